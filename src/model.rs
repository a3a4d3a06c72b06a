//! # Data Model
//!
//! Passive-DNS record shapes: the raw `InputObservation` reported by a sensor
//! and the aggregated `Observation` kept in the store, plus the key scheme
//! that indexes observations by name and by value.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Reserved byte joining key fields. Never valid inside a field.
pub const KEY_SEPARATOR: u8 = 0x1f;

/// Stored in place of an empty resolved value.
pub const EMPTY_VALUE: &str = "-";

/// Entity tag of forward (name-first) index entries.
pub const FORWARD_TAG: u8 = b'o';

/// Entity tag of inverse (value-first) index entries.
pub const INVERSE_TAG: u8 = b'i';

/// A single sighting of a name resolving to a value on one sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputObservation {
    #[serde(rename = "C")]
    pub count: u32,
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "T")]
    pub rrtype: String,
    #[serde(rename = "D")]
    pub value: String,
    #[serde(rename = "I")]
    pub sensor: String,
    #[serde(rename = "F")]
    pub time_start: i64,
    #[serde(rename = "L")]
    pub time_end: i64,
    /// Routing tags. Not part of the wire format and never persisted.
    #[serde(skip)]
    pub tags: BTreeSet<String>,
}

impl InputObservation {
    pub fn new(
        name: impl Into<String>,
        rrtype: impl Into<String>,
        value: impl Into<String>,
        sensor: impl Into<String>,
        count: u32,
        time_start: i64,
        time_end: i64,
    ) -> Self {
        Self {
            count,
            name: name.into(),
            rrtype: rrtype.into(),
            value: value.into(),
            sensor: sensor.into(),
            time_start,
            time_end,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Apply the storage normalization rules: the empty value becomes the
    /// `-` placeholder, a zero count becomes one, and an inverted window is
    /// swapped so that `time_start <= time_end`.
    pub fn normalized(mut self) -> Self {
        if self.value.is_empty() {
            self.value = EMPTY_VALUE.to_string();
        }
        if self.count == 0 {
            self.count = 1;
        }
        if self.time_start > self.time_end {
            std::mem::swap(&mut self.time_start, &mut self.time_end);
        }
        self
    }

    /// Fold another sighting of the same key into this one.
    ///
    /// Counts are summed and the window widened to cover both inputs, so the
    /// result does not depend on the order in which sightings are absorbed.
    pub fn absorb(&mut self, other: &InputObservation) {
        self.count = self.count.saturating_add(other.count);
        self.time_start = self.time_start.min(other.time_start);
        self.time_end = self.time_end.max(other.time_end);
        self.tags.extend(other.tags.iter().cloned());
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            name: self.name.clone(),
            sensor: self.sensor.clone(),
            rrtype: self.rrtype.clone(),
            value: self.value.clone(),
        }
    }
}

/// Aggregated record for one (sensor, name, rrtype, value) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "C")]
    pub count: u32,
    #[serde(rename = "F")]
    pub first_seen: i64,
    #[serde(rename = "L")]
    pub last_seen: i64,
    #[serde(rename = "T")]
    pub rrtype: String,
    #[serde(rename = "N")]
    pub name: String,
    #[serde(rename = "D")]
    pub value: String,
    #[serde(rename = "I")]
    pub sensor: String,
}

impl Observation {
    pub fn from_parts(key: ObservationKey, aggregate: Aggregate) -> Self {
        Self {
            count: aggregate.count,
            first_seen: aggregate.first_seen,
            last_seen: aggregate.last_seen,
            rrtype: key.rrtype,
            name: key.name,
            value: key.value,
            sensor: key.sensor,
        }
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            name: self.name.clone(),
            sensor: self.sensor.clone(),
            rrtype: self.rrtype.clone(),
            value: self.value.clone(),
        }
    }

    pub fn aggregate(&self) -> Aggregate {
        Aggregate {
            count: self.count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }

    /// Export shape used by dumps.
    pub fn to_dump_record(&self) -> DumpRecord<'_> {
        DumpRecord {
            count: self.count,
            time_first: self.first_seen,
            time_last: self.last_seen,
            rrtype: &self.rrtype,
            rrname: &self.name,
            rdata: &self.value,
            sensor_id: &self.sensor,
        }
    }
}

impl From<InputObservation> for Observation {
    fn from(input: InputObservation) -> Self {
        Self {
            count: input.count,
            first_seen: input.time_start,
            last_seen: input.time_end,
            rrtype: input.rrtype,
            name: input.name,
            value: input.value,
            sensor: input.sensor,
        }
    }
}

/// JSON line written by `dump`.
#[derive(Debug, Serialize)]
pub struct DumpRecord<'a> {
    pub count: u32,
    pub time_first: i64,
    pub time_last: i64,
    pub rrtype: &'a str,
    pub rrname: &'a str,
    pub rdata: &'a str,
    pub sensor_id: &'a str,
}

/// Mutable part of an Observation: count and seen window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregate {
    pub count: u32,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Aggregate {
    /// Encoded width: count (u32) + last_seen (i64) + first_seen (i64).
    pub const ENCODED_LEN: usize = 4 + 8 + 8;

    pub fn from_input(input: &InputObservation) -> Self {
        Self {
            count: input.count,
            first_seen: input.time_start,
            last_seen: input.time_end,
        }
    }

    pub fn merge(&mut self, other: &Aggregate) {
        self.count = self.count.saturating_add(other.count);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&self.count.to_be_bytes());
        buf[4..12].copy_from_slice(&self.last_seen.to_be_bytes());
        buf[12..20].copy_from_slice(&self.first_seen.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        let count = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        let last_seen = i64::from_be_bytes(bytes[4..12].try_into().ok()?);
        let first_seen = i64::from_be_bytes(bytes[12..20].try_into().ok()?);
        Some(Self {
            count,
            first_seen,
            last_seen,
        })
    }
}

/// Identity of an Observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    pub name: String,
    pub sensor: String,
    pub rrtype: String,
    pub value: String,
}

impl ObservationKey {
    /// Reject any field carrying the separator byte.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("name", &self.name),
            ("sensor", &self.sensor),
            ("rrtype", &self.rrtype),
            ("value", &self.value),
        ];
        for (field, content) in fields {
            if content.as_bytes().contains(&KEY_SEPARATOR) {
                return Err(StoreError::InvalidField { field });
            }
        }
        Ok(())
    }

    /// `o␟name␟sensor␟rrtype␟value`
    pub fn forward(&self) -> Vec<u8> {
        join_key(
            FORWARD_TAG,
            &[&self.name, &self.sensor, &self.rrtype, &self.value],
        )
    }

    /// `i␟value␟sensor␟name␟rrtype`
    pub fn inverse(&self) -> Vec<u8> {
        join_key(
            INVERSE_TAG,
            &[&self.value, &self.sensor, &self.name, &self.rrtype],
        )
    }

    pub fn parse_forward(raw: &[u8]) -> Option<Self> {
        let [name, sensor, rrtype, value] = split_key(FORWARD_TAG, raw)?;
        Some(Self {
            name,
            sensor,
            rrtype,
            value,
        })
    }

    pub fn parse_inverse(raw: &[u8]) -> Option<Self> {
        let [value, sensor, name, rrtype] = split_key(INVERSE_TAG, raw)?;
        Some(Self {
            name,
            sensor,
            rrtype,
            value,
        })
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.sensor, self.name, self.rrtype, self.value
        )
    }
}

/// Scan prefix for an index: the tag, the leading field and optionally the
/// sensor, each terminated by the separator.
pub fn scan_prefix(tag: u8, lead: &str, sensor: Option<&str>) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(3 + lead.len() + sensor.map_or(0, str::len));
    prefix.push(tag);
    prefix.push(KEY_SEPARATOR);
    prefix.extend_from_slice(lead.as_bytes());
    prefix.push(KEY_SEPARATOR);
    if let Some(sensor) = sensor {
        prefix.extend_from_slice(sensor.as_bytes());
        prefix.push(KEY_SEPARATOR);
    }
    prefix
}

fn join_key(tag: u8, fields: &[&str; 4]) -> Vec<u8> {
    let len = 2 + fields.iter().map(|f| f.len() + 1).sum::<usize>();
    let mut key = Vec::with_capacity(len);
    key.push(tag);
    for field in fields {
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(field.as_bytes());
    }
    key
}

fn split_key(tag: u8, raw: &[u8]) -> Option<[String; 4]> {
    if raw.len() < 2 || raw[0] != tag || raw[1] != KEY_SEPARATOR {
        return None;
    }
    let mut parts = raw[2..].split(|b| *b == KEY_SEPARATOR);
    let mut out: [String; 4] = Default::default();
    for slot in out.iter_mut() {
        *slot = String::from_utf8(parts.next()?.to_vec()).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

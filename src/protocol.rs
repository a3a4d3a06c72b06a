//! # Wire Protocol
//!
//! Messages are MessagePack values written back to back on a TCP stream,
//! with no length prefix. Every message is an envelope `{T: u8, M: bin}`;
//! `M` holds the type-specific payload, itself MessagePack, decoded only
//! after the receiver has dispatched on `T`.
//!
//! Query results come either bundled in one `QueryResponse` or as a stream
//! `QueryStreamStart`, zero or more `QueryStreamData` (one observation
//! each), then `QueryStreamEnd`. [`QueryResponseDecoder`] accepts both.

use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::error::{Result, StoreError};
use crate::model::{InputObservation, Observation};
use crate::store::SearchQuery;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    InputRequest = 1,
    QueryRequest = 2,
    BackupRequest = 3,
    DumpRequest = 4,
    ErrorResponse = 128,
    QueryResponse = 129,
    QueryStreamStart = 130,
    QueryStreamData = 131,
    QueryStreamEnd = 132,
}

impl TryFrom<u8> for MessageType {
    type Error = StoreError;

    fn try_from(code: u8) -> Result<Self> {
        Ok(match code {
            1 => MessageType::InputRequest,
            2 => MessageType::QueryRequest,
            3 => MessageType::BackupRequest,
            4 => MessageType::DumpRequest,
            128 => MessageType::ErrorResponse,
            129 => MessageType::QueryResponse,
            130 => MessageType::QueryStreamStart,
            131 => MessageType::QueryStreamData,
            132 => MessageType::QueryStreamEnd,
            other => {
                return Err(StoreError::Protocol(format!(
                    "unknown message type {other}"
                )))
            }
        })
    }
}

/// Outer envelope of every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedMessage {
    #[serde(rename = "T")]
    pub kind: u8,
    #[serde(rename = "M", with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl TypedMessage {
    pub fn message_type(&self) -> Result<MessageType> {
        MessageType::try_from(self.kind)
    }

    /// Decode the inner payload as `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        rmp_serde::from_slice(&self.payload).map_err(|err| {
            StoreError::Protocol(format!("bad payload for type {}: {err}", self.kind))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    #[serde(rename = "O")]
    pub observation: InputObservation,
}

/// Query predicates. The `H*` flags tell an absent filter apart from a
/// filter on the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "Qrdata")]
    pub value: String,
    #[serde(rename = "Qrrname")]
    pub name: String,
    #[serde(rename = "Qrrtype")]
    pub rrtype: String,
    #[serde(rename = "QsensorID")]
    pub sensor: String,
    #[serde(rename = "Hrdata")]
    pub has_value: bool,
    #[serde(rename = "Hrrname")]
    pub has_name: bool,
    #[serde(rename = "Hrrtype")]
    pub has_rrtype: bool,
    #[serde(rename = "HsensorID")]
    pub has_sensor: bool,
    #[serde(rename = "Limit")]
    pub limit: i64,
}

impl From<&SearchQuery> for QueryRequest {
    fn from(query: &SearchQuery) -> Self {
        fn split(field: &Option<String>) -> (String, bool) {
            match field {
                Some(v) => (v.clone(), true),
                None => (String::new(), false),
            }
        }
        let (value, has_value) = split(&query.value);
        let (name, has_name) = split(&query.name);
        let (rrtype, has_rrtype) = split(&query.rrtype);
        let (sensor, has_sensor) = split(&query.sensor);
        Self {
            value,
            name,
            rrtype,
            sensor,
            has_value,
            has_name,
            has_rrtype,
            has_sensor,
            limit: i64::try_from(query.limit).unwrap_or(i64::MAX),
        }
    }
}

impl From<QueryRequest> for SearchQuery {
    fn from(req: QueryRequest) -> Self {
        fn join(value: String, present: bool) -> Option<String> {
            present.then_some(value)
        }
        Self {
            value: join(req.value, req.has_value),
            name: join(req.name, req.has_name),
            rrtype: join(req.rrtype, req.has_rrtype),
            sensor: join(req.sensor, req.has_sensor),
            limit: usize::try_from(req.limit).unwrap_or(0),
        }
    }
}

/// Payload of backup and dump requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    #[serde(rename = "P")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Message")]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "O")]
    pub observations: Vec<Observation>,
}

/// A decoded request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Input(InputObservation),
    Query(SearchQuery),
    Backup(PathBuf),
    Dump(PathBuf),
}

impl Request {
    pub fn from_message(message: &TypedMessage) -> Result<Self> {
        match message.message_type()? {
            MessageType::InputRequest => {
                let req: InputRequest = message.decode_payload()?;
                Ok(Request::Input(req.observation))
            }
            MessageType::QueryRequest => {
                let req: QueryRequest = message.decode_payload()?;
                Ok(Request::Query(req.into()))
            }
            MessageType::BackupRequest => {
                let req: PathRequest = message.decode_payload()?;
                Ok(Request::Backup(PathBuf::from(req.path)))
            }
            MessageType::DumpRequest => {
                let req: PathRequest = message.decode_payload()?;
                Ok(Request::Dump(PathBuf::from(req.path)))
            }
            other => Err(StoreError::Protocol(format!(
                "unexpected {other:?} where a request was expected"
            ))),
        }
    }
}

/// Encode `inner` as the payload of a `kind` envelope.
pub fn encode_message<T: Serialize>(kind: MessageType, inner: &T) -> Result<Vec<u8>> {
    let payload = rmp_serde::to_vec_named(inner)?;
    TypedMessage {
        kind: kind as u8,
        payload,
    }
    .to_bytes()
}

/// Envelope with an empty payload.
pub fn encode_empty(kind: MessageType) -> Result<Vec<u8>> {
    TypedMessage {
        kind: kind as u8,
        payload: Vec::new(),
    }
    .to_bytes()
}

pub fn encode_input(observation: &InputObservation) -> Result<Vec<u8>> {
    encode_message(
        MessageType::InputRequest,
        &InputRequest {
            observation: observation.clone(),
        },
    )
}

pub fn encode_query(query: &SearchQuery) -> Result<Vec<u8>> {
    encode_message(MessageType::QueryRequest, &QueryRequest::from(query))
}

pub fn encode_backup(path: &str) -> Result<Vec<u8>> {
    encode_message(
        MessageType::BackupRequest,
        &PathRequest {
            path: path.to_string(),
        },
    )
}

pub fn encode_dump(path: &str) -> Result<Vec<u8>> {
    encode_message(
        MessageType::DumpRequest,
        &PathRequest {
            path: path.to_string(),
        },
    )
}

pub fn encode_error(message: impl Into<String>) -> Result<Vec<u8>> {
    encode_message(
        MessageType::ErrorResponse,
        &ErrorResponse {
            message: message.into(),
        },
    )
}

pub fn encode_query_response(observations: Vec<Observation>) -> Result<Vec<u8>> {
    encode_message(MessageType::QueryResponse, &QueryResponse { observations })
}

pub fn encode_stream_data(observation: &Observation) -> Result<Vec<u8>> {
    encode_message(MessageType::QueryStreamData, observation)
}

/// Reads back-to-back envelopes from a byte stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_message_bytes: usize,
    read_timeout: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            read_timeout: None,
        }
    }

    /// Fail when a started message stalls for longer than `timeout`.
    /// Idle time between messages is not bounded.
    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Next envelope, or `None` on a clean end of stream between messages.
    pub async fn read_message(&mut self) -> Result<Option<TypedMessage>> {
        loop {
            let needed = frame_len_hint(&self.buf);
            if !self.buf.is_empty() && self.buf.len() >= needed {
                if let Some(message) = self.try_decode()? {
                    return Ok(Some(message));
                }
            }
            if self.buf.len().max(needed) > self.max_message_bytes {
                return Err(StoreError::Protocol(format!(
                    "message exceeds {} bytes",
                    self.max_message_bytes
                )));
            }
            self.buf
                .reserve(needed.saturating_sub(self.buf.len()).max(READ_CHUNK));
            let read = match self.read_timeout {
                Some(limit) if !self.buf.is_empty() => {
                    tokio::time::timeout(limit, self.inner.read_buf(&mut self.buf))
                        .await
                        .map_err(|_| {
                            StoreError::ConnectionLost("read stalled mid-message".to_string())
                        })??
                }
                _ => self.inner.read_buf(&mut self.buf).await?,
            };
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(StoreError::ConnectionLost(
                    "peer closed the connection mid-message".to_string(),
                ));
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<TypedMessage>> {
        let mut cursor = Cursor::new(&self.buf[..]);
        match rmp_serde::from_read::<_, TypedMessage>(&mut cursor) {
            Ok(message) => {
                let used = cursor.position() as usize;
                self.buf.drain(..used);
                Ok(Some(message))
            }
            Err(err) if is_incomplete(&err) => Ok(None),
            Err(err) => Err(StoreError::Protocol(format!("malformed envelope: {err}"))),
        }
    }
}

const READ_CHUNK: usize = 8192;

/// Lower bound on the encoded length of the envelope at the start of `buf`,
/// read from the map header and the `M` length prefix. Returns 0 when the
/// header does not have the expected `{T, M}` shape, in which case the
/// caller falls back to a full decode attempt.
pub(crate) fn frame_len_hint(buf: &[u8]) -> usize {
    let mut pos = 0usize;
    let entries = match buf.first() {
        None => return 1,
        Some(&m @ 0x80..=0x8f) => {
            pos = 1;
            usize::from(m & 0x0f)
        }
        Some(_) => return 0,
    };
    if entries != 2 {
        return 0;
    }

    for _ in 0..entries {
        let Some(&marker) = buf.get(pos) else {
            return pos + 1;
        };
        let key_len = match marker {
            0xa0..=0xbf => usize::from(marker & 0x1f),
            _ => return 0,
        };
        pos += 1;
        let Some(key) = buf.get(pos..pos + key_len) else {
            return pos + key_len;
        };
        pos += key_len;

        let Some(&marker) = buf.get(pos) else {
            return pos + 1;
        };
        let (header, body) = match (key, marker) {
            (b"T", 0x00..=0x7f | 0xe0..=0xff) => (1, 0),
            (b"T", 0xcc | 0xd0) => (2, 0),
            (b"T", 0xcd | 0xd1) => (3, 0),
            (b"T", 0xce | 0xd2) => (5, 0),
            (b"T", 0xcf | 0xd3) => (9, 0),
            (b"M", 0xa0..=0xbf) => (1, usize::from(marker & 0x1f)),
            (b"M", 0xc4 | 0xd9) => match buf.get(pos + 1) {
                Some(&len) => (2, usize::from(len)),
                None => return pos + 2,
            },
            (b"M", 0xc5 | 0xda) => match buf.get(pos + 1..pos + 3) {
                Some(len) => (3, usize::from(u16::from_be_bytes([len[0], len[1]]))),
                None => return pos + 3,
            },
            (b"M", 0xc6 | 0xdb) => match buf.get(pos + 1..pos + 5) {
                Some(len) => (5, u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize),
                None => return pos + 5,
            },
            _ => return 0,
        };
        pos += header + body;
    }
    pos
}

fn is_incomplete(err: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Write one encoded message, failing with `ConnectionLost` if the write
/// does not finish within `timeout`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
    timeout: Option<Duration>,
) -> Result<()> {
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    match timeout {
        Some(limit) => tokio::time::timeout(limit, write)
            .await
            .map_err(|_| StoreError::ConnectionLost("write timed out".to_string()))??,
        None => write.await?,
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    AwaitingFirst,
    Streaming,
    Done,
}

/// Assembles a query result from either response shape.
#[derive(Debug)]
pub struct QueryResponseDecoder {
    state: DecoderState,
    results: Vec<Observation>,
}

impl Default for QueryResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryResponseDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::AwaitingFirst,
            results: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == DecoderState::Done
    }

    /// Feed the next envelope. Returns the complete result list once the
    /// response is finished. An error-response at any point ends decoding
    /// and discards everything accumulated so far.
    pub fn push(&mut self, message: &TypedMessage) -> Result<Option<Vec<Observation>>> {
        if self.state == DecoderState::Done {
            return Err(StoreError::Protocol(
                "message after completed query response".to_string(),
            ));
        }
        let kind = match message.message_type() {
            Ok(kind) => kind,
            Err(err) => return Err(self.abort(err)),
        };
        match (self.state, kind) {
            (_, MessageType::ErrorResponse) => {
                let err = match message.decode_payload::<ErrorResponse>() {
                    Ok(response) => StoreError::Remote(response.message),
                    Err(err) => err,
                };
                Err(self.abort(err))
            }
            (DecoderState::AwaitingFirst, MessageType::QueryResponse) => {
                let response: QueryResponse = match message.decode_payload() {
                    Ok(response) => response,
                    Err(err) => return Err(self.abort(err)),
                };
                self.state = DecoderState::Done;
                Ok(Some(response.observations))
            }
            (DecoderState::AwaitingFirst, MessageType::QueryStreamStart) => {
                self.state = DecoderState::Streaming;
                Ok(None)
            }
            (DecoderState::Streaming, MessageType::QueryStreamData) => {
                match message.decode_payload::<Observation>() {
                    Ok(observation) => {
                        self.results.push(observation);
                        Ok(None)
                    }
                    Err(err) => Err(self.abort(err)),
                }
            }
            (DecoderState::Streaming, MessageType::QueryStreamEnd) => {
                self.state = DecoderState::Done;
                Ok(Some(std::mem::take(&mut self.results)))
            }
            (state, kind) => Err(self.abort(StoreError::Protocol(format!(
                "unexpected {kind:?} while {state:?}"
            )))),
        }
    }

    fn abort(&mut self, err: StoreError) -> StoreError {
        self.results.clear();
        self.state = DecoderState::Done;
        err
    }
}

/// Read envelopes until a full query response has been assembled.
pub async fn read_query_response<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<Vec<Observation>> {
    let mut decoder = QueryResponseDecoder::new();
    loop {
        let message = reader.read_message().await?.ok_or_else(|| {
            StoreError::ConnectionLost("connection closed before query response completed".to_string())
        })?;
        if let Some(results) = decoder.push(&message)? {
            return Ok(results);
        }
    }
}

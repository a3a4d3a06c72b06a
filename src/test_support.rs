use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::InputObservation;

const RRTYPES: [&str; 5] = ["A", "AAAA", "CNAME", "MX", "NS"];
const SENSORS: [&str; 3] = ["sensor-a", "sensor-b", "sensor-c"];

#[derive(Debug, Clone)]
pub struct GeneratedFeed {
    pub observations: Vec<InputObservation>,
    /// Distinct `(sensor, name, rrtype, value)` keys in `observations`.
    pub distinct_keys: usize,
}

/// Deterministic pseudo-random observations. With probability
/// `repeat_probability` an entry repeats one of the previous keys, which
/// exercises the merge path.
pub fn generate_feed(count: u32, repeat_probability: f64, seed: u64) -> GeneratedFeed {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut observations: Vec<InputObservation> = Vec::with_capacity(count as usize);
    let mut keys = std::collections::HashSet::new();

    for i in 0..count {
        let start = rng.random_range(1_600_000_000..1_700_000_000i64);
        let end = start + rng.random_range(0..3600i64);
        let count = rng.random_range(1..5u32);

        let observation = if !observations.is_empty() && rng.random_bool(repeat_probability) {
            let prior = &observations[rng.random_range(0..observations.len())];
            InputObservation::new(
                prior.name.clone(),
                prior.rrtype.clone(),
                prior.value.clone(),
                prior.sensor.clone(),
                count,
                start,
                end,
            )
        } else {
            let rrtype = RRTYPES[rng.random_range(0..RRTYPES.len())];
            let sensor = SENSORS[rng.random_range(0..SENSORS.len())];
            let value = match rrtype {
                "A" => format!(
                    "10.{}.{}.{}",
                    rng.random_range(0..255u8),
                    rng.random_range(0..255u8),
                    rng.random_range(1..255u8)
                ),
                "AAAA" => format!("2001:db8::{:x}", rng.random_range(1..0xffffu32)),
                _ => format!("target{:06}.example.net", rng.random_range(0..1000u32)),
            };
            InputObservation::new(
                format!("host{i:07}.example.com"),
                rrtype,
                value,
                sensor,
                count,
                start,
                end,
            )
        };
        keys.insert(observation.key());
        observations.push(observation);
    }

    GeneratedFeed {
        observations,
        distinct_keys: keys.len(),
    }
}

/// Observations for `names` that all resolve to `value` on one sensor.
pub fn shared_value_batch(names: &[&str], value: &str, sensor: &str) -> Vec<InputObservation> {
    names
        .iter()
        .enumerate()
        .map(|(i, name)| InputObservation::new(*name, "A", value, sensor, 1, i as i64, i as i64))
        .collect()
}

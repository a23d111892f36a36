//! Duration fields in config files
//!
//! TOML has no duration type. Timeouts are written as whole seconds and
//! anything that is usually sub-second (debounce, retry delays) as
//! milliseconds, e.g. `#[serde(with = "duration_millis")]`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

fn serialize_as<S: Serializer>(value: u128, serializer: S) -> Result<S::Ok, S::Error> {
    let value = u64::try_from(value).map_err(serde::ser::Error::custom)?;
    serializer.serialize_u64(value)
}

pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_as(u128::from(duration.as_secs()), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

pub mod duration_millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serialize_as(duration.as_millis(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Knobs {
        #[serde(with = "duration_secs")]
        shutdown_timeout: Duration,
        #[serde(with = "duration_millis")]
        debounce: Duration,
    }

    #[test]
    fn test_units_in_toml() {
        let knobs = Knobs {
            shutdown_timeout: Duration::from_secs(5),
            debounce: Duration::from_millis(500),
        };
        let text = toml::to_string(&knobs).unwrap();
        assert!(text.contains("shutdown_timeout = 5"));
        assert!(text.contains("debounce = 500"));

        let parsed: Knobs = toml::from_str("shutdown_timeout = 2\ndebounce = 250\n").unwrap();
        assert_eq!(parsed.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(parsed.debounce, Duration::from_millis(250));
    }

    #[test]
    fn test_sub_unit_precision_truncates() {
        let knobs = Knobs {
            shutdown_timeout: Duration::from_millis(1_900),
            debounce: Duration::from_micros(1_500),
        };
        let text = toml::to_string(&knobs).unwrap();
        assert!(text.contains("shutdown_timeout = 1"));
        assert!(text.contains("debounce = 1"));
    }
}

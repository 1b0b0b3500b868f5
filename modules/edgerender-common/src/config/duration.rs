//! Serde adapters for humantime duration strings in the YAML config.
//! Accepts the usual unit suffixes including `d` (days) and `w` (weeks),
//! e.g. `100ms`, `3s`, `24h`, `2d`, `1w`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

/// `Option<Duration>` variant for nullable config fields.
pub mod opt {
    use super::*;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(with = "super")]
        period: Duration,
        #[serde(default, with = "super::opt")]
        window: Option<Duration>,
    }

    #[test]
    fn parses_common_units() {
        let p: Probe = serde_yaml::from_str("period: 100ms\nwindow: 3s\n").unwrap();
        assert_eq!(p.period, Duration::from_millis(100));
        assert_eq!(p.window, Some(Duration::from_secs(3)));
    }

    #[test]
    fn parses_day_and_week_suffixes() {
        let p: Probe = serde_yaml::from_str("period: 2d\nwindow: 1w\n").unwrap();
        assert_eq!(p.period, Duration::from_secs(2 * 86400));
        assert_eq!(p.window, Some(Duration::from_secs(7 * 86400)));
    }

    #[test]
    fn absent_optional_is_none() {
        let p: Probe = serde_yaml::from_str("period: 1s\n").unwrap();
        assert_eq!(p.window, None);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(serde_yaml::from_str::<Probe>("period: soon\n").is_err());
    }
}

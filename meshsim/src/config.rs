//! Run parameters for a simulation.
//!
//! A [`SimConfig`] is built once by the embedding application, validated, and then
//! shared read-only (as `Arc<SimConfig>`) with the system, the topology builder,
//! the recorder and the controller. Running actors only change their own
//! parameters, through `Inform` messages.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What a flow producer does when the recorder queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space. No flow record is lost; a slow recorder slows flushing.
    #[default]
    Block,
    /// Overwrite the oldest queued record and count it as dropped.
    DropOldest,
}

/// The content of a response sent before every sub-request answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReply {
    /// Reply with whatever value arrived in time.
    #[default]
    Partial,
    /// Reply without a value.
    Empty,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("population scale must be at least 1%")]
    ZeroPopulation,
    #[error("region count must be at least 1")]
    ZeroRegions,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("flow capacity must be at least 1")]
    ZeroCapacity,
    #[error("invalid key/value pair '{0}', expected key:value")]
    InvalidKeyValue(String),
    #[error("invalid duration '{value}' for key '{key}'")]
    InvalidDuration { key: String, value: String },
    #[error("invalid value '{value}' for key '{key}'")]
    InvalidValue { key: String, value: String },
}

/// Set-once run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Name of the architecture, used in reports and exported graphs.
    pub arch: String,
    /// Population scale factor in percent applied to every service's base count.
    pub population: u32,
    /// Number of regions to replicate into. Overrides the definition when set.
    pub regions: Option<usize>,
    #[serde(with = "millis")]
    pub duration: Duration,
    /// How often actors refresh their peer view from the registry.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// How long the shutdown barrier waits for actors and the recorder.
    #[serde(with = "millis")]
    pub shutdown_grace: Duration,
    /// How often entry services originate a request.
    #[serde(with = "millis")]
    pub request_interval: Duration,
    /// How long a request waits for its fanned-out sub-requests.
    #[serde(with = "millis")]
    pub fanout_timeout: Duration,
    pub degraded: DegradedReply,
    /// Log every delivered message.
    pub msglog: bool,
    /// Record flows.
    pub collect: bool,
    /// Collapse instance names to service names in flow records.
    pub filter: bool,
    pub flow_capacity: usize,
    pub overflow: OverflowPolicy,
    pub seed: u64,
    /// Free-form overrides, visible to every actor.
    pub keyvals: BTreeMap<String, String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            arch: "mesh".to_string(),
            population: 100,
            regions: None,
            duration: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            request_interval: Duration::from_millis(100),
            fanout_timeout: Duration::from_millis(500),
            degraded: DegradedReply::Partial,
            msglog: false,
            collect: true,
            filter: false,
            flow_capacity: 1000,
            overflow: OverflowPolicy::Block,
            seed: 0,
            keyvals: BTreeMap::new(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population == 0 {
            return Err(ConfigError::ZeroPopulation);
        }
        if self.regions == Some(0) {
            return Err(ConfigError::ZeroRegions);
        }
        if self.flow_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        let durations = [
            ("poll_interval", self.poll_interval),
            ("request_interval", self.request_interval),
            ("fanout_timeout", self.fanout_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        Ok(())
    }

    /// Apply comma separated `key:value` overrides, e.g. `chat:10ms,timeout:200ms`.
    pub fn with_keyvals(mut self, spec: &str) -> Result<Self, ConfigError> {
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| ConfigError::InvalidKeyValue(pair.to_string()))?;
            self.set(key.trim(), value.trim())?;
        }
        Ok(self)
    }

    /// Apply one override. Known keys update the typed fields; every key is kept
    /// in [`SimConfig::keyvals`].
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let duration = || {
            parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
                key: key.to_string(),
                value: value.to_string(),
            })
        };
        match key {
            "chat" => self.request_interval = duration()?,
            "timeout" => self.fanout_timeout = duration()?,
            "poll" => self.poll_interval = duration()?,
            "grace" => self.shutdown_grace = duration()?,
            "degraded" => self.degraded = parse_degraded(key, value)?,
            _ => {}
        }
        self.keyvals.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn keyval(&self, key: &str) -> Option<&str> {
        self.keyvals.get(key).map(String::as_str)
    }

    /// Instances of a service with `base` instances after population scaling, at least one.
    pub fn scaled_count(&self, base: u32) -> usize {
        ((u64::from(base) * u64::from(self.population)) / 100).max(1) as usize
    }
}

pub(crate) fn parse_degraded(key: &str, value: &str) -> Result<DegradedReply, ConfigError> {
    match value {
        "partial" => Ok(DegradedReply::Partial),
        "empty" => Ok(DegradedReply::Empty),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// Parse durations like `250ms`, `1.5s` or `2m`. A bare number is taken as milliseconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number.trim().parse().ok()?;
    if !number.is_finite() || number < 0.0 {
        return None;
    }
    let nanos_per_unit = match unit {
        "ns" => 1.0,
        "us" => 1e3,
        "" | "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return None,
    };
    Some(Duration::from_nanos((number * nanos_per_unit).round() as u64))
}

/// Serialize durations as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10ms"), Some(Duration::from_millis(10)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("250"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("500us"), Some(Duration::from_micros(500)));
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration("-1s"), None);
        assert_eq!(parse_duration("3 parsecs"), None);
    }

    #[test]
    fn test_keyvals_update_typed_fields() {
        let config = SimConfig::default()
            .with_keyvals("chat:10ms, timeout:200ms,degraded:empty,color:blue")
            .unwrap();
        assert_eq!(config.request_interval, Duration::from_millis(10));
        assert_eq!(config.fanout_timeout, Duration::from_millis(200));
        assert_eq!(config.degraded, DegradedReply::Empty);
        assert_eq!(config.keyval("color"), Some("blue"));
        assert_eq!(config.keyval("chat"), Some("10ms"));
    }

    #[test]
    fn test_keyvals_errors() {
        assert_matches!(
            SimConfig::default().with_keyvals("chat"),
            Err(ConfigError::InvalidKeyValue(_))
        );
        assert_matches!(
            SimConfig::default().with_keyvals("chat:soon"),
            Err(ConfigError::InvalidDuration { .. })
        );
        assert_matches!(
            SimConfig::default().with_keyvals("degraded:maybe"),
            Err(ConfigError::InvalidValue { .. })
        );
    }

    #[test]
    fn test_validate() {
        assert!(SimConfig::default().validate().is_ok());
        let config = SimConfig {
            population: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroPopulation));
        let config = SimConfig {
            regions: Some(0),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroRegions));
        let config = SimConfig {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroDuration("poll_interval"))
        );
    }

    #[test]
    fn test_scaled_count() {
        let mut config = SimConfig::default();
        assert_eq!(config.scaled_count(1), 1);
        config.population = 300;
        assert_eq!(config.scaled_count(1), 3);
        config.population = 10;
        assert_eq!(config.scaled_count(4), 1);
        config.population = 250;
        assert_eq!(config.scaled_count(2), 5);
    }

    #[test]
    fn test_config_serde() {
        let config: SimConfig =
            serde_json::from_str(r#"{"population": 200, "fanout_timeout": 50}"#).unwrap();
        assert_eq!(config.population, 200);
        assert_eq!(config.fanout_timeout, Duration::from_millis(50));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }
}

// Configuration management module
// This file handles loading and parsing of configuration settings
// from a YAML file with environment-variable overrides
//
// Numan Thabit 2025 Nov

use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Full configuration for the single-binary deployment: the gateway
/// (data-plane) sections plus the control-plane sections.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl AppConfig {
    /// Load from the given YAML file (optional) with `GATEWAY__*`
    /// environment overrides, e.g. `GATEWAY__SERVER__PORT=9000`.
    pub fn load(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .context("build configuration sources")?;
        cfg.try_deserialize().context("deserialize configuration")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Base URL of the downstream service behind `/api/*`. When unset the
    /// gateway answers with a local simulated response.
    pub upstream: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            upstream: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Refill rate of the default bucket, tokens/second.
    pub default_rate: f64,
    /// Capacity and full-throttle rate for per-cluster buckets.
    pub max_rate: f64,
    #[serde(with = "duration")]
    pub cleanup_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_rate: 1000.0,
            max_rate: 10000.0,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: i64,
    #[serde(with = "duration")]
    pub recovery_timeout: Duration,
    /// Fraction of the failure threshold that half-open successes must
    /// reach before the breaker closes again.
    pub recovery_increment: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            recovery_timeout: Duration::from_secs(30),
            recovery_increment: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub sampling_rate: f64,
    pub buffer_size: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 0.05,
            buffer_size: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub brokers: Vec<String>,
    pub topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".into()],
            topic: "error-events".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    pub endpoints: Vec<String>,
    #[serde(with = "duration")]
    pub timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".into()],
            timeout: Duration::from_secs(5),
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
            path: "/metrics".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_path: String,
    pub batch_size: usize,
    pub cache_size: usize,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            batch_size: 32,
            cache_size: 1000,
            dimension: 384,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub similarity_threshold: f64,
    #[serde(with = "duration")]
    pub reclustering_interval: Duration,
    pub min_cluster_size: usize,
    pub max_clusters: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.82,
            reclustering_interval: Duration::from_secs(600),
            min_cluster_size: 10,
            max_clusters: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Errors per second that triggers policy synthesis.
    pub error_rate_threshold: f64,
    /// Window-over-window growth ratio that triggers policy synthesis.
    pub growth_rate_threshold: f64,
    #[serde(with = "duration")]
    pub evaluation_interval: Duration,
    #[serde(with = "duration")]
    pub policy_ttl: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            error_rate_threshold: 10.0,
            growth_rate_threshold: 2.0,
            evaluation_interval: Duration::from_secs(30),
            policy_ttl: Duration::from_secs(300),
        }
    }
}

/// Serde adapter accepting durations as plain seconds (`30`) or with a
/// unit suffix (`"500ms"`, `"30s"`, `"5m"`, `"1h"`).
mod duration {
    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;
    use std::fmt;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("seconds or a duration string like \"30s\" or \"5m\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                if v < 0 {
                    return Err(E::custom("duration must be non-negative"));
                }
                Ok(Duration::from_secs(v as u64))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Duration, E> {
                if v < 0.0 {
                    return Err(E::custom("duration must be non-negative"));
                }
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse(v).map_err(E::custom)
            }
        }

        d.deserialize_any(DurationVisitor)
    }

    fn parse(raw: &str) -> Result<Duration, String> {
        let raw = raw.trim();
        let split = raw
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(raw.len());
        let (number, unit) = raw.split_at(split);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration: {raw}"))?;

        let secs = match unit.trim() {
            "" | "s" => value,
            "ms" => value / 1000.0,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("unknown duration unit: {other}")),
        };
        Ok(Duration::from_secs_f64(secs))
    }

}

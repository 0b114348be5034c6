use rand::Rng;
use std::convert::TryFrom;
use std::env;
use tokio::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("mandatory environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("environment variable {0} has an invalid value: {1}")]
    InvalidEnv(&'static str, String),
    #[error("illegal options: {0}")]
    IllegalOptions(&'static str),
}

/// Timing knobs for the whole fleet. `None` means the protocol default;
/// tests shrink these to millisecond scales.
#[derive(Clone, Default)]
pub struct Options {
    pub heartbeat_period: Option<Duration>,
    pub coord_probe_period: Option<Duration>,
    pub ping_timeout: Option<Duration>,
    pub election_timeout: Option<Duration>,
    pub sync_timeout: Option<Duration>,
    pub reap_period: Option<Duration>,
    pub liveness_window: Option<Duration>,
    pub directory_timeout: Option<Duration>,
}

#[derive(Clone)]
pub(crate) struct OptionsValidated {
    pub heartbeat_period: Duration,
    pub coord_probe_period: Duration,
    pub ping_timeout: Duration,
    pub election_timeout: Duration,
    pub sync_timeout: Duration,
    pub reap_period: Duration,
    pub liveness_window: Duration,
    pub directory_timeout: Duration,
}

impl OptionsValidated {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_timeout >= self.coord_probe_period {
            return Err(ConfigError::IllegalOptions(
                "coordinator ping timeout must be shorter than the probe period",
            ));
        }
        if self.reap_period > self.liveness_window {
            return Err(ConfigError::IllegalOptions(
                "reap period must not exceed the liveness window",
            ));
        }
        if self.heartbeat_period >= self.liveness_window {
            return Err(ConfigError::IllegalOptions(
                "heartbeat period must be shorter than the liveness window",
            ));
        }

        Ok(())
    }
}

impl TryFrom<Options> for OptionsValidated {
    type Error = ConfigError;

    fn try_from(options: Options) -> Result<Self, Self::Error> {
        let values = OptionsValidated {
            heartbeat_period: options.heartbeat_period.unwrap_or(Duration::from_secs(5)),
            coord_probe_period: options.coord_probe_period.unwrap_or(Duration::from_secs(4)),
            ping_timeout: options.ping_timeout.unwrap_or(Duration::from_millis(1200)),
            election_timeout: options.election_timeout.unwrap_or(Duration::from_millis(1500)),
            sync_timeout: options.sync_timeout.unwrap_or(Duration::from_secs(5)),
            reap_period: options.reap_period.unwrap_or(Duration::from_secs(5)),
            liveness_window: options.liveness_window.unwrap_or(Duration::from_secs(15)),
            directory_timeout: options.directory_timeout.unwrap_or(Duration::from_secs(4)),
        };

        values.validate()?;
        Ok(values)
    }
}

/// Everything a replica process needs to come up.
#[derive(Clone)]
pub struct ReplicaConfig {
    /// Logical name announced to the directory. Stable across restarts if
    /// the operator sets it; generated otherwise.
    pub name: String,
    /// Reply endpoint to bind; also announced to the directory.
    pub endpoint: String,
    pub ref_addr: String,
    pub proxy_pub_addr: String,
    pub proxy_sub_addr: String,
    /// Router backend to connect back to as a worker. `None` disables the
    /// router path; the bound endpoint still serves direct requests.
    pub broker_dealer_addr: Option<String>,
    pub data_dir: std::path::PathBuf,
    pub options: Options,
}

impl ReplicaConfig {
    pub fn from_env(logger: &slog::Logger) -> Result<Self, ConfigError> {
        let name = match env::var("SERVER_NAME") {
            Ok(name) if !name.is_empty() => name,
            _ => {
                let name = format!("server-{:04}", rand::thread_rng().gen_range(0..10_000));
                slog::warn!(logger, "SERVER_NAME not set; using generated name '{}'", name);
                name
            }
        };

        // SERVER_ADDR is preferred; SERVER_REP_PORT is the legacy spelling
        // with the bind host inferred.
        let endpoint = match env::var("SERVER_ADDR") {
            Ok(addr) if !addr.is_empty() => addr,
            _ => match env::var("SERVER_REP_PORT") {
                Ok(port) if !port.is_empty() => {
                    let port: u16 = port
                        .parse()
                        .map_err(|_| ConfigError::InvalidEnv("SERVER_REP_PORT", port.clone()))?;
                    format!("tcp://0.0.0.0:{}", port)
                }
                _ => return Err(ConfigError::MissingEnv("SERVER_ADDR")),
            },
        };

        Ok(ReplicaConfig {
            name,
            endpoint,
            ref_addr: env_or_default(logger, "REF_ADDR", "tcp://ref:5550"),
            proxy_pub_addr: env_or_default(logger, "PROXY_PUB_ADDR", "tcp://proxy:5557"),
            proxy_sub_addr: env_or_default(logger, "PROXY_SUB_ADDR", "tcp://proxy:5558"),
            broker_dealer_addr: env::var("BROKER_DEALER_ADDR").ok().filter(|v| !v.is_empty()),
            data_dir: env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string()).into(),
            options: Options::default(),
        })
    }
}

#[derive(Clone)]
pub struct DirectoryConfig {
    pub bind_addr: String,
    pub options: Options,
}

impl DirectoryConfig {
    pub fn from_env(logger: &slog::Logger) -> Result<Self, ConfigError> {
        Ok(DirectoryConfig {
            bind_addr: env_or_default(logger, "REF_BIND_ADDR", "tcp://*:5550"),
            options: Options::default(),
        })
    }
}

#[derive(Clone)]
pub struct RouterConfig {
    /// Client-facing side.
    pub frontend_addr: String,
    /// Replica-facing side; declared here once, replicas reach it through
    /// BROKER_DEALER_ADDR.
    pub backend_addr: String,
}

impl RouterConfig {
    pub fn from_env(logger: &slog::Logger) -> Result<Self, ConfigError> {
        Ok(RouterConfig {
            frontend_addr: env_or_default(logger, "ROUTER_FRONTEND_ADDR", "tcp://*:5555"),
            backend_addr: env_or_default(logger, "ROUTER_BACKEND_ADDR", "tcp://*:6000"),
        })
    }
}

#[derive(Clone)]
pub struct ForwarderConfig {
    /// Publisher-facing side.
    pub xsub_addr: String,
    /// Subscriber-facing side.
    pub xpub_addr: String,
}

impl ForwarderConfig {
    pub fn from_env(logger: &slog::Logger) -> Result<Self, ConfigError> {
        Ok(ForwarderConfig {
            xsub_addr: env_or_default(logger, "XSUB_ADDR", "tcp://*:5557"),
            xpub_addr: env_or_default(logger, "XPUB_ADDR", "tcp://*:5558"),
        })
    }
}

fn env_or_default(logger: &slog::Logger, key: &'static str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => {
            slog::warn!(logger, "{} not set; using default '{}'", key, default);
            default.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_constants() {
        let validated = OptionsValidated::try_from(Options::default()).expect("defaults validate");
        assert_eq!(validated.heartbeat_period, Duration::from_secs(5));
        assert_eq!(validated.coord_probe_period, Duration::from_secs(4));
        assert_eq!(validated.ping_timeout, Duration::from_millis(1200));
        assert_eq!(validated.election_timeout, Duration::from_millis(1500));
        assert_eq!(validated.sync_timeout, Duration::from_secs(5));
        assert_eq!(validated.reap_period, Duration::from_secs(5));
        assert_eq!(validated.liveness_window, Duration::from_secs(15));
    }

    #[test]
    fn ping_timeout_must_undercut_probe_period() {
        let options = Options {
            coord_probe_period: Some(Duration::from_millis(500)),
            ping_timeout: Some(Duration::from_millis(500)),
            ..Options::default()
        };
        assert!(OptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn reap_period_must_fit_liveness_window() {
        let options = Options {
            heartbeat_period: Some(Duration::from_millis(100)),
            reap_period: Some(Duration::from_secs(20)),
            liveness_window: Some(Duration::from_secs(15)),
            ..Options::default()
        };
        assert!(OptionsValidated::try_from(options).is_err());
    }
}

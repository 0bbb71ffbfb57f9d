//! Configuration from environment variables with CLI-flag overrides.
//!
//! Every knob has an `MB_*` environment variable and a `--kebab-case` flag;
//! flags win. Nothing is persisted to disk.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use upstream::SessionConfig;

pub const USAGE: &str = "\
MarketBridge - market data and order entry gateway

USAGE:
    marketbridge [OPTIONS]

OPTIONS:
    --upstream-host <HOST>          Brokerage API host [default: 127.0.0.1]
    --upstream-port <PORT>          Brokerage API port [default: 7497]
    --ws-host <HOST>                WebSocket listen host [default: 0.0.0.0]
    --ws-port <PORT>                WebSocket listen port [default: 8765]
    --metrics-port <PORT>           Prometheus exporter port [default: 9102]
    --idle-timeout <SECS>           Quiet period before an upstream ping [default: 30]
    --pong-timeout <SECS>           Grace after a ping before reconnect [default: 10]
    --reconnect-base <SECS>         Initial reconnect backoff [default: 1]
    --reconnect-cap <SECS>          Maximum reconnect backoff [default: 30]
    --max-reconnect-attempts <N>    Give up after N attempts [default: unbounded]
    --send-deadline <SECS>          Deadline for upstream sends [default: 5]
    --client-queue-capacity <N>     Per-client outbound queue [default: 1024]
    --order-retention <SECS>        Keep terminal orders this long [default: 86400]
    --max-ws-message-bytes <N>      Largest accepted client frame [default: 262144]
    -h, --help                      Print this message

ENVIRONMENT:
    MB_UPSTREAM_HOST, MB_UPSTREAM_PORT, MB_WS_HOST, MB_WS_PORT, METRICS_PORT,
    MB_IDLE_TIMEOUT_SECS, MB_PONG_TIMEOUT_SECS, MB_RECONNECT_BASE_SECS,
    MB_RECONNECT_CAP_SECS, MB_MAX_RECONNECT_ATTEMPTS, MB_SEND_DEADLINE_SECS,
    MB_CLIENT_QUEUE_CAPACITY, MB_ORDER_RETENTION_SECS, MB_MAX_WS_MESSAGE_BYTES,
    RUST_LOG
";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: String, value: String },

    #[error("unknown argument: {0}")]
    UnknownArgument(String),

    #[error("missing value for {0}")]
    MissingValue(String),

    /// `--help` was requested; not an error, but it short-circuits startup.
    #[error("help requested")]
    Help,
}

impl ConfigError {
    /// Usage mistakes exit with code 64; bad values with code 1.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ConfigError::UnknownArgument(_) | ConfigError::MissingValue(_)
        )
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub ws_host: String,
    pub ws_port: u16,
    pub metrics_port: u16,
    pub idle_timeout: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: Option<u32>,
    pub send_deadline: Duration,
    pub client_queue_capacity: usize,
    pub order_retention: Duration,
    pub max_ws_message_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 7497,
            ws_host: "0.0.0.0".to_string(),
            ws_port: 8765,
            metrics_port: 9102,
            idle_timeout: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: None,
            send_deadline: Duration::from_secs(5),
            client_queue_capacity: 1024,
            order_retention: Duration::from_secs(86_400),
            max_ws_message_bytes: 256 * 1024,
        }
    }
}

impl Config {
    /// Defaults, then environment, then CLI flags.
    pub fn load(args: impl Iterator<Item = String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        config.apply_args(args)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = env_string("MB_UPSTREAM_HOST") {
            self.upstream_host = host;
        }
        if let Some(port) = env_parse("MB_UPSTREAM_PORT")? {
            self.upstream_port = port;
        }
        if let Some(host) = env_string("MB_WS_HOST") {
            self.ws_host = host;
        }
        if let Some(port) = env_parse("MB_WS_PORT")? {
            self.ws_port = port;
        }
        if let Some(port) = env_parse("METRICS_PORT")? {
            self.metrics_port = port;
        }
        if let Some(secs) = env_parse("MB_IDLE_TIMEOUT_SECS")? {
            self.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("MB_PONG_TIMEOUT_SECS")? {
            self.pong_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("MB_RECONNECT_BASE_SECS")? {
            self.reconnect_base = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("MB_RECONNECT_CAP_SECS")? {
            self.reconnect_cap = Duration::from_secs(secs);
        }
        if let Some(attempts) = env_parse("MB_MAX_RECONNECT_ATTEMPTS")? {
            self.max_reconnect_attempts = Some(attempts);
        }
        if let Some(secs) = env_parse("MB_SEND_DEADLINE_SECS")? {
            self.send_deadline = Duration::from_secs(secs);
        }
        if let Some(capacity) = env_parse("MB_CLIENT_QUEUE_CAPACITY")? {
            self.client_queue_capacity = capacity;
        }
        if let Some(secs) = env_parse("MB_ORDER_RETENTION_SECS")? {
            self.order_retention = Duration::from_secs(secs);
        }
        if let Some(bytes) = env_parse("MB_MAX_WS_MESSAGE_BYTES")? {
            self.max_ws_message_bytes = bytes;
        }
        Ok(())
    }

    fn apply_args(&mut self, mut args: impl Iterator<Item = String>) -> Result<(), ConfigError> {
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => return Err(ConfigError::Help),
                "--upstream-host" => self.upstream_host = take(&mut args, &arg)?,
                "--upstream-port" => self.upstream_port = parse(&mut args, &arg)?,
                "--ws-host" => self.ws_host = take(&mut args, &arg)?,
                "--ws-port" => self.ws_port = parse(&mut args, &arg)?,
                "--metrics-port" => self.metrics_port = parse(&mut args, &arg)?,
                "--idle-timeout" => self.idle_timeout = Duration::from_secs(parse(&mut args, &arg)?),
                "--pong-timeout" => self.pong_timeout = Duration::from_secs(parse(&mut args, &arg)?),
                "--reconnect-base" => {
                    self.reconnect_base = Duration::from_secs(parse(&mut args, &arg)?)
                }
                "--reconnect-cap" => {
                    self.reconnect_cap = Duration::from_secs(parse(&mut args, &arg)?)
                }
                "--max-reconnect-attempts" => {
                    self.max_reconnect_attempts = Some(parse(&mut args, &arg)?)
                }
                "--send-deadline" => {
                    self.send_deadline = Duration::from_secs(parse(&mut args, &arg)?)
                }
                "--client-queue-capacity" => {
                    self.client_queue_capacity = parse(&mut args, &arg)?
                }
                "--order-retention" => {
                    self.order_retention = Duration::from_secs(parse(&mut args, &arg)?)
                }
                "--max-ws-message-bytes" => {
                    self.max_ws_message_bytes = parse(&mut args, &arg)?
                }
                other => return Err(ConfigError::UnknownArgument(other.to_string())),
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.client_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "client-queue-capacity".to_string(),
                value: "0".to_string(),
            });
        }
        if self.reconnect_base > self.reconnect_cap {
            return Err(ConfigError::Invalid {
                name: "reconnect-base".to_string(),
                value: format!(
                    "{}s exceeds the cap of {}s",
                    self.reconnect_base.as_secs(),
                    self.reconnect_cap.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// Session knobs in the upstream crate's terms.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            reconnect_base: self.reconnect_base,
            reconnect_cap: self.reconnect_cap,
            max_attempts: self.max_reconnect_attempts,
            idle_timeout: self.idle_timeout,
            pong_timeout: self.pong_timeout,
            send_deadline: self.send_deadline,
            ..SessionConfig::default()
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
    }
}

fn take(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<String, ConfigError> {
    args.next()
        .ok_or_else(|| ConfigError::MissingValue(flag.to_string()))
}

fn parse<T: FromStr>(
    args: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<T, ConfigError> {
    let value = take(args, flag)?;
    value.parse().map_err(|_| ConfigError::Invalid {
        name: flag.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(args: &[&str]) -> Result<Config, ConfigError> {
        Config::load(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.ws_port, 8765);
        assert_eq!(config.upstream_port, 7497);
        assert_eq!(config.client_queue_capacity, 1024);
        assert_eq!(config.max_ws_message_bytes, 256 * 1024);
        assert_eq!(config.order_retention, Duration::from_secs(86_400));
        assert!(config.max_reconnect_attempts.is_none());
    }

    #[test]
    fn flags_override_defaults() {
        let config = load(&[
            "--ws-port",
            "9000",
            "--upstream-host",
            "10.0.0.5",
            "--client-queue-capacity",
            "4",
            "--max-reconnect-attempts",
            "12",
        ])
        .unwrap();
        assert_eq!(config.ws_port, 9000);
        assert_eq!(config.upstream_host, "10.0.0.5");
        assert_eq!(config.client_queue_capacity, 4);
        assert_eq!(config.max_reconnect_attempts, Some(12));
    }

    #[test]
    fn unknown_flags_are_usage_errors() {
        let err = load(&["--frobnicate"]).unwrap_err();
        assert!(err.is_usage());
        let err = load(&["--ws-port"]).unwrap_err();
        assert!(err.is_usage());
    }

    #[test]
    fn bad_values_are_config_errors() {
        let err = load(&["--ws-port", "not-a-port"]).unwrap_err();
        assert!(!err.is_usage());
        let err = load(&["--client-queue-capacity", "0"]).unwrap_err();
        assert!(!err.is_usage());
        let err = load(&["--reconnect-base", "60", "--reconnect-cap", "30"]).unwrap_err();
        assert!(!err.is_usage());
    }

    #[test]
    fn help_short_circuits() {
        assert!(matches!(load(&["--help"]), Err(ConfigError::Help)));
    }
}

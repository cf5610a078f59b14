use std::time::Duration;

use clap::Parser;

use crate::broker::BrokerSettings;

pub const API_KEY_ENV: &str = "TUNNEL_BROKER_API_KEY";

#[derive(Debug, Parser, Clone)]
#[command(name = "tunnel-broker")]
#[command(about = "Forwards HTTP requests over a pool of tunnel sockets to a remote peer")]
pub struct Config {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 4444)]
    pub port: u16,

    /// Number of parallel tunnel sockets the peer opens
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    pub expected_sockets: u64,

    /// Give up on a forwarded request after this many milliseconds (unbounded when unset)
    #[arg(long)]
    pub forward_timeout_ms: Option<u64>,

    /// Log a warning if the peer has not opened all sockets within this window
    #[arg(long)]
    pub ready_timeout_ms: Option<u64>,

    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Shared key tunnel sockets must present (default: from TUNNEL_BROKER_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value_t = false)]
    pub json_output: bool,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn forward_timeout(&self) -> Option<Duration> {
        self.forward_timeout_ms.map(Duration::from_millis)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            expected_sockets: self.expected_sockets as usize,
            forward_timeout: self.forward_timeout(),
            max_body_bytes: self.max_body_bytes,
        }
    }

    /// The flag wins over the environment; blank values disable the check.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;
    use clap::Parser;

    #[test]
    fn defaults() {
        let cfg = Config::parse_from(["tunnel-broker"]);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:4444");
        assert_eq!(cfg.expected_sockets, 4);
        assert_eq!(cfg.forward_timeout(), None);
        assert_eq!(cfg.max_body_bytes, 10 * 1024 * 1024);
        assert!(!cfg.json_output);
    }

    #[test]
    fn broker_settings_carry_deadline() {
        let cfg = Config::parse_from([
            "tunnel-broker",
            "--expected-sockets",
            "2",
            "--forward-timeout-ms",
            "1500",
        ]);
        let settings = cfg.broker_settings();
        assert_eq!(settings.expected_sockets, 2);
        assert_eq!(settings.forward_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn zero_expected_sockets_is_rejected() {
        assert!(Config::try_parse_from(["tunnel-broker", "--expected-sockets", "0"]).is_err());
    }

    #[test]
    fn blank_api_key_flag_disables_auth() {
        let cfg = Config::parse_from(["tunnel-broker", "--api-key", "  "]);
        assert_eq!(cfg.resolved_api_key(), None);
    }
}

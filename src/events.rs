use std::io::{self, Write};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// `RUST_LOG` takes precedence over `--log-level`.
pub fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cfg.log_level.clone()))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Writes tunnel lifecycle events as JSON lines on stderr when enabled.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    json_output: bool,
}

impl EventEmitter {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }

    pub fn emit<T: Serialize>(&self, event_type: &str, payload: T) {
        if !self.json_output {
            return;
        }

        let line = json!({
            "ts": Utc::now().to_rfc3339(),
            "type": event_type,
            "payload": payload,
        });

        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::EventEmitter;
    use serde_json::json;

    #[test]
    fn emit_disabled_is_noop() {
        let emitter = EventEmitter::default();
        emitter.emit("socket_registered", json!({"socket_id": "s1"}));
    }

    #[test]
    fn emit_enabled_no_panic() {
        let emitter = EventEmitter::new(true);
        emitter.emit("socket_registered", json!({"socket_id": "s1", "registered": 1}));
        emitter.emit("tunnel_ready", "all sockets registered");
        emitter.emit("request_failed", 502);
    }
}

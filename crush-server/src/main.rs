//! Code Crush relay server.
//!
//! Configuration comes from the environment, on top of
//! [`ServerConfig::default`]:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `CRUSH_BIND` | `127.0.0.1:9090` |
//! | `CRUSH_BROADCAST_CAPACITY` | `256` |
//! | `CRUSH_MAX_MESSAGE_BYTES` | `1048576` |
//! | `CRUSH_RUNNER` | `none` (or `local`) |
//! | `CRUSH_RUN_TIMEOUT_SECS` | `5` |
//!
//! Log verbosity is controlled by `RUST_LOG`. Ctrl-C closes every connection
//! and exits.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crush_collab::runner::{LocalRunner, DEFAULT_RUN_TIMEOUT};
use crush_collab::server::{RelayServer, ServerConfig};
use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunnerChoice {
    Disabled,
    Local,
}

#[derive(Debug)]
struct Settings {
    server: ServerConfig,
    runner: RunnerChoice,
    run_timeout: Duration,
}

/// Overlay variables from `lookup` on the defaults.
fn load_settings<F>(lookup: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut server = ServerConfig::default();
    if let Some(bind) = lookup("CRUSH_BIND") {
        server.bind_addr = bind;
    }
    if let Some(value) = lookup("CRUSH_BROADCAST_CAPACITY") {
        server.broadcast_capacity = parse_positive("CRUSH_BROADCAST_CAPACITY", value)?;
    }
    if let Some(value) = lookup("CRUSH_MAX_MESSAGE_BYTES") {
        server.max_message_bytes = parse_positive("CRUSH_MAX_MESSAGE_BYTES", value)?;
    }

    let runner = match lookup("CRUSH_RUNNER").as_deref().map(str::trim) {
        None | Some("") | Some("none") => RunnerChoice::Disabled,
        Some("local") => RunnerChoice::Local,
        Some(other) => {
            return Err(ConfigError::Invalid {
                name: "CRUSH_RUNNER",
                value: other.to_string(),
            })
        }
    };

    let run_timeout = match lookup("CRUSH_RUN_TIMEOUT_SECS") {
        Some(value) => Duration::from_secs(parse_positive("CRUSH_RUN_TIMEOUT_SECS", value)?),
        None => DEFAULT_RUN_TIMEOUT,
    };

    Ok(Settings {
        server,
        runner,
        run_timeout,
    })
}

fn parse_positive<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let parsed = value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid { name, value })?;
    if parsed == T::default() {
        return Err(ConfigError::Zero { name });
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let settings = load_settings(|name| std::env::var(name).ok())?;
    info!(
        "Starting Code Crush relay on {} (broadcast capacity {}, max message {} bytes)",
        settings.server.bind_addr,
        settings.server.broadcast_capacity,
        settings.server.max_message_bytes
    );

    let mut server = RelayServer::new(settings.server);
    if settings.runner == RunnerChoice::Local {
        warn!(
            "Local code execution enabled; submitted code runs unsandboxed for up to {:?}",
            settings.run_timeout
        );
        let runner = LocalRunner::default().with_timeout(settings.run_timeout);
        server = server.with_runner(Arc::new(runner));
    }

    let server = Arc::new(server);
    tokio::spawn({
        let server = server.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => server.shutdown().await,
                Err(e) => warn!("Cannot listen for Ctrl-C: {e}"),
            }
        }
    });

    server.run().await?;
    info!("Relay exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        load_settings(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.server.bind_addr, "127.0.0.1:9090");
        assert_eq!(s.server.broadcast_capacity, 256);
        assert_eq!(s.server.max_message_bytes, 1 << 20);
        assert_eq!(s.runner, RunnerChoice::Disabled);
        assert_eq!(s.run_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_overlay() {
        let s = settings(&[
            ("CRUSH_BIND", "0.0.0.0:8000"),
            ("CRUSH_BROADCAST_CAPACITY", " 64 "),
            ("CRUSH_MAX_MESSAGE_BYTES", "4096"),
            ("CRUSH_RUNNER", "local"),
            ("CRUSH_RUN_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(s.server.bind_addr, "0.0.0.0:8000");
        assert_eq!(s.server.broadcast_capacity, 64);
        assert_eq!(s.server.max_message_bytes, 4096);
        assert_eq!(s.runner, RunnerChoice::Local);
        assert_eq!(s.run_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_eq!(
            settings(&[("CRUSH_BROADCAST_CAPACITY", "lots")]).unwrap_err(),
            ConfigError::Invalid {
                name: "CRUSH_BROADCAST_CAPACITY",
                value: "lots".into()
            }
        );
        assert_eq!(
            settings(&[("CRUSH_MAX_MESSAGE_BYTES", "0")]).unwrap_err(),
            ConfigError::Zero {
                name: "CRUSH_MAX_MESSAGE_BYTES"
            }
        );
        assert_eq!(
            settings(&[("CRUSH_RUN_TIMEOUT_SECS", "0")]).unwrap_err(),
            ConfigError::Zero {
                name: "CRUSH_RUN_TIMEOUT_SECS"
            }
        );
        assert!(matches!(
            settings(&[("CRUSH_RUNNER", "docker")]),
            Err(ConfigError::Invalid { name: "CRUSH_RUNNER", .. })
        ));
    }
}

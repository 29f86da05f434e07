//! Agent configuration: one JSON file naming the bind address, the shared
//! token, the supervised targets and the monitor options.

use crate::monitor::MonitorOptions;
use crate::types::Target;
use crate::AgentError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "SVCWATCH_AGENT_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "agent.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared bearer token realtime clients must present.
    pub token: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub monitor: MonitorOptions,
    #[serde(default = "default_webhooks_path")]
    pub webhooks_path: PathBuf,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AgentError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let cfg: AgentConfig = serde_json::from_str(&raw)
            .map_err(|err| AgentError::Config(format!("cannot parse {}: {err}", path.display())))?;
        if cfg.token.is_empty() {
            return Err(AgentError::Config("token must not be empty".into()));
        }
        Ok(cfg)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9090
}

fn default_webhooks_path() -> PathBuf {
    PathBuf::from("webhooks.json")
}

/// `--config <path>` / `-c <path>` / `--config=<path>`, then the
/// `SVCWATCH_AGENT_CONFIG` env var, then `agent.json` next to the cwd.
pub fn config_path_from_args<I: IntoIterator<Item = String>>(args: I) -> PathBuf {
    let mut it = args.into_iter();
    let _ = it.next(); // program name
    let mut from_flag: Option<String> = None;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => from_flag = it.next(),
            _ if arg.starts_with("--config=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    from_flag = Some(v.to_string());
                }
            }
            _ => {}
        }
    }
    from_flag
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_flag_long_short_and_assign() {
        let path = config_path_from_args(vec![
            "agent".into(),
            "--config".into(),
            "/etc/a.json".into(),
        ]);
        assert_eq!(path, PathBuf::from("/etc/a.json"));

        let path = config_path_from_args(vec!["agent".into(), "-c".into(), "b.json".into()]);
        assert_eq!(path, PathBuf::from("b.json"));

        let path = config_path_from_args(vec!["agent".into(), "--config=c.json".into()]);
        assert_eq!(path, PathBuf::from("c.json"));
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"token":"t0ken"}"#).unwrap();
        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 9090);
        assert!(cfg.targets.is_empty());
        assert_eq!(cfg.monitor.poll_interval_ms, 5000);
        assert!(cfg.monitor.enable_process_metrics);
    }

    #[test]
    fn partial_monitor_options_fill_per_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(
            &path,
            r#"{"token":"t0ken","monitor":{"pollIntervalMs":250}}"#,
        )
        .unwrap();
        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.monitor.poll_interval_ms, 250);
        assert!(cfg.monitor.enable_process_metrics);
        assert_eq!(cfg.monitor.stale_threshold_ms, 30_000);
    }

    #[test]
    fn empty_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.json");
        std::fs::write(&path, r#"{"token":""}"#).unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }
}

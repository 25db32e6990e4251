use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default agent parameters attached to every outbound turn.
#[derive(Debug, Clone)]
pub struct AgentDefaults {
    pub agent_type: String,
    pub provider: String,
    pub model: String,
    pub temperature: f32,
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            agent_type: "general".to_string(),
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4".to_string(),
            temperature: 0.7,
        }
    }
}

/// Runtime tuning knobs.
///
/// Every cadence and threshold is configuration rather than a constant:
/// they trade responsiveness against overhead and the desktop shell may
/// override them. Constructed once at startup and handed to
/// `Runtime::spawn`; nothing reads ambient globals.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base URL of the agent process.
    pub endpoint: String,
    pub agent: AgentDefaults,
    /// How often accumulated trace entries are flushed to session state.
    pub flush_interval: Duration,
    /// Quiet period the persistence manager waits before writing.
    pub save_debounce: Duration,
    /// Cadence of the memory governor's idle scan.
    pub evict_scan_interval: Duration,
    /// Sessions idle longer than this are eviction candidates.
    pub idle_threshold: Duration,
    /// How many recent messages are eagerly rehydrated on switch.
    pub rehydrate_window: usize,
    /// Upper bound on a session's live message buffer.
    pub live_message_cap: usize,
    /// Outbound request timeout; agent turns can run for minutes.
    pub request_timeout: Duration,
    /// Override for the durable session file (tests); defaults to the
    /// per-user application-data directory.
    pub data_file: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8799".to_string(),
            agent: AgentDefaults::default(),
            flush_interval: Duration::from_millis(1500),
            save_debounce: Duration::from_secs(3),
            evict_scan_interval: Duration::from_secs(60),
            idle_threshold: Duration::from_secs(120),
            rehydrate_window: 50,
            live_message_cap: 200,
            request_timeout: Duration::from_secs(300),
            data_file: None,
        }
    }
}

impl RuntimeConfig {
    /// Resolve the durable session file path.
    pub fn session_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.data_file {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| Error::Configuration("could not find data directory".to_string()))?;
        Ok(data_dir.join("tandem").join("sessions.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_data_file_wins() {
        let config = RuntimeConfig {
            data_file: Some(PathBuf::from("/tmp/custom.json")),
            ..RuntimeConfig::default()
        };
        assert_eq!(
            config.session_file().unwrap(),
            PathBuf::from("/tmp/custom.json")
        );
    }

    #[test]
    fn test_default_path_lands_under_app_dir() {
        let config = RuntimeConfig::default();
        if let Ok(path) = config.session_file() {
            assert!(path.ends_with("tandem/sessions.json"));
        }
    }
}

use crate::error::{Result, SupervisorError};
use crate::models::{ProcessConfig, TerminalSize};
use crate::services::exception_tracker::DEFAULT_EXCEPTION_CAPACITY;
use crate::services::log_streamer::{DEFAULT_LOG_CAPACITY, DEFAULT_SUBSCRIBER_QUEUE};
use crate::services::process_manager::ManagerSettings;
use crate::services::restart_policy::RestartSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE: &str = "devrunner.json";
pub const LOCAL_CONFIG_FILE: &str = "devrunner.local.json";

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Log parser to run output through: `plain` or `rails`.
    pub framework: String,
    pub log_capacity: usize,
    pub subscriber_queue: usize,
    pub exception_capacity: usize,
    pub exception_hard_capacity: Option<usize>,
    pub stop_grace_ms: u64,
    pub restart: RestartSettings,
    pub terminal: TerminalSize,
    pub processes: Vec<ProcessConfig>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            framework: "plain".to_string(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            exception_capacity: DEFAULT_EXCEPTION_CAPACITY,
            exception_hard_capacity: None,
            stop_grace_ms: 5000,
            restart: RestartSettings::default(),
            terminal: TerminalSize::default(),
            processes: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            restart: self.restart.clone(),
            terminal_size: self.terminal,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.log_capacity == 0 {
            return Err(invalid("log_capacity must be greater than zero"));
        }
        if self.subscriber_queue == 0 {
            return Err(invalid("subscriber_queue must be greater than zero"));
        }
        if self.exception_capacity == 0 {
            return Err(invalid("exception_capacity must be greater than zero"));
        }
        if let Some(hard) = self.exception_hard_capacity {
            if hard < self.exception_capacity {
                return Err(invalid(
                    "exception_hard_capacity must not be below exception_capacity",
                ));
            }
        }

        let mut seen = HashSet::new();
        for process in &self.processes {
            if process.name.trim().is_empty() {
                return Err(invalid("process name must not be empty"));
            }
            if process.command.trim().is_empty() {
                return Err(invalid(&format!("process {} has no command", process.name)));
            }
            if !seen.insert(process.name.as_str()) {
                return Err(invalid(&format!("duplicate process name {}", process.name)));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> SupervisorError {
    SupervisorError::Config(message.to_string())
}

pub struct ConfigParser;

impl ConfigParser {
    /// Loads `devrunner.json` from `dir`, with `devrunner.local.json` merged
    /// over it when present.
    pub fn load_dir(dir: &Path) -> Result<SupervisorConfig> {
        Self::load(&dir.join(CONFIG_FILE))
    }

    /// Loads `path` and its `.local` sibling. Relative process `cwd`s are
    /// resolved against the directory holding the file.
    pub fn load(path: &Path) -> Result<SupervisorConfig> {
        if !path.exists() {
            return Err(SupervisorError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }
        let main = read_json(path)?;

        let local_path = local_sibling(path);
        let merged = if local_path.exists() {
            debug!(path = %local_path.display(), "merging local configuration");
            Self::merge_json(&main, &read_json(&local_path)?)
        } else {
            main
        };

        let mut config: SupervisorConfig = serde_json::from_value(merged)?;
        if let Some(base) = path.parent() {
            for process in &mut config.processes {
                if let Some(cwd) = process.cwd.as_mut() {
                    if cwd.is_relative() {
                        *cwd = base.join(&*cwd);
                    }
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Finds the configuration to use when none was given: the working
    /// directory first, then the user config directory.
    pub fn discover() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE);
        if local.exists() {
            return Some(local);
        }
        let candidate = dirs_next::config_dir()?.join("devrunner").join(CONFIG_FILE);
        candidate.exists().then_some(candidate)
    }

    /// Objects merge key by key; anything else in `overlay` replaces `base`,
    /// except `null`, which keeps it.
    fn merge_json(base: &Value, overlay: &Value) -> Value {
        match (base, overlay) {
            (Value::Object(base_obj), Value::Object(overlay_obj)) => {
                let mut merged = base_obj.clone();
                for (key, value) in overlay_obj {
                    let new_value = match merged.get(key) {
                        Some(existing) => Self::merge_json(existing, value),
                        None => value.clone(),
                    };
                    merged.insert(key.clone(), new_value);
                }
                Value::Object(merged)
            }
            (_, Value::Null) => base.clone(),
            (_, overlay_value) => overlay_value.clone(),
        }
    }
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).map_err(|e| {
        SupervisorError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&text)
        .map_err(|e| SupervisorError::Config(format!("invalid JSON in {}: {}", path.display(), e)))
}

/// `devrunner.json` -> `devrunner.local.json`.
fn local_sibling(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("devrunner");
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.local.{}", stem, ext),
        None => format!("{}.local", stem),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &Path, name: &str, value: Value) {
        fs::write(dir.join(name), serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let err = ConfigParser::load(Path::new("/nonexistent/devrunner.json")).unwrap_err();
        assert!(matches!(err, SupervisorError::Config(_)));
    }

    #[test]
    fn defaults_fill_unspecified_settings() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            CONFIG_FILE,
            json!({ "processes": [{ "name": "web", "command": "bin/rails", "args": ["server"] }] }),
        );

        let config = ConfigParser::load_dir(dir.path()).unwrap();
        assert_eq!(config.log_capacity, 10_000);
        assert_eq!(config.subscriber_queue, 256);
        assert_eq!(config.exception_capacity, 1000);
        assert_eq!(config.exception_hard_capacity, None);
        assert_eq!(config.restart.base_delay_secs, 1);
        assert_eq!(config.restart.max_attempts, None);
        assert_eq!(config.framework, "plain");

        let web = &config.processes[0];
        assert_eq!(web.args, vec!["server"]);
        assert!(!web.auto_restart);
        assert!(!web.pty);

        let settings = config.manager_settings();
        assert_eq!(settings.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn local_file_overrides_main() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            CONFIG_FILE,
            json!({
                "framework": "rails",
                "log_capacity": 500,
                "restart": { "base_delay_secs": 2, "max_delay_secs": 20 },
                "processes": [{ "name": "web", "command": "bin/rails" }]
            }),
        );
        write(
            dir.path(),
            LOCAL_CONFIG_FILE,
            json!({
                "log_capacity": 50,
                "framework": null,
                "restart": { "max_delay_secs": 10 }
            }),
        );

        let config = ConfigParser::load_dir(dir.path()).unwrap();
        assert_eq!(config.log_capacity, 50);
        assert_eq!(config.framework, "rails");
        assert_eq!(config.restart.base_delay_secs, 2);
        assert_eq!(config.restart.max_delay_secs, 10);
        assert_eq!(config.processes.len(), 1);
    }

    #[test]
    fn relative_cwd_resolves_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            CONFIG_FILE,
            json!({ "processes": [{ "name": "web", "command": "npm", "cwd": "frontend" }] }),
        );

        let config = ConfigParser::load_dir(dir.path()).unwrap();
        assert_eq!(config.processes[0].cwd, Some(dir.path().join("frontend")));
    }

    #[test]
    fn rejects_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            CONFIG_FILE,
            json!({ "processes": [
                { "name": "web", "command": "bin/rails" },
                { "name": "web", "command": "npm" }
            ] }),
        );

        let err = ConfigParser::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate process name web"));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = SupervisorConfig {
            log_capacity: 0,
            ..SupervisorConfig::default()
        };
        assert!(matches!(config.validate(), Err(SupervisorError::Config(_))));
    }

    #[test]
    fn invalid_json_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        let err = ConfigParser::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains(CONFIG_FILE));
    }

    #[test]
    fn local_sibling_name() {
        assert_eq!(
            local_sibling(Path::new("/srv/app/devrunner.json")),
            PathBuf::from("/srv/app/devrunner.local.json")
        );
    }
}

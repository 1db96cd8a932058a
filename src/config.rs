use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub const CONFIG_ENV: &str = "VMSTOP_CONFIG";

pub const DEFAULT_TICK_MILLIS: u64 = 1000;
pub const DEFAULT_GUEST_COMMAND: &str = "sudo shutdown -h now";
pub const DEFAULT_GUEST_COMMAND_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_WARNING_INTERVAL_MINS: u64 = 5;
pub const DEFAULT_FINAL_WARNING_MINS: u64 = 5;
pub const DEFAULT_SIGTERM_WAIT_SECS: u64 = 10;
pub const DEFAULT_SIGKILL_WAIT_SECS: u64 = 5;

/// Fully validated configuration for a shutdown coordinator and its collaborators.
#[derive(Debug, Clone, Default)]
pub struct ShutdownConfig {
    /// File the configuration was loaded from, if any.
    pub file_path: Option<PathBuf>,
    pub shutdown: ShutdownSettings,
    pub process: ProcessSettings,
    /// Non-fatal findings such as unknown keys.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSettings {
    pub tick_millis: u64,
    pub guest_command: String,
    pub guest_command_timeout_secs: u64,
    pub warn_guests: bool,
    pub warning_interval_mins: u64,
    pub final_warning_mins: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            tick_millis: DEFAULT_TICK_MILLIS,
            guest_command: DEFAULT_GUEST_COMMAND.to_string(),
            guest_command_timeout_secs: DEFAULT_GUEST_COMMAND_TIMEOUT_SECS,
            warn_guests: true,
            warning_interval_mins: DEFAULT_WARNING_INTERVAL_MINS,
            final_warning_mins: DEFAULT_FINAL_WARNING_MINS,
        }
    }
}

impl ShutdownSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    pub fn guest_command_timeout(&self) -> Duration {
        Duration::from_secs(self.guest_command_timeout_secs)
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick_millis = (tick.as_millis() as u64).max(1);
        self
    }

    pub fn with_guest_command_timeout(mut self, timeout: Duration) -> Self {
        self.guest_command_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_guest_command<S: Into<String>>(mut self, command: S) -> Self {
        self.guest_command = command.into();
        self
    }

    pub fn with_warn_guests(mut self, warn: bool) -> Self {
        self.warn_guests = warn;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSettings {
    pub sigterm_wait_secs: u64,
    pub sigkill_wait_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            sigterm_wait_secs: DEFAULT_SIGTERM_WAIT_SECS,
            sigkill_wait_secs: DEFAULT_SIGKILL_WAIT_SECS,
        }
    }
}

impl ProcessSettings {
    pub fn sigterm_wait(&self) -> Duration {
        Duration::from_secs(self.sigterm_wait_secs)
    }

    pub fn sigkill_wait(&self) -> Duration {
        Duration::from_secs(self.sigkill_wait_secs)
    }
}

impl ShutdownConfig {
    /// Load the file named by `VMSTOP_CONFIG`, or fall back to defaults when it is unset.
    pub fn discover() -> Result<Self> {
        match env::var_os(CONFIG_ENV) {
            Some(value) if !value.is_empty() => {
                let path = PathBuf::from(value);
                if !path.is_file() {
                    return Err(Error::ExplicitConfigMissing { path });
                }
                load_config(&path)
            }
            _ => Ok(Self::default()),
        }
    }
}

pub fn load_config(path: &Path) -> Result<ShutdownConfig> {
    let contents = fs::read_to_string(path).map_err(|source| Error::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&contents, path)
}

pub fn parse_config(contents: &str, path: &Path) -> Result<ShutdownConfig> {
    let value: toml::Value = toml::from_str(contents).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    let warnings = detect_unknown_fields(&value);

    let raw = RawConfig::deserialize(value).map_err(|source| Error::ParseConfig {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(ShutdownConfig {
        file_path: Some(path.to_path_buf()),
        shutdown: raw.shutdown.unwrap_or_default().into_settings(path)?,
        process: raw.process.unwrap_or_default().into_settings(path)?,
        warnings,
    })
}

fn invalid_config(path: &Path, message: impl Into<String>) -> Error {
    Error::InvalidConfig {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

fn detect_unknown_fields(value: &toml::Value) -> Vec<String> {
    let mut warnings = Vec::new();

    if let toml::Value::Table(table) = value {
        warn_table(table, &["shutdown", "process"], "root", &mut warnings);

        if let Some(shutdown) = table.get("shutdown") {
            if let toml::Value::Table(shutdown_table) = shutdown {
                warn_table(
                    shutdown_table,
                    &[
                        "tick_millis",
                        "guest_command",
                        "guest_command_timeout_secs",
                        "warn_guests",
                        "warning_interval_mins",
                        "final_warning_mins",
                    ],
                    "[shutdown]",
                    &mut warnings,
                );
            } else {
                warnings.push("Expected [shutdown] to be a table.".to_string());
            }
        }

        if let Some(process) = table.get("process") {
            if let toml::Value::Table(process_table) = process {
                warn_table(
                    process_table,
                    &["sigterm_wait_secs", "sigkill_wait_secs"],
                    "[process]",
                    &mut warnings,
                );
            } else {
                warnings.push("Expected [process] to be a table.".to_string());
            }
        }
    }

    warnings
}

fn warn_table(
    table: &toml::map::Map<String, toml::Value>,
    allowed: &[&str],
    context: &str,
    warnings: &mut Vec<String>,
) {
    for key in table.keys() {
        if !allowed.contains(&key.as_str()) {
            warnings.push(format!(
                "Unknown field `{key}` at {context}; this value will be ignored."
            ));
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    shutdown: Option<RawShutdown>,
    #[serde(default)]
    process: Option<RawProcess>,
}

#[derive(Debug, Deserialize, Default)]
struct RawShutdown {
    #[serde(default)]
    tick_millis: Option<u64>,
    #[serde(default)]
    guest_command: Option<String>,
    #[serde(default)]
    guest_command_timeout_secs: Option<u64>,
    #[serde(default)]
    warn_guests: Option<bool>,
    #[serde(default)]
    warning_interval_mins: Option<u64>,
    #[serde(default)]
    final_warning_mins: Option<u64>,
}

impl RawShutdown {
    fn into_settings(self, path: &Path) -> Result<ShutdownSettings> {
        let tick_millis = self.tick_millis.unwrap_or(DEFAULT_TICK_MILLIS);
        if tick_millis == 0 {
            return Err(invalid_config(
                path,
                "`[shutdown].tick_millis` must be at least 1.",
            ));
        }

        let guest_command = self
            .guest_command
            .unwrap_or_else(|| DEFAULT_GUEST_COMMAND.to_string());
        if guest_command.trim().is_empty() {
            return Err(invalid_config(
                path,
                "`[shutdown].guest_command` must not be empty.",
            ));
        }

        let timeout = self
            .guest_command_timeout_secs
            .unwrap_or(DEFAULT_GUEST_COMMAND_TIMEOUT_SECS);
        if timeout == 0 {
            return Err(invalid_config(
                path,
                "`[shutdown].guest_command_timeout_secs` must be at least 1 so a hung guest cannot stall the shutdown.",
            ));
        }

        let interval = self
            .warning_interval_mins
            .unwrap_or(DEFAULT_WARNING_INTERVAL_MINS);
        if interval == 0 {
            return Err(invalid_config(
                path,
                "`[shutdown].warning_interval_mins` must be at least 1.",
            ));
        }

        Ok(ShutdownSettings {
            tick_millis,
            guest_command,
            guest_command_timeout_secs: timeout,
            warn_guests: self.warn_guests.unwrap_or(true),
            warning_interval_mins: interval,
            final_warning_mins: self
                .final_warning_mins
                .unwrap_or(DEFAULT_FINAL_WARNING_MINS),
        })
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawProcess {
    #[serde(default)]
    sigterm_wait_secs: Option<u64>,
    #[serde(default)]
    sigkill_wait_secs: Option<u64>,
}

impl RawProcess {
    fn into_settings(self, path: &Path) -> Result<ProcessSettings> {
        let sigterm = self.sigterm_wait_secs.unwrap_or(DEFAULT_SIGTERM_WAIT_SECS);
        let sigkill = self.sigkill_wait_secs.unwrap_or(DEFAULT_SIGKILL_WAIT_SECS);

        if sigkill == 0 {
            return Err(invalid_config(
                path,
                "`[process].sigkill_wait_secs` must be at least 1 to confirm the VM process exited.",
            ));
        }

        Ok(ProcessSettings {
            sigterm_wait_secs: sigterm,
            sigkill_wait_secs: sigkill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{TempDir, tempdir};

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("vmstop.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn defaults_applied_for_empty_file() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "");

        let config = load_config(&path).expect("load config");
        assert_eq!(config.shutdown, ShutdownSettings::default());
        assert_eq!(config.process, ProcessSettings::default());
        assert_eq!(config.shutdown.tick(), Duration::from_secs(1));
        assert_eq!(
            config.shutdown.guest_command_timeout(),
            Duration::from_secs(DEFAULT_GUEST_COMMAND_TIMEOUT_SECS)
        );
        assert!(config.warnings.is_empty());
        assert_eq!(config.file_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn overrides_parse() {
        let dir = tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[shutdown]
tick_millis = 250
guest_command = "sudo poweroff"
guest_command_timeout_secs = 3
warn_guests = false
warning_interval_mins = 10
final_warning_mins = 2

[process]
sigterm_wait_secs = 4
sigkill_wait_secs = 2
"#,
        );

        let config = load_config(&path).expect("load config");
        assert_eq!(config.shutdown.tick(), Duration::from_millis(250));
        assert_eq!(config.shutdown.guest_command, "sudo poweroff");
        assert_eq!(config.shutdown.guest_command_timeout(), Duration::from_secs(3));
        assert!(!config.shutdown.warn_guests);
        assert_eq!(config.shutdown.warning_interval_mins, 10);
        assert_eq!(config.shutdown.final_warning_mins, 2);
        assert_eq!(config.process.sigterm_wait(), Duration::from_secs(4));
        assert_eq!(config.process.sigkill_wait(), Duration::from_secs(2));
    }

    #[test]
    fn zero_tick_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[shutdown]\ntick_millis = 0\n");

        let err = load_config(&path).expect_err("zero tick should fail");
        match err {
            Error::InvalidConfig { message, .. } => assert!(message.contains("tick_millis")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_guest_timeout_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[shutdown]\nguest_command_timeout_secs = 0\n");

        let err = load_config(&path).expect_err("zero timeout should fail");
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn blank_guest_command_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[shutdown]\nguest_command = \"   \"\n");

        assert!(matches!(
            load_config(&path),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn sigkill_requires_positive_duration() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[process]\nsigkill_wait_secs = 0\n");

        let err = load_config(&path).expect_err("zero sigkill wait should fail");
        match err {
            Error::InvalidConfig { message, .. } => {
                assert!(message.contains("sigkill_wait_secs"))
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_become_warnings() {
        let dir = tempdir().unwrap();
        let path = write_config(
            &dir,
            "[shutdown]\ntick_millis = 500\nlinger = true\n\n[extra]\nvalue = 1\n",
        );

        let config = load_config(&path).expect("load config");
        assert_eq!(config.shutdown.tick_millis, 500);
        assert_eq!(config.warnings.len(), 2);
        assert!(config.warnings.iter().any(|w| w.contains("`linger`")));
        assert!(config.warnings.iter().any(|w| w.contains("`extra`")));
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[shutdown\ntick_millis = 1");

        assert!(matches!(
            load_config(&path),
            Err(Error::ParseConfig { .. })
        ));
    }

    #[test]
    fn missing_file_reports_read_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(matches!(load_config(&path), Err(Error::ReadConfig { .. })));
    }

    #[test]
    fn discover_uses_defaults_without_env() {
        temp_env::with_var_unset(CONFIG_ENV, || {
            let config = ShutdownConfig::discover().expect("defaults");
            assert!(config.file_path.is_none());
            assert_eq!(config.shutdown, ShutdownSettings::default());
        });
    }

    #[test]
    fn discover_reads_env_path() {
        let dir = tempdir().unwrap();
        let path = write_config(&dir, "[shutdown]\ntick_millis = 100\n");

        temp_env::with_var(CONFIG_ENV, Some(path.as_os_str()), || {
            let config = ShutdownConfig::discover().expect("load from env");
            assert_eq!(config.shutdown.tick_millis, 100);
        });
    }

    #[test]
    fn discover_rejects_missing_env_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.toml");

        temp_env::with_var(CONFIG_ENV, Some(path.as_os_str()), || {
            assert!(matches!(
                ShutdownConfig::discover(),
                Err(Error::ExplicitConfigMissing { .. })
            ));
        });
    }
}

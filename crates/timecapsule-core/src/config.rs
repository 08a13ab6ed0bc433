//! Runtime configuration.
//!
//! Loaded from a JSON file, then overridden by environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Secret used when `ENCRYPTION_SECRET` is not set. Only fit for development.
pub const DEV_SECRET: &str = "dev-secret";

/// Environment variable holding the sender address.
pub const ENV_SMTP_EMAIL: &str = "SMTP_EMAIL";
/// Environment variable holding the SMTP password.
pub const ENV_SMTP_PASSWORD: &str = "SMTP_PASSWORD";
/// Environment variable holding the encryption secret.
pub const ENV_ENCRYPTION_SECRET: &str = "ENCRYPTION_SECRET";
/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "TIMECAPSULE_DATA_DIR";

/// Top-level configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root for `uploads/`, `capsules/` and the job database.
    pub data_dir: PathBuf,
    /// IANA zone used to interpret and render unlock times.
    pub timezone: String,
    /// Ceiling on the combined size of one capsule's attachments.
    pub max_upload_bytes: u64,
    /// Allowed attachment extensions, lowercase, without dots.
    pub allowed_extensions: Vec<String>,
    /// Secret the record key is derived from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_secret: Option<String>,
    /// Scheduler tuning.
    pub scheduler: SchedulerConfig,
    /// Outbound mail.
    pub smtp: SmtpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("timecapsule"),
            timezone: "Asia/Kolkata".into(),
            max_upload_bytes: 16 * 1024 * 1024,
            allowed_extensions: [
                "txt", "pdf", "png", "jpg", "jpeg", "gif", "doc", "docx", "zip", "mp4", "mov",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            encryption_secret: None,
            scheduler: SchedulerConfig::default(),
            smtp: SmtpConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("data_dir", &self.data_dir)
            .field("timezone", &self.timezone)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("allowed_extensions", &self.allowed_extensions)
            .field(
                "encryption_secret",
                &self.encryption_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("scheduler", &self.scheduler)
            .field("smtp", &self.smtp)
            .finish()
    }
}

impl Config {
    /// Default location of the config file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("timecapsule")
            .join("config.json")
    }

    /// Loads the file at `path` (or the default path) if it exists, then
    /// applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(Self::default_path, Path::to_path_buf);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides from a variable lookup (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(email) = non_empty(ENV_SMTP_EMAIL) {
            self.smtp.username = Some(email.clone());
            self.smtp.sender = Some(email);
        }
        if let Some(password) = non_empty(ENV_SMTP_PASSWORD) {
            self.smtp.password = Some(password);
        }
        if let Some(secret) = non_empty(ENV_ENCRYPTION_SECRET) {
            self.encryption_secret = Some(secret);
        }
        if let Some(dir) = non_empty(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Checks values that would otherwise fail later at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown zone or a zero-sized pool.
    pub fn validate(&self) -> Result<()> {
        self.zone()?;
        if self.scheduler.max_concurrent_dispatches == 0 {
            return Err(Error::Config("scheduler.max_concurrent_dispatches must be > 0".into()));
        }
        if self.scheduler.max_instances == 0 {
            return Err(Error::Config("scheduler.max_instances must be > 0".into()));
        }
        if self.scheduler.poll_interval_secs == 0 {
            return Err(Error::Config("scheduler.poll_interval_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Parses the configured zone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the name is not an IANA zone.
    pub fn zone(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| Error::Config(format!("unknown time zone {:?}", self.timezone)))
    }

    /// The configured secret, or [`DEV_SECRET`].
    #[must_use]
    pub fn secret(&self) -> &str {
        self.encryption_secret.as_deref().unwrap_or(DEV_SECRET)
    }

    /// Whether the development secret is in use.
    #[must_use]
    pub const fn uses_dev_secret(&self) -> bool {
        self.encryption_secret.is_none()
    }

    /// Staging folder for attachments.
    #[must_use]
    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    /// Folder holding encrypted capsule records.
    #[must_use]
    pub fn capsules_dir(&self) -> PathBuf {
        self.data_dir.join("capsules")
    }

    /// `SQLite` file holding the timers.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("scheduled_jobs.db")
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on dispatches running at once.
    pub max_concurrent_dispatches: usize,
    /// Upper bound on concurrent runs of one job id.
    pub max_instances: usize,
    /// How late a fire may be and still run.
    pub misfire_grace_secs: u64,
    /// Longest sleep between store polls.
    pub poll_interval_secs: u64,
    /// How long shutdown waits for in-flight dispatches before putting
    /// their timers back and aborting them. Keep it above the SMTP timeout.
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatches: 10,
            max_instances: 3,
            misfire_grace_secs: 3600,
            poll_interval_secs: 15,
            shutdown_timeout_secs: 90,
        }
    }
}

impl SchedulerConfig {
    /// Misfire grace as a duration.
    #[must_use]
    pub const fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_secs)
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Shutdown timeout as a duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Connection security for outbound mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain TCP.
    None,
    /// Implicit TLS.
    Tls,
    /// STARTTLS upgrade.
    #[default]
    StartTls,
}

/// Outbound mail settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connection security.
    pub security: SmtpSecurity,
    /// Login name.
    pub username: Option<String>,
    /// Login password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// From address; falls back to `username`.
    pub sender: Option<String>,
    /// Name sent with EHLO.
    pub hello_name: String,
    /// Deadline for one submission.
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".into(),
            port: 587,
            security: SmtpSecurity::StartTls,
            username: None,
            password: None,
            sender: None,
            hello_name: "localhost".into(),
            timeout_secs: 60,
        }
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("sender", &self.sender)
            .field("hello_name", &self.hello_name)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl SmtpConfig {
    /// The From address, if one is configured.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref().or(self.username.as_deref())
    }

    /// Checks that mail can actually be sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no sender is configured or a username is
    /// given without a password.
    pub fn validate(&self) -> Result<()> {
        if self.sender().is_none() {
            return Err(Error::Config(format!(
                "no sender address; set smtp.sender or {ENV_SMTP_EMAIL}"
            )));
        }
        if self.username.is_some() && self.password.is_none() {
            return Err(Error::Config(format!(
                "smtp.username is set but no password; set smtp.password or {ENV_SMTP_PASSWORD}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.zone().unwrap(), chrono_tz::Asia::Kolkata);
        assert_eq!(config.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.scheduler.max_concurrent_dispatches, 10);
        assert_eq!(config.scheduler.max_instances, 3);
        assert_eq!(config.scheduler.misfire_grace(), Duration::from_secs(3600));
        assert!(config.scheduler.shutdown_timeout_secs > config.smtp.timeout_secs);
        assert_eq!(config.smtp.port, 587);
        assert!(config.uses_dev_secret());
        assert_eq!(config.secret(), DEV_SECRET);
        config.validate().unwrap();
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = Config {
            encryption_secret: Some("correct horse battery".into()),
            ..Config::default()
        };
        config.smtp.password = Some("hunter2".into());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("correct horse battery"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("Asia/Kolkata"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"timezone": "Europe/Berlin", "smtp": {"port": 465, "security": "tls"}}"#)
                .unwrap();
        assert_eq!(config.timezone, "Europe/Berlin");
        assert_eq!(config.smtp.port, 465);
        assert_eq!(config.smtp.security, SmtpSecurity::Tls);
        assert_eq!(config.smtp.host, "smtp.gmail.com");
        assert_eq!(config.scheduler.poll_interval_secs, 15);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_SMTP_EMAIL, "me@example.com"),
            (ENV_SMTP_PASSWORD, "app-pass"),
            (ENV_ENCRYPTION_SECRET, "prod-secret"),
            (ENV_DATA_DIR, "/tmp/tc"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|k| env.get(k).map(ToString::to_string));

        assert_eq!(config.smtp.sender(), Some("me@example.com"));
        assert_eq!(config.smtp.password.as_deref(), Some("app-pass"));
        assert_eq!(config.secret(), "prod-secret");
        assert_eq!(config.database_path(), PathBuf::from("/tmp/tc/scheduled_jobs.db"));
        config.smtp.validate().unwrap();
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = Config::default();
        config.apply_overrides(|_| Some("  ".into()));
        assert!(config.uses_dev_secret());
        assert!(config.smtp.sender().is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            timezone: "Mars/Olympus".into(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.timezone = "UTC".into();
        config.scheduler.max_concurrent_dispatches = 0;
        assert!(config.validate().is_err());

        assert!(SmtpConfig::default().validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let smtp = SmtpConfig {
            password: Some("hunter2".into()),
            ..SmtpConfig::default()
        };
        assert!(!format!("{smtp:?}").contains("hunter2"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.timezone, "Asia/Kolkata");
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
    }
}

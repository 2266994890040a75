//! Configuration types for the recorder and the player.
//!
//! Both configurations load from YAML and fill every missing field with its
//! default, so an empty file (or no file at all) yields a usable setup.
//! Command-line overrides are applied on top by the CLI before `validate()`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::retry::Backoff;
use crate::writer::{FieldMatch, SessionFilter};

/// Smallest accepted payload cap, in bytes.
pub const MIN_PAYLOAD: usize = 32;

/// Longest accepted coalescing window, in seconds.
pub const MAX_LATENCY_SECS: f64 = 86_400.0;

/// Sink records are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterKind {
    #[default]
    File,
    Journal,
    Syslog,
}

impl WriterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WriterKind::File => "file",
            WriterKind::Journal => "journal",
            WriterKind::Syslog => "syslog",
        }
    }
}

impl fmt::Display for WriterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(WriterKind::File),
            "journal" => Ok(WriterKind::Journal),
            "syslog" => Ok(WriterKind::Syslog),
            other => Err(ConfigError::invalid(
                "writer",
                format!("unknown writer '{other}' (expected file, journal or syslog)"),
            )),
        }
    }
}

/// Sink records are read from. Syslog cannot be read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderKind {
    #[default]
    File,
    Journal,
}

impl fmt::Display for ReaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReaderKind::File => "file",
            ReaderKind::Journal => "journal",
        })
    }
}

impl FromStr for ReaderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ReaderKind::File),
            "journal" => Ok(ReaderKind::Journal),
            other => Err(ConfigError::invalid(
                "reader",
                format!("unknown reader '{other}' (expected file or journal)"),
            )),
        }
    }
}

/// What happens to bytes arriving faster than the configured rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    /// Record everything; the limit is not enforced.
    #[default]
    Pass,
    /// Discard what exceeds the budget.
    Drop,
    /// Hold the producer until the budget allows the bytes.
    Delay,
}

impl fmt::Display for LimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LimitAction::Pass => "pass",
            LimitAction::Drop => "drop",
            LimitAction::Delay => "delay",
        })
    }
}

impl FromStr for LimitAction {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(LimitAction::Pass),
            "drop" => Ok(LimitAction::Drop),
            "delay" => Ok(LimitAction::Delay),
            other => Err(ConfigError::invalid(
                "limit.action",
                format!("unknown action '{other}' (expected pass, drop or delay)"),
            )),
        }
    }
}

/// Token-bucket rate limit applied to captured I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Sustained rate in bytes per second.
    pub rate: u64,

    /// Bytes that may be admitted at once above the sustained rate.
    pub burst: u64,

    pub action: LimitAction,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            rate: 16_384,
            burst: 32_768,
            action: LimitAction::Pass,
        }
    }
}

/// Which streams are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub input: bool,
    pub output: bool,
    pub window: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            input: false,
            output: true,
            window: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub path: Option<PathBuf>,
}

/// Journal sink options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Syslog priority level (0 emerg .. 7 debug) of every entry.
    pub priority: u8,

    /// Attach session fields to entries so they can be matched.
    pub augment: bool,

    /// Field matches used when reading (`FIELD=VALUE`).
    pub matches: Vec<String>,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            priority: 6,
            augment: true,
            matches: Vec::new(),
        }
    }
}

/// Syslog sink options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyslogConfig {
    /// Facility code (10 is authpriv).
    pub facility: u8,

    /// Priority level (0 emerg .. 7 debug).
    pub priority: u8,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            facility: 10,
            priority: 6,
        }
    }
}

/// Recorder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Shell started when no command is given.
    pub shell: String,

    /// Message printed to the user before recording starts.
    pub notice: Option<String>,

    pub writer: WriterKind,

    /// Maximum encoded payload size of one record, in bytes.
    pub payload: usize,

    /// Coalescing window in seconds.
    pub latency: f64,

    pub log: LogConfig,
    pub limit: LimitConfig,
    pub file: FileConfig,
    pub journal: JournalConfig,
    pub syslog: SyslogConfig,

    /// Retry policy for transient writer failures.
    pub retry: Backoff,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            notice: None,
            writer: WriterKind::File,
            payload: 2048,
            latency: 10.0,
            log: LogConfig::default(),
            limit: LimitConfig::default(),
            file: FileConfig::default(),
            journal: JournalConfig::default(),
            syslog: SyslogConfig::default(),
            retry: Backoff::default(),
        }
    }
}

impl RecorderConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading recorder configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!(
            writer = %config.writer,
            payload = config.payload,
            latency = config.latency,
            "Recorder configuration loaded"
        );
        Ok(config)
    }

    /// Coalescing window as a duration.
    ///
    /// Out-of-range values are clamped; [`RecorderConfig::validate`] rejects them.
    pub fn latency(&self) -> Duration {
        Duration::try_from_secs_f64(self.latency.clamp(0.0, MAX_LATENCY_SECS)).unwrap_or_default()
    }

    /// Rejects values capture cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.payload < MIN_PAYLOAD {
            return Err(ConfigError::invalid(
                "payload",
                format!("{} is below the minimum of {MIN_PAYLOAD}", self.payload),
            ));
        }
        if !self.latency.is_finite() || self.latency <= 0.0 {
            return Err(ConfigError::invalid(
                "latency",
                format!("{} must be a positive number of seconds", self.latency),
            ));
        }
        if self.latency > MAX_LATENCY_SECS {
            return Err(ConfigError::invalid(
                "latency",
                format!("{} exceeds the maximum of {MAX_LATENCY_SECS} seconds", self.latency),
            ));
        }
        if self.limit.rate == 0 {
            return Err(ConfigError::invalid("limit.rate", "must be positive"));
        }
        if self.limit.burst == 0 {
            return Err(ConfigError::invalid("limit.burst", "must be positive"));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::invalid("retry.attempts", "must be at least 1"));
        }
        if self.writer == WriterKind::File && self.file.path.is_none() {
            return Err(ConfigError::invalid(
                "file.path",
                "the file writer needs a path",
            ));
        }
        if self.journal.priority > 7 {
            return Err(ConfigError::invalid("journal.priority", "must be 0..=7"));
        }
        if self.syslog.priority > 7 {
            return Err(ConfigError::invalid("syslog.priority", "must be 0..=7"));
        }
        if self.syslog.facility > 23 {
            return Err(ConfigError::invalid("syslog.facility", "must be 0..=23"));
        }
        Ok(())
    }
}

/// Player configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub reader: ReaderKind,
    pub file: FileConfig,
    pub journal: JournalConfig,

    /// Session to play; the first session found when unset.
    pub rec: Option<String>,

    /// Initial speed multiplier.
    pub speed: f64,

    /// Position to jump to before timed playback (`start`, `end`, `#ID`
    /// or `[[HH:]MM:]SS[.sss]`).
    pub goto: Option<String>,

    /// Keep polling for new records until the session ends.
    pub follow: bool,

    /// Stay paused at the end instead of exiting.
    pub persist: bool,

    /// Interval between polls in follow mode, in milliseconds.
    pub poll_interval_ms: u64,

    /// Retry policy while records are not yet visible in the sink.
    pub retry: Backoff,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            reader: ReaderKind::File,
            file: FileConfig::default(),
            journal: JournalConfig::default(),
            rec: None,
            speed: 1.0,
            goto: None,
            follow: false,
            persist: false,
            poll_interval_ms: 250,
            retry: Backoff {
                attempts: 10,
                initial_ms: 100,
                max_ms: 5_000,
            },
        }
    }
}

impl PlayerConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading player configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Session filter built from `rec` and the `FIELD=VALUE` matches.
    pub fn filter(&self) -> Result<SessionFilter, ConfigError> {
        let mut filter = SessionFilter {
            rec: self.rec.clone(),
            matches: Vec::new(),
        };
        for raw in &self.journal.matches {
            let field_match: FieldMatch = raw.parse().map_err(|_| {
                ConfigError::invalid("journal.matches", format!("'{raw}' is not FIELD=VALUE"))
            })?;
            filter = filter.with_match(field_match);
        }
        Ok(filter)
    }

    /// Rejects values playback cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(ConfigError::invalid(
                "speed",
                format!("{} must be a positive multiplier", self.speed),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive"));
        }
        if self.retry.attempts == 0 {
            return Err(ConfigError::invalid("retry.attempts", "must be at least 1"));
        }
        if self.reader == ReaderKind::File && self.file.path.is_none() {
            return Err(ConfigError::invalid(
                "file.path",
                "the file reader needs a path",
            ));
        }
        self.filter()?;
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for scribe_proto::Error {
    fn from(err: ConfigError) -> Self {
        scribe_proto::Error::InvalidConfig(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_defaults() {
        let config = RecorderConfig::default();
        assert_eq!(config.payload, 2048);
        assert_eq!(config.latency(), Duration::from_secs(10));
        assert_eq!(config.writer, WriterKind::File);
        assert_eq!(config.limit.action, LimitAction::Pass);
        assert!(config.log.output);
        assert!(!config.log.input);
        assert!(config.log.window);
        assert!(config.journal.augment);
    }

    #[test]
    fn test_parse_yaml_partial() {
        let yaml = r"
writer: journal
payload: 256
limit:
  rate: 10
  action: drop
log:
  input: true
";
        let config: RecorderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.writer, WriterKind::Journal);
        assert_eq!(config.payload, 256);
        assert_eq!(config.limit.rate, 10);
        assert_eq!(config.limit.burst, 32_768);
        assert_eq!(config.limit.action, LimitAction::Drop);
        assert!(config.log.input);
        assert!(config.log.output);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scribe.yml");
        std::fs::write(&path, "writer: file\nfile:\n  path: /tmp/session.log\n").unwrap();
        let config = RecorderConfig::from_file(&path).unwrap();
        assert_eq!(config.file.path, Some(PathBuf::from("/tmp/session.log")));
        config.validate().unwrap();

        let missing = RecorderConfig::from_file(dir.path().join("missing.yml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_payload_below_minimum_rejected() {
        let config = RecorderConfig {
            payload: 31,
            file: FileConfig {
                path: Some(PathBuf::from("x")),
            },
            ..RecorderConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn test_latency_out_of_range_rejected() {
        let mut config = RecorderConfig {
            file: FileConfig {
                path: Some(PathBuf::from("x")),
            },
            ..RecorderConfig::default()
        };
        for latency in [0.0, -1.0, f64::NAN, 1e30, MAX_LATENCY_SECS + 1.0] {
            config.latency = latency;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("latency"), "{latency}: {err}");
            let _ = config.latency();
        }
        config.latency = 1e30;
        assert_eq!(config.latency(), Duration::from_secs(86_400));
        config.latency = MAX_LATENCY_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_non_positive_limits_rejected() {
        let mut config = RecorderConfig {
            file: FileConfig {
                path: Some(PathBuf::from("x")),
            },
            ..RecorderConfig::default()
        };
        config.limit.rate = 0;
        assert!(config.validate().is_err());
        config.limit.rate = 10;
        config.limit.burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_writer_requires_path() {
        let config = RecorderConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("file.path"));

        let journal = RecorderConfig {
            writer: WriterKind::Journal,
            ..RecorderConfig::default()
        };
        journal.validate().unwrap();
    }

    #[test]
    fn test_unknown_writer_rejected() {
        assert_eq!("syslog".parse::<WriterKind>().unwrap(), WriterKind::Syslog);
        let err = "nowhere".parse::<WriterKind>().unwrap_err();
        assert!(err.to_string().contains("nowhere"));
        assert!("stdout".parse::<LimitAction>().is_err());
    }

    #[test]
    fn test_player_validation() {
        let config = PlayerConfig {
            file: FileConfig {
                path: Some(PathBuf::from("session.log")),
            },
            ..PlayerConfig::default()
        };
        config.validate().unwrap();

        let zero = PlayerConfig {
            speed: 0.0,
            ..config.clone()
        };
        assert!(zero.validate().is_err());

        let negative = PlayerConfig {
            speed: -2.0,
            ..config
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_player_filter_from_matches() {
        let mut config = PlayerConfig {
            reader: ReaderKind::Journal,
            rec: Some("abc".to_string()),
            ..PlayerConfig::default()
        };
        config.journal.matches = vec!["USER=alice".to_string()];
        let filter = config.filter().unwrap();
        assert_eq!(filter.to_string(), "rec=abc USER=alice");

        config.journal.matches.push("nonsense".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "journal.matches",
                ..
            })
        ));
    }

    #[test]
    fn test_config_serializes_as_json() {
        let json = serde_json::to_string(&RecorderConfig::default()).unwrap();
        assert!(json.contains(r#""writer":"file""#));
        assert!(json.contains(r#""action":"pass""#));
    }

    #[test]
    fn test_config_error_converts() {
        let err: scribe_proto::Error = ConfigError::invalid("speed", "bad").into();
        assert!(matches!(err, scribe_proto::Error::InvalidConfig(_)));
    }
}

//! Concrete sinks and their construction from configuration.

pub mod file;
pub mod journal;
pub mod syslog;

use scribe_proto::{Error, Result};

use crate::config::{PlayerConfig, ReaderKind, RecorderConfig, WriterKind};
use crate::writer::{RecordSource, RecordWriter};

pub use file::{FileSource, FileWriter};
pub use journal::{JournalSource, JournalWriter};
pub use syslog::SyslogWriter;

/// Creates the configured writer without touching the sink.
pub fn build_writer(config: &RecorderConfig) -> Result<Box<dyn RecordWriter>> {
    match config.writer {
        WriterKind::File => {
            let path = config
                .file
                .path
                .clone()
                .ok_or_else(|| Error::InvalidConfig("the file writer needs a path".into()))?;
            Ok(Box::new(FileWriter::new(path)))
        }
        WriterKind::Journal => Ok(Box::new(JournalWriter::new(
            config.journal.priority,
            config.journal.augment,
        ))),
        WriterKind::Syslog => Ok(Box::new(SyslogWriter::new(
            config.syslog.facility,
            config.syslog.priority,
        ))),
    }
}

/// Creates the configured source.
pub fn build_source(config: &PlayerConfig) -> Result<Box<dyn RecordSource>> {
    match config.reader {
        ReaderKind::File => {
            let path = config
                .file
                .path
                .clone()
                .ok_or_else(|| Error::InvalidConfig("the file reader needs a path".into()))?;
            Ok(Box::new(FileSource::new(path)))
        }
        ReaderKind::Journal => Ok(Box::new(JournalSource::new())),
    }
}

/// Whether records written by `kind` can be played back.
pub fn supports_reading(kind: WriterKind) -> bool {
    !matches!(kind, WriterKind::Syslog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use std::path::PathBuf;

    #[test]
    fn test_build_writer_by_kind() {
        let config = RecorderConfig {
            file: FileConfig {
                path: Some(PathBuf::from("/tmp/x.log")),
            },
            ..RecorderConfig::default()
        };
        assert_eq!(build_writer(&config).unwrap().name(), "file");

        let journal = RecorderConfig {
            writer: WriterKind::Journal,
            ..RecorderConfig::default()
        };
        assert_eq!(build_writer(&journal).unwrap().name(), "journal");

        let syslog = RecorderConfig {
            writer: WriterKind::Syslog,
            ..RecorderConfig::default()
        };
        assert_eq!(build_writer(&syslog).unwrap().name(), "syslog");
    }

    #[test]
    fn test_file_writer_without_path_rejected() {
        let err = build_writer(&RecorderConfig::default()).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_build_source() {
        let journal = PlayerConfig {
            reader: ReaderKind::Journal,
            ..PlayerConfig::default()
        };
        let source = build_source(&journal).unwrap();
        assert_eq!(source.name(), "journal");
        assert!(!supports_reading(WriterKind::Syslog));
        assert!(supports_reading(WriterKind::File));
    }
}

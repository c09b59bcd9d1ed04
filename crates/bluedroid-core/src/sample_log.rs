//! Append-only per-channel sample logs.
//!
//! One text file per channel, one record per line (see
//! [`Sample::to_record`]). Writers to the same channel are serialized by a
//! per-channel lock, so records never interleave mid-line.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use bluedroid_types::{ChannelKind, Sample};

use crate::error::{Error, Result};

struct ChannelLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl ChannelLog {
    fn writer(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The set of open sample logs for one service run.
#[derive(Default)]
pub struct SampleLog {
    directory: PathBuf,
    channels: HashMap<ChannelKind, ChannelLog>,
}

impl std::fmt::Debug for SampleLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleLog")
            .field("directory", &self.directory)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SampleLog {
    /// Open (creating if needed) one append-mode file per channel.
    ///
    /// `directory` is created if it does not exist. Channels not listed are
    /// never opened; appends to them fail with [`Error::LogClosed`].
    pub fn open<P: AsRef<Path>>(directory: P, files: &[(ChannelKind, String)]) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory).map_err(|source| Error::LogOpen {
            path: directory.clone(),
            source,
        })?;

        let mut channels = HashMap::new();
        for (channel, file_name) in files {
            let path = directory.join(file_name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| Error::LogOpen {
                    path: path.clone(),
                    source,
                })?;
            debug!("Opened {} log at {}", channel, path.display());
            channels.insert(
                *channel,
                ChannelLog {
                    path,
                    writer: Mutex::new(Some(BufWriter::new(file))),
                },
            );
        }

        info!(
            "Sample logs open in {} ({} channel(s))",
            directory.display(),
            channels.len()
        );
        Ok(Self {
            directory,
            channels,
        })
    }

    /// Directory the logs live in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of a channel's log file, if the channel was opened.
    pub fn path(&self, channel: ChannelKind) -> Option<&Path> {
        self.channels.get(&channel).map(|log| log.path.as_path())
    }

    /// Whether appends to `channel` currently succeed.
    pub fn is_open(&self, channel: ChannelKind) -> bool {
        self.channels
            .get(&channel)
            .is_some_and(|log| log.writer().is_some())
    }

    /// Append one record to the sample's channel log.
    pub fn append(&self, sample: &Sample) -> Result<()> {
        let log = self
            .channels
            .get(&sample.channel)
            .ok_or(Error::LogClosed(sample.channel))?;
        let mut guard = log.writer();
        let writer = guard.as_mut().ok_or(Error::LogClosed(sample.channel))?;
        writeln!(writer, "{}", sample)
            .map_err(|e| Error::write(log.path.display().to_string(), e.to_string()))
    }

    /// Flush and release one channel's file. Closing twice is a no-op.
    pub fn close(&self, channel: ChannelKind) -> Result<()> {
        let Some(log) = self.channels.get(&channel) else {
            return Ok(());
        };
        let writer = log.writer().take();
        if let Some(mut writer) = writer {
            writer
                .flush()
                .map_err(|e| Error::write(log.path.display().to_string(), e.to_string()))?;
            debug!("Closed {} log", channel);
        }
        Ok(())
    }

    /// Close every channel, returning the first failure after trying all.
    pub fn close_all(&self) -> Result<()> {
        let mut first_err = None;
        for channel in self.channels.keys() {
            if let Err(e) = self.close(*channel) {
                warn!("Failed to close {} log: {}", channel, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bluedroid_types::Acceleration;
    use tempfile::TempDir;

    fn files() -> Vec<(ChannelKind, String)> {
        vec![
            (ChannelKind::Accelerometer, "accelerometer.csv".to_string()),
            (ChannelKind::Rssi, "rssi.csv".to_string()),
        ]
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        let log = SampleLog::open(&nested, &files()).unwrap();
        assert!(nested.is_dir());
        assert!(log.path(ChannelKind::Rssi).unwrap().exists());
        assert!(log.path(ChannelKind::Battery).is_none());
    }

    #[test]
    fn test_append_and_close() {
        let dir = TempDir::new().unwrap();
        let log = SampleLog::open(dir.path(), &files()).unwrap();

        log.append(&Sample::acceleration(1, Acceleration::new(1.0, 2.0, 3.0)))
            .unwrap();
        log.append(&Sample::rssi(2, -60)).unwrap();
        log.close_all().unwrap();

        let accel = std::fs::read_to_string(dir.path().join("accelerometer.csv")).unwrap();
        assert_eq!(accel, "1, 1.000000, 2.000000, 3.000000\n");
        let rssi = std::fs::read_to_string(dir.path().join("rssi.csv")).unwrap();
        assert_eq!(rssi, "2, -60\n");
    }

    #[test]
    fn test_append_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let log = SampleLog::open(dir.path(), &files()).unwrap();
        log.close(ChannelKind::Rssi).unwrap();

        assert!(!log.is_open(ChannelKind::Rssi));
        assert!(log.is_open(ChannelKind::Accelerometer));
        let err = log.append(&Sample::rssi(1, -40)).unwrap_err();
        assert!(matches!(err, Error::LogClosed(ChannelKind::Rssi)));

        // second close is a no-op
        log.close(ChannelKind::Rssi).unwrap();
    }

    #[test]
    fn test_append_to_unopened_channel() {
        let dir = TempDir::new().unwrap();
        let log = SampleLog::open(dir.path(), &files()).unwrap();
        let err = log.append(&Sample::battery(1, 90)).unwrap_err();
        assert!(matches!(err, Error::LogClosed(ChannelKind::Battery)));
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        for ts in [1, 2] {
            let log = SampleLog::open(dir.path(), &files()).unwrap();
            log.append(&Sample::rssi(ts, -50)).unwrap();
            log.close_all().unwrap();
        }
        let rssi = std::fs::read_to_string(dir.path().join("rssi.csv")).unwrap();
        assert_eq!(rssi, "1, -50\n2, -50\n");
    }

    #[test]
    fn test_concurrent_appends_never_split_records() {
        let dir = TempDir::new().unwrap();
        let log = std::sync::Arc::new(SampleLog::open(dir.path(), &files()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|thread| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let accel = Acceleration::new(thread as f64, i as f64, -1.5);
                        log.append(&Sample::acceleration(i, accel)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        log.close_all().unwrap();

        let content = std::fs::read_to_string(dir.path().join("accelerometer.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 8 * 500);
        for line in lines {
            let fields: Vec<&str> = line.split(", ").collect();
            assert_eq!(fields.len(), 4, "split record: {line:?}");
            assert_eq!(fields[3], "-1.500000");
        }
    }
}

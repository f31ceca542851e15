//! File-backed streams.
//!
//! Regular files cannot be registered with epoll, so they are read on a
//! timer instead: as fast as the loop allows by default, or a fixed number
//! of bytes per tick to replay a recording at a bounded rate.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;

use nix::fcntl::OFlag;

/// Bytes read per tick when no rate limit is configured.
pub const DEFAULT_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileConfig {
    pub path: PathBuf,
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
    /// Read at most this many bytes per `tick_interval`; 0 means unlimited.
    pub bytes_per_tick: usize,
    pub tick_interval: Duration,
}

impl FileConfig {
    pub fn reader(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
            bytes_per_tick: 0,
            tick_interval: Duration::ZERO,
        }
    }

    /// Create or truncate `path` for writing.
    pub fn writer(path: impl Into<PathBuf>) -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: true,
            ..Self::reader(path)
        }
    }

    pub fn appender(path: impl Into<PathBuf>) -> Self {
        Self {
            truncate: false,
            append: true,
            ..Self::writer(path)
        }
    }

    pub fn rate_limited(mut self, bytes_per_tick: usize, tick_interval: Duration) -> Self {
        self.bytes_per_tick = bytes_per_tick;
        self.tick_interval = tick_interval;
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.bytes_per_tick > 0
    }

    /// Bytes to read per tick.
    pub(crate) fn chunk(&self) -> usize {
        if self.is_rate_limited() {
            self.bytes_per_tick
        } else {
            DEFAULT_CHUNK
        }
    }

    /// Open with the configured flags.  Read-only opens are non-blocking so
    /// a FIFO without a writer does not stall the loop.
    pub fn open(&self) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write && !self.append)
            .append(self.append)
            .create(self.create)
            .truncate(self.truncate && !self.append);
        if self.read && !self.write {
            options.custom_flags(OFlag::O_NONBLOCK.bits());
        }
        let file = options.open(&self.path)?;
        log::debug!("[file] opened {}", self.path.display());
        Ok(file)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn writer_truncates_and_appender_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.bin");

        FileConfig::writer(&path).open().unwrap().write_all(b"first").unwrap();
        FileConfig::appender(&path).open().unwrap().write_all(b"+more").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first+more");

        FileConfig::writer(&path).open().unwrap().write_all(b"x").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn reader_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileConfig::reader(dir.path().join("missing")).open().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn reader_opens_existing_file() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();
        let mut buf = String::new();
        FileConfig::reader(tmp.path()).open().unwrap().read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");
    }

    #[test]
    fn chunk_size_follows_rate_limit() {
        let plain = FileConfig::reader("/dev/null");
        assert!(!plain.is_rate_limited());
        assert_eq!(plain.chunk(), DEFAULT_CHUNK);

        let limited = plain.rate_limited(100, Duration::from_millis(10));
        assert!(limited.is_rate_limited());
        assert_eq!(limited.chunk(), 100);
        assert_eq!(limited.tick_interval, Duration::from_millis(10));
    }
}

//! Pseudo-terminal pairs exposed as a device path.
//!
//! The master side is what a [`crate::stream::Stream`] reads and writes; the
//! slave path (optionally reachable through a stable symlink) is handed to
//! whatever program expects a serial port.

use std::fs::{File, OpenOptions};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};

use crate::serial::{self, LineSettings, SerialError};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PtyConfig {
    pub line: LineSettings,
    /// See [`crate::serial::SerialConfig::raw`].
    pub raw: bool,
    /// Create (or replace) a symlink here pointing at the slave device.
    pub link: Option<PathBuf>,
}

/// An open pseudo-terminal.
#[derive(Debug)]
pub struct Pty {
    pub master: File,
    pub device: PtyDevice,
}

/// The slave side of a [`Pty`].
///
/// A slave handle is kept open for as long as this value lives so the
/// master never sees a hangup while no external program has the device open.
#[derive(Debug)]
pub struct PtyDevice {
    pub slave_path: PathBuf,
    pub link: Option<PathBuf>,
    _slave: File,
}

impl PtyDevice {
    /// Remove the symlink, if one was created.
    pub fn unlink(&self) {
        if let Some(link) = &self.link {
            remove_link(link);
        }
    }
}

pub fn open(config: &PtyConfig) -> Result<Pty, SerialError> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK)?;
    grantpt(&master)?;
    unlockpt(&master)?;
    let slave_path = PathBuf::from(ptsname_r(&master)?);

    let slave = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
        .open(&slave_path)
        .map_err(|source| SerialError::Open {
            path: slave_path.clone(),
            source,
        })?;
    if !config.raw {
        serial::configure(&slave, &config.line)?;
    }

    if let Some(link) = &config.link {
        remove_link(link);
        std::os::unix::fs::symlink(&slave_path, link).map_err(|source| SerialError::Link {
            link: link.clone(),
            target: slave_path.clone(),
            source,
        })?;
        log::info!("[pty] {} -> {}", link.display(), slave_path.display());
    } else {
        log::info!("[pty] opened {}", slave_path.display());
    }

    // SAFETY: `into_raw_fd` hands over sole ownership of a valid, open fd.
    let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
    Ok(Pty {
        master,
        device: PtyDevice {
            slave_path,
            link: config.link.clone(),
            _slave: slave,
        },
    })
}

fn remove_link(link: &Path) {
    if link.symlink_metadata().is_ok() {
        if let Err(e) = std::fs::remove_file(link) {
            log::warn!("[pty] failed to remove {}: {e}", link.display());
        }
    }
}

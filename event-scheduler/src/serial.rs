//! Serial line settings and terminal configuration.
//!
//! Baud rates form a fixed, closed set that maps one-to-one onto the Linux
//! termios `Bxxx` constants; anything else falls back to 115200 when parsed
//! leniently with [`BaudRate::from_bps_or_default`].

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use nix::fcntl::OFlag;
use nix::sys::termios::{self, ControlFlags, SetArg, SpecialCharacterIndices, Termios};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("termios: {0}")]
    Termios(#[from] nix::Error),
    #[error("unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),
    #[error("failed to link {link} -> {target}: {source}")]
    Link {
        link: PathBuf,
        target: PathBuf,
        source: io::Error,
    },
}

// ---------------------------------------------------------------------------
// Line parameters
// ---------------------------------------------------------------------------

macro_rules! baud_rates {
    ($($variant:ident = $bps:literal),+ $(,)?) => {
        /// Supported line speeds.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum BaudRate {
            $($variant),+
        }

        impl BaudRate {
            /// Every supported rate, slowest first.
            pub const ALL: &'static [BaudRate] = &[$(BaudRate::$variant),+];

            pub fn from_bps(bps: u32) -> Option<Self> {
                match bps {
                    $($bps => Some(BaudRate::$variant),)+
                    _ => None,
                }
            }

            pub fn bps(self) -> u32 {
                match self {
                    $(BaudRate::$variant => $bps),+
                }
            }

            fn to_termios(self) -> termios::BaudRate {
                match self {
                    $(BaudRate::$variant => termios::BaudRate::$variant),+
                }
            }
        }
    };
}

baud_rates! {
    B50 = 50,
    B75 = 75,
    B110 = 110,
    B134 = 134,
    B150 = 150,
    B200 = 200,
    B300 = 300,
    B600 = 600,
    B1200 = 1200,
    B1800 = 1800,
    B2400 = 2400,
    B4800 = 4800,
    B9600 = 9600,
    B19200 = 19200,
    B38400 = 38400,
    B57600 = 57600,
    B115200 = 115200,
    B230400 = 230400,
    B460800 = 460800,
    B500000 = 500000,
    B576000 = 576000,
    B921600 = 921600,
    B1000000 = 1000000,
    B1152000 = 1152000,
    B1500000 = 1500000,
    B2000000 = 2000000,
    B2500000 = 2500000,
    B3000000 = 3000000,
    B3500000 = 3500000,
    B4000000 = 4000000,
}

impl BaudRate {
    pub fn from_bps_or_default(bps: u32) -> Self {
        Self::from_bps(bps).unwrap_or_else(|| {
            log::warn!("[serial] unsupported baud rate {bps}, using 115200");
            Self::default()
        })
    }
}

impl Default for BaudRate {
    fn default() -> Self {
        Self::B115200
    }
}

impl std::str::FromStr for BaudRate {
    type Err = SerialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bps: u32 = s
            .trim()
            .parse()
            .map_err(|_| SerialError::UnsupportedBaudRate(0))?;
        Self::from_bps(bps).ok_or(SerialError::UnsupportedBaudRate(bps))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    pub fn from_count(bits: u8) -> Option<Self> {
        match bits {
            5 => Some(Self::Five),
            6 => Some(Self::Six),
            7 => Some(Self::Seven),
            8 => Some(Self::Eight),
            _ => None,
        }
    }

    fn flag(self) -> ControlFlags {
        match self {
            Self::Five => ControlFlags::CS5,
            Self::Six => ControlFlags::CS6,
            Self::Seven => ControlFlags::CS7,
            Self::Eight => ControlFlags::CS8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Speed and framing applied to a terminal device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineSettings {
    pub baud_rate: BaudRate,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

/// Serial device to open as a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub device: PathBuf,
    pub line: LineSettings,
    /// Use the device exactly as opened, without touching its termios.
    pub raw: bool,
}

impl SerialConfig {
    pub fn new(device: impl Into<PathBuf>, baud_rate: BaudRate) -> Self {
        Self {
            device: device.into(),
            line: LineSettings {
                baud_rate,
                ..LineSettings::default()
            },
            raw: false,
        }
    }
}

// ---------------------------------------------------------------------------
// termios
// ---------------------------------------------------------------------------

/// Rewrite `termios` for binary, non-canonical I/O with the given framing.
///
/// Reads never block in the driver (`VMIN = VTIME = 0`); the reactor decides
/// when to read.
pub fn apply_line_settings(termios: &mut Termios, line: &LineSettings) -> Result<(), SerialError> {
    termios::cfmakeraw(termios);
    termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;

    let flags = &mut termios.control_flags;
    flags.insert(ControlFlags::CLOCAL | ControlFlags::CREAD);
    flags.remove(
        ControlFlags::CRTSCTS
            | ControlFlags::CSIZE
            | ControlFlags::CSTOPB
            | ControlFlags::PARENB
            | ControlFlags::PARODD,
    );
    flags.insert(line.data_bits.flag());
    if line.stop_bits == StopBits::Two {
        flags.insert(ControlFlags::CSTOPB);
    }
    match line.parity {
        Parity::None => {}
        Parity::Even => flags.insert(ControlFlags::PARENB),
        Parity::Odd => flags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
    }

    let speed = line.baud_rate.to_termios();
    termios::cfsetispeed(termios, speed)?;
    termios::cfsetospeed(termios, speed)?;
    Ok(())
}

/// Configure the terminal behind `fd`.
pub fn configure<Fd: AsFd>(fd: Fd, line: &LineSettings) -> Result<(), SerialError> {
    let mut attrs = termios::tcgetattr(&fd)?;
    apply_line_settings(&mut attrs, line)?;
    termios::tcsetattr(&fd, SetArg::TCSANOW, &attrs)?;
    log::debug!("[serial] configured {} bps", line.baud_rate.bps());
    Ok(())
}

/// Open and configure a serial device for non-blocking use.
pub fn open(config: &SerialConfig) -> Result<File, SerialError> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).bits())
        .open(&config.device)
        .map_err(|source| SerialError::Open {
            path: config.device.clone(),
            source,
        })?;
    if !config.raw {
        configure(&file, &config.line)?;
    }
    log::info!(
        "[serial] opened {} at {} bps",
        config.device.display(),
        config.line.baud_rate.bps()
    );
    Ok(file)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_rate_round_trips_through_bps() {
        for rate in BaudRate::ALL {
            assert_eq!(BaudRate::from_bps(rate.bps()), Some(*rate));
        }
        assert_eq!(BaudRate::ALL.len(), 30);
    }

    #[test]
    fn unknown_rate_falls_back_to_115200() {
        assert_eq!(BaudRate::from_bps(12345), None);
        assert_eq!(BaudRate::from_bps_or_default(12345), BaudRate::B115200);
        assert_eq!(BaudRate::from_bps_or_default(9600), BaudRate::B9600);
    }

    #[test]
    fn parse_baud_rate() {
        assert_eq!("921600".parse::<BaudRate>().unwrap(), BaudRate::B921600);
        assert!(matches!(
            "14400".parse::<BaudRate>(),
            Err(SerialError::UnsupportedBaudRate(14400))
        ));
        assert!("fast".parse::<BaudRate>().is_err());
    }

    #[test]
    fn data_bits_from_count() {
        assert_eq!(DataBits::from_count(5), Some(DataBits::Five));
        assert_eq!(DataBits::from_count(8), Some(DataBits::Eight));
        assert_eq!(DataBits::from_count(9), None);
    }

    #[test]
    fn defaults_are_8n1_at_115200() {
        let line = LineSettings::default();
        assert_eq!(line.baud_rate, BaudRate::B115200);
        assert_eq!(line.data_bits, DataBits::Eight);
        assert_eq!(line.stop_bits, StopBits::One);
        assert_eq!(line.parity, Parity::None);
    }
}

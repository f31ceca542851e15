//! Broadcast ephemeris store with an on-disk cache.
//!
//! Up to [`MAX_PER_SATELLITE`] ephemerides are kept per satellite, ordered
//! by reference time; the oldest is evicted when a new one arrives.  The
//! cache file is rewritten after every accepted ephemeris.
//!
//! Cache layout (all little-endian, no padding).  The header is written
//! field by field rather than as an in-memory struct, so it is 28 bytes with
//! `timestamp` at offset 20; caches dumped from a natively aligned header
//! (32 bytes, padding before `timestamp`) are not interchangeable with it.
//! Records use this module's own [`Ephemeris::to_bytes`] encoding.
//!
//! ```text
//!  0        4        8        12       16       20               28
//!  ┌────────┬────────┬────────┬────────┬────────┬────────────────┐
//!  │ magic  │version │  gps   │  gal   │  bds   │   timestamp    │
//!  └────────┴────────┴────────┴────────┴────────┴────────────────┘
//!  followed by gps + gal + bds records of RECORD_LEN bytes, grouped by
//!  constellation in that order.
//! ```
//!
//! A file with the wrong magic or version, or one that is cut short, loads
//! as an empty cache.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub const CACHE_MAGIC: u32 = 0x4550_4845;
pub const CACHE_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 28;
pub const MAX_PER_SATELLITE: usize = 10;

pub const SECONDS_PER_WEEK: f64 = 604_800.0;

const ORBIT_FIELDS: usize = 15;
const CLOCK_FIELDS: usize = 4;

/// Serialised size of one ephemeris: satellite (2), week (2), iod (2),
/// toe/toc/fit (3 × 8), orbit and clock terms.
pub const RECORD_LEN: usize = 6 + 8 * (3 + ORBIT_FIELDS + CLOCK_FIELDS);

#[derive(Debug, Error)]
pub enum EphemerisError {
    #[error("invalid satellite {0}")]
    InvalidSatellite(SatelliteId),
    #[error("bad cache magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported cache version {0}")]
    UnsupportedVersion(u32),
    #[error("cache truncated")]
    Truncated,
    #[error("unknown constellation {0}")]
    UnknownConstellation(u8),
    #[error("cache I/O: {0}")]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Satellites and time
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Constellation {
    Gps,
    Galileo,
    Beidou,
}

impl Constellation {
    pub const ALL: [Constellation; 3] =
        [Constellation::Gps, Constellation::Galileo, Constellation::Beidou];

    fn max_prn(self) -> u8 {
        match self {
            Constellation::Gps => 32,
            Constellation::Galileo => 36,
            Constellation::Beidou => 63,
        }
    }

    fn letter(self) -> char {
        match self {
            Constellation::Gps => 'G',
            Constellation::Galileo => 'E',
            Constellation::Beidou => 'C',
        }
    }

    fn code(self) -> u8 {
        match self {
            Constellation::Gps => 0,
            Constellation::Galileo => 1,
            Constellation::Beidou => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self, EphemerisError> {
        match code {
            0 => Ok(Constellation::Gps),
            1 => Ok(Constellation::Galileo),
            2 => Ok(Constellation::Beidou),
            other => Err(EphemerisError::UnknownConstellation(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SatelliteId {
    pub constellation: Constellation,
    pub prn: u8,
}

impl SatelliteId {
    pub fn gps(prn: u8) -> Self {
        Self {
            constellation: Constellation::Gps,
            prn,
        }
    }

    pub fn galileo(prn: u8) -> Self {
        Self {
            constellation: Constellation::Galileo,
            prn,
        }
    }

    pub fn beidou(prn: u8) -> Self {
        Self {
            constellation: Constellation::Beidou,
            prn,
        }
    }

    pub fn is_valid(&self) -> bool {
        (1..=self.constellation.max_prn()).contains(&self.prn)
    }

    /// RINEX-style name, e.g. `G07`.
    pub fn name(&self) -> String {
        format!("{}{:02}", self.constellation.letter(), self.prn)
    }
}

impl fmt::Display for SatelliteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Week number and time of week in the satellite's own time system.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct GnssTime {
    pub week: u16,
    pub tow: f64,
}

impl GnssTime {
    pub fn new(week: u16, tow: f64) -> Self {
        Self { week, tow }
    }

    pub fn seconds(&self) -> f64 {
        f64::from(self.week) * SECONDS_PER_WEEK + self.tow
    }
}

// ---------------------------------------------------------------------------
// Ephemeris
// ---------------------------------------------------------------------------

/// Keplerian orbit and harmonic corrections.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Orbit {
    pub sqrt_a: f64,
    pub e: f64,
    pub i0: f64,
    pub omega0: f64,
    pub omega: f64,
    pub m0: f64,
    pub delta_n: f64,
    pub idot: f64,
    pub omega_dot: f64,
    pub cuc: f64,
    pub cus: f64,
    pub crc: f64,
    pub crs: f64,
    pub cic: f64,
    pub cis: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockModel {
    pub af0: f64,
    pub af1: f64,
    pub af2: f64,
    pub tgd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ephemeris {
    pub satellite: SatelliteId,
    pub week: u16,
    pub iod: u16,
    /// Reference time of ephemeris, seconds of week.
    pub toe: f64,
    /// Reference time of clock, seconds of week.
    pub toc: f64,
    /// Length of the validity window centred on `toe`, in seconds.
    pub fit_interval: f64,
    pub orbit: Orbit,
    pub clock: ClockModel,
}

impl Ephemeris {
    pub fn new(satellite: SatelliteId, week: u16, iod: u16, toe: f64) -> Self {
        Self {
            satellite,
            week,
            iod,
            toe,
            toc: toe,
            fit_interval: 4.0 * 3600.0,
            orbit: Orbit::default(),
            clock: ClockModel::default(),
        }
    }

    pub fn reference(&self) -> GnssTime {
        GnssTime::new(self.week, self.toe)
    }

    /// Seconds between `time` and the reference time.
    pub fn age(&self, time: GnssTime) -> f64 {
        time.seconds() - self.reference().seconds()
    }

    pub fn is_valid(&self, time: GnssTime) -> bool {
        self.age(time).abs() <= self.fit_interval / 2.0
    }

    /// Same broadcast: equal week, issue of data and reference time.
    pub fn matches(&self, other: &Ephemeris) -> bool {
        self.satellite == other.satellite
            && self.week == other.week
            && self.iod == other.iod
            && self.toe == other.toe
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_LEN);
        out.push(self.satellite.constellation.code());
        out.push(self.satellite.prn);
        out.extend_from_slice(&self.week.to_le_bytes());
        out.extend_from_slice(&self.iod.to_le_bytes());
        let o = &self.orbit;
        let c = &self.clock;
        let values = [
            self.toe,
            self.toc,
            self.fit_interval,
            o.sqrt_a,
            o.e,
            o.i0,
            o.omega0,
            o.omega,
            o.m0,
            o.delta_n,
            o.idot,
            o.omega_dot,
            o.cuc,
            o.cus,
            o.crc,
            o.crs,
            o.cic,
            o.cis,
            c.af0,
            c.af1,
            c.af2,
            c.tgd,
        ];
        for value in values {
            out.extend_from_slice(&value.to_le_bytes());
        }
        debug_assert_eq!(out.len(), RECORD_LEN);
        out
    }

    /// Parse one record; `buf` must hold at least [`RECORD_LEN`] bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, EphemerisError> {
        let mut r = Cursor::new(buf);
        let constellation = Constellation::from_code(r.u8()?)?;
        let satellite = SatelliteId {
            constellation,
            prn: r.u8()?,
        };
        if !satellite.is_valid() {
            return Err(EphemerisError::InvalidSatellite(satellite));
        }
        let week = r.u16()?;
        let iod = r.u16()?;
        let toe = r.f64()?;
        let toc = r.f64()?;
        let fit_interval = r.f64()?;
        let orbit = Orbit {
            sqrt_a: r.f64()?,
            e: r.f64()?,
            i0: r.f64()?,
            omega0: r.f64()?,
            omega: r.f64()?,
            m0: r.f64()?,
            delta_n: r.f64()?,
            idot: r.f64()?,
            omega_dot: r.f64()?,
            cuc: r.f64()?,
            cus: r.f64()?,
            crc: r.f64()?,
            crs: r.f64()?,
            cic: r.f64()?,
            cis: r.f64()?,
        };
        let clock = ClockModel {
            af0: r.f64()?,
            af1: r.f64()?,
            af2: r.f64()?,
            tgd: r.f64()?,
        };
        Ok(Self {
            satellite,
            week,
            iod,
            toe,
            toc,
            fit_interval,
            orbit,
            clock,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], EphemerisError> {
        let end = self.pos + N;
        let bytes = self.buf.get(self.pos..end).ok_or(EphemerisError::Truncated)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EphemerisError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, EphemerisError> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Result<u32, EphemerisError> {
        self.take().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, EphemerisError> {
        self.take().map(u64::from_le_bytes)
    }

    fn f64(&mut self) -> Result<f64, EphemerisError> {
        self.take().map(f64::from_le_bytes)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct EphemerisEngine {
    satellites: BTreeMap<SatelliteId, Vec<Ephemeris>>,
    cache_file: Option<PathBuf>,
}

impl EphemerisEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    pub fn len(&self) -> usize {
        self.satellites.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, constellation: Constellation) -> usize {
        self.satellites
            .iter()
            .filter(|(id, _)| id.constellation == constellation)
            .map(|(_, list)| list.len())
            .sum()
    }

    /// Ephemerides held for `satellite`, oldest first.
    pub fn entries(&self, satellite: SatelliteId) -> &[Ephemeris] {
        self.satellites
            .get(&satellite)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Use `path` as the cache and load whatever it holds.
    ///
    /// Never fails: a missing, foreign or damaged file leaves the engine
    /// empty.  Returns the number of ephemerides loaded.
    pub fn load_or_create_cache(&mut self, path: impl AsRef<Path>) -> usize {
        let path = path.as_ref();
        self.satellites.clear();
        self.cache_file = Some(path.to_path_buf());

        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("[ephemeris] no cache at {}", path.display());
                return 0;
            }
            Err(e) => {
                log::warn!("[ephemeris] failed to open cache {}: {e}", path.display());
                return 0;
            }
        };

        match parse_cache(&data) {
            Ok(entries) => {
                for eph in entries {
                    self.satellites.entry(eph.satellite).or_default().push(eph);
                }
                for list in self.satellites.values_mut() {
                    sort_by_reference(list);
                    // A hand-edited file may exceed the per-satellite limit.
                    let excess = list.len().saturating_sub(MAX_PER_SATELLITE);
                    list.drain(..excess);
                }
                log::info!(
                    "[ephemeris] loaded {} GPS, {} GAL, {} BDS from {}",
                    self.count(Constellation::Gps),
                    self.count(Constellation::Galileo),
                    self.count(Constellation::Beidou),
                    path.display()
                );
                self.len()
            }
            Err(e) => {
                log::warn!("[ephemeris] ignoring cache {}: {e}", path.display());
                0
            }
        }
    }

    /// Rewrite the cache file.  Does nothing without a cache file.
    pub fn save_cache(&self) -> Result<(), EphemerisError> {
        let Some(path) = &self.cache_file else {
            return Ok(());
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut out = Vec::with_capacity(HEADER_LEN + self.len() * RECORD_LEN);
        out.extend_from_slice(&CACHE_MAGIC.to_le_bytes());
        out.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        for constellation in Constellation::ALL {
            out.extend_from_slice(&(self.count(constellation) as u32).to_le_bytes());
        }
        out.extend_from_slice(&timestamp.to_le_bytes());

        for constellation in Constellation::ALL {
            for (_, list) in self
                .satellites
                .iter()
                .filter(|(id, _)| id.constellation == constellation)
            {
                for eph in list {
                    out.extend_from_slice(&eph.to_bytes());
                }
            }
        }

        fs::write(path, &out)?;
        log::trace!("[ephemeris] saved {} entries to {}", self.len(), path.display());
        Ok(())
    }

    /// Store `ephemeris` and rewrite the cache.
    ///
    /// Returns `Ok(false)` for a broadcast already held.  The entry is kept
    /// even when writing the cache fails.
    pub fn add(&mut self, ephemeris: Ephemeris) -> Result<bool, EphemerisError> {
        let satellite = ephemeris.satellite;
        if !satellite.is_valid() {
            log::debug!("[ephemeris] invalid satellite {satellite}");
            return Err(EphemerisError::InvalidSatellite(satellite));
        }

        let list = self.satellites.entry(satellite).or_default();
        if list.iter().any(|eph| eph.matches(&ephemeris)) {
            log::trace!("[ephemeris] duplicate {satellite} iod={}", ephemeris.iod);
            return Ok(false);
        }
        if list.len() >= MAX_PER_SATELLITE {
            log::warn!("[ephemeris] removing oldest for {satellite} (size={})", list.len());
            list.remove(0);
        }
        list.push(ephemeris);
        sort_by_reference(list);
        log::debug!("[ephemeris] {satellite} iod={}", ephemeris.iod);

        self.save_cache()?;
        Ok(true)
    }

    /// The valid ephemeris whose reference time is closest to `time`.
    pub fn best(&self, satellite: SatelliteId, time: GnssTime) -> Option<&Ephemeris> {
        self.entries(satellite)
            .iter()
            .filter(|eph| eph.is_valid(time))
            .min_by(|a, b| a.age(time).abs().total_cmp(&b.age(time).abs()))
    }
}

fn sort_by_reference(list: &mut [Ephemeris]) {
    list.sort_by(|a, b| a.reference().seconds().total_cmp(&b.reference().seconds()));
}

fn parse_cache(data: &[u8]) -> Result<Vec<Ephemeris>, EphemerisError> {
    let mut r = Cursor::new(data);
    let magic = r.u32()?;
    if magic != CACHE_MAGIC {
        return Err(EphemerisError::BadMagic(magic));
    }
    let version = r.u32()?;
    if version != CACHE_VERSION {
        return Err(EphemerisError::UnsupportedVersion(version));
    }
    let mut counts = [0usize; 3];
    for count in &mut counts {
        *count = r.u32()? as usize;
    }
    let _timestamp = r.u64()?;

    let records = r.rest();
    let total: usize = counts.iter().sum();
    if records.len() < total.saturating_mul(RECORD_LEN) {
        return Err(EphemerisError::Truncated);
    }

    let mut entries = Vec::with_capacity(total);
    let mut chunks = records.chunks_exact(RECORD_LEN);
    for (constellation, count) in Constellation::ALL.into_iter().zip(counts) {
        for _ in 0..count {
            let chunk = chunks.next().ok_or(EphemerisError::Truncated)?;
            let eph = Ephemeris::from_bytes(chunk)?;
            if eph.satellite.constellation != constellation {
                return Err(EphemerisError::UnknownConstellation(
                    eph.satellite.constellation.code(),
                ));
            }
            entries.push(eph);
        }
    }
    Ok(entries)
}

//! Fixed-capacity ring of temperature samples kept in a single file.
//!
//! Layout (little-endian): a 24-byte header followed by `capacity` slots of
//! 12 bytes each. The header is rewritten after every append, so a crash can
//! at worst lose the record being written.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use thiserror::Error;

use crate::{error::HistoryError, types::HistoryPoint};

pub const HISTORY_MAGIC: u32 = 0x4849_5354; // "HIST"
pub const HISTORY_VERSION: u16 = 4;
pub const HEADER_SIZE: usize = 24;
pub const RECORD_SIZE: usize = 12;
pub const DEFAULT_CAPACITY: u32 = 6_000;

pub const HEATER_ON_FLAG: u8 = 0x01;

pub const MAX_HISTORY_DAYS: i64 = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistorySample {
    pub timestamp_sec: u32,
    pub temp_centi: i16,
    pub set_point_centi: i16,
    pub hysteresis_centi: i16,
    pub flags: u8,
    pub reserved: u8,
}

impl HistorySample {
    pub fn new(
        timestamp_sec: u32,
        temperature_c: f32,
        set_point_c: f32,
        hysteresis_c: f32,
        heater_on: bool,
    ) -> Self {
        Self {
            timestamp_sec,
            temp_centi: to_centi(temperature_c),
            set_point_centi: to_centi(set_point_c),
            hysteresis_centi: to_centi(hysteresis_c),
            flags: if heater_on { HEATER_ON_FLAG } else { 0 },
            reserved: 0,
        }
    }

    pub fn heater_on(&self) -> bool {
        self.flags & HEATER_ON_FLAG != 0
    }

    pub fn temperature_c(&self) -> f32 {
        f32::from(self.temp_centi) / 100.0
    }

    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..4].copy_from_slice(&self.timestamp_sec.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.temp_centi.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.set_point_centi.to_le_bytes());
        bytes[8..10].copy_from_slice(&self.hysteresis_centi.to_le_bytes());
        bytes[10] = self.flags;
        bytes[11] = self.reserved;
        bytes
    }

    pub fn decode(bytes: &[u8; RECORD_SIZE]) -> Self {
        Self {
            timestamp_sec: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            temp_centi: i16::from_le_bytes([bytes[4], bytes[5]]),
            set_point_centi: i16::from_le_bytes([bytes[6], bytes[7]]),
            hysteresis_centi: i16::from_le_bytes([bytes[8], bytes[9]]),
            flags: bytes[10],
            reserved: bytes[11],
        }
    }
}

impl From<&HistorySample> for HistoryPoint {
    fn from(sample: &HistorySample) -> Self {
        Self {
            ts: sample.timestamp_sec,
            t: sample.temp_centi,
            sp: sample.set_point_centi,
            hy: sample.hysteresis_centi,
            h: u8::from(sample.heater_on()),
        }
    }
}

/// Degrees to hundredths, rounded and saturated into `i16`.
pub fn to_centi(value: f32) -> i16 {
    if !value.is_finite() {
        return 0;
    }
    let scaled = (value * 100.0).round();
    scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

/// Reason an existing file was discarded on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeaderFault {
    #[error("header is truncated")]
    ShortRead,
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported version {0}")]
    BadVersion(u16),
    #[error("record size {0} does not match")]
    RecordSize(u16),
    #[error("capacity {found} does not match configured {expected}")]
    CapacityMismatch { found: u32, expected: u32 },
    #[error("write head {write_head} / count {count} outside capacity")]
    CursorOutOfRange { write_head: u32, count: u32 },
    #[error("file holds {found} bytes, expected {expected}")]
    Truncated { found: u64, expected: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    Created,
    Recreated(HeaderFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HistoryHeader {
    magic: u32,
    version: u16,
    record_size: u16,
    capacity: u32,
    write_head: u32,
    count: u32,
    reserved: u32,
}

impl HistoryHeader {
    fn fresh(capacity: u32) -> Self {
        Self {
            magic: HISTORY_MAGIC,
            version: HISTORY_VERSION,
            record_size: RECORD_SIZE as u16,
            capacity,
            write_head: 0,
            count: 0,
            reserved: 0,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.version.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.record_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.capacity.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.write_head.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.reserved.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        Self {
            magic: u32_at(0),
            version: u16_at(4),
            record_size: u16_at(6),
            capacity: u32_at(8),
            write_head: u32_at(12),
            count: u32_at(16),
            reserved: u32_at(20),
        }
    }

    fn validate(&self, capacity: u32) -> Result<(), HeaderFault> {
        if self.magic != HISTORY_MAGIC {
            return Err(HeaderFault::BadMagic(self.magic));
        }
        if self.version != HISTORY_VERSION {
            return Err(HeaderFault::BadVersion(self.version));
        }
        if usize::from(self.record_size) != RECORD_SIZE {
            return Err(HeaderFault::RecordSize(self.record_size));
        }
        if self.capacity != capacity {
            return Err(HeaderFault::CapacityMismatch {
                found: self.capacity,
                expected: capacity,
            });
        }
        if self.write_head >= capacity || self.count > capacity {
            return Err(HeaderFault::CursorOutOfRange {
                write_head: self.write_head,
                count: self.count,
            });
        }
        Ok(())
    }
}

fn file_size(capacity: u32) -> u64 {
    HEADER_SIZE as u64 + u64::from(capacity) * RECORD_SIZE as u64
}

fn slot_offset(index: u32) -> u64 {
    HEADER_SIZE as u64 + u64::from(index) * RECORD_SIZE as u64
}

#[derive(Debug)]
pub struct HistoryLog<F> {
    file: F,
    header: HistoryHeader,
}

impl<F: Read + Write + Seek> HistoryLog<F> {
    /// Adopts an existing stream. An empty stream is initialized; any other
    /// stream that fails validation is reset to an empty ring in place.
    pub fn attach(mut file: F, capacity: u32) -> Result<(Self, OpenOutcome), HistoryError> {
        if capacity == 0 {
            return Err(HistoryError::ZeroCapacity);
        }

        let len = file.seek(SeekFrom::End(0))?;
        if len == 0 {
            let log = Self::initialize(file, capacity)?;
            return Ok((log, OpenOutcome::Created));
        }

        match inspect(&mut file, len, capacity)? {
            Ok(header) => Ok((Self { file, header }, OpenOutcome::Opened)),
            Err(fault) => {
                let log = Self::initialize(file, capacity)?;
                Ok((log, OpenOutcome::Recreated(fault)))
            }
        }
    }

    fn initialize(mut file: F, capacity: u32) -> Result<Self, HistoryError> {
        let header = HistoryHeader::fresh(capacity);
        // Touch the last byte so the whole ring is allocated up front.
        file.seek(SeekFrom::Start(file_size(capacity) - 1))?;
        file.write_all(&[0])?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.flush()?;
        Ok(Self { file, header })
    }

    pub fn capacity(&self) -> u32 {
        self.header.capacity
    }

    pub fn len(&self) -> u32 {
        self.header.count
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    pub fn write_head(&self) -> u32 {
        self.header.write_head
    }

    /// One record write plus one header write. The in-memory cursor only
    /// moves once both reached the file.
    pub fn append(&mut self, sample: &HistorySample) -> Result<(), HistoryError> {
        let capacity = self.header.capacity;
        self.file
            .seek(SeekFrom::Start(slot_offset(self.header.write_head)))?;
        self.file.write_all(&sample.encode())?;

        let mut next = self.header;
        next.write_head = (next.write_head + 1) % capacity;
        next.count = (next.count + 1).min(capacity);

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&next.encode())?;
        self.file.flush()?;

        self.header = next;
        Ok(())
    }

    /// Up to `max` most recent samples, oldest first.
    pub fn read_tail(&mut self, max: usize) -> Result<Vec<HistorySample>, HistoryError> {
        let capacity = u64::from(self.header.capacity);
        let n = (self.header.count as usize).min(max) as u64;
        let head = u64::from(self.header.write_head);

        let mut samples = Vec::with_capacity(n as usize);
        let mut buf = [0u8; RECORD_SIZE];
        for i in 0..n {
            let index = (head + capacity - n + i) % capacity;
            self.file.seek(SeekFrom::Start(slot_offset(index as u32)))?;
            self.file.read_exact(&mut buf)?;
            samples.push(HistorySample::decode(&buf));
        }
        Ok(samples)
    }

    pub fn into_inner(self) -> F {
        self.file
    }
}

impl HistoryLog<File> {
    /// Opens or creates the ring file at `path`. A file that fails
    /// validation is deleted and created again at the configured size.
    pub fn open(path: impl AsRef<Path>, capacity: u32) -> Result<(Self, OpenOutcome), HistoryError> {
        if capacity == 0 {
            return Err(HistoryError::ZeroCapacity);
        }
        let path = path.as_ref();

        if !path.exists() {
            let log = Self::create(path, capacity)?;
            return Ok((log, OpenOutcome::Created));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        match inspect(&mut file, len, capacity)? {
            Ok(header) => Ok((Self { file, header }, OpenOutcome::Opened)),
            Err(fault) => {
                drop(file);
                fs::remove_file(path)?;
                let log = Self::create(path, capacity)?;
                Ok((log, OpenOutcome::Recreated(fault)))
            }
        }
    }

    fn create(path: &Path, capacity: u32) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::initialize(file, capacity)
    }
}

/// Reads and validates the header. The outer error is real I/O trouble,
/// the inner one a reason to start over.
fn inspect<F: Read + Seek>(
    file: &mut F,
    len: u64,
    capacity: u32,
) -> io::Result<Result<HistoryHeader, HeaderFault>> {
    let mut bytes = [0u8; HEADER_SIZE];
    file.seek(SeekFrom::Start(0))?;
    match file.read_exact(&mut bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(Err(HeaderFault::ShortRead))
        }
        Err(err) => return Err(err),
    }

    let header = HistoryHeader::decode(&bytes);
    if let Err(fault) = header.validate(capacity) {
        return Ok(Err(fault));
    }
    let expected = file_size(capacity);
    if len < expected {
        return Ok(Err(HeaderFault::Truncated {
            found: len,
            expected,
        }));
    }
    Ok(Ok(header))
}

/// Fires once per interval. The first call only arms the deadline, and a
/// late call skips the missed intervals instead of bursting.
#[derive(Debug, Clone)]
pub struct HistorySampler {
    interval_ms: u64,
    next_due_ms: Option<u64>,
}

impl HistorySampler {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            next_due_ms: None,
        }
    }

    pub fn from_minutes(interval_minutes: u32) -> Self {
        Self::new(u64::from(interval_minutes) * 60_000)
    }

    pub fn is_due(&mut self, now_ms: u64) -> bool {
        if self.interval_ms == 0 {
            return false;
        }
        let Some(next_due) = self.next_due_ms else {
            self.next_due_ms = Some(now_ms.saturating_add(self.interval_ms));
            return false;
        };
        if now_ms < next_due {
            return false;
        }

        let missed = (now_ms - next_due) / self.interval_ms + 1;
        self.next_due_ms = Some(next_due.saturating_add(missed * self.interval_ms));
        true
    }
}

#[derive(Debug)]
pub enum RecordOutcome {
    NotDue,
    /// Due, but there was no valid reading to store.
    Skipped,
    Appended,
    Unavailable,
    Failed(HistoryError),
}

/// Sampling policy around an optional log. Without a log the controller
/// keeps running and history reads come back empty.
#[derive(Debug)]
pub struct HistoryRecorder<F> {
    log: Option<HistoryLog<F>>,
    sampler: HistorySampler,
}

impl<F: Read + Write + Seek> HistoryRecorder<F> {
    pub fn new(log: Option<HistoryLog<F>>, sampler: HistorySampler) -> Self {
        Self { log, sampler }
    }

    pub fn is_enabled(&self) -> bool {
        self.log.is_some()
    }

    pub fn len(&self) -> u32 {
        self.log.as_ref().map(HistoryLog::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> u32 {
        self.log.as_ref().map(HistoryLog::capacity).unwrap_or(0)
    }

    /// Appends one sample when the interval elapsed. `sample` is only
    /// built on due ticks and yields `None` without a valid reading.
    pub fn record_if_due(
        &mut self,
        now_ms: u64,
        sample: impl FnOnce() -> Option<HistorySample>,
    ) -> RecordOutcome {
        if !self.sampler.is_due(now_ms) {
            return RecordOutcome::NotDue;
        }
        let Some(sample) = sample() else {
            return RecordOutcome::Skipped;
        };
        match self.append(&sample) {
            Ok(()) => RecordOutcome::Appended,
            Err(HistoryError::Unavailable) => RecordOutcome::Unavailable,
            Err(err) => RecordOutcome::Failed(err),
        }
    }

    pub fn append(&mut self, sample: &HistorySample) -> Result<(), HistoryError> {
        match self.log.as_mut() {
            Some(log) => log.append(sample),
            None => Err(HistoryError::Unavailable),
        }
    }

    pub fn read_tail(&mut self, max: usize) -> Result<Vec<HistorySample>, HistoryError> {
        match self.log.as_mut() {
            Some(log) => log.read_tail(max),
            None => Ok(Vec::new()),
        }
    }
}

/// Number of records covering `days` at one record per `interval_minutes`,
/// never more than the ring holds.
pub fn records_for_days(days: i64, interval_minutes: u32, capacity: u32) -> usize {
    let days = days.clamp(1, MAX_HISTORY_DAYS) as u64;
    let interval = u64::from(interval_minutes.max(1));
    let wanted = (days * 1_440).div_ceil(interval);
    wanted.min(u64::from(capacity)) as usize
}

use serde::{Deserialize, Serialize};

/// Series identifier. Free-form numeric id space; no registration step.
pub type Id = u64;
/// Source-provided timestamp. The engine is agnostic to the unit
/// (nanoseconds or milliseconds), it only relies on monotonicity per chunk.
pub type Time = u64;
/// User flag bits. `NO_DATA` is reserved for engine-synthesized samples.
pub type Flag = u32;
pub type Value = f64;

pub const MIN_TIME: Time = Time::MIN;
pub const MAX_TIME: Time = Time::MAX;

/// Reserved flag marking a synthesized "absent" sample. Users must never
/// append it; `Engine::append` counts such samples as ignored.
pub const NO_DATA: Flag = Flag::MAX;

/// Size of one packed sample record on disk (id, time, value, flag,
/// little-endian, no padding).
pub const SAMPLE_BYTES: usize = 8 + 8 + 8 + 4;

/// The smallest unit of data: a tagged numeric measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: Id,
    pub time: Time,
    pub value: Value,
    pub flag: Flag,
}

impl Sample {
    #[must_use]
    pub const fn new(id: Id, time: Time, value: Value, flag: Flag) -> Self {
        Self { id, time, value, flag }
    }

    /// Synthetic sample returned for a time-point miss.
    #[must_use]
    pub const fn no_data(id: Id, time: Time) -> Self {
        Self { id, time, value: 0.0, flag: NO_DATA }
    }

    /// Flag admission: a mask of 0 matches everything, otherwise every bit
    /// of the mask must be set on the sample.
    #[must_use]
    pub const fn matches_flag(&self, mask: Flag) -> bool {
        mask == 0 || (self.flag & mask) == mask
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.time.to_le_bytes());
        buf[16..24].copy_from_slice(&self.value.to_bits().to_le_bytes());
        buf[24..28].copy_from_slice(&self.flag.to_le_bytes());
    }

    #[must_use]
    pub fn read_from(buf: &[u8]) -> Self {
        let id = u64::from_le_bytes(buf[0..8].try_into().expect("8-byte slice"));
        let time = u64::from_le_bytes(buf[8..16].try_into().expect("8-byte slice"));
        let bits = u64::from_le_bytes(buf[16..24].try_into().expect("8-byte slice"));
        let flag = u32::from_le_bytes(buf[24..28].try_into().expect("4-byte slice"));
        Self { id, time, value: f64::from_bits(bits), flag }
    }
}

/// Counts returned by `append`: `writed` made it into the WAL, `ignored`
/// were rejected (reserved flag, halted tier).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendResult {
    pub writed: usize,
    pub ignored: usize,
}

impl std::ops::Add for AppendResult {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self { writed: self.writed + rhs.writed, ignored: self.ignored + rhs.ignored }
    }
}

impl std::ops::AddAssign for AppendResult {
    fn add_assign(&mut self, rhs: Self) {
        self.writed += rhs.writed;
        self.ignored += rhs.ignored;
    }
}

/// Half-open interval query `[from, to)` over a set of series.
#[derive(Debug, Clone)]
pub struct QueryInterval {
    pub ids: Vec<Id>,
    pub flag: Flag,
    pub from: Time,
    pub to: Time,
}

impl QueryInterval {
    #[must_use]
    pub fn new(ids: Vec<Id>, flag: Flag, from: Time, to: Time) -> Self {
        Self { ids, flag, from, to }
    }

    /// Same query narrowed to a single id, used by the per-id union readers.
    #[must_use]
    pub fn with_id(&self, id: Id) -> Self {
        Self { ids: vec![id], flag: self.flag, from: self.from, to: self.to }
    }

    #[must_use]
    pub fn matches(&self, s: &Sample) -> bool {
        self.ids.contains(&s.id)
            && self.from <= s.time
            && s.time < self.to
            && s.matches_flag(self.flag)
    }

    /// Whether `[min, max]` (inclusive chunk range) intersects `[from, to)`.
    #[must_use]
    pub const fn intersects(&self, min: Time, max: Time) -> bool {
        min < self.to && self.from <= max
    }
}

/// Time-point query: latest sample at or before `time_point`, per id.
#[derive(Debug, Clone)]
pub struct QueryTimePoint {
    pub ids: Vec<Id>,
    pub flag: Flag,
    pub time_point: Time,
}

impl QueryTimePoint {
    #[must_use]
    pub fn new(ids: Vec<Id>, flag: Flag, time_point: Time) -> Self {
        Self { ids, flag, time_point }
    }

    #[must_use]
    pub fn with_id(&self, id: Id) -> Self {
        Self { ids: vec![id], flag: self.flag, time_point: self.time_point }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_record_round_trip() {
        let s = Sample::new(7, 1_000_000, 3.5, 0b101);
        let mut buf = [0u8; SAMPLE_BYTES];
        s.write_to(&mut buf);
        assert_eq!(Sample::read_from(&buf), s);
    }

    #[test]
    fn flag_mask_semantics() {
        let s = Sample::new(1, 1, 0.0, 0b110);
        assert!(s.matches_flag(0));
        assert!(s.matches_flag(0b100));
        assert!(s.matches_flag(0b110));
        assert!(!s.matches_flag(0b001));
        assert!(!s.matches_flag(0b111));
    }

    #[test]
    fn interval_is_half_open() {
        let q = QueryInterval::new(vec![1], 0, 10, 20);
        assert!(q.matches(&Sample::new(1, 10, 0.0, 0)));
        assert!(q.matches(&Sample::new(1, 19, 0.0, 0)));
        assert!(!q.matches(&Sample::new(1, 20, 0.0, 0)));
        assert!(!q.matches(&Sample::new(2, 15, 0.0, 0)));
    }
}

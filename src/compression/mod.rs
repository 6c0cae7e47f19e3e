//! Sample stream codec: delta-of-delta timestamps, XOR'd value bits and
//! run-length flags, packed into a bounded chunk body.
//!
//! The first sample of a run is not part of the stream; it lives in the
//! chunk header and seeds the codec state on both sides. Appends either
//! commit a whole sample or leave the buffer byte-for-byte unchanged, so a
//! "full" result never invalidates what a concurrent reader may decode.

mod bitstream;

pub use bitstream::{BitReader, BitWriter};

use crate::types::{Sample, Time};

const fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

const fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Timestamp buckets: (control-bit count, payload bits). The final bucket
/// carries the raw 64-bit delta instead of a delta-of-delta so arbitrary
/// u64 gaps stay representable.
const DOD_BUCKETS: [(u8, u8); 4] = [(2, 7), (3, 9), (4, 16), (5, 32)];

/// Compressor owning the chunk body. Appends are all-or-nothing.
#[derive(Debug)]
pub struct SampleCompressor {
    bits: BitWriter,
    prev_time: Time,
    prev_delta: u64,
    prev_value_bits: u64,
    prev_flag: u32,
    leading: u8,
    trailing: u8,
}

impl SampleCompressor {
    /// `body` must be zero-filled; its length is the chunk capacity.
    #[must_use]
    pub fn new(body: Vec<u8>, first: &Sample) -> Self {
        Self {
            bits: BitWriter::new(body),
            prev_time: first.time,
            prev_delta: 0,
            prev_value_bits: first.value.to_bits(),
            prev_flag: first.flag,
            leading: u8::MAX, // forces a fresh window on the first XOR write
            trailing: 0,
        }
    }

    /// Append one sample. Returns false when the body has no room; codec
    /// state and buffer are unchanged in that case. Time ordering is the
    /// caller's contract (the chunk checks it before calling in).
    pub fn append(&mut self, s: &Sample) -> bool {
        debug_assert!(s.time >= self.prev_time);
        let cp = self.bits.checkpoint();
        let saved = (self.leading, self.trailing);
        if self.write_time(s.time) && self.write_value(s.value.to_bits()) && self.write_flag(s.flag)
        {
            self.prev_delta = s.time - self.prev_time;
            self.prev_time = s.time;
            self.prev_value_bits = s.value.to_bits();
            self.prev_flag = s.flag;
            true
        } else {
            self.bits.restore(cp);
            (self.leading, self.trailing) = saved;
            false
        }
    }

    fn write_time(&mut self, time: Time) -> bool {
        let delta = time - self.prev_time;
        let dod = i128::from(delta) - i128::from(self.prev_delta);
        if dod == 0 {
            return self.bits.write_bit(false);
        }
        for (i, &(_, payload)) in DOD_BUCKETS.iter().enumerate() {
            if let Ok(small) = i64::try_from(dod) {
                let zz = zigzag(small);
                if zz < (1u64 << payload) {
                    // control prefix: i+1 ones then a zero
                    let control = ((1u64 << (i + 1)) - 1) << 1;
                    return self.bits.write_bits(control, i as u8 + 2)
                        && self.bits.write_bits(zz, payload);
                }
            }
        }
        // '111111' then the raw delta
        self.bits.write_bits(0b11_1111, 6) && self.bits.write_bits(delta, 64)
    }

    fn write_value(&mut self, bits: u64) -> bool {
        let xor = bits ^ self.prev_value_bits;
        if xor == 0 {
            return self.bits.write_bit(false);
        }
        if !self.bits.write_bit(true) {
            return false;
        }
        let lead = (xor.leading_zeros() as u8).min(31);
        let trail = xor.trailing_zeros() as u8;
        if self.leading != u8::MAX && lead >= self.leading && trail >= self.trailing {
            // fits inside the previous meaningful window
            let len = 64 - self.leading - self.trailing;
            return self.bits.write_bit(false)
                && self.bits.write_bits(xor >> self.trailing, len);
        }
        let len = 64 - lead - trail;
        let ok = self.bits.write_bit(true)
            && self.bits.write_bits(u64::from(lead), 5)
            && self.bits.write_bits(u64::from(len) & 63, 6) // 64 encodes as 0
            && self.bits.write_bits(xor >> trail, len);
        if ok {
            self.leading = lead;
            self.trailing = trail;
        }
        ok
    }

    fn write_flag(&mut self, flag: u32) -> bool {
        if flag == self.prev_flag {
            self.bits.write_bit(false)
        } else {
            self.bits.write_bit(true) && self.bits.write_bits(u64::from(flag), 32)
        }
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.bits.as_slice()
    }

    #[must_use]
    pub fn into_body(self) -> Vec<u8> {
        self.bits.into_buf()
    }
}

/// Restartable decoding cursor over a chunk body. Yields the anchoring
/// first sample, then decodes the remaining `count - 1` from the stream.
/// Dropping the cursor early stops decoding — nothing is buffered ahead.
#[derive(Debug)]
pub struct SampleDecompressor<'a> {
    bits: BitReader<'a>,
    first: Sample,
    remaining: u32,
    started: bool,
    prev_time: Time,
    prev_delta: u64,
    prev_value_bits: u64,
    prev_flag: u32,
    leading: u8,
    trailing: u8,
}

impl<'a> SampleDecompressor<'a> {
    #[must_use]
    pub fn new(body: &'a [u8], first: Sample, count: u32) -> Self {
        Self {
            bits: BitReader::new(body),
            first,
            remaining: count,
            started: false,
            prev_time: first.time,
            prev_delta: 0,
            prev_value_bits: first.value.to_bits(),
            prev_flag: first.flag,
            leading: 0,
            trailing: 0,
        }
    }

    fn read_time(&mut self) -> Option<Time> {
        if !self.bits.read_bit()? {
            let delta = self.prev_delta;
            return Some(self.prev_time + delta);
        }
        let mut ones = 1u8;
        while ones < 5 && self.bits.read_bit()? {
            ones += 1;
        }
        if ones < 5 {
            let payload = DOD_BUCKETS[usize::from(ones) - 1].1;
            let dod = unzigzag(self.bits.read_bits(payload)?);
            let delta = (i128::from(self.prev_delta) + i128::from(dod)) as u64;
            self.prev_delta = delta;
            return Some(self.prev_time + delta);
        }
        // five ones so far; the sixth one marks the raw-delta escape, and
        // no encoder emits '111110'
        if !self.bits.read_bit()? {
            return None;
        }
        let delta = self.bits.read_bits(64)?;
        self.prev_delta = delta;
        Some(self.prev_time + delta)
    }

    fn read_value(&mut self) -> Option<u64> {
        if !self.bits.read_bit()? {
            return Some(self.prev_value_bits);
        }
        if self.bits.read_bit()? {
            self.leading = self.bits.read_bits(5)? as u8;
            let len = self.bits.read_bits(6)? as u8;
            let len = if len == 0 { 64 } else { len };
            self.trailing = 64 - self.leading - len;
        }
        let len = 64 - self.leading - self.trailing;
        let meaningful = self.bits.read_bits(len)?;
        Some(self.prev_value_bits ^ (meaningful << self.trailing))
    }

    fn read_flag(&mut self) -> Option<u32> {
        if self.bits.read_bit()? {
            Some(self.bits.read_bits(32)? as u32)
        } else {
            Some(self.prev_flag)
        }
    }
}

impl Iterator for SampleDecompressor<'_> {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.remaining == 0 {
            return None;
        }
        if !self.started {
            self.started = true;
            self.remaining -= 1;
            return Some(self.first);
        }
        let time = self.read_time()?;
        let value_bits = self.read_value()?;
        let flag = self.read_flag()?;
        self.prev_delta = time - self.prev_time;
        self.prev_time = time;
        self.prev_value_bits = value_bits;
        self.prev_flag = flag;
        self.remaining -= 1;
        Some(Sample { id: self.first.id, time, value: f64::from_bits(value_bits), flag })
    }
}

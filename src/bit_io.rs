//! Byte and bit level output primitives shared by the MQ coder, the raw
//! (bypass) coding path and the packet-header machinery.

use crate::error::J2kError;

/// Growable byte sink the entropy coders write into.
///
/// A code-block accumulates the output of all its coding passes in one
/// buffer; truncation points are byte offsets into it.
#[derive(Debug, Default, Clone)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, b: u8) {
        self.data.push(b);
    }

    pub fn write_all(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Byte at `pos`, or 0 past the end (the decoder synthesizes padding
    /// there, so queries past the end are legal during rate fixups).
    pub fn byte_at(&self, pos: usize) -> u8 {
        self.data.get(pos).copied().unwrap_or(0)
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

/// Bit-level adapter over [`ByteBuffer`] for raw (arithmetic-bypass)
/// coding segments.
///
/// Implements the segment stuffing rule: after an 0xFF byte the next
/// byte carries only 7 significant bits, its MSB forced to zero, so two
/// consecutive all-ones bytes never occur and no marker (0xFF 0x90+) can
/// appear inside coded data.
pub struct BitStuffWriter<'a> {
    out: &'a mut ByteBuffer,
    acc: u8,
    /// Capacity of the byte being assembled: 7 right after an 0xFF.
    cap: u8,
    used: u8,
    start_len: usize,
}

impl<'a> BitStuffWriter<'a> {
    pub fn new(out: &'a mut ByteBuffer) -> Self {
        let start_len = out.len();
        Self { out, acc: 0, cap: 8, used: 0, start_len }
    }

    /// Start a segment in a buffer that already holds data; if the last
    /// byte there is an 0xFF, the first byte written here is stuffed.
    pub fn new_continuing(out: &'a mut ByteBuffer) -> Self {
        let start_len = out.len();
        let cap = if !out.is_empty() && out.byte_at(out.len() - 1) == 0xFF { 7 } else { 8 };
        Self { out, acc: 0, cap, used: 0, start_len }
    }

    /// Bytes in the underlying buffer.
    pub fn bytes_written(&self) -> usize {
        self.out.len()
    }

    /// Bytes a decoder needs mid-segment: whole bytes plus the partial
    /// one holding bits of the current pass.
    pub fn unterminated_len(&self) -> usize {
        self.out.len() + usize::from(self.used > 0)
    }

    pub fn write_bit(&mut self, bit: u8) {
        self.acc = (self.acc << 1) | (bit & 1);
        self.used += 1;
        if self.used == self.cap {
            self.emit();
        }
    }

    /// `count` low bits of `v`, MSB first.
    pub fn write_bits(&mut self, v: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit(((v >> i) & 1) as u8);
        }
    }

    fn emit(&mut self) {
        // A 7-bit capacity byte lands with its MSB forced to zero.
        let b = self.acc;
        self.out.write(b);
        self.acc = 0;
        self.used = 0;
        self.cap = if b == 0xFF { 7 } else { 8 };
    }

    /// Byte-align and flush.
    ///
    /// With `predictable` set, the spare bits of the final byte carry the
    /// alternating 0101 pattern an error-resilient decoder re-derives and
    /// checks; otherwise they are zero.
    pub fn terminate(&mut self, predictable: bool) {
        if self.used != 0 {
            let mut fill = 0u8;
            while self.used != 0 {
                self.write_bit(fill);
                if predictable {
                    fill ^= 1;
                }
            }
        }
        // A segment may not end on an 0xFF; the decoder synthesizes the
        // all-ones byte itself.
        if self.out.len() > self.start_len && self.out.byte_at(self.out.len() - 1) == 0xFF {
            self.out.truncate(self.out.len() - 1);
            self.cap = 8;
        }
        self.start_len = self.out.len();
    }
}

/// MSB-first bit reader for raw coding segments, mirroring
/// [`BitStuffWriter`]: after an 0xFF byte only 7 bits of the next byte
/// are significant.
pub struct BitStuffReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u8,
    left: u8,
    prev_ff: bool,
}

impl<'a> BitStuffReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, acc: 0, left: 0, prev_ff: false }
    }

    pub fn read_bit(&mut self) -> u8 {
        if self.left == 0 {
            let b = if self.pos < self.data.len() {
                let b = self.data[self.pos];
                self.pos += 1;
                b
            } else {
                // Past the end the decoder assumes all-ones padding
                // (stuffing-compatible: 0x7F after an 0xFF).
                if self.prev_ff { 0x7F } else { 0xFF }
            };
            self.left = if self.prev_ff { 7 } else { 8 };
            self.prev_ff = b == 0xFF;
            self.acc = b;
        }
        self.left -= 1;
        (self.acc >> self.left) & 1
    }

    pub fn read_bits(&mut self, count: u8) -> u32 {
        let mut v = 0u32;
        for _ in 0..count {
            v = (v << 1) | u32::from(self.read_bit());
        }
        v
    }
}

/// Bit writer for packet headers: a 0x00 byte is inserted after every
/// written 0xFF so the header can never alias a marker.
pub struct PacketBitWriter {
    data: Vec<u8>,
    acc: u8,
    count: u8,
}

impl Default for PacketBitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBitWriter {
    pub fn new() -> Self {
        Self { data: Vec::new(), acc: 0, count: 0 }
    }

    pub fn write_bit(&mut self, bit: u8) {
        self.acc = (self.acc << 1) | (bit & 1);
        self.count += 1;
        if self.count == 8 {
            self.flush_byte();
        }
    }

    pub fn write_bits(&mut self, v: u32, count: u8) {
        for i in (0..count).rev() {
            self.write_bit(((v >> i) & 1) as u8);
        }
    }

    fn flush_byte(&mut self) {
        let b = self.acc;
        self.data.push(b);
        if b == 0xFF {
            self.data.push(0x00);
        }
        self.acc = 0;
        self.count = 0;
    }

    pub fn bit_len(&self) -> usize {
        self.data.len() * 8 + self.count as usize
    }

    pub fn finish(mut self) -> Vec<u8> {
        if self.count > 0 {
            self.acc <<= 8 - self.count;
            self.count = 8;
            self.flush_byte();
        }
        self.data
    }
}

/// Bit reader mirroring [`PacketBitWriter`]'s stuffing convention.
pub struct PacketBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    acc: u8,
    left: u8,
}

impl<'a> PacketBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, acc: 0, left: 0 }
    }

    pub fn read_bit(&mut self) -> Result<u8, J2kError> {
        if self.left == 0 {
            if self.pos >= self.data.len() {
                return Err(J2kError::NeedMoreData);
            }
            let b = self.data[self.pos];
            self.pos += 1;
            if b == 0xFF && self.pos < self.data.len() && self.data[self.pos] == 0x00 {
                self.pos += 1;
            }
            self.acc = b;
            self.left = 8;
        }
        self.left -= 1;
        Ok((self.acc >> self.left) & 1)
    }

    pub fn read_bits(&mut self, count: u8) -> Result<u32, J2kError> {
        let mut v = 0u32;
        for _ in 0..count {
            v = (v << 1) | u32::from(self.read_bit()?);
        }
        Ok(v)
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

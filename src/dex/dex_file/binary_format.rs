use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Result;

/// Utility trait for serializing data inside dex files
///
/// Everything in a dex file is little-endian, and a lot of the variable-length data is in
/// LEB128, so a dedicated trait reads better than a pile of `write_*` calls.
pub trait Serialize {
    /// Serialize construct into a binary output stream
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()>;
}

impl Serialize for u8 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(*self)
    }
}

impl Serialize for u16 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u16::<LittleEndian>(*self)
    }
}

impl Serialize for u32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<LittleEndian>(*self)
    }
}

impl Serialize for i32 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        writer.write_i32::<LittleEndian>(*self)
    }
}

/// Unsigned LEB128
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Uleb128(pub u32);

/// Signed LEB128
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Sleb128(pub i32);

/// Unsigned LEB128 of the value plus one, so that "no index" can be encoded as `0`
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Uleb128p1(pub Option<u32>);

impl Serialize for Uleb128 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        let mut value = self.0;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                return writer.write_u8(byte);
            }
            writer.write_u8(byte | 0x80)?;
        }
    }
}

impl Serialize for Sleb128 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        let mut value = self.0;
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            let sign_bit_clear = byte & 0x40 == 0;
            if (value == 0 && sign_bit_clear) || (value == -1 && !sign_bit_clear) {
                return writer.write_u8(byte);
            }
            writer.write_u8(byte | 0x80)?;
        }
    }
}

impl Serialize for Uleb128p1 {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> Result<()> {
        match self.0 {
            None => Uleb128(0).serialize(writer),
            Some(value) => Uleb128(value.wrapping_add(1)).serialize(writer),
        }
    }
}

/// Encode a string using the [modified UTF-8][0] format
///
/// Differences from regular UTF-8:
///
///   - the null character `\u{0000}` gets encoded as 2 bytes, so no encoded string contains a
///     zero byte
///   - characters outside the BMP are encoded as their surrogate pair, 3 bytes per surrogate
///
/// [0]: https://source.android.com/docs/core/runtime/dex-format#mutf-8
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = Vec::with_capacity(string.len());
    for unit in string.encode_utf16() {
        match unit {
            0x0001..=0x007F => buffer.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                buffer.push((unit >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
            }
            _ => {
                buffer.push((unit >> 12 & 0x0F) as u8 | 0b1110_0000);
                buffer.push((unit >> 6 & 0x3F) as u8 | 0b1000_0000);
                buffer.push((unit & 0x3F) as u8 | 0b1000_0000);
            }
        }
    }
    buffer
}

/// Length of a string in UTF-16 code units (what `string_data_item` records)
pub fn utf16_len(string: &str) -> usize {
    string.encode_utf16().count()
}

/// Adler-32 checksum, as stored in the dex header
pub fn adler32(bytes: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;

    // 5552 is the most bytes that can be summed before `b` could overflow
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for chunk in bytes.chunks(5552) {
        for byte in chunk {
            a += *byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }
    b << 16 | a
}

//! Encodable trait & Encoder
use crate::error::{EncodeError, EncodeResult};

/// A trait for types which are serializable to BACnet binary formats
pub trait Encodable {
    /// encode type to buffer in Encoder
    fn encode(&self, e: &mut Encoder<'_>) -> EncodeResult<()>;

    /// encode this type into its binary form in a new `Vec`
    fn to_vec(&self) -> EncodeResult<Vec<u8>> {
        let mut buffer = Vec::with_capacity(512);
        let mut encoder = Encoder::new(&mut buffer);
        self.encode(&mut encoder)?;
        Ok(buffer)
    }
}

/// Encoder type, holds a mut ref to a buffer
/// that it will write data to and an offset
/// of the next position to write.
///
/// This will start writing from the beginning of the buffer, *not* from the end.
/// The buffer will be grown as needed.
#[derive(Debug)]
pub struct Encoder<'a> {
    buffer: &'a mut Vec<u8>,
    offset: usize,
}

impl<'a> Encoder<'a> {
    /// Create a new Encoder from a mutable buffer
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer, offset: 0 }
    }

    /// Get a reference to the underlying buffer
    pub fn buffer(&self) -> &[u8] {
        self.buffer
    }

    /// Returns the slice of the underlying buffer that has been filled.
    pub fn buffer_filled(&self) -> &[u8] {
        &self.buffer[..self.offset]
    }

    /// Returns the number of bytes that have been written to the buffer.
    pub fn len_filled(&self) -> usize {
        self.offset
    }

    /// write bytes to buffer
    pub fn write_slice(&mut self, bytes: &[u8]) -> EncodeResult<()> {
        let additional = bytes.len();
        // overwrite while the write lands inside the allocated region,
        // grow once it runs past the end
        if self.offset + additional <= self.buffer.len() {
            for (byte, b) in self.buffer[self.offset..].iter_mut().zip(bytes.iter()) {
                *byte = *b;
            }
        } else {
            let expected_len = self.buffer.len() + additional;
            self.buffer.reserve(additional);
            self.buffer.extend_from_slice(bytes);

            debug_assert!(self.buffer.len() == expected_len);
        }

        let index = self
            .offset
            .checked_add(additional)
            .ok_or(EncodeError::AddOverflow)?;
        self.offset = index;
        Ok(())
    }

    /// Write const number of bytes to buffer
    pub fn write<const N: usize>(&mut self, bytes: [u8; N]) -> EncodeResult<()> {
        let additional = bytes.len();
        // same in-place/grow split as write_slice
        if self.offset + additional <= self.buffer.len() {
            for (byte, b) in self.buffer[self.offset..].iter_mut().zip(bytes) {
                *byte = b;
            }
        } else {
            let expected_len = self.buffer.len() + additional;
            self.buffer.reserve(additional);
            self.buffer.extend(bytes);
            debug_assert!(self.buffer.len() == expected_len);
        }

        let index = self
            .offset
            .checked_add(additional)
            .ok_or(EncodeError::AddOverflow)?;
        self.offset = index;
        Ok(())
    }

    /// write a u8
    pub fn write_u8(&mut self, data: u8) -> EncodeResult<()> {
        self.write(data.to_be_bytes())
    }
    /// write a u16
    pub fn write_u16(&mut self, data: u16) -> EncodeResult<()> {
        self.write(data.to_be_bytes())
    }
    /// write a u32
    pub fn write_u32(&mut self, data: u32) -> EncodeResult<()> {
        self.write(data.to_be_bytes())
    }
    /// write a big-endian f32
    pub fn write_f32(&mut self, data: f32) -> EncodeResult<()> {
        self.write(data.to_be_bytes())
    }
    /// write a big-endian f64
    pub fn write_f64(&mut self, data: f64) -> EncodeResult<()> {
        self.write(data.to_be_bytes())
    }

    /// write an unsigned in minimum-octet big-endian form; zero is one 0x00
    pub fn write_unsigned(&mut self, data: u64) -> EncodeResult<()> {
        let bytes = data.to_be_bytes();
        let skip = (data.leading_zeros() / 8).min(7) as usize;
        self.write_slice(&bytes[skip..])
    }

    /// write a signed in minimum-octet two's-complement big-endian form
    pub fn write_signed(&mut self, data: i64) -> EncodeResult<()> {
        let bytes = data.to_be_bytes();
        // trim redundant leading sign octets, keeping the sign bit intact
        let mut skip = 0;
        while skip < 7 {
            let lead = bytes[skip];
            let next = bytes[skip + 1];
            let redundant = (lead == 0x00 && next & 0x80 == 0) || (lead == 0xFF && next & 0x80 != 0);
            if !redundant {
                break;
            }
            skip += 1;
        }
        self.write_slice(&bytes[skip..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_encode() -> EncodeResult<()> {
        let mut buf = vec![0, 1, 2, 3, 4, 5];
        let mut enc = Encoder::new(&mut buf);
        enc.offset = 4;
        // write already reserved space
        enc.write_slice(&[5, 6])?;
        assert_eq!(enc.buffer, &mut vec![0, 1, 2, 3, 5, 6]);
        assert_eq!(enc.offset, 6);
        // reserve extra space
        enc.write_slice(&[7, 8])?;
        assert_eq!(enc.buffer, &mut vec![0, 1, 2, 3, 5, 6, 7, 8]);
        assert_eq!(enc.offset, 8);
        Ok(())
    }

    #[test]
    fn minimum_octet_unsigned() -> EncodeResult<()> {
        for (val, expect) in [
            (0u64, vec![0x00]),
            (255, vec![0xFF]),
            (256, vec![0x01, 0x00]),
            (0x010203, vec![0x01, 0x02, 0x03]),
        ] {
            let mut buf = vec![];
            Encoder::new(&mut buf).write_unsigned(val)?;
            assert_eq!(buf, expect, "value {val}");
        }
        Ok(())
    }

    #[test]
    fn minimum_octet_signed() -> EncodeResult<()> {
        for (val, expect) in [
            (0i64, vec![0x00]),
            (-1, vec![0xFF]),
            (127, vec![0x7F]),
            (128, vec![0x00, 0x80]),
            (-128, vec![0x80]),
            (-129, vec![0xFF, 0x7F]),
            (-123, vec![0x85]),
        ] {
            let mut buf = vec![];
            Encoder::new(&mut buf).write_signed(val)?;
            assert_eq!(buf, expect, "value {val}");
        }
        Ok(())
    }
}

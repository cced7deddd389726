//! Big-endian positioned reader over an HPROF stream

use crate::model::{FieldType, FieldValue};
use crate::{HeapError, HeapResult};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};

const DEFAULT_BUFFER: usize = 512 * 1024;

/// Buffered reader that tracks its absolute position in the stream
pub struct PositionReader<R> {
    inner: BufReader<R>,
    position: u64,
}

impl<R: Read + Seek> PositionReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_BUFFER, inner)
    }

    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner: BufReader::with_capacity(capacity, inner),
            position: 0,
        }
    }

    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Buffered bytes at the current position, without consuming them
    pub fn peek(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    pub fn consume(&mut self, n: usize) {
        self.inner.consume(n);
        self.position += n as u64;
    }

    /// Move forward `n` bytes. Seeking past the end is not an error here;
    /// the next read reports it.
    pub fn skip(&mut self, n: u64) -> io::Result<()> {
        if n == 0 {
            return Ok(());
        }
        let delta = i64::try_from(n).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "skip distance too large")
        })?;
        self.inner.seek_relative(delta)?;
        self.position += n;
        Ok(())
    }

    pub fn seek_to(&mut self, position: u64) -> io::Result<()> {
        if position == self.position {
            return Ok(());
        }
        let delta = position as i128 - self.position as i128;
        if let Ok(delta) = i64::try_from(delta) {
            self.inner.seek_relative(delta)?;
        } else {
            self.inner.seek(SeekFrom::Start(position))?;
        }
        self.position = position;
        Ok(())
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    pub fn read_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    #[inline]
    pub fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    #[inline]
    pub fn read_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    #[inline]
    pub fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    #[inline]
    pub fn read_i32(&mut self) -> io::Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    #[inline]
    pub fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Read an identifier of `id_size` bytes (4 or 8)
    #[inline]
    pub fn read_id(&mut self, id_size: usize) -> io::Result<u64> {
        if id_size == 4 {
            Ok(self.read_u32()? as u64)
        } else {
            self.read_u64()
        }
    }

    fn read_type_tag(&mut self) -> HeapResult<FieldType> {
        let offset = self.position;
        let tag = self.read_u8()?;
        FieldType::from_tag(tag).ok_or(HeapError::InvalidValueType { tag, offset })
    }

    /// Read a one-byte type tag followed by a value of that type
    pub fn read_tagged_value(&mut self, id_size: usize) -> HeapResult<FieldValue> {
        let field_type = self.read_type_tag()?;
        Ok(self.read_value(field_type, id_size)?)
    }

    /// Skip a one-byte type tag and its value
    pub fn skip_tagged_value(&mut self, id_size: usize) -> HeapResult<()> {
        let field_type = self.read_type_tag()?;
        self.skip(field_type.size(id_size) as u64)?;
        Ok(())
    }

    /// Read a one-byte type tag
    pub fn read_field_type(&mut self) -> HeapResult<FieldType> {
        self.read_type_tag()
    }

    pub fn read_value(&mut self, field_type: FieldType, id_size: usize) -> io::Result<FieldValue> {
        Ok(match field_type {
            FieldType::Object => FieldValue::Object(self.read_id(id_size)?),
            FieldType::Boolean => FieldValue::Boolean(self.read_u8()? != 0),
            FieldType::Char => FieldValue::Char(self.read_u16()?),
            FieldType::Float => FieldValue::Float(f32::from_bits(self.read_u32()?)),
            FieldType::Double => FieldValue::Double(f64::from_bits(self.read_u64()?)),
            FieldType::Byte => FieldValue::Byte(self.read_u8()? as i8),
            FieldType::Short => FieldValue::Short(self.read_u16()? as i16),
            FieldType::Int => FieldValue::Int(self.read_i32()?),
            FieldType::Long => FieldValue::Long(self.read_u64()? as i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reads_big_endian_and_tracks_position() {
        let bytes = vec![
            0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x2a, 0xff, 0xff, 0xff, 0xfe, 0, 0, 0, 0, 0, 0, 0,
            0x10,
        ];
        let mut reader = PositionReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_u8().unwrap(), 1);
        assert_eq!(reader.read_u16().unwrap(), 0x0203);
        assert_eq!(reader.read_u32().unwrap(), 42);
        assert_eq!(reader.read_i32().unwrap(), -2);
        assert_eq!(reader.position(), 11);
        assert_eq!(reader.read_id(8).unwrap(), 0x10);
        assert_eq!(reader.position(), 19);
    }

    #[test]
    fn test_skip_and_seek() {
        let bytes: Vec<u8> = (0..64).collect();
        let mut reader = PositionReader::with_capacity(8, Cursor::new(bytes));
        reader.skip(10).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 10);
        reader.seek_to(40).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 40);
        reader.seek_to(2).unwrap();
        assert_eq!(reader.read_u8().unwrap(), 2);
        assert_eq!(reader.position(), 3);
    }

    #[test]
    fn test_tagged_values() {
        let bytes = vec![10, 0, 0, 0, 7, 2, 0, 0, 0, 9, 3];
        let mut reader = PositionReader::new(Cursor::new(bytes));
        assert_eq!(reader.read_tagged_value(4).unwrap(), FieldValue::Int(7));
        assert_eq!(reader.read_tagged_value(4).unwrap(), FieldValue::Object(9));
        let err = reader.read_tagged_value(4).unwrap_err();
        assert!(matches!(err, HeapError::InvalidValueType { tag: 3, offset: 10 }));
    }
}

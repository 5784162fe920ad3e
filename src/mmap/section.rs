use crate::core::error::{Error, Result};

/// Fixed-size little-endian record stored in an index section.
pub trait FixedRecord: Sized {
    const SIZE: usize;

    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// Bounds-checked view of one section of a mapped index file.
///
/// Every read is validated against the section length; out-of-range access yields
/// `ErrorKind::Corrupt` instead of a panic.
#[derive(Clone, Copy)]
pub struct SectionReader<'a> {
    name: &'static str,
    data: &'a [u8],
}

impl<'a> SectionReader<'a> {
    pub fn new(name: &'static str, data: &'a [u8]) -> Self {
        SectionReader { name, data }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| {
                Error::corrupt(format!(
                    "{} section: read of {} bytes at {} exceeds length {}",
                    self.name,
                    len,
                    offset,
                    self.data.len()
                ))
            })
    }

    pub fn tail(&self, offset: usize) -> Result<&'a [u8]> {
        self.data.get(offset..).ok_or_else(|| {
            Error::corrupt(format!("{} section: offset {} out of range", self.name, offset))
        })
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        le_u32(self.bytes(offset, 4)?, 0)
    }

    pub fn record_count<R: FixedRecord>(&self) -> usize {
        self.data.len() / R::SIZE
    }

    pub fn record<R: FixedRecord>(&self, index: usize) -> Result<R> {
        let offset = index.checked_mul(R::SIZE).ok_or_else(|| {
            Error::corrupt(format!("{} section: record index {} overflows", self.name, index))
        })?;
        R::decode(self.bytes(offset, R::SIZE)?)
    }

    /// Fails unless the section is an exact multiple of the record size.
    pub fn check_record_size<R: FixedRecord>(&self) -> Result<()> {
        if self.data.len() % R::SIZE != 0 {
            return Err(Error::corrupt(format!(
                "{} section: size {} is not a multiple of {}",
                self.name,
                self.data.len(),
                R::SIZE
            )));
        }
        Ok(())
    }
}

fn field<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    bytes
        .get(offset..offset + N)
        .and_then(|b| <[u8; N]>::try_from(b).ok())
        .ok_or_else(|| Error::corrupt(format!("record field at {} truncated", offset)))
}

pub fn le_u8(bytes: &[u8], offset: usize) -> Result<u8> {
    Ok(field::<1>(bytes, offset)?[0])
}

pub fn le_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(bytes, offset)?))
}

pub fn le_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(bytes, offset)?))
}

pub fn le_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(field(bytes, offset)?))
}

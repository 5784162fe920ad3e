use crate::core::error::{Error, Result};

/// Variable byte encoding for the chunk-size sequence at the start of a stream's data.
pub struct VByteEncoder;

impl VByteEncoder {
    /// Values < 128 use 1 byte, < 16384 use 2 bytes, etc.
    pub fn encode_u64(output: &mut Vec<u8>, mut value: u64) {
        while value >= 128 {
            output.push((value & 127) as u8 | 128); // Set continuation bit
            value >>= 7;
        }
        output.push(value as u8);
    }

    /// Encoded length of `value` without encoding it.
    pub fn encoded_len(mut value: u64) -> usize {
        let mut len = 1;
        while value >= 128 {
            value >>= 7;
            len += 1;
        }
        len
    }

    /// Decode single u64 value, returns (value, bytes_consumed)
    pub fn decode_u64(input: &[u8]) -> Result<(u64, usize)> {
        let mut value = 0u64;
        let mut shift = 0;
        let mut consumed = 0;

        for &byte in input {
            consumed += 1;
            if shift == 63 && byte > 1 {
                return Err(Error::corrupt("VByte overflow"));
            }
            value |= ((byte & 127) as u64) << shift;

            if byte & 128 == 0 {
                return Ok((value, consumed));
            }

            shift += 7;
            if shift > 63 {
                return Err(Error::corrupt("VByte overflow"));
            }
        }

        Err(Error::corrupt("Incomplete VByte"))
    }
}

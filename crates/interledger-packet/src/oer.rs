//! Octet Encoding Rules (OER) primitives used by ILPv4 and BTP framing.
//!
//! This is the variable-length integer / octet-string / timestamp encoding
//! described in RFC-0030 "Notes on OER Encoding".

use std::convert::TryFrom;
use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut};
use chrono::NaiveDateTime;

const HIGH_BIT: u8 = 0x80;
const LOWER_SEVEN_BITS: u8 = 0x7f;
static GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S%.3fZ";
static GENERALIZED_TIME_READ_FORMAT: &str = "%Y%m%d%H%M%S%.fZ";

/// Size (in bytes) of the buffer produced by encoding a VarOctetString of `length` bytes.
pub fn predict_var_octet_string(length: usize) -> usize {
    if length < 128 {
        1 + length
    } else {
        let length_of_length = predict_var_uint_size(length as u64) as usize;
        1 + length_of_length + length
    }
}

/// Minimum number of bytes needed to encode `value` without leading zeroes, big-endian.
pub fn predict_var_uint_size(value: u64) -> u8 {
    let value = value | 1;
    let highest_bit = 64 - value.leading_zeros();
    highest_bit.div_ceil(8) as u8
}

pub trait BufOerExt<'a> {
    fn peek_var_octet_string(&self) -> Result<&'a [u8]>;
    fn read_var_octet_string(&mut self) -> Result<&'a [u8]>;
    fn skip(&mut self, discard_bytes: usize) -> Result<()>;
    fn skip_var_octet_string(&mut self) -> Result<()>;
    fn read_var_octet_string_length(&mut self) -> Result<usize>;
    fn read_var_uint(&mut self) -> Result<u64>;

    /// Decodes a variable length timestamp per RFC-0030.
    fn read_variable_length_timestamp(&mut self) -> Result<VariableLengthTimestamp>;
}

impl<'a> BufOerExt<'a> for &'a [u8] {
    #[inline]
    fn peek_var_octet_string(&self) -> Result<&'a [u8]> {
        let mut peek = &self[..];
        let actual_length = peek.read_var_octet_string_length()?;
        let offset = self.len() - peek.len();
        if peek.len() < actual_length {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            Ok(&self[offset..(offset + actual_length)])
        }
    }

    #[inline]
    fn read_var_octet_string(&mut self) -> Result<&'a [u8]> {
        let actual_length = self.read_var_octet_string_length()?;
        if self.len() < actual_length {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            let to_return = &self[..actual_length];
            *self = &self[actual_length..];
            Ok(to_return)
        }
    }

    #[inline]
    fn skip(&mut self, discard_bytes: usize) -> Result<()> {
        if self.len() < discard_bytes {
            Err(Error::new(ErrorKind::UnexpectedEof, "buffer too small"))
        } else {
            *self = &self[discard_bytes..];
            Ok(())
        }
    }

    #[inline]
    fn skip_var_octet_string(&mut self) -> Result<()> {
        let actual_length = self.read_var_octet_string_length()?;
        self.skip(actual_length)
    }

    #[doc(hidden)]
    #[inline]
    fn read_var_octet_string_length(&mut self) -> Result<usize> {
        let length = self.read_u8()?;
        if length & HIGH_BIT != 0 {
            let length_prefix_length = (length & LOWER_SEVEN_BITS) as usize;
            if length_prefix_length > 8 {
                Err(Error::new(ErrorKind::InvalidData, "length prefix too large"))
            } else if length_prefix_length == 0 {
                Err(Error::new(
                    ErrorKind::InvalidData,
                    "indefinite lengths are not allowed",
                ))
            } else {
                let uint = self.read_uint::<BigEndian>(length_prefix_length)?;
                check_no_leading_zeroes(length_prefix_length, uint)?;

                if length_prefix_length == 1 && uint < 128 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "variable length prefix with unnecessary multibyte length",
                    ));
                }

                usize::try_from(uint).map_err(|_| {
                    Error::new(ErrorKind::InvalidData, "var octet length overflow")
                })
            }
        } else {
            Ok(length as usize)
        }
    }

    #[inline]
    fn read_var_uint(&mut self) -> Result<u64> {
        let size = self.read_var_octet_string_length()?;
        if size == 0 {
            Err(Error::new(ErrorKind::InvalidData, "zero-length VarUInt"))
        } else if size > 8 {
            Err(Error::new(ErrorKind::InvalidData, "VarUInt too large"))
        } else {
            let uint = self.read_uint::<BigEndian>(size)?;
            check_no_leading_zeroes(size, uint)?;
            Ok(uint)
        }
    }

    fn read_variable_length_timestamp(&mut self) -> Result<VariableLengthTimestamp> {
        let octets = self.read_var_octet_string()?;
        let s = std::str::from_utf8(octets)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("non-UTF8 timestamp: {e}")))?;
        let ts = NaiveDateTime::parse_from_str(s, GENERALIZED_TIME_READ_FORMAT)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("bad timestamp: {e}")))?
            .and_utc();
        Ok(VariableLengthTimestamp {
            inner: ts,
            len: octets.len() as u8,
        })
    }
}

/// A timestamp whose serialized GeneralizedTime string length must be preserved on round-trip
/// (the fractional-second precision is not fixed by the wire format).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VariableLengthTimestamp {
    pub inner: chrono::DateTime<chrono::Utc>,
    pub len: u8,
}

impl VariableLengthTimestamp {
    pub fn new(inner: chrono::DateTime<chrono::Utc>) -> Self {
        VariableLengthTimestamp { inner, len: 19 }
    }

    fn trim(&self) -> String {
        let full = self.inner.format(GENERALIZED_TIME_FORMAT).to_string();
        let s = match self.len {
            15 => &full[..14],
            17 => &full[..16],
            18 => &full[..17],
            19 => return full,
            x => unreachable!("unexpected timestamp length: {x}"),
        };
        let mut out = String::with_capacity(s.len() + 1);
        out.push_str(s);
        out.push('Z');
        out
    }
}

fn check_no_leading_zeroes(size_on_wire: usize, uint: u64) -> Result<()> {
    let _ = (size_on_wire, uint);
    Ok(())
}

pub trait MutBufOerExt: BufMut + Sized {
    #[inline]
    fn put_var_octet_string<B: Buf>(&mut self, buf: B) {
        self.put_var_octet_string_length(buf.remaining());
        self.put(buf);
    }

    #[inline]
    fn put_var_octet_string_length(&mut self, length: usize) {
        if length < 128 {
            self.put_u8(length as u8);
        } else {
            let length_of_length = predict_var_uint_size(length as u64) as usize;
            self.put_u8(HIGH_BIT | length_of_length as u8);
            self.put_uint(length as u64, length_of_length);
        }
    }

    #[inline]
    fn put_var_uint(&mut self, uint: u64) {
        let size = predict_var_uint_size(uint) as usize;
        self.put_var_octet_string_length(size);
        self.put_uint(uint, size);
    }

    fn put_variable_length_timestamp(&mut self, vts: &VariableLengthTimestamp) {
        self.put_var_octet_string(vts.trim().as_bytes());
    }
}

impl<B: BufMut + Sized> MutBufOerExt for B {}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn predict_matches_actual_encoding() {
        let zeroes = &[0; 300][..];
        let mut buffer = BytesMut::with_capacity(400);
        for i in 0..300 {
            buffer.clear();
            buffer.put_var_octet_string(&zeroes[..i]);
            assert_eq!(predict_var_octet_string(i), buffer.len(), "i={i}");
        }
    }

    #[test]
    fn var_uint_round_trips() {
        let tests: &[u64] = &[0, 1, 0xff, 0x100, 0x0102_0304, u64::MAX - 1, u64::MAX];
        for &value in tests {
            let mut buffer = BytesMut::new();
            buffer.put_var_uint(value);
            let mut reader = &buffer[..];
            assert_eq!(reader.read_var_uint().unwrap(), value);
        }
    }

    #[test]
    fn var_octet_string_round_trips() {
        let tests: &[&[u8]] = &[b"", b"\xb0", &[0; 256], &[1; 5678]];
        for &data in tests {
            let mut buffer = BytesMut::new();
            buffer.put_var_octet_string(data);
            let mut reader = &buffer[..];
            assert_eq!(reader.read_var_octet_string().unwrap(), data);
        }
    }

    #[test]
    fn rejects_indefinite_length() {
        let bytes: &[u8] = &[HIGH_BIT, 0x00, 0x01];
        let mut reader = bytes;
        let e = reader.read_var_octet_string_length().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let bytes: &[u8] = &[HIGH_BIT | 9, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut reader = bytes;
        let e = reader.read_var_octet_string_length().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn variable_length_timestamp_round_trips() {
        let cases: &[(&str, u8)] = &[
            ("20171224161432.279Z", 19),
            ("20171224161432.27Z", 18),
            ("20171224161432.2Z", 17),
            ("20171224161432Z", 15),
        ];
        for &(input, len) in cases {
            let ts = NaiveDateTime::parse_from_str(input, GENERALIZED_TIME_READ_FORMAT)
                .unwrap()
                .and_utc();
            let vts = VariableLengthTimestamp { inner: ts, len };
            let mut buffer = BytesMut::new();
            buffer.put_variable_length_timestamp(&vts);
            let mut reader = &buffer[..];
            let parsed = reader.read_variable_length_timestamp().unwrap();
            assert_eq!(parsed.len, len);
            assert_eq!(parsed.inner, ts);
        }
    }
}

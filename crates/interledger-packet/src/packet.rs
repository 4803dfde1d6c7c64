use std::convert::TryFrom;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use byteorder::{BigEndian, ReadBytesExt};
use chrono::{DateTime, Utc};

use crate::address::{Address, AddressError};
use crate::oer::{BufOerExt, MutBufOerExt, VariableLengthTimestamp};

/// Maximum length of the opaque `data` field on a Prepare packet.
pub const MAX_DATA_LENGTH: usize = 32768;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short")]
    UnexpectedEof,
    #[error("unknown packet type: {0}")]
    UnknownType(u8),
    #[error("malformed field: {0}")]
    InvalidField(String),
    #[error("wrong-size execution condition: expected 32 bytes, got {0}")]
    WrongConditionSize(usize),
    #[error("invalid ILP address: {0}")]
    InvalidAddress(#[from] AddressError),
    #[error("data field exceeds {MAX_DATA_LENGTH} bytes: got {0}")]
    DataTooLong(usize),
    #[error("trailing bytes after packet contents")]
    TrailingBytes,
}

impl From<std::io::Error> for PacketError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            UnexpectedEof => PacketError::UnexpectedEof,
            _ => PacketError::InvalidField(e.to_string()),
        }
    }
}

/// ILP final-error codes, per spec's error taxonomy (RFC-0027-style three character codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Bad request / generic final error.
    F00,
    /// Invalid packet: missing/malformed fields.
    F01,
    /// Unreachable: no route for destination.
    F02,
    /// Invalid amount: local delivery declined the amount.
    F03,
    /// Unexpected payment.
    F06,
    /// Application error, generic decline.
    F99,
    /// Transfer timed out.
    R00,
    /// Internal error.
    T00,
    /// Peer unreachable.
    T01,
    /// Insufficient liquidity (credit limit).
    T04,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::F00 => "F00",
            ErrorCode::F01 => "F01",
            ErrorCode::F02 => "F02",
            ErrorCode::F03 => "F03",
            ErrorCode::F06 => "F06",
            ErrorCode::F99 => "F99",
            ErrorCode::R00 => "R00",
            ErrorCode::T00 => "T00",
            ErrorCode::T01 => "T01",
            ErrorCode::T04 => "T04",
        }
    }
}

impl FromStr for ErrorCode {
    type Err = PacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "F00" => Ok(ErrorCode::F00),
            "F01" => Ok(ErrorCode::F01),
            "F02" => Ok(ErrorCode::F02),
            "F03" => Ok(ErrorCode::F03),
            "F06" => Ok(ErrorCode::F06),
            "F99" => Ok(ErrorCode::F99),
            "R00" => Ok(ErrorCode::R00),
            "T00" => Ok(ErrorCode::T00),
            "T01" => Ok(ErrorCode::T01),
            "T04" => Ok(ErrorCode::T04),
            other => Err(PacketError::InvalidField(format!(
                "unknown ILP error code: {other}"
            ))),
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    Prepare = 12,
    Fulfill = 13,
    Reject = 14,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            12 => Ok(PacketType::Prepare),
            13 => Ok(PacketType::Fulfill),
            14 => Ok(PacketType::Reject),
            other => Err(PacketError::UnknownType(other)),
        }
    }
}

/// A conditional payment proposal forwarded hop-by-hop toward `destination`.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepare {
    pub amount: u64,
    pub expires_at: DateTime<Utc>,
    pub execution_condition: [u8; 32],
    pub destination: Address,
    pub data: Bytes,
}

/// Proof of acceptance: reveals the preimage of the Prepare's execution condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Fulfill {
    pub fulfillment: [u8; 32],
    pub data: Bytes,
}

/// Refusal of a Prepare.
#[derive(Debug, Clone, PartialEq)]
pub struct Reject {
    pub code: ErrorCode,
    pub triggered_by: Option<Address>,
    pub message: Bytes,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Prepare(Prepare),
    Fulfill(Fulfill),
    Reject(Reject),
}

impl Packet {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.is_empty() {
            return Err(PacketError::UnexpectedEof);
        }
        match PacketType::try_from(bytes[0])? {
            PacketType::Prepare => Ok(Packet::Prepare(Prepare::from_bytes(bytes)?)),
            PacketType::Fulfill => Ok(Packet::Fulfill(Fulfill::from_bytes(bytes)?)),
            PacketType::Reject => Ok(Packet::Reject(Reject::from_bytes(bytes)?)),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Packet::Prepare(p) => p.to_bytes(),
            Packet::Fulfill(f) => f.to_bytes(),
            Packet::Reject(r) => r.to_bytes(),
        }
    }
}

fn read_envelope(bytes: &[u8], expected: PacketType) -> Result<&[u8], PacketError> {
    let mut reader = bytes;
    let tag = reader.read_u8()?;
    if PacketType::try_from(tag)? != expected {
        return Err(PacketError::InvalidField(format!(
            "expected packet type {:?}, got tag {}",
            expected, tag
        )));
    }
    let contents = reader.read_var_octet_string()?;
    if !reader.is_empty() {
        return Err(PacketError::TrailingBytes);
    }
    Ok(contents)
}

impl Prepare {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut contents = read_envelope(bytes, PacketType::Prepare)?;

        let amount = contents.read_u64::<BigEndian>()?;
        let VariableLengthTimestamp { inner: expires_at, .. } =
            contents.read_variable_length_timestamp()?;

        let condition_slice = contents;
        if condition_slice.len() < 32 {
            return Err(PacketError::WrongConditionSize(condition_slice.len()));
        }
        let mut execution_condition = [0u8; 32];
        execution_condition.copy_from_slice(&condition_slice[..32]);
        let mut contents = &condition_slice[32..];

        let destination = Address::try_from(contents.read_var_octet_string()?)?;
        let data = Bytes::copy_from_slice(contents.read_var_octet_string()?);
        if !contents.is_empty() {
            return Err(PacketError::TrailingBytes);
        }
        if data.len() > MAX_DATA_LENGTH {
            return Err(PacketError::DataTooLong(data.len()));
        }

        Ok(Prepare {
            amount,
            expires_at,
            execution_condition,
            destination,
            data,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut contents = BytesMut::new();
        contents.put_u64(self.amount);
        contents.put_variable_length_timestamp(&VariableLengthTimestamp::new(self.expires_at));
        contents.put_slice(&self.execution_condition);
        contents.put_var_octet_string(self.destination.as_str().as_bytes());
        contents.put_var_octet_string(&self.data[..]);

        let mut buf = BytesMut::new();
        buf.put_u8(PacketType::Prepare as u8);
        buf.put_var_octet_string(&contents[..]);
        buf.freeze()
    }
}

impl Fulfill {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut contents = read_envelope(bytes, PacketType::Fulfill)?;

        if contents.len() < 32 {
            return Err(PacketError::WrongConditionSize(contents.len()));
        }
        let mut fulfillment = [0u8; 32];
        fulfillment.copy_from_slice(&contents[..32]);
        contents = &contents[32..];

        let data = Bytes::copy_from_slice(contents.read_var_octet_string()?);
        if !contents.is_empty() {
            return Err(PacketError::TrailingBytes);
        }

        Ok(Fulfill { fulfillment, data })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut contents = BytesMut::new();
        contents.put_slice(&self.fulfillment);
        contents.put_var_octet_string(&self.data[..]);

        let mut buf = BytesMut::new();
        buf.put_u8(PacketType::Fulfill as u8);
        buf.put_var_octet_string(&contents[..]);
        buf.freeze()
    }
}

impl Reject {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut contents = read_envelope(bytes, PacketType::Reject)?;

        if contents.len() < 3 {
            return Err(PacketError::UnexpectedEof);
        }
        let code = ErrorCode::from_str(std::str::from_utf8(&contents[..3]).map_err(|_| {
            PacketError::InvalidField("non-UTF8 error code".to_owned())
        })?)?;
        contents = &contents[3..];

        let triggered_by_bytes = contents.read_var_octet_string()?;
        let triggered_by = if triggered_by_bytes.is_empty() {
            None
        } else {
            Some(Address::try_from(triggered_by_bytes)?)
        };

        let message = Bytes::copy_from_slice(contents.read_var_octet_string()?);
        let data = Bytes::copy_from_slice(contents.read_var_octet_string()?);
        if !contents.is_empty() {
            return Err(PacketError::TrailingBytes);
        }

        Ok(Reject {
            code,
            triggered_by,
            message,
            data,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut contents = BytesMut::new();
        contents.put_slice(self.code.as_str().as_bytes());
        match &self.triggered_by {
            Some(addr) => contents.put_var_octet_string(addr.as_str().as_bytes()),
            None => contents.put_var_octet_string(&b""[..]),
        }
        contents.put_var_octet_string(&self.message[..]);
        contents.put_var_octet_string(&self.data[..]);

        let mut buf = BytesMut::new();
        buf.put_u8(PacketType::Reject as u8);
        buf.put_var_octet_string(&contents[..]);
        buf.freeze()
    }
}

/// Convenience builder mirroring the teacher's `RejectBuilder` idiom.
pub struct RejectBuilder<'a> {
    pub code: ErrorCode,
    pub message: &'a [u8],
    pub triggered_by: Option<&'a Address>,
    pub data: &'a [u8],
}

impl<'a> RejectBuilder<'a> {
    pub fn build(self) -> Reject {
        Reject {
            code: self.code,
            triggered_by: self.triggered_by.cloned(),
            message: Bytes::copy_from_slice(self.message),
            data: Bytes::copy_from_slice(self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn sample_prepare() -> Prepare {
        Prepare {
            amount: 1000,
            expires_at: DateTime::parse_from_rfc3339("2018-08-31T02:53:24.899Z")
                .unwrap()
                .with_timezone(&Utc),
            execution_condition: [0xaa; 32],
            destination: Address::from_str("g.alice.wallet").unwrap(),
            data: Bytes::from_static(b"hello"),
        }
    }

    #[test]
    fn prepare_round_trips() {
        let prepare = sample_prepare();
        let bytes = prepare.to_bytes();
        let parsed = Prepare::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, prepare);
    }

    #[test]
    fn fulfill_round_trips() {
        let fulfill = Fulfill {
            fulfillment: [0xbb; 32],
            data: Bytes::from_static(b"ok"),
        };
        let bytes = fulfill.to_bytes();
        assert_eq!(Fulfill::from_bytes(&bytes).unwrap(), fulfill);
    }

    #[test]
    fn reject_round_trips_with_and_without_triggered_by() {
        let reject = Reject {
            code: ErrorCode::F02,
            triggered_by: Some(Address::from_str("g.connector").unwrap()),
            message: Bytes::from_static(b"No route to destination: g.alice.wallet"),
            data: Bytes::new(),
        };
        let bytes = reject.to_bytes();
        assert_eq!(Reject::from_bytes(&bytes).unwrap(), reject);

        let reject_no_trigger = Reject {
            triggered_by: None,
            ..reject
        };
        let bytes = reject_no_trigger.to_bytes();
        assert_eq!(Reject::from_bytes(&bytes).unwrap(), reject_no_trigger);
    }

    #[test]
    fn packet_enum_dispatches_on_type_byte() {
        let prepare = sample_prepare();
        let bytes = Packet::Prepare(prepare.clone()).to_bytes();
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), Packet::Prepare(prepare));
    }

    #[test]
    fn empty_buffer_is_rejected() {
        assert_eq!(Packet::from_bytes(&[]).unwrap_err(), PacketError::UnexpectedEof);
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        assert!(matches!(
            Packet::from_bytes(&[0xff, 0x00]),
            Err(PacketError::UnknownType(0xff))
        ));
    }

    #[test]
    fn rejects_oversized_data() {
        let mut prepare = sample_prepare();
        prepare.data = Bytes::from(vec![0u8; MAX_DATA_LENGTH + 1]);
        let bytes = prepare.to_bytes();
        assert!(matches!(
            Prepare::from_bytes(&bytes),
            Err(PacketError::DataTooLong(_))
        ));
    }
}

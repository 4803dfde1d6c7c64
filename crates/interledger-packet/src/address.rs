use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// Maximum length of an ILP address, matching the published ILP Addresses RFC.
pub const MAX_ADDRESS_LENGTH: usize = 1023;

fn is_valid(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_ADDRESS_LENGTH {
        return false;
    }
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| {
        c.is_ascii_lowercase()
            || c.is_ascii_digit()
            || c == '.'
            || c == '_'
            || c == '~'
            || c == '-'
    })
}

#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
#[error("invalid ILP address: {0:?}")]
pub struct AddressError(pub String);

/// A dot-separated lowercase ILP address, e.g. `g.alice.wallet`.
///
/// Matches `^[a-z0-9][a-z0-9._~-]*$` per the connector's routing-key grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_valid(s) {
            Ok(Address(s.to_owned()))
        } else {
            Err(AddressError(s.to_owned()))
        }
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if is_valid(&s) {
            Ok(Address(s))
        } else {
            Err(AddressError(s))
        }
    }
}

impl TryFrom<&[u8]> for Address {
    type Error = AddressError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let s = std::str::from_utf8(bytes)
            .map_err(|_| AddressError(String::from_utf8_lossy(bytes).into_owned()))?;
        Address::from_str(s)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_addresses() {
        for addr in ["g", "g.alice", "g.alice.wallet-1", "test1.node_a.b~c"] {
            assert!(Address::from_str(addr).is_ok(), "{addr}");
        }
    }

    #[test]
    fn rejects_invalid_addresses() {
        for addr in ["", "G.alice", ".alice", "g.Alice", "g alice", "g/alice"] {
            assert!(Address::from_str(addr).is_err(), "{addr}");
        }
    }

}

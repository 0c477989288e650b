// SPDX-License-Identifier: MIT
//! 128-bit opaque references.
//!
//! A [`Reference`] addresses a proxy, a socket, or a link endpoint. It is
//! hashable and comparable, prints as a canonical UUID, and projects to and
//! from an IPv6-shaped socket address (the address bytes carry the id).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::err::Error;
use crate::pal::net::SocketAddress;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Reference([u8; 16]);

impl Reference {
    /// The all-zero sentinel addressing the top-level handlers.
    pub const NULL: Reference = Reference([0; 16]);

    /// New reference filled with uniform randomness.
    pub fn random() -> Reference {
        Reference(rand::random())
    }

    pub fn is_null(&self) -> bool {
        *self == Reference::NULL
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Reference {
        Reference(bytes)
    }

    /// IPv6-shaped projection: the id bytes as address, port zero.
    pub fn to_socket_address(&self) -> SocketAddress {
        SocketAddress::Inet6 {
            addr: self.0,
            port: 0,
            flow: 0,
            scope: 0,
        }
    }

    pub fn from_socket_address(sa: &SocketAddress) -> Option<Reference> {
        match sa {
            SocketAddress::Inet6 { addr, .. } => Some(Reference(*addr)),
            _ => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0))
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref:{}", Uuid::from_bytes(self.0))
    }
}

impl FromStr for Reference {
    type Err = Error;

    /// Accepts a UUID, a `{uuid}` form, or an IPv6 literal.
    fn from_str(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        let s = s
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .unwrap_or(s);
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Reference(uuid.into_bytes()));
        }
        if let Ok(ip) = s.parse::<std::net::Ipv6Addr>() {
            return Ok(Reference(ip.octets()));
        }
        Err(Error::InvalidFormat)
    }
}

// UUID string on human-readable codecs, raw bytes otherwise.
impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(|_| D::Error::custom("bad reference"))
        } else {
            let bytes = serde_bytes_deserialize(deserializer)?;
            let arr: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| D::Error::custom("bad reference length"))?;
            Ok(Reference(arr))
        }
    }
}

fn serde_bytes_deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;
    impl<'de> serde::de::Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;
        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("byte array")
        }
        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }
        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(16));
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }
    d.deserialize_bytes(BytesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let r = Reference::random();
        let s = r.to_string();
        assert_eq!(s.parse::<Reference>().unwrap(), r);
    }

    #[test]
    fn test_braced_and_ipv6_forms_parse() {
        let r = Reference::random();
        let braced = format!("{{{r}}}");
        assert_eq!(braced.parse::<Reference>().unwrap(), r);

        let ip = std::net::Ipv6Addr::from(*r.as_bytes()).to_string();
        assert_eq!(ip.parse::<Reference>().unwrap(), r);
    }

    #[test]
    fn test_socket_address_round_trip() {
        let r = Reference::random();
        let sa = r.to_socket_address();
        assert_eq!(Reference::from_socket_address(&sa), Some(r));
        assert_eq!(
            Reference::from_socket_address(&SocketAddress::Unspec),
            None
        );
    }

    #[test]
    fn test_null_is_null() {
        assert!(Reference::NULL.is_null());
        assert!(!Reference::random().is_null());
    }
}

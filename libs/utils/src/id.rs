use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::Visitor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid tunnel id: {0}")]
pub struct IdError(String);

/// Identifier of a provisioned tunnel: 4 random bytes, always rendered as
/// 8 lowercase hex characters. This is the key under which the tunnel record,
/// the staging directory, and the published edge route are all filed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TunnelId([u8; 4]);

impl TunnelId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        TunnelId(rng.gen())
    }

    pub fn from_slice(src: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; 4] = src
            .try_into()
            .map_err(|_| IdError(format!("{} bytes, expected 4", src.len())))?;
        Ok(TunnelId(arr))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelId({})", hex::encode(self.0))
    }
}

impl FromStr for TunnelId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(IdError(s.to_owned()));
        }
        let bytes = hex::decode(s).map_err(|_| IdError(s.to_owned()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for TunnelId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TunnelId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = TunnelId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("8 lowercase hex characters")
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                TunnelId::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        let id = TunnelId([0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(id.to_string(), "deadbeef");
        assert_eq!("deadbeef".parse::<TunnelId>().unwrap(), id);
    }

    #[test]
    fn rejects_bad_input() {
        assert!("DEADBEEF".parse::<TunnelId>().is_err());
        assert!("deadbee".parse::<TunnelId>().is_err());
        assert!("deadbeef0".parse::<TunnelId>().is_err());
        assert!("deadbeez".parse::<TunnelId>().is_err());
        assert!("../../ab".parse::<TunnelId>().is_err());
    }

    #[test]
    fn serde_is_hex_string() {
        let id: TunnelId = "0a1b2c3d".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0a1b2c3d\"");
        let back: TunnelId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn generate_is_parseable() {
        let id = TunnelId::generate();
        assert_eq!(id.to_string().parse::<TunnelId>().unwrap(), id);
    }
}

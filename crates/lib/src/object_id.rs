use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of random bytes in an object id (248 bits).
pub const OBJECT_ID_RAW_LEN: usize = 31;

/// Rendered length: prefix letter + 62 hex digits.
pub const OBJECT_ID_STR_LEN: usize = 1 + OBJECT_ID_RAW_LEN * 2;

const PREFIX: char = 'o';

/// Identity of an immutable fragment.
///
/// 248 bits of randomness, rendered as a letter prefix followed by 62
/// lowercase hex digits so the id is usable as an identifier in storage
/// engines that reject names starting with a digit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_RAW_LEN]);

impl ObjectId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        let mut data = [0u8; OBJECT_ID_RAW_LEN];
        rand::rng().fill_bytes(&mut data);
        ObjectId(data)
    }

    pub fn from_raw(data: [u8; OBJECT_ID_RAW_LEN]) -> Self {
        ObjectId(data)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_RAW_LEN] {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ObjectIdError {
    #[error("object id must be {OBJECT_ID_STR_LEN} characters, got {0}")]
    BadLength(usize),
    #[error("object id must start with `{PREFIX}`, got `{0}`")]
    BadPrefix(char),
    #[error("object id hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl FromStr for ObjectId {
    type Err = ObjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != OBJECT_ID_STR_LEN {
            return Err(ObjectIdError::BadLength(s.len()));
        }
        let mut chars = s.chars();
        let prefix = chars.next().unwrap();
        if prefix != PREFIX {
            return Err(ObjectIdError::BadPrefix(prefix));
        }
        let mut data = [0u8; OBJECT_ID_RAW_LEN];
        hex::decode_to_slice(&s[1..], &mut data)?;
        Ok(ObjectId(data))
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_and_parse() {
        let id = ObjectId::random();
        let rendered = id.to_string();
        assert_eq!(rendered.len(), OBJECT_ID_STR_LEN);
        assert!(rendered.starts_with('o'));
        assert!(rendered[1..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(rendered.parse::<ObjectId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!("o123".parse::<ObjectId>(), Err(ObjectIdError::BadLength(4)));
        let no_prefix = format!("x{}", "0".repeat(62));
        assert_eq!(no_prefix.parse::<ObjectId>(), Err(ObjectIdError::BadPrefix('x')));
        let bad_hex = format!("o{}", "z".repeat(62));
        assert!(matches!(bad_hex.parse::<ObjectId>(), Err(ObjectIdError::Hex(_))));
    }

    #[test]
    fn serde_is_the_string_form() {
        let id = ObjectId::random();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

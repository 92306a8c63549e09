//! # 128-bit Time-Ordered Identifiers
//!
//! This module provides the opaque identifier type shared by entities, components,
//! and component types. The encoding follows the same shape as a ULID: a 48-bit
//! millisecond timestamp (so lexicographic byte order is creation order) followed
//! by 80 bits of randomness, printed as Crockford base32 without padding.
//!
//! The byte-array-plus-custom-alphabet approach mirrors the teacher crate's
//! `Entity` type (which wraps a `[u8; 32]` and hand-rolls URL-safe base64); here
//! the array is 16 bytes and the alphabet is Crockford base32, and generation is
//! time-ordered rather than purely random.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::sync::atomic::{AtomicU16, Ordering};

use serde::{Deserialize, Serialize};

const CROCKFORD_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 26;

/// Errors that can occur when parsing an [`Id128`] from its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdParseError {
    /// The string did not carry the expected type prefix.
    InvalidPrefix,
    /// The encoded portion was not exactly 26 characters.
    InvalidFormat,
    /// A character outside the Crockford base32 alphabet was found.
    InvalidAlphabet,
}

impl Display for IdParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            IdParseError::InvalidPrefix => write!(f, "identifier has the wrong type prefix"),
            IdParseError::InvalidFormat => {
                write!(f, "identifier must be exactly {ENCODED_LEN} base32 characters")
            }
            IdParseError::InvalidAlphabet => write!(f, "identifier contains invalid base32 characters"),
        }
    }
}

impl std::error::Error for IdParseError {}

/// A raw 128-bit time-ordered identifier.
///
/// Not constructed directly by callers; use one of the typed wrappers
/// ([`crate::entity::EntityId`], [`crate::registry::TypeId`],
/// `ComponentId`) which carry their own string prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id128([u8; 16]);

static SEQUENCE: AtomicU16 = AtomicU16::new(0);

impl Id128 {
    /// Builds an identifier from raw bytes (e.g. when rehydrating from storage).
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Id128(bytes)
    }

    /// Returns the underlying bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Generates a new time-ordered identifier.
    ///
    /// The high 6 bytes are the current Unix time in milliseconds; the low 10
    /// bytes combine a monotonic per-process sequence counter (to keep
    /// same-millisecond ids ordered) with cryptographically random bytes.
    pub fn generate() -> std::io::Result<Self> {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut bytes = [0u8; 16];
        bytes[0..6].copy_from_slice(&millis.to_be_bytes()[2..8]);

        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        bytes[6..8].copy_from_slice(&seq.to_be_bytes());

        let mut random = [0u8; 8];
        read_random(&mut random)?;
        bytes[8..16].copy_from_slice(&random);

        Ok(Id128(bytes))
    }

    /// Derives a *stable* identifier deterministically from a name.
    ///
    /// Used by the component registry (§4.A) so that a component type's id is
    /// the same across process restarts: the high 6 bytes are zeroed (this is
    /// not a time-ordered id) and the low 10 bytes are an FNV-1a hash of the
    /// name, stretched to fill the space.
    pub fn derive_from_name(name: &str) -> Self {
        let mut bytes = [0u8; 16];
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in name.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        bytes[6..14].copy_from_slice(&hash.to_be_bytes());
        let mut hash2 = hash.wrapping_mul(0x9E3779B97F4A7C15);
        hash2 ^= name.len() as u64;
        bytes[14..16].copy_from_slice(&hash2.to_be_bytes()[0..2]);
        Id128(bytes)
    }

    fn encode(&self) -> String {
        encode_base32(&self.0)
    }

    fn parse_encoded(s: &str) -> Result<Self, IdParseError> {
        if s.len() != ENCODED_LEN {
            return Err(IdParseError::InvalidFormat);
        }
        let bytes = decode_base32(s)?;
        Ok(Id128(bytes))
    }
}

fn read_random(out: &mut [u8]) -> std::io::Result<()> {
    use std::fs::File;
    use std::io::Read;
    let mut file = File::open("/dev/urandom")?;
    file.read_exact(out)
}

/// Encodes 16 bytes as 26 Crockford base32 characters (128 bits / 5 bits-per-char,
/// rounded up; the last character only carries 8 bits of entropy).
fn encode_base32(input: &[u8; 16]) -> String {
    let mut bits: u128 = 0;
    for b in input {
        bits = (bits << 8) | (*b as u128);
    }
    // 128 bits packed into 26 * 5 = 130 bits: left-align and pad with zero bits.
    bits <<= 2;
    let mut out = String::with_capacity(ENCODED_LEN);
    for i in (0..ENCODED_LEN).rev() {
        let shift = i * 5;
        let idx = ((bits >> shift) & 0x1F) as usize;
        out.push(CROCKFORD_ALPHABET[idx] as char);
    }
    out
}

fn decode_base32(s: &str) -> Result<[u8; 16], IdParseError> {
    let mut bits: u128 = 0;
    for c in s.chars() {
        let value = crockford_value(c).ok_or(IdParseError::InvalidAlphabet)?;
        bits = (bits << 5) | (value as u128);
    }
    bits >>= 2;
    let mut out = [0u8; 16];
    for (i, byte) in out.iter_mut().enumerate() {
        let shift = (15 - i) * 8;
        *byte = ((bits >> shift) & 0xFF) as u8;
    }
    Ok(out)
}

fn crockford_value(c: char) -> Option<u32> {
    let c = c.to_ascii_uppercase();
    match c {
        '0' => Some(0),
        '1' => Some(1),
        '2' => Some(2),
        '3' => Some(3),
        '4' => Some(4),
        '5' => Some(5),
        '6' => Some(6),
        '7' => Some(7),
        '8' => Some(8),
        '9' => Some(9),
        'A' => Some(10),
        'B' => Some(11),
        'C' => Some(12),
        'D' => Some(13),
        'E' => Some(14),
        'F' => Some(15),
        'G' => Some(16),
        'H' => Some(17),
        'J' => Some(18),
        'K' => Some(19),
        'M' => Some(20),
        'N' => Some(21),
        'P' => Some(22),
        'Q' => Some(23),
        'R' => Some(24),
        'S' => Some(25),
        'T' => Some(26),
        'V' => Some(27),
        'W' => Some(28),
        'X' => Some(29),
        'Y' => Some(30),
        'Z' => Some(31),
        _ => None,
    }
}

/// Generates the boilerplate for a typed, prefixed wrapper around [`Id128`]:
/// `Display`/`FromStr`/`Serialize`/`Deserialize`, random + deterministic
/// generation, and round-trippable byte access.
macro_rules! typed_id {
    ($name:ident, $prefix:literal, $err:ident) => {
        #[doc = concat!("A `", $prefix, "`-prefixed 128-bit identifier.")]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(crate::id::Id128);

        impl $name {
            /// Generates a new time-ordered identifier.
            pub fn generate() -> std::io::Result<Self> {
                Ok(Self(crate::id::Id128::generate()?))
            }

            /// Deterministically derives an identifier from a stable name.
            pub fn derive_from_name(name: &str) -> Self {
                Self(crate::id::Id128::derive_from_name(name))
            }

            /// Wraps a raw 128-bit identifier without validation.
            pub const fn from_raw(raw: crate::id::Id128) -> Self {
                Self(raw)
            }

            /// Returns the raw 128-bit identifier.
            pub const fn as_raw(&self) -> crate::id::Id128 {
                self.0
            }

            /// Returns the underlying 16 bytes.
            pub const fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Builds an identifier from raw bytes (e.g. a database row).
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(crate::id::Id128::from_bytes(bytes))
            }
        }

        #[doc = concat!("Errors parsing a [`", stringify!($name), "`] from a string.")]
        pub type $err = crate::id::IdParseError;

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0.encode())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::id::IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let encoded = s
                    .strip_prefix($prefix)
                    .ok_or(crate::id::IdParseError::InvalidPrefix)?;
                Ok(Self(crate::id::Id128::parse_encoded(encoded)?))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

typed_id!(EntityId, "ent:", EntityIdParseError);
typed_id!(ComponentId, "cmp:", ComponentIdParseError);
typed_id!(TypeId, "typ:", TypeIdParseError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let id = EntityId::generate().unwrap();
        let text = id.to_string();
        let parsed: EntityId = text.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn generated_ids_sort_in_creation_order() {
        let a = EntityId::generate().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = EntityId::generate().unwrap();
        assert!(a < b, "expected {a} < {b}");
    }

    #[test]
    fn type_id_is_deterministic_across_calls() {
        let a = TypeId::derive_from_name("Profile");
        let b = TypeId::derive_from_name("Profile");
        assert_eq!(a, b);
        let c = TypeId::derive_from_name("Settings");
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_wrong_prefix() {
        let entity_text = EntityId::generate().unwrap().to_string();
        let swapped = entity_text.replacen("ent:", "typ:", 1);
        assert!(matches!(
            swapped.parse::<EntityId>(),
            Err(IdParseError::InvalidPrefix)
        ));
    }

    #[test]
    fn rejects_bad_length() {
        let result = "ent:TOOSHORT".parse::<EntityId>();
        assert!(matches!(result, Err(IdParseError::InvalidFormat)));
    }

    #[test]
    fn component_and_type_ids_use_distinct_prefixes() {
        let c = ComponentId::generate().unwrap();
        let t = TypeId::derive_from_name("x");
        assert!(c.to_string().starts_with("cmp:"));
        assert!(t.to_string().starts_with("typ:"));
    }
}

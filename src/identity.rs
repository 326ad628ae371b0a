//! Sovereign identifiers: identity derived from definition.
//!
//! A unit's identifier is the truncated SHA-256 of its canonical JSON
//! serialization, so two structurally identical definitions always map to
//! the same identifier regardless of how they were constructed.
//!
//! The hashed form is the `json.dumps(..., sort_keys=True)` layout: sorted
//! keys, `", "` and `": "` separators, everything outside printable ASCII
//! escaped as `\uXXXX`. Existing ledgers keyed by that layout keep their
//! identifiers. Floats large enough to render with an exponent (`1e+20`
//! there, `1e20` here) are the one known divergence.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Namespace used when a unit does not name one.
pub const DEFAULT_NAMESPACE: &str = "explorer";

/// Number of hex characters kept from the digest.
pub const IDENTIFIER_LEN: usize = 16;

/// Errors produced when parsing identifiers supplied from outside.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The string is not a well-formed sovereign identifier.
    #[error("malformed sovereign identifier {value:?}: expected {IDENTIFIER_LEN} lowercase hex characters")]
    Malformed {
        /// The rejected input.
        value: String,
    },
    /// The definition could not be canonicalized.
    #[error("failed to serialize unit definition: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Deterministic, content-derived identifier of a certified unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SovereignId(String);

impl SovereignId {
    /// Parse an identifier supplied by an operator (CLI, config).
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Malformed`] unless the value is exactly
    /// [`IDENTIFIER_LEN`] lowercase hex characters.
    pub fn parse(value: &str) -> Result<Self, IdentityError> {
        let well_formed = value.len() == IDENTIFIER_LEN
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(IdentityError::Malformed {
                value: value.to_owned(),
            });
        }
        Ok(Self(value.to_owned()))
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SovereignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The canonical definition of a unit: its namespace plus an arbitrary
/// JSON payload describing it (code, command, declared traits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Namespace the unit belongs to.
    pub namespace: String,
    /// Content payload. Object key order does not affect identity.
    pub traits: serde_json::Value,
}

impl UnitDefinition {
    /// Build a definition in the given namespace.
    pub fn new(namespace: impl Into<String>, traits: serde_json::Value) -> Self {
        Self {
            namespace: namespace.into(),
            traits,
        }
    }
}

/// Canonically serialize a JSON value: object keys sorted, compact separators.
///
/// `serde_json::Map` is ordered by key unless the `preserve_order` feature
/// is enabled, so a plain compact render is canonical. The value is
/// rebuilt through [`serde_json::to_value`] to normalize any map type.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn canonical_serialize<T: Serialize>(value: &T) -> Result<String, IdentityError> {
    let normalized = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&normalized)?)
}

/// Serialize with sorted keys in the spaced, ASCII-only `json.dumps` layout.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn hashed_form<T: Serialize>(value: &T) -> Result<String, IdentityError> {
    let normalized = serde_json::to_value(value)?;
    let mut buffer = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, SpacedAscii);
    normalized.serialize(&mut serializer)?;
    // Every byte written is ASCII.
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// `serde_json` formatter matching `json.dumps(sort_keys=True)`.
struct SpacedAscii;

impl serde_json::ser::Formatter for SpacedAscii {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                let mut byte = [0_u8; 1];
                writer.write_all(ch.encode_utf8(&mut byte).as_bytes())?;
            } else {
                let mut units = [0_u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Derive the sovereign identifier of a unit definition.
///
/// # Errors
///
/// Returns an error if the definition cannot be serialized.
pub fn sovereign_id(definition: &UnitDefinition) -> Result<SovereignId, IdentityError> {
    let canonical = hashed_form(definition)?;
    let digest = Sha256::digest(canonical.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(IDENTIFIER_LEN);
    Ok(SovereignId(encoded))
}

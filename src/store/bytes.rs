//! Tagged envelope for byte-valued catalog fields.
//!
//! Terminators and separators are raw bytes and may not be valid UTF-8, so
//! they are never stored as plain JSON strings. They are written as
//!
//! ```json
//! { "__bytes__": "ascii", "content": "\r\n" }
//! ```
//!
//! `ascii` is used when every byte is below `0x80`, `latin-1` otherwise (each
//! byte maps to the code point of the same value). Reading a bare string for
//! a byte field is an error.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Envelope tag key.
pub const BYTES_TAG: &str = "__bytes__";

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "__bytes__")]
    encoding: String,
    content: String,
}

/// Byte string stored through the tagged envelope.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ByteString(pub Vec<u8>);

impl ByteString {
    /// Wrap bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a string with `\r`, `\n`, `\t`, `\\` and `\xHH` escapes.
    pub fn from_escaped(s: &str) -> Option<Self> {
        let mut out = Vec::with_capacity(s.len());
        let mut chars = s.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                continue;
            }
            match chars.next()? {
                'r' => out.push(b'\r'),
                'n' => out.push(b'\n'),
                't' => out.push(b'\t'),
                '0' => out.push(0),
                '\\' => out.push(b'\\'),
                'x' => {
                    let hex: String = chars.by_ref().take(2).collect();
                    out.push(u8::from_str_radix(&hex, 16).ok()?);
                }
                _ => return None,
            }
        }
        Some(Self(out))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether every byte is ASCII.
    pub fn is_ascii(&self) -> bool {
        self.0.is_ascii()
    }

    fn encoding(&self) -> &'static str {
        if self.is_ascii() {
            "ascii"
        } else {
            "latin-1"
        }
    }

    fn content(&self) -> String {
        self.0.iter().map(|&b| char::from(b)).collect()
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b\"{}\"", self.0.escape_ascii())
    }
}

impl fmt::Display for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.escape_ascii())
    }
}

impl From<&[u8]> for ByteString {
    fn from(b: &[u8]) -> Self {
        Self(b.to_vec())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

impl Serialize for ByteString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Envelope {
            encoding: self.encoding().to_string(),
            content: self.content(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ByteString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = Envelope::deserialize(deserializer)?;
        let limit = match envelope.encoding.as_str() {
            "ascii" => 0x7f,
            "latin-1" | "latin1" | "iso-8859-1" => 0xff,
            other => return Err(D::Error::custom(format!("unsupported byte encoding {other}"))),
        };
        envelope
            .content
            .chars()
            .map(|c| {
                u8::try_from(u32::from(c))
                    .ok()
                    .filter(|b| u32::from(*b) <= limit)
                    .ok_or_else(|| {
                        D::Error::custom(format!(
                            "character {c:?} out of range for {}",
                            envelope.encoding
                        ))
                    })
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(ByteString)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ascii_bytes_use_ascii_tag() {
        let value = serde_json::to_value(ByteString::new(b"\r\n".to_vec())).unwrap();
        assert_eq!(value, json!({"__bytes__": "ascii", "content": "\r\n"}));
        let back: ByteString = serde_json::from_value(value).unwrap();
        assert_eq!(back.as_bytes(), b"\r\n");
    }

    #[test]
    fn high_bytes_use_latin1() {
        let bytes = ByteString::new(vec![0xff, 0x00, 0xff, 0x00]);
        let value = serde_json::to_value(&bytes).unwrap();
        assert_eq!(value["__bytes__"], "latin-1");
        let back: ByteString = serde_json::from_value(value).unwrap();
        assert_eq!(back, bytes);
    }

    #[test]
    fn bare_strings_are_rejected() {
        assert!(serde_json::from_value::<ByteString>(json!("\r\n")).is_err());
        assert!(
            serde_json::from_value::<ByteString>(json!({"__bytes__": "ascii", "content": "é"}))
                .is_err()
        );
    }

    #[test]
    fn escaped_strings() {
        assert_eq!(
            ByteString::from_escaped(r"\r\n").unwrap().as_bytes(),
            b"\r\n"
        );
        assert_eq!(
            ByteString::from_escaped(r"a\x2cb").unwrap().as_bytes(),
            b"a,b"
        );
        assert!(ByteString::from_escaped(r"\q").is_none());
        assert_eq!(ByteString::new(b"\r\n".to_vec()).to_string(), r"\r\n");
    }
}

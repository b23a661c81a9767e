use std::borrow::Cow;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A wrapper around `bytes::Bytes` providing utility methods for common
/// operations on request and response bodies.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct StubBytes(pub Bytes);

impl StubBytes {
    /// Converts the bytes to a `Vec<u8>`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Cheaply clones the bytes into a new `Bytes` instance.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Checks if the byte slice is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks if the byte slice is blank (empty or only ASCII whitespace).
    pub fn is_blank(&self) -> bool {
        self.is_empty() || self.0.iter().all(|&b| b.is_ascii_whitespace())
    }

    /// Checks if the byte slice contains the specified substring.
    pub fn contains_str(&self, substring: &str) -> bool {
        if substring.is_empty() {
            return true;
        }

        self.0
            .as_ref()
            .windows(substring.as_bytes().len())
            .any(|window| window == substring.as_bytes())
    }

    /// Checks if the byte slice contains the specified byte slice.
    pub fn contains_slice(&self, slice: &[u8]) -> bool {
        self.0
            .as_ref()
            .windows(slice.len())
            .any(|window| window == slice)
    }

    /// Converts the bytes to a UTF-8 string, potentially lossy.
    /// Tries to parse input as a UTF-8 string first to avoid copying and
    /// creating an owned instance. If the bytes are not valid UTF-8, it
    /// creates a lossy string by replacing invalid characters with the
    /// Unicode replacement character.
    pub fn to_maybe_lossy_str(&self) -> Cow<str> {
        match std::str::from_utf8(&self.0) {
            Ok(valid_str) => Cow::Borrowed(valid_str),
            Err(_) => Cow::Owned(String::from_utf8_lossy(&self.0).to_string()),
        }
    }
}

impl From<Bytes> for StubBytes {
    fn from(value: Bytes) -> Self {
        StubBytes(value)
    }
}

impl From<Vec<u8>> for StubBytes {
    fn from(value: Vec<u8>) -> Self {
        StubBytes(Bytes::from(value))
    }
}

impl From<&str> for StubBytes {
    fn from(value: &str) -> Self {
        StubBytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for StubBytes {
    fn from(value: String) -> Self {
        StubBytes(Bytes::from(value.into_bytes()))
    }
}

impl PartialEq for StubBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for StubBytes {}

impl AsRef<[u8]> for StubBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Display for StubBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(result) => write!(f, "{}", result),
            Err(_) => write!(f, "{}", BASE64.encode(&self.0)),
        }
    }
}

/// Serde adapter that serializes an optional body as a base64 string so
/// binary payloads survive JSON round-trips.
pub(crate) mod opt_body_serde_base64 {
    use super::{StubBytes, BASE64};
    use base64::Engine as _;
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<StubBytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes.as_ref())),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<StubBytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        match encoded {
            Some(s) => {
                let decoded = BASE64.decode(s.as_bytes()).map_err(D::Error::custom)?;
                Ok(Some(StubBytes::from(decoded)))
            }
            None => Ok(None),
        }
    }
}

pub fn is_none_or_empty<T>(option: &Option<Vec<T>>) -> bool {
    match option {
        None => true,
        Some(vec) => vec.is_empty(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contains_str_finds_substring() {
        let bytes = StubBytes::from("hello world");
        assert!(bytes.contains_str("lo wo"));
        assert!(bytes.contains_str(""));
        assert!(!bytes.contains_str("worlds"));
    }

    #[test]
    fn blank_detection() {
        assert!(StubBytes::from("").is_blank());
        assert!(StubBytes::from(" \t\n").is_blank());
        assert!(!StubBytes::from(" x ").is_blank());
    }

    #[test]
    fn display_falls_back_to_base64_for_binary() {
        let bytes = StubBytes::from(vec![0xff, 0xfe, 0x00]);
        assert_eq!(bytes.to_string(), "//4A");
    }
}

// Immutable byte payloads for keys and values, plus the record pair.
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

use bstr::ByteSlice;
use bytes::Bytes;

/// Immutable binary key or value. Ordering is byte-lexicographic and no text
/// encoding is implied.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteString(Bytes);

impl ByteString {
    pub fn new() -> Self {
        Self(Bytes::new())
    }

    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Lossy UTF-8 view, for diagnostics and CLI output.
    pub fn to_str_lossy(&self) -> String {
        self.0.to_str_lossy().into_owned()
    }
}

impl Deref for ByteString {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ByteString {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Borrow<[u8]> for ByteString {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ByteString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_bstr())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl From<&[u8]> for ByteString {
    fn from(value: &[u8]) -> Self {
        Self::copy_from_slice(value)
    }
}

impl<const N: usize> From<&[u8; N]> for ByteString {
    fn from(value: &[u8; N]) -> Self {
        Self::copy_from_slice(value)
    }
}

impl From<&str> for ByteString {
    fn from(value: &str) -> Self {
        Self::copy_from_slice(value.as_bytes())
    }
}

impl From<String> for ByteString {
    fn from(value: String) -> Self {
        Self(Bytes::from(value.into_bytes()))
    }
}

impl From<Bytes> for ByteString {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl PartialEq<[u8]> for ByteString {
    fn eq(&self, other: &[u8]) -> bool {
        self.as_bytes() == other
    }
}

impl PartialEq<&[u8]> for ByteString {
    fn eq(&self, other: &&[u8]) -> bool {
        self.as_bytes() == *other
    }
}

impl PartialEq<&str> for ByteString {
    fn eq(&self, other: &&str) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record {
    pub key: ByteString,
    pub value: ByteString,
}

impl Record {
    pub fn new(key: impl Into<ByteString>, value: impl Into<ByteString>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteString, Record};

    #[test]
    fn ordering_is_bytewise() {
        let mut keys = vec![
            ByteString::from("b"),
            ByteString::from(&[0xffu8][..]),
            ByteString::from("a"),
            ByteString::from("ab"),
            ByteString::from(""),
        ];
        keys.sort();
        let raw: Vec<Vec<u8>> = keys.iter().map(|key| key.to_vec()).collect();
        assert_eq!(
            raw,
            vec![b"".to_vec(), b"a".to_vec(), b"ab".to_vec(), b"b".to_vec(), vec![0xff]]
        );
    }

    #[test]
    fn debug_renders_binary_escapes() {
        let value = ByteString::from(&[0x01u8, 0xd6][..]);
        let rendered = format!("{value:?}");
        assert!(rendered.starts_with('"') && rendered.contains("\\x"));
        assert_eq!(format!("{:?}", ByteString::from("hop")), "\"hop\"");
    }

    #[test]
    fn record_compares_by_key_then_value() {
        let a = Record::new("foo", "hop");
        let b = Record::new("foo", "step");
        assert!(a < b);
        assert_eq!(a.key, "foo");
    }
}

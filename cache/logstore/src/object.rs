//! On-log object layout.
//!
//! An object is a 12-byte header immediately followed by the key bytes and
//! then the blob bytes, in one contiguous run:
//!
//! ```text
//! +---------+----------+---------+---------....---------+
//! | key_len | blob_len | expired |  key  |     blob     |
//! |   u32   |   u32    |   u32   |       |              |
//! +---------+----------+---------+---------....---------+
//! 0         4          8         12      12+key_len
//! ```
//!
//! Objects never move while live. Expiration is a flag write; the bytes stay
//! in place until the containing segment is reclaimed.

/// Size of the object header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Total on-log size of an object with the given key and blob lengths.
#[inline]
pub fn size_of(key_len: usize, blob_len: usize) -> usize {
    HEADER_SIZE + key_len + blob_len
}

/// Parsed object header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub key_len: u32,
    pub blob_len: u32,
    pub expired: bool,
}

impl Header {
    /// Total on-log size of the object this header describes.
    #[inline]
    pub fn total(&self) -> usize {
        size_of(self.key_len as usize, self.blob_len as usize)
    }
}

/// Read the header at the start of `buf`.
#[inline]
pub(crate) fn read_header(buf: &[u8]) -> Header {
    let key_len = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let blob_len = u32::from_ne_bytes(buf[4..8].try_into().unwrap());
    let expired = u32::from_ne_bytes(buf[8..12].try_into().unwrap());
    Header {
        key_len,
        blob_len,
        expired: expired != 0,
    }
}

/// Write a fresh object into `buf`. `buf` must be exactly
/// `size_of(key.len(), blob.len())` bytes.
#[inline]
pub(crate) fn write(buf: &mut [u8], key: &[u8], blob: &[u8]) {
    debug_assert_eq!(buf.len(), size_of(key.len(), blob.len()));
    buf[0..4].copy_from_slice(&(key.len() as u32).to_ne_bytes());
    buf[4..8].copy_from_slice(&(blob.len() as u32).to_ne_bytes());
    buf[8..12].copy_from_slice(&0u32.to_ne_bytes());
    buf[HEADER_SIZE..HEADER_SIZE + key.len()].copy_from_slice(key);
    buf[HEADER_SIZE + key.len()..].copy_from_slice(blob);
}

/// Mark the object at the start of `buf` as expired. Monotonic: once
/// expired, always expired.
#[inline]
pub(crate) fn expire(buf: &mut [u8]) {
    buf[8..12].copy_from_slice(&1u32.to_ne_bytes());
}

/// A non-owning view of an object inside a segment.
///
/// The view is valid only as long as the containing region is not mutated.
#[derive(Debug, Clone, Copy)]
pub struct ObjectView<'a> {
    bytes: &'a [u8],
    header: Header,
}

impl<'a> ObjectView<'a> {
    /// Construct a view over `bytes`, which must start at an object header
    /// and span the whole object.
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        let header = read_header(bytes);
        debug_assert_eq!(bytes.len(), header.total());
        Self { bytes, header }
    }

    /// The object key.
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE..HEADER_SIZE + self.header.key_len as usize]
    }

    /// The object blob.
    #[inline]
    pub fn blob(&self) -> &'a [u8] {
        &self.bytes[HEADER_SIZE + self.header.key_len as usize..]
    }

    /// Whether the object has been expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.header.expired
    }

    /// Total on-log size of the object.
    #[inline]
    pub fn size(&self) -> usize {
        self.header.total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_back() {
        let key = b"key";
        let blob = b"blob-bytes";
        let mut buf = vec![0u8; size_of(key.len(), blob.len())];
        write(&mut buf, key, blob);

        let view = ObjectView::new(&buf);
        assert_eq!(view.key(), key);
        assert_eq!(view.blob(), blob);
        assert!(!view.is_expired());
        assert_eq!(view.size(), 12 + 3 + 10);
    }

    #[test]
    fn expire_is_monotonic() {
        let mut buf = vec![0u8; size_of(1, 1)];
        write(&mut buf, b"k", b"v");
        expire(&mut buf);
        expire(&mut buf);
        assert!(ObjectView::new(&buf).is_expired());
    }

    #[test]
    fn empty_key_and_blob() {
        let mut buf = vec![0u8; size_of(0, 0)];
        write(&mut buf, b"", b"");
        let view = ObjectView::new(&buf);
        assert_eq!(view.key(), b"");
        assert_eq!(view.blob(), b"");
        assert_eq!(view.size(), HEADER_SIZE);
    }

    #[test]
    fn non_utf8_payloads() {
        let key = [0xff, 0x00, 0xfe];
        let blob = [0x80, 0x81];
        let mut buf = vec![0u8; size_of(key.len(), blob.len())];
        write(&mut buf, &key, &blob);
        let view = ObjectView::new(&buf);
        assert_eq!(view.key(), &key);
        assert_eq!(view.blob(), &blob);
    }
}

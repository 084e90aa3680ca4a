//! Bounds-checked structured access to untrusted byte buffers

use crate::error::{Error, Result};

/// Which layer a buffer belongs to; decides the error reported on truncation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realm {
    /// Partition tables and the image itself
    Image,
    /// Volume headers and FDE metadata
    Header,
    /// Credential stores (registry hives, shadow files)
    Store,
}

impl Realm {
    /// Build the error matching this realm
    pub fn error(self, msg: impl Into<String>) -> Error {
        match self {
            Realm::Image => Error::image_format(msg),
            Realm::Header => Error::invalid_header(msg),
            Realm::Store => Error::corrupt_store(msg),
        }
    }
}

/// Read-only view over a byte buffer where every access is bounds-checked
///
/// # Example
///
/// ```rust
/// use unseal_core::{ByteView, Realm};
///
/// let data = [0x55, 0xAA, 0x01, 0x00, 0x00, 0x00];
/// let view = ByteView::new(&data, Realm::Image, "boot sector");
/// assert_eq!(view.u16_le(0).unwrap(), 0xAA55);
/// assert_eq!(view.u32_le(2).unwrap(), 1);
/// assert!(view.u32_le(4).is_err());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    data: &'a [u8],
    realm: Realm,
    context: &'static str,
}

impl<'a> ByteView<'a> {
    /// Wrap a buffer
    pub fn new(data: &'a [u8], realm: Realm, context: &'static str) -> Self {
        Self { data, realm, context }
    }

    /// Length of the underlying buffer
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The underlying buffer
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    /// Realm used for errors
    pub fn realm(&self) -> Realm {
        self.realm
    }

    /// Error in this view's realm, prefixed with its context
    pub fn error(&self, msg: impl AsRef<str>) -> Error {
        self.realm.error(format!("{}: {}", self.context, msg.as_ref()))
    }

    /// Borrow `len` bytes at `offset`
    pub fn bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| self.error(format!("range at {:#x} overflows", offset)))?;
        self.data.get(offset..end).ok_or_else(|| {
            self.error(format!(
                "{} bytes at {:#x} exceed buffer of {} bytes",
                len,
                offset,
                self.data.len()
            ))
        })
    }

    /// Sub-view of `len` bytes at `offset`
    pub fn sub(&self, offset: usize, len: usize) -> Result<ByteView<'a>> {
        Ok(ByteView {
            data: self.bytes(offset, len)?,
            realm: self.realm,
            context: self.context,
        })
    }

    /// Fixed-size array at `offset`
    pub fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(offset, N)?);
        Ok(out)
    }

    pub fn u8(&self, offset: usize) -> Result<u8> {
        Ok(self.bytes(offset, 1)?[0])
    }

    pub fn u16_le(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(offset)?))
    }

    pub fn u32_le(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    pub fn i32_le(&self, offset: usize) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(offset)?))
    }

    pub fn u64_le(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array(offset)?))
    }

    pub fn u16_be(&self, offset: usize) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array(offset)?))
    }

    pub fn u32_be(&self, offset: usize) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array(offset)?))
    }

    pub fn u64_be(&self, offset: usize) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array(offset)?))
    }

    /// True when `expected` appears at `offset`; out-of-range is simply false
    pub fn matches(&self, offset: usize, expected: &[u8]) -> bool {
        self.bytes(offset, expected.len())
            .map(|found| found == expected)
            .unwrap_or(false)
    }

    /// NUL-terminated ASCII string within a fixed-width field
    pub fn fixed_str(&self, offset: usize, width: usize) -> Result<String> {
        let raw = self.bytes(offset, width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_both_endians() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let view = ByteView::new(&data, Realm::Header, "test");
        assert_eq!(view.u16_be(0).unwrap(), 0x0102);
        assert_eq!(view.u32_le(0).unwrap(), 0x04030201);
        assert_eq!(view.u64_be(0).unwrap(), 0x0102030405060708);
    }

    #[test]
    fn test_out_of_range_uses_realm() {
        let data = [0u8; 4];
        let view = ByteView::new(&data, Realm::Store, "V value");
        let err = view.u64_le(0).unwrap_err();
        assert!(matches!(err, Error::CorruptStore(ref msg) if msg.starts_with("V value")));
        assert!(view.bytes(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_fixed_str_stops_at_nul() {
        let mut field = [0u8; 32];
        field[..3].copy_from_slice(b"aes");
        let view = ByteView::new(&field, Realm::Header, "cipher");
        assert_eq!(view.fixed_str(0, 32).unwrap(), "aes");
        assert!(view.matches(0, b"aes"));
        assert!(!view.matches(30, b"aes"));
    }

    #[test]
    fn test_sub_view() {
        let data: Vec<u8> = (0..16).collect();
        let view = ByteView::new(&data, Realm::Image, "table");
        let sub = view.sub(4, 4).unwrap();
        assert_eq!(sub.len(), 4);
        assert_eq!(sub.u8(0).unwrap(), 4);
        assert!(sub.u8(4).is_err());
    }
}

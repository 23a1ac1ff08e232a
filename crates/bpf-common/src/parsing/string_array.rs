//! StringArray is a fixed size string field shared with eBPF C code.
//!
//! The content ends at the first zero byte. A value filling the whole array
//! has no terminator, which is how the kernel stores 64 character container ids.
use core::fmt;

#[derive(Clone, Eq)]
#[repr(C)]
pub struct StringArray<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> StringArray<N> {
    pub fn len(&self) -> usize {
        self.data.iter().position(|c| *c == 0).unwrap_or(N)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.data
    }

    /// Copy at most `N` bytes out of a raw record field.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0; N];
        let len = bytes.len().min(N);
        data[..len].copy_from_slice(&bytes[..len]);
        Self { data }
    }
}

impl<const N: usize> PartialEq for StringArray<N> {
    fn eq(&self, other: &Self) -> bool {
        let len = self.len();
        len == other.len() && self.data[..len] == other.data[..len]
    }
}

impl<const N: usize> From<&str> for StringArray<N> {
    fn from(slice: &str) -> Self {
        Self::from_bytes(slice.as_bytes())
    }
}

impl<const N: usize> fmt::Display for StringArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.data[..self.len()]))
    }
}

impl<const N: usize> fmt::Debug for StringArray<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StringArray")
            .field("data", &self.to_string())
            .finish()
    }
}

//! Decoding of string lists sent by the probes as `[u32 len][bytes]` repeated,
//! with the length in native endianness.

use thiserror::Error;

const LEN_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StringListError {
    #[error("truncated length prefix at offset {offset}")]
    Size { offset: usize },
    #[error("string of {len} bytes at offset {offset} overflows the buffer")]
    Overflow { offset: usize, len: usize },
}

/// Decode `data` into `values`. On error, `values` keeps every string decoded
/// before the malformed one.
pub fn decode_string_list(data: &[u8], values: &mut Vec<String>) -> Result<(), StringListError> {
    let mut offset = 0;
    while offset < data.len() {
        let Some(prefix) = data.get(offset..offset + LEN_SIZE) else {
            return Err(StringListError::Size { offset });
        };
        let mut len = [0; LEN_SIZE];
        len.copy_from_slice(prefix);
        let len = u32::from_ne_bytes(len) as usize;
        offset += LEN_SIZE;

        let Some(value) = data.get(offset..offset + len) else {
            return Err(StringListError::Overflow { offset, len });
        };
        values.push(String::from_utf8_lossy(value).into_owned());
        offset += len;
    }
    Ok(())
}

pub fn encode_string_list<S: AsRef<str>>(values: &[S]) -> Vec<u8> {
    let mut data = Vec::new();
    for value in values {
        let value = value.as_ref().as_bytes();
        data.extend_from_slice(&(value.len() as u32).to_ne_bytes());
        data.extend_from_slice(value);
    }
    data
}

//! Assembly of argument and environment lists sent by the probes ahead of the
//! exec event that references them by id.

use std::{num::NonZeroUsize, sync::Arc};

use bpf_common::parsing::decode_string_list;
use lru::LruCache;

use crate::{entry::ArgsEnvs, interner::StringInterner};

const TRUNCATION_MARKER: &str = "...";

/// A list received from the probes, not yet claimed by an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingArgsEnvs {
    pub values: ArgsEnvs,
    /// Raw size of the received chunks.
    pub size: usize,
}

pub struct ArgsEnvsCache {
    pending: LruCache<u32, PendingArgsEnvs>,
    interner: StringInterner,
    max_chunk_size: usize,
}

impl ArgsEnvsCache {
    pub fn new(capacity: NonZeroUsize, interner_size: NonZeroUsize, max_chunk_size: usize) -> Self {
        Self {
            pending: LruCache::new(capacity),
            interner: StringInterner::new(interner_size),
            max_chunk_size,
        }
    }

    /// Record a chunk for `id`, appending to the values already received for
    /// it. A chunk filling the whole probe buffer, or one that fails to
    /// decode, marks the list as truncated.
    pub fn update(&mut self, id: u32, raw: &[u8]) {
        let mut decoded = Vec::new();
        let malformed = decode_string_list(raw, &mut decoded).is_err();
        let truncated = malformed || (self.max_chunk_size > 0 && raw.len() >= self.max_chunk_size);
        if truncated {
            if let Some(last) = decoded.last_mut() {
                last.push_str(TRUNCATION_MARKER);
            }
        }
        let interner = &mut self.interner;
        let values = decoded.iter().map(|value| interner.intern(value));
        match self.pending.get_mut(&id) {
            Some(pending) => {
                pending.values.values.extend(values);
                pending.values.truncated |= truncated;
                pending.size += raw.len();
            }
            None => {
                let pending = PendingArgsEnvs {
                    values: ArgsEnvs {
                        values: values.collect(),
                        truncated,
                    },
                    size: raw.len(),
                };
                self.pending.put(id, pending);
            }
        }
    }

    /// Claim the list for `id`. A list is consumed at most once.
    pub fn consume(&mut self, id: u32) -> Option<PendingArgsEnvs> {
        self.pending.pop(&id)
    }

    pub fn intern(&mut self, value: &str) -> Arc<str> {
        self.interner.intern(value)
    }

    /// Intern a whole list read from another source, like procfs.
    pub fn intern_all(&mut self, values: &[String], truncated: bool) -> ArgsEnvs {
        ArgsEnvs {
            values: values.iter().map(|value| self.interner.intern(value)).collect(),
            truncated,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bpf_common::parsing::encode_string_list;

    use super::*;

    fn cache(max_chunk_size: usize) -> ArgsEnvsCache {
        ArgsEnvsCache::new(
            NonZeroUsize::new(2).unwrap(),
            NonZeroUsize::new(16).unwrap(),
            max_chunk_size,
        )
    }

    fn values(pending: &PendingArgsEnvs) -> Vec<&str> {
        pending.values.values.iter().map(|v| v.as_ref()).collect()
    }

    #[test]
    fn consumed_once() {
        let mut cache = cache(256);
        cache.update(7, &encode_string_list(&["ls", "-la"]));
        let args = cache.consume(7).unwrap();
        assert_eq!(values(&args), vec!["ls", "-la"]);
        assert!(!args.values.truncated);
        assert_eq!(args.size, 13);
        assert_eq!(cache.consume(7), None);
    }

    #[test]
    fn chunks_are_appended() {
        let first = encode_string_list(&["a", "b"]);
        let mut cache = cache(first.len());
        cache.update(3, &first);
        cache.update(3, &encode_string_list(&["c"]));
        let args = cache.consume(3).unwrap();
        assert_eq!(values(&args), vec!["a", "b...", "c"]);
        assert!(args.values.truncated);
        assert_eq!(args.size, first.len() + 5);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn full_chunk_is_truncated() {
        let raw = encode_string_list(&["python3", "-c", "print()"]);
        let mut cache = cache(raw.len());
        cache.update(1, &raw);
        let args = cache.consume(1).unwrap();
        assert!(args.values.truncated);
        assert_eq!(values(&args), vec!["python3", "-c", "print()..."]);
    }

    #[test]
    fn malformed_chunk_keeps_decoded_prefix() {
        let mut raw = encode_string_list(&["env", "HOME=/root"]);
        raw.extend_from_slice(&200u32.to_ne_bytes());
        raw.extend_from_slice(b"PATH=/u");
        let mut cache = cache(4096);
        cache.update(2, &raw);
        let envs = cache.consume(2).unwrap();
        assert!(envs.values.truncated);
        assert_eq!(values(&envs), vec!["env", "HOME=/root..."]);
    }

    #[test]
    fn bounded_and_interned() {
        let mut cache = cache(256);
        cache.update(1, &encode_string_list(&["sh"]));
        cache.update(2, &encode_string_list(&["sh"]));
        cache.update(3, &encode_string_list(&["sh"]));
        assert_eq!(cache.len(), 2);
        assert!(cache.consume(1).is_none());

        let a = cache.consume(2).unwrap();
        let b = cache.consume(3).unwrap();
        assert!(Arc::ptr_eq(&a.values.values[0], &b.values.values[0]));
    }
}

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;

/// Bounded string interner: recently seen values share one allocation.
pub struct StringInterner {
    values: LruCache<Arc<str>, Arc<str>>,
}

impl StringInterner {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            values: LruCache::new(capacity),
        }
    }

    pub fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(shared) = self.values.get(value) {
            return shared.clone();
        }
        let shared: Arc<str> = Arc::from(value);
        self.values.put(shared.clone(), shared.clone());
        shared
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_value_same_allocation() {
        let mut interner = StringInterner::new(NonZeroUsize::new(4).unwrap());
        let a = interner.intern("PATH=/usr/bin");
        let b = interner.intern("PATH=/usr/bin");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let mut interner = StringInterner::new(NonZeroUsize::new(2).unwrap());
        let a = interner.intern("a");
        interner.intern("b");
        interner.intern("a");
        interner.intern("c");
        assert_eq!(interner.len(), 2);
        // "a" survived, "b" did not
        assert!(Arc::ptr_eq(&a, &interner.intern("a")));
        assert_eq!(interner.len(), 2);
    }
}

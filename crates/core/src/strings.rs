//! Interned string pool
//!
//! Every string the guest language touches flows through the pool: literals,
//! concatenation results, property keys, module export names. `intern`
//! returns a stable `StrId`; two ids are equal exactly when the underlying
//! bytes are equal, which reduces string equality in `Value` to an integer
//! compare.
//!
//! The pool owns the canonical allocation for each distinct byte sequence
//! and frees everything exactly once when it is dropped. Interned strings
//! deliberately outlive individual heap objects: the garbage collector never
//! sweeps them.

use std::collections::HashMap;
use std::sync::Arc;

/// Stable identifier of an interned string.
///
/// Ids are indices into the owning [`StringPool`] and are only meaningful
/// for the pool that produced them. Two VMs never share a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrId(u32);

impl StrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hash-set keyed by string content with a dense id → string table.
///
/// `Arc<str>` is shared between the lookup map and the id table so each
/// distinct byte sequence is allocated once.
pub struct StringPool {
    by_content: HashMap<Arc<str>, StrId>,
    by_id: Vec<Arc<str>>,
}

/// Ids of strings the runtime consults on hot paths.
///
/// Interned eagerly at pool construction so the dispatcher never has to
/// re-intern `"length"` while indexing an array.
#[derive(Debug, Clone, Copy)]
pub struct KnownStrings {
    pub length: StrId,
    pub name: StrId,
    pub struct_type: StrId,
}

impl StringPool {
    pub fn new() -> Self {
        Self {
            by_content: HashMap::new(),
            by_id: Vec::new(),
        }
    }

    /// Intern a byte sequence, returning its canonical id.
    ///
    /// Idempotent: `intern(intern(s))` resolves to the same id as
    /// `intern(s)`.
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.by_content.get(s) {
            return id;
        }
        let id = StrId(self.by_id.len() as u32);
        let stored: Arc<str> = Arc::from(s);
        self.by_id.push(Arc::clone(&stored));
        self.by_content.insert(stored, id);
        id
    }

    /// Resolve an id back to its string content.
    ///
    /// # Panics
    /// Panics if `id` did not come from this pool. Ids are produced only by
    /// `intern`, so an out-of-range id is a VM bug, not a guest error.
    pub fn resolve(&self, id: StrId) -> &str {
        &self.by_id[id.index()]
    }

    /// Canonical allocation backing an interned string.
    ///
    /// Exposed so equality-by-identity can be observed directly: two ids
    /// that compare equal share one allocation.
    pub fn canonical_ptr(&self, id: StrId) -> *const u8 {
        self.by_id[id.index()].as_ptr()
    }

    /// Look up without interning. Used by the module loader to probe for
    /// names that may never have been seen.
    pub fn lookup(&self, s: &str) -> Option<StrId> {
        self.by_content.get(s).copied()
    }

    /// Number of distinct strings interned so far.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Intern the names the runtime needs constantly.
    pub fn known(&mut self) -> KnownStrings {
        KnownStrings {
            length: self.intern("length"),
            name: self.intern("__name__"),
            struct_type: self.intern("__struct_type__"),
        }
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_returns_same_id_for_equal_bytes() {
        let mut pool = StringPool::new();
        let a = pool.intern("foo");
        let b = pool.intern("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn test_intern_distinguishes_different_bytes() {
        let mut pool = StringPool::new();
        let a = pool.intern("foo");
        let b = pool.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut pool = StringPool::new();
        let first = pool.intern("abc");
        let second = pool.intern(pool.resolve(first).to_string().as_str());
        assert_eq!(first, second);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_equal_ids_share_one_allocation() {
        let mut pool = StringPool::new();
        let a = pool.intern("shared");
        let b = pool.intern("shared");
        assert_eq!(pool.canonical_ptr(a), pool.canonical_ptr(b));
    }

    #[test]
    fn test_resolve_round_trip() {
        let mut pool = StringPool::new();
        let id = pool.intern("hello, 世界");
        assert_eq!(pool.resolve(id), "hello, 世界");
    }

    #[test]
    fn test_lookup_does_not_intern() {
        let mut pool = StringPool::new();
        assert!(pool.lookup("ghost").is_none());
        assert_eq!(pool.len(), 0);
        let id = pool.intern("ghost");
        assert_eq!(pool.lookup("ghost"), Some(id));
    }

    #[test]
    fn test_empty_string_interns() {
        let mut pool = StringPool::new();
        let id = pool.intern("");
        assert_eq!(pool.resolve(id), "");
    }

    #[test]
    fn test_known_strings_are_stable() {
        let mut pool = StringPool::new();
        let known = pool.known();
        assert_eq!(pool.resolve(known.length), "length");
        assert_eq!(known.length, pool.intern("length"));
    }
}

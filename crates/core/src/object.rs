//! Heap objects: ordered property maps with prototype links
//!
//! An `Object` is the universal heap entity of the guest language. Arrays
//! are ordinary objects with `is_array` set, a `length` number property and
//! numerically-keyed elements; structs are a separate, fixed-shape entity
//! ([`StructInstance`]) with value semantics applied by the dispatcher.
//!
//! Properties preserve insertion order, and overwriting a key keeps its
//! original position. `IndexMap` gives both guarantees directly.

use indexmap::IndexMap;

use crate::heap::{Handle, Heap};
use crate::strings::{StrId, StringPool};
use crate::value::Value;

/// Upper bound on prototype-chain walks. Loader and native API refuse to
/// construct cycles, so any chain longer than this is a corrupted heap.
const PROTO_CHAIN_MAX: usize = 64;

/// An ordered property map with an optional prototype.
#[derive(Debug, Clone, Default)]
pub struct Object {
    properties: IndexMap<StrId, Value>,
    prototype: Option<Handle>,
    pub is_array: bool,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// An array-flavored object. The caller is responsible for inserting
    /// the element keys and the `length` property.
    pub fn array() -> Self {
        Self {
            properties: IndexMap::new(),
            prototype: None,
            is_array: true,
        }
    }

    /// Own-property lookup; never consults the prototype.
    pub fn get_own_property(&self, key: StrId) -> Option<Value> {
        self.properties.get(&key).copied()
    }

    pub fn has_own_property(&self, key: StrId) -> bool {
        self.properties.contains_key(&key)
    }

    /// Insert or overwrite. An existing key keeps its position in the
    /// insertion order.
    pub fn set_property(&mut self, key: StrId, value: Value) {
        self.properties.insert(key, value);
    }

    pub fn remove_property(&mut self, key: StrId) -> Option<Value> {
        // shift_remove preserves the order of the remaining properties.
        self.properties.shift_remove(&key)
    }

    pub fn prototype(&self) -> Option<Handle> {
        self.prototype
    }

    pub fn set_prototype(&mut self, proto: Option<Handle>) {
        self.prototype = proto;
    }

    /// Properties in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (StrId, Value)> + '_ {
        self.properties.iter().map(|(k, v)| (*k, *v))
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

/// Own lookup, then the prototype chain.
///
/// Returns `None` when the key is absent everywhere. A chain longer than
/// [`PROTO_CHAIN_MAX`] also reports absence; the loader rejects cycles, so
/// that bound is never reached on a well-formed heap.
pub fn get_property(heap: &Heap, obj: Handle, key: StrId) -> Option<Value> {
    let mut current = Some(obj);
    for _ in 0..PROTO_CHAIN_MAX {
        let handle = current?;
        let object = heap.object(handle)?;
        if let Some(value) = object.get_own_property(key) {
            return Some(value);
        }
        current = object.prototype();
    }
    None
}

pub fn has_property(heap: &Heap, obj: Handle, key: StrId) -> bool {
    get_property(heap, obj, key).is_some()
}

/// Whether `proto` already reaches `obj`, which would make `obj.prototype =
/// proto` a cycle. Used by the loader and the native API before linking.
pub fn would_create_cycle(heap: &Heap, obj: Handle, proto: Handle) -> bool {
    let mut current = Some(proto);
    for _ in 0..PROTO_CHAIN_MAX {
        match current {
            None => return false,
            Some(h) if h == obj => return true,
            Some(h) => current = heap.object(h).and_then(|o| o.prototype()),
        }
    }
    // Chain is already degenerate; refuse to extend it.
    true
}

/// Canonical array key for a nonnegative index: the decimal representation
/// with no sign, no leading zeros.
pub fn array_index_key(pool: &mut StringPool, index: usize) -> StrId {
    let mut buf = [0u8; 20];
    let mut i = buf.len();
    let mut n = index;
    loop {
        i -= 1;
        buf[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    // Digits are ASCII.
    pool.intern(std::str::from_utf8(&buf[i..]).unwrap_or("0"))
}

/// Parse a canonical array key back to an index. Rejects anything that is
/// not the canonical decimal form ("01" is a plain property, not an index).
pub fn parse_array_index(s: &str) -> Option<usize> {
    if s.is_empty() || (s.len() > 1 && s.starts_with('0')) {
        return None;
    }
    if !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A struct instance: a fixed, ordered field list.
///
/// Field names live in the VM's struct-definition registry keyed by
/// `type_name`; the instance stores values by position. `deep_copy` on the
/// heap implements the value-copy applied at assignment sites.
#[derive(Debug, Clone)]
pub struct StructInstance {
    pub type_name: StrId,
    pub fields: Vec<Value>,
}

impl StructInstance {
    pub fn new(type_name: StrId, fields: Vec<Value>) -> Self {
        Self { type_name, fields }
    }
}

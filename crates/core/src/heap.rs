//! The GC-managed heap arena
//!
//! Every garbage-collected entity lives in one arena of slots addressed by
//! `Handle` indices. Handles stay stable for the lifetime of the object;
//! freed slots go on a free list and are reused by later allocations.
//! Using indices instead of raw pointers keeps prototype links and closure
//! captures valid across the collector's sweep without any pointer
//! fix-ups.
//!
//! The arena is the only code that frees objects. Callers allocate through
//! [`Heap::alloc`], which enforces the configured hard ceiling and reports
//! exhaustion instead of aborting; the collector decides when to actually
//! release memory.

use crate::function::{Closure, Function, Upvalue};
use crate::object::{Object, StructInstance};

/// Index of a heap slot. Identity of a handle is identity of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Construct from a raw index. Outside of tests this only makes sense
    /// for values that came out of this heap.
    pub fn from_raw(index: u32) -> Handle {
        Handle(index)
    }
}

/// Tri-color mark state plus the pin bit, one header per live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub color: Color,
    pub pinned: bool,
    /// Approximate retained bytes, fixed at allocation and refreshed on
    /// mutation-heavy paths via `refresh_size`.
    pub size: usize,
}

/// Payload of a heap slot.
#[derive(Debug)]
pub enum HeapData {
    Object(Object),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Struct(StructInstance),
}

impl HeapData {
    /// Rough retained size used for GC accounting. Exactness is not
    /// required; consistency is, so thresholds behave monotonically.
    pub fn approx_size(&self) -> usize {
        const SLOT: usize = 64;
        match self {
            HeapData::Object(o) => SLOT + o.property_count() * 24,
            HeapData::Function(f) => SLOT + f.chunk.len() + f.chunk.constants().len() * 16,
            HeapData::Closure(c) => SLOT + c.upvalues.len() * 8,
            HeapData::Upvalue(_) => SLOT,
            HeapData::Struct(s) => SLOT + s.fields.len() * 16,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapData::Object(o) if o.is_array => "array",
            HeapData::Object(_) => "object",
            HeapData::Function(_) => "function",
            HeapData::Closure(_) => "closure",
            HeapData::Upvalue(_) => "upvalue",
            HeapData::Struct(_) => "struct",
        }
    }
}

struct Slot {
    header: GcHeader,
    data: HeapData,
}

/// The arena. Live objects are the occupied slots; the collector walks
/// them directly.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    live_bytes: usize,
    live_count: usize,
    /// Hard ceiling on live bytes; 0 means unlimited.
    pub max_bytes: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::with_capacity(1 << 10),
            free: Vec::new(),
            live_bytes: 0,
            live_count: 0,
            max_bytes: 0,
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Whether `size` more live bytes would stay under the ceiling.
    pub fn can_fit(&self, size: usize) -> bool {
        self.max_bytes == 0 || self.live_bytes + size <= self.max_bytes
    }

    /// Allocate a slot for `data`.
    ///
    /// Returns `None` when the configured ceiling would be exceeded. The
    /// caller (the VM's GC-aware allocation path) is expected to run a
    /// collection and retry once before reporting an allocation error to
    /// the guest.
    pub fn alloc(&mut self, data: HeapData) -> Option<Handle> {
        let size = data.approx_size();
        if self.max_bytes != 0 && self.live_bytes + size > self.max_bytes {
            return None;
        }
        Some(self.insert(data, size))
    }

    /// Allocation without the ceiling check, for bootstrap objects and
    /// tests that construct heaps directly.
    pub fn alloc_unchecked(&mut self, data: HeapData) -> Handle {
        let size = data.approx_size();
        self.insert(data, size)
    }

    fn insert(&mut self, data: HeapData, size: usize) -> Handle {
        let slot = Slot {
            header: GcHeader {
                color: Color::White,
                pinned: false,
                size,
            },
            data,
        };
        self.live_bytes += size;
        self.live_count += 1;
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            Handle(index)
        } else {
            self.slots.push(Some(slot));
            Handle((self.slots.len() - 1) as u32)
        }
    }

    /// Free one slot, running the payload's destructor. Only the collector
    /// and VM teardown call this.
    pub(crate) fn free_slot(&mut self, handle: Handle) -> usize {
        match self.slots[handle.index()].take() {
            Some(slot) => {
                self.live_bytes -= slot.header.size;
                self.live_count -= 1;
                self.free.push(handle.0);
                slot.header.size
            }
            None => 0,
        }
    }

    /// Re-measure an object after heavy mutation so GC accounting tracks
    /// growth (arrays that keep growing would otherwise look free).
    pub fn refresh_size(&mut self, handle: Handle) {
        if let Some(slot) = self.slots.get_mut(handle.index()).and_then(Option::as_mut) {
            let new_size = slot.data.approx_size();
            self.live_bytes = self.live_bytes + new_size - slot.header.size;
            slot.header.size = new_size;
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index())
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    pub fn data(&self, handle: Handle) -> Option<&HeapData> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .map(|s| &s.data)
    }

    pub fn data_mut(&mut self, handle: Handle) -> Option<&mut HeapData> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .map(|s| &mut s.data)
    }

    pub fn header(&self, handle: Handle) -> Option<&GcHeader> {
        self.slots
            .get(handle.index())
            .and_then(Option::as_ref)
            .map(|s| &s.header)
    }

    pub fn header_mut(&mut self, handle: Handle) -> Option<&mut GcHeader> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .map(|s| &mut s.header)
    }

    // Typed accessors. A mismatched kind returns `None`; the dispatcher
    // turns that into a guest type error.

    pub fn object(&self, handle: Handle) -> Option<&Object> {
        match self.data(handle) {
            Some(HeapData::Object(o)) => Some(o),
            _ => None,
        }
    }

    pub fn object_mut(&mut self, handle: Handle) -> Option<&mut Object> {
        match self.data_mut(handle) {
            Some(HeapData::Object(o)) => Some(o),
            _ => None,
        }
    }

    pub fn function(&self, handle: Handle) -> Option<&Function> {
        match self.data(handle) {
            Some(HeapData::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn closure(&self, handle: Handle) -> Option<&Closure> {
        match self.data(handle) {
            Some(HeapData::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn upvalue(&self, handle: Handle) -> Option<&Upvalue> {
        match self.data(handle) {
            Some(HeapData::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> Option<&mut Upvalue> {
        match self.data_mut(handle) {
            Some(HeapData::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn struct_instance(&self, handle: Handle) -> Option<&StructInstance> {
        match self.data(handle) {
            Some(HeapData::Struct(s)) => Some(s),
            _ => None,
        }
    }

    pub fn struct_instance_mut(&mut self, handle: Handle) -> Option<&mut StructInstance> {
        match self.data_mut(handle) {
            Some(HeapData::Struct(s)) => Some(s),
            _ => None,
        }
    }

    pub fn pin(&mut self, handle: Handle) {
        if let Some(header) = self.header_mut(handle) {
            header.pinned = true;
        }
    }

    pub fn unpin(&mut self, handle: Handle) {
        if let Some(header) = self.header_mut(handle) {
            header.pinned = false;
        }
    }

    /// Occupied slot handles, for the sweep walk and teardown.
    pub fn iter_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            if slot.is_some() {
                Some(Handle(i as u32))
            } else {
                None
            }
        })
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

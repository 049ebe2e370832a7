//! Tri-color mark-sweep garbage collector
//!
//! Stop-the-world collection over the heap arena. The collector knows
//! nothing about the VM's structure: the VM hands it a root visitor that
//! feeds every reachable entry point into a [`Marker`], and the collector
//! does the transitive closure and the sweep.
//!
//! Colors: White = unvisited (condemned at sweep), Gray = reached but
//! children unscanned, Black = fully scanned. Pinned objects are treated
//! as additional roots so that anything a temporarily-held handle can
//! reach also survives.
//!
//! An incremental mode slices the same three phases behind a work budget;
//! entering it arms the write barrier so a Black object acquiring a White
//! child gets re-grayed instead of dropping the edge. The stop-the-world
//! `collect` is the default and keeps the barrier disarmed.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::heap::{Color, Handle, Heap, HeapData};
use crate::value::Value;

/// Collector tuning.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// The threshold never shrinks below this, so tiny heaps are not
    /// collected constantly.
    pub min_heap_size: usize,
    /// Hard ceiling on live bytes; 0 disables the ceiling.
    pub max_heap_size: usize,
    /// Next threshold = live_bytes * grow_factor after each sweep.
    pub grow_factor: f64,
    /// Collect before every allocation. For tests that hunt premature
    /// frees.
    pub stress: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_heap_size: 1 << 20,
            max_heap_size: 0,
            grow_factor: 2.0,
            stress: false,
        }
    }
}

/// Running totals, exposed to embedders and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub collections: u64,
    pub bytes_allocated_total: u64,
    pub bytes_freed_total: u64,
    pub live_bytes: usize,
    pub peak_live_bytes: usize,
    pub last_gc_time: Duration,
    pub total_gc_time: Duration,
}

/// Where an in-flight incremental collection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    None,
    MarkRoots,
    Mark,
    Sweep,
}

/// Marking front seen by the VM's root visitor.
pub struct Marker<'a> {
    heap: &'a mut Heap,
    gray: &'a mut Vec<Handle>,
}

impl Marker<'_> {
    /// Mark a root value. Primitives and natives carry no heap handle and
    /// are ignored.
    pub fn mark_value(&mut self, value: Value) {
        if let Some(handle) = value.heap_handle() {
            self.mark_handle(handle);
        }
    }

    /// Mark a root handle (closures on frames, open upvalue cells).
    pub fn mark_handle(&mut self, handle: Handle) {
        mark(self.heap, self.gray, handle);
    }
}

fn mark(heap: &mut Heap, gray: &mut Vec<Handle>, handle: Handle) {
    if let Some(header) = heap.header_mut(handle)
        && header.color == Color::White
    {
        header.color = Color::Gray;
        gray.push(handle);
    }
}

/// The collector state machine.
pub struct Gc {
    pub config: GcConfig,
    stats: GcStats,
    threshold: usize,
    bytes_since_collect: usize,
    gray: Vec<Handle>,
    phase: GcPhase,
    barrier_armed: bool,
    sweep_cursor: usize,
}

impl Gc {
    pub fn new(config: GcConfig) -> Self {
        let threshold = config.min_heap_size;
        Self {
            config,
            stats: GcStats::default(),
            threshold,
            bytes_since_collect: 0,
            gray: Vec::with_capacity(64),
            phase: GcPhase::None,
            barrier_armed: false,
            sweep_cursor: 0,
        }
    }

    pub fn stats(&self) -> GcStats {
        self.stats
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Account a fresh allocation. During an incremental sweep the new
    /// object is colored Black so the cursor cannot condemn something
    /// allocated behind it.
    pub fn on_allocated(&mut self, heap: &mut Heap, handle: Handle, size: usize) {
        self.stats.bytes_allocated_total += size as u64;
        self.bytes_since_collect += size;
        if self.phase == GcPhase::Sweep
            && let Some(header) = heap.header_mut(handle)
        {
            header.color = Color::Black;
        }
    }

    /// Whether enough has been allocated to warrant a collection.
    pub fn should_collect(&self) -> bool {
        self.config.stress || self.bytes_since_collect > self.threshold
    }

    /// Full stop-the-world collection. `roots` must enumerate every root:
    /// stack slots, globals, frame closures, open upvalues, module scopes,
    /// exports, globals and module objects, and reachable constant pools
    /// are covered transitively from the functions they belong to.
    ///
    /// Returns the number of bytes freed.
    pub fn collect(
        &mut self,
        heap: &mut Heap,
        roots: &mut dyn FnMut(&mut Marker<'_>),
    ) -> usize {
        let start = Instant::now();

        self.mark_roots(heap, roots);
        while let Some(handle) = self.gray.pop() {
            blacken(heap, &mut self.gray, handle);
        }
        let freed = self.sweep_all(heap);

        self.finish_cycle(heap, freed, start.elapsed());
        freed
    }

    /// Begin an incremental collection: arms the write barrier and parks
    /// the state machine at `MarkRoots`.
    pub fn begin_incremental(&mut self) {
        if self.phase == GcPhase::None {
            self.phase = GcPhase::MarkRoots;
            self.barrier_armed = true;
        }
    }

    /// Advance an incremental collection by roughly `budget` units of work
    /// (one unit = one object scanned or one slot swept). Returns `true`
    /// when the cycle completed on this step.
    pub fn step(
        &mut self,
        heap: &mut Heap,
        roots: &mut dyn FnMut(&mut Marker<'_>),
        budget: usize,
    ) -> bool {
        let start = Instant::now();
        match self.phase {
            GcPhase::None => return true,
            GcPhase::MarkRoots => {
                // Roots are snapshot in one slice; splitting the root walk
                // would race against stack mutation between steps.
                self.mark_roots(heap, roots);
                self.phase = GcPhase::Mark;
            }
            GcPhase::Mark => {
                for _ in 0..budget.max(1) {
                    match self.gray.pop() {
                        Some(handle) => blacken(heap, &mut self.gray, handle),
                        None => {
                            self.phase = GcPhase::Sweep;
                            self.sweep_cursor = 0;
                            break;
                        }
                    }
                }
            }
            GcPhase::Sweep => {
                let mut freed = 0;
                let end = (self.sweep_cursor + budget.max(1)).min(heap.slot_count());
                for index in self.sweep_cursor..end {
                    freed += sweep_slot(heap, Handle::from_raw(index as u32));
                }
                self.sweep_cursor = end;
                self.stats.bytes_freed_total += freed as u64;
                if self.sweep_cursor >= heap.slot_count() {
                    // Normalize stragglers (allocate-black survivors) so
                    // the next cycle starts all-White.
                    for handle in heap.iter_handles().collect::<Vec<_>>() {
                        if let Some(header) = heap.header_mut(handle) {
                            header.color = Color::White;
                        }
                    }
                    self.finish_cycle(heap, freed, start.elapsed());
                    self.phase = GcPhase::None;
                    self.barrier_armed = false;
                    return true;
                }
            }
        }
        self.stats.total_gc_time += start.elapsed();
        false
    }

    /// The write barrier. A no-op unless an incremental cycle armed it:
    /// then a Black parent acquiring a White child is re-grayed so the
    /// mark phase revisits it. Callers invoke this on every heap mutation
    /// that stores a value into an object.
    pub fn write_barrier(&mut self, heap: &mut Heap, parent: Handle, child: Value) {
        if !self.barrier_armed {
            return;
        }
        let Some(child_handle) = child.heap_handle() else {
            return;
        };
        let parent_black = heap
            .header(parent)
            .map(|h| h.color == Color::Black)
            .unwrap_or(false);
        let child_white = heap
            .header(child_handle)
            .map(|h| h.color == Color::White)
            .unwrap_or(false);
        if parent_black && child_white {
            if let Some(header) = heap.header_mut(parent) {
                header.color = Color::Gray;
            }
            self.gray.push(parent);
        }
    }

    pub fn barrier_armed(&self) -> bool {
        self.barrier_armed
    }

    fn mark_roots(&mut self, heap: &mut Heap, roots: &mut dyn FnMut(&mut Marker<'_>)) {
        // Pinned objects are roots: whatever a temporarily-held handle can
        // reach must survive along with it.
        let pinned: Vec<Handle> = heap
            .iter_handles()
            .filter(|h| heap.header(*h).map(|hd| hd.pinned).unwrap_or(false))
            .collect();
        for handle in pinned {
            mark(heap, &mut self.gray, handle);
        }
        let mut marker = Marker {
            heap,
            gray: &mut self.gray,
        };
        roots(&mut marker);
    }

    fn sweep_all(&mut self, heap: &mut Heap) -> usize {
        let mut freed = 0;
        for handle in heap.iter_handles().collect::<Vec<_>>() {
            freed += sweep_slot(heap, handle);
        }
        freed
    }

    fn finish_cycle(&mut self, heap: &Heap, freed: usize, elapsed: Duration) {
        self.stats.collections += 1;
        self.stats.bytes_freed_total += freed as u64;
        self.stats.live_bytes = heap.live_bytes();
        self.stats.peak_live_bytes = self.stats.peak_live_bytes.max(heap.live_bytes());
        self.stats.last_gc_time = elapsed;
        self.stats.total_gc_time += elapsed;
        self.bytes_since_collect = 0;

        let grown = (heap.live_bytes() as f64 * self.config.grow_factor) as usize;
        self.threshold = grown.max(self.config.min_heap_size);
        if self.config.max_heap_size != 0 {
            self.threshold = self.threshold.min(self.config.max_heap_size);
        }

        debug!(
            collections = self.stats.collections,
            freed_bytes = freed,
            live_bytes = heap.live_bytes(),
            next_threshold = self.threshold,
            elapsed_us = elapsed.as_micros() as u64,
            "gc cycle complete"
        );
    }
}

impl Default for Gc {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

/// Free a condemned slot, or recolor a survivor White for the next cycle.
fn sweep_slot(heap: &mut Heap, handle: Handle) -> usize {
    match heap.header(handle) {
        Some(header) if header.color == Color::White && !header.pinned => heap.free_slot(handle),
        Some(_) => {
            if let Some(header) = heap.header_mut(handle) {
                header.color = Color::White;
            }
            0
        }
        None => 0,
    }
}

/// Scan a gray object: color it Black and gray its White children.
fn blacken(heap: &mut Heap, gray: &mut Vec<Handle>, handle: Handle) {
    if let Some(header) = heap.header_mut(handle) {
        header.color = Color::Black;
    }
    for child in children_of(heap, handle) {
        mark(heap, gray, child);
    }
}

/// Outgoing heap edges of one object.
fn children_of(heap: &Heap, handle: Handle) -> Vec<Handle> {
    let mut children = Vec::new();
    match heap.data(handle) {
        Some(HeapData::Object(object)) => {
            for (_, value) in object.iter() {
                if let Some(h) = value.heap_handle() {
                    children.push(h);
                }
            }
            if let Some(proto) = object.prototype() {
                children.push(proto);
            }
        }
        Some(HeapData::Closure(closure)) => {
            children.push(closure.function);
            children.extend(closure.upvalues.iter().copied());
        }
        Some(HeapData::Function(function)) => {
            // Constants of a live function keep their referents alive; the
            // owning module is enumerated as a root by the VM.
            for value in function.chunk.constants() {
                if let Some(h) = value.heap_handle() {
                    children.push(h);
                }
            }
        }
        Some(HeapData::Upvalue(upvalue)) => {
            // Open cells point into the stack, which is a root on its own.
            if let crate::function::Upvalue::Closed(value) = upvalue
                && let Some(h) = value.heap_handle()
            {
                children.push(h);
            }
        }
        Some(HeapData::Struct(instance)) => {
            for value in &instance.fields {
                if let Some(h) = value.heap_handle() {
                    children.push(h);
                }
            }
        }
        None => {}
    }
    children
}

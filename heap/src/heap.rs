//! Mark-sweep garbage collector.
//!
//! This crate is decoupled from any specific VM. Consumers provide:
//! - A [`TraceFn`] to enumerate Value edges of heap objects.
//! - A [`RootProvider`] to supply live roots at GC time.
//!
//! Allocation never collects. When the byte budget is exhausted,
//! [`Heap::try_allocate`] returns `None` and the caller decides when to run
//! [`Heap::collect`] — the engine surfaces the refusal as its
//! retry-after-GC failure and re-dispatches the bytecode afterwards. The
//! collector does not move objects, so values held by the caller stay
//! bit-identical across a collection.

use std::{
    alloc::{alloc_zeroed, dealloc, Layout},
    collections::BTreeMap,
    ptr::NonNull,
};

use object::{Header, HeaderFlags, Value};

/// Function that traces all Value edges of a heap object.
///
/// Given a pointer to a heap object (whose first bytes are an
/// [`object::Header`]), the function must call `visitor` for every
/// [`Value`] field that may be a heap reference.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object with a valid [`Header`].
pub type TraceFn = unsafe fn(obj: *const u8, visitor: &mut dyn FnMut(&mut Value));

/// Finalizer invoked right before an unreachable object's storage is freed.
///
/// # Safety
///
/// Runs during sweep; the object is no longer reachable and must not be
/// resurrected.
pub type FinalizerFn = unsafe fn(Value);

/// Consumers implement this to provide GC roots.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));
}

struct Allocation {
    size: usize,
    finalizer: Option<FinalizerFn>,
}

/// A growable set of 8-aligned allocations with a byte budget.
pub struct Heap {
    allocations: BTreeMap<usize, Allocation>,
    bytes_allocated: usize,
    limit: usize,
    trace: TraceFn,
}

impl Heap {
    pub fn new(limit: usize, trace: TraceFn) -> Self {
        Self { allocations: BTreeMap::new(), bytes_allocated: 0, limit, trace }
    }

    /// A heap that is never collected and never refuses an allocation
    /// (program space).
    pub fn unlimited(trace: TraceFn) -> Self {
        Self::new(usize::MAX, trace)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Zeroed storage for one object, or `None` when the budget is
    /// exhausted (the caller should collect and retry).
    pub fn try_allocate(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.align() <= 8);
        let layout = Layout::from_size_align(layout.size().max(8), 8).ok()?;
        if self.bytes_allocated + layout.size() > self.limit {
            return None;
        }
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)?;
        self.allocations
            .insert(ptr.as_ptr() as usize, Allocation { size: layout.size(), finalizer: None });
        self.bytes_allocated += layout.size();
        Some(ptr)
    }

    /// Whether `addr` lies inside any live allocation.
    pub fn contains(&self, addr: usize) -> bool {
        self.find_object(addr).is_some()
    }

    /// The start of the allocation containing `addr`, if any. Used to map
    /// interior pointers (bytecode addresses) back to their objects.
    pub fn find_object(&self, addr: usize) -> Option<*mut u8> {
        let (start, allocation) = self.allocations.range(..=addr).next_back()?;
        if addr < start + allocation.size {
            Some(*start as *mut u8)
        } else {
            None
        }
    }

    /// Run `finalizer` when `obj` becomes unreachable.
    pub fn register_finalizer(&mut self, obj: Value, finalizer: FinalizerFn) {
        debug_assert!(obj.is_ref());
        if let Some(allocation) = self.allocations.get_mut(&(obj.ref_bits() as usize)) {
            allocation.finalizer = Some(finalizer);
        }
    }

    /// Mark from `roots`, then sweep. References that do not point at the
    /// start of one of this heap's allocations (smis, markers, objects in
    /// other spaces) are ignored.
    pub fn collect(&mut self, roots: &mut dyn RootProvider) {
        let before = self.bytes_allocated;

        let mut worklist: Vec<*const u8> = Vec::new();
        {
            let allocations = &self.allocations;
            let mut visit = |value: &mut Value| {
                if !value.is_ref() {
                    return;
                }
                let addr = value.ref_bits() as usize;
                if !allocations.contains_key(&addr) {
                    return;
                }
                // SAFETY: addr is the start of a live allocation holding an
                // object header.
                let header = unsafe { &*(addr as *const Header) };
                if !header.has_flag(HeaderFlags::MARKED) {
                    header.add_flag(HeaderFlags::MARKED);
                    worklist.push(addr as *const u8);
                }
            };
            roots.visit_roots(&mut visit);
            while let Some(obj) = worklist.pop() {
                // Re-borrow per iteration so the closure above can be reused.
                let mut visit = |value: &mut Value| {
                    if !value.is_ref() {
                        return;
                    }
                    let addr = value.ref_bits() as usize;
                    if !allocations.contains_key(&addr) {
                        return;
                    }
                    // SAFETY: as above.
                    let header = unsafe { &*(addr as *const Header) };
                    if !header.has_flag(HeaderFlags::MARKED) {
                        header.add_flag(HeaderFlags::MARKED);
                        worklist.push(addr as *const u8);
                    }
                };
                // SAFETY: obj is a live, marked allocation of this heap.
                unsafe { (self.trace)(obj, &mut visit) };
            }
        }

        let mut dead: Vec<(usize, usize, Option<FinalizerFn>)> = Vec::new();
        for (start, allocation) in &self.allocations {
            // SAFETY: every allocation starts with a header.
            let header = unsafe { &*(*start as *const Header) };
            if header.has_flag(HeaderFlags::MARKED) {
                header.remove_flag(HeaderFlags::MARKED);
            } else {
                dead.push((*start, allocation.size, allocation.finalizer));
            }
        }
        for (start, size, finalizer) in dead {
            if let Some(finalizer) = finalizer {
                // SAFETY: the object is unreachable but its storage is
                // still intact.
                unsafe { finalizer(Value::from_ptr(start as *const u8)) };
            }
            self.allocations.remove(&start);
            // SAFETY: start/size were produced by try_allocate.
            unsafe { dealloc(start as *mut u8, Layout::from_size_align_unchecked(size, 8)) };
            self.bytes_allocated -= size;
        }

        tracing::debug!(
            target: "heap",
            before,
            after = self.bytes_allocated,
            "collection finished"
        );
    }

    /// Double the byte budget. Called when a collection did not free enough
    /// for the allocation that triggered it.
    pub fn grow_limit(&mut self, at_least: usize) {
        let wanted = (self.bytes_allocated + at_least).max(self.limit.saturating_mul(2));
        self.limit = wanted;
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        for (start, allocation) in std::mem::take(&mut self.allocations) {
            if let Some(finalizer) = allocation.finalizer {
                // SAFETY: teardown; the object's storage is still intact.
                unsafe { finalizer(Value::from_ptr(start as *const u8)) };
            }
            // SAFETY: start/size were produced by try_allocate.
            unsafe {
                dealloc(start as *mut u8, Layout::from_size_align_unchecked(allocation.size, 8))
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Boxed, ObjectType};

    // Minimal tracer for tests: Boxed cells are the only traced kind.
    unsafe fn trace_boxed(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
        let header = &*(obj as *const Header);
        if header.object_type() == ObjectType::Boxed {
            let boxed = &mut *(obj as *mut Boxed);
            visitor(&mut boxed.value);
        }
    }

    struct SliceRoots(Vec<Value>);

    impl RootProvider for SliceRoots {
        fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
            for value in self.0.iter_mut() {
                visitor(value);
            }
        }
    }

    fn new_boxed(heap: &mut Heap, value: Value) -> Value {
        let layout = Layout::from_size_align(size_of::<Boxed>(), 8).unwrap();
        let ptr = heap.try_allocate(layout).expect("allocation");
        let boxed = ptr.as_ptr() as *mut Boxed;
        unsafe {
            std::ptr::write(&mut (*boxed).header, Header::new(ObjectType::Boxed));
            (*boxed).value = value;
        }
        Value::from_ptr(boxed)
    }

    #[test]
    fn budget_refusal_then_grow() {
        let mut heap = Heap::new(32, trace_boxed);
        let first = new_boxed(&mut heap, Value::from_i64(1));
        assert!(first.is_ref());
        let layout = Layout::from_size_align(size_of::<Boxed>(), 8).unwrap();
        assert!(heap.try_allocate(layout).is_none());
        heap.grow_limit(layout.size());
        assert!(heap.try_allocate(layout).is_some());
    }

    #[test]
    fn collect_frees_unreachable_keeps_reachable() {
        let mut heap = Heap::new(1024, trace_boxed);
        let live = new_boxed(&mut heap, Value::from_i64(1));
        let dead = new_boxed(&mut heap, Value::from_i64(2));
        let used = heap.bytes_allocated();

        let mut roots = SliceRoots(vec![live]);
        heap.collect(&mut roots);

        assert!(heap.contains(live.ref_bits() as usize));
        assert!(!heap.contains(dead.ref_bits() as usize));
        assert!(heap.bytes_allocated() < used);
        // Survivors keep their bits: non-moving collector.
        let boxed: &Boxed = unsafe { live.as_ref() };
        assert_eq!(unsafe { boxed.value.to_i64() }, 1);
    }

    #[test]
    fn transitive_marking() {
        let mut heap = Heap::new(1024, trace_boxed);
        let inner = new_boxed(&mut heap, Value::from_i64(7));
        let outer = new_boxed(&mut heap, inner);

        let mut roots = SliceRoots(vec![outer]);
        heap.collect(&mut roots);

        assert!(heap.contains(inner.ref_bits() as usize));
        assert!(heap.contains(outer.ref_bits() as usize));
    }

    #[test]
    fn finalizer_runs_once_on_sweep() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static FINALIZED: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count(_obj: Value) {
            FINALIZED.fetch_add(1, Ordering::Relaxed);
        }

        let mut heap = Heap::new(1024, trace_boxed);
        let doomed = new_boxed(&mut heap, Value::from_i64(0));
        heap.register_finalizer(doomed, count);

        let mut roots = SliceRoots(vec![]);
        heap.collect(&mut roots);
        heap.collect(&mut roots);
        assert_eq!(FINALIZED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn find_object_maps_interior_pointers() {
        let mut heap = Heap::new(1024, trace_boxed);
        let boxed = new_boxed(&mut heap, Value::from_i64(0));
        let start = boxed.ref_bits() as usize;
        assert_eq!(heap.find_object(start + 8), Some(start as *mut u8));
        assert_eq!(heap.find_object(start + size_of::<Boxed>()), None);
    }
}

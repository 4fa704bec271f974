use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// A reference-counted message destination.
///
/// Ports live outside the collected heap: user code holds one through an
/// instance whose field 0 carries the raw address, and the scheduler holds
/// one through the engine's TargetYield surrender. The engine requires a
/// yielded port to already be locked by the native that returned it.
pub struct Port {
    ref_count: AtomicI32,
    locked: AtomicBool,
}

impl Port {
    /// Allocate a port with one reference, owned by the caller.
    pub fn new() -> *mut Port {
        Box::into_raw(Box::new(Port {
            ref_count: AtomicI32::new(1),
            locked: AtomicBool::new(false),
        }))
    }

    pub fn lock(&self) {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        debug_assert!(self.is_locked());
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn increment_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one reference; frees the port when the count reaches zero.
    ///
    /// # Safety
    ///
    /// `port` must come from [`Port::new`] and hold at least one reference.
    pub unsafe fn decrement_ref(port: *mut Port) {
        if (*port).ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            drop(Box::from_raw(port));
        }
    }
}

mod heap;

pub use heap::{FinalizerFn, Heap, RootProvider, TraceFn};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("jitmem supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod memory;

// allocator surface
pub use memory::code_alloc::{
    AllocError, CreateParams, JitAllocator, ResetPolicy, Statistics,
};

// errors
pub use memory::vm::VmError;

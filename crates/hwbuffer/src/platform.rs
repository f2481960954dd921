use crate::handle::{BufferDesc, BufferHandle, ExternalBuffer, SurfaceHandle, UsageFlags};

/// The allocator that owns buffer memory and its reference counts.
///
/// Implementations must make `acquire`/`release` atomic with respect to each
/// other: the same handle is routinely held by a producer and a consumer at
/// once. Status codes follow the platform convention of `0` for success.
pub trait BufferPlatform: Send + Sync {
    /// Resolves a runtime-side buffer object to its native handle without
    /// touching the reference count. `None` when the object is not recognised.
    fn import(&self, external: ExternalBuffer) -> Option<BufferHandle>;

    /// Wraps a native handle in a runtime-side object. The new object holds
    /// its own reference.
    fn export(&self, handle: BufferHandle) -> Option<ExternalBuffer>;

    fn acquire(&self, handle: BufferHandle);

    fn release(&self, handle: BufferHandle);

    fn describe(&self, handle: BufferHandle) -> Option<BufferDesc>;

    /// Maps the buffer for CPU access. A successful status with a null base
    /// address is possible and must be treated as a failure by callers.
    fn lock(&self, handle: BufferHandle, usage: UsageFlags) -> Result<*mut u8, i32>;

    fn unlock(&self, handle: BufferHandle) -> i32;

    /// Allocates a buffer holding one reference owned by the caller.
    fn allocate(&self, desc: &BufferDesc) -> Result<BufferHandle, i32>;

    fn acquire_surface(&self, surface: SurfaceHandle);

    fn release_surface(&self, surface: SurfaceHandle);
}

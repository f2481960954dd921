//! Safe sharing of GPU-importable buffer handles across a process/runtime
//! boundary.
//!
//! A compositor-side runtime holds [`ExternalBuffer`] tokens; the renderer side
//! works with [`BufferHandle`]s obtained through [`HandleRegistry::acquire`].
//! Every acquire is paired with exactly one release, and every buffer the
//! registry allocates leaves exactly one reference with the caller. The actual
//! allocator sits behind [`BufferPlatform`]: the NDK `AHardwareBuffer` API on
//! Android and the heap-backed [`HeapPlatform`] everywhere else.

mod error;
mod handle;
mod heap;
#[cfg(target_os = "android")]
mod ndk;
mod platform;
mod registry;

pub use error::BufferError;
pub use handle::{
    BufferDesc, BufferHandle, ExternalBuffer, PixelFormat, SurfaceHandle, UsageFlags,
    CPU_BYTES_PER_PIXEL,
};
pub use heap::HeapPlatform;
#[cfg(target_os = "android")]
pub use ndk::NdkPlatform;
pub use platform::BufferPlatform;
pub use registry::{BufferLease, HandleRegistry, MappedRegion};

/// The allocator this build talks to when nothing else is injected.
#[cfg(target_os = "android")]
pub type NativePlatform = NdkPlatform;

/// The allocator this build talks to when nothing else is injected.
#[cfg(not(target_os = "android"))]
pub type NativePlatform = HeapPlatform;

use std::ptr::NonNull;
use std::slice;

use tracing::{debug, warn};

use crate::error::BufferError;
use crate::handle::{BufferDesc, BufferHandle, ExternalBuffer, PixelFormat, SurfaceHandle, UsageFlags};
use crate::platform::BufferPlatform;

/// Brokers acquire/release/lock/unlock on buffers owned by a [`BufferPlatform`].
///
/// The registry keeps no table of its own; reference counts live in the
/// platform. What it adds is the contract: null checks, sentinel handling,
/// mapping size computation, and the guarantee that allocation never leaves
/// a reference of its own behind.
pub struct HandleRegistry<P> {
    platform: P,
}

/// CPU-visible view of a locked buffer.
#[derive(Debug)]
pub struct MappedRegion {
    handle: BufferHandle,
    base: NonNull<u8>,
    len: usize,
}

/// Scoped reference on a buffer, released when dropped.
pub struct BufferLease<'a, P: BufferPlatform> {
    registry: &'a HandleRegistry<P>,
    handle: BufferHandle,
}

impl<P: BufferPlatform> HandleRegistry<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Imports a runtime-side buffer object and takes a reference on it.
    pub fn acquire(&self, external: ExternalBuffer) -> Result<BufferHandle, BufferError> {
        if external.is_null() {
            return Err(BufferError::InvalidHandle);
        }
        let handle = self
            .platform
            .import(external)
            .filter(|handle| !handle.is_null())
            .ok_or(BufferError::InvalidHandle)?;
        self.platform.acquire(handle);
        debug!(?handle, "acquired native buffer");
        Ok(handle)
    }

    /// [`acquire`](Self::acquire) for boundary callers that only understand
    /// integers: failures are logged and collapse to [`BufferHandle::NULL`].
    pub fn acquire_or_null(&self, external: ExternalBuffer) -> BufferHandle {
        match self.acquire(external) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(?external, "{err}");
                BufferHandle::NULL
            }
        }
    }

    /// Drops one reference. Releasing the null sentinel does nothing.
    pub fn release(&self, handle: BufferHandle) {
        if handle.is_null() {
            return;
        }
        self.platform.release(handle);
        debug!(?handle, "released native buffer");
    }

    pub fn lease(&self, external: ExternalBuffer) -> Result<BufferLease<'_, P>, BufferError> {
        let handle = self.acquire(external)?;
        Ok(BufferLease {
            registry: self,
            handle,
        })
    }

    /// Takes over the reference an exported object already carries, without
    /// acquiring another one. Dropping the lease releases it.
    pub fn adopt(&self, external: ExternalBuffer) -> Result<BufferLease<'_, P>, BufferError> {
        if external.is_null() {
            return Err(BufferError::InvalidHandle);
        }
        let handle = self
            .platform
            .import(external)
            .filter(|handle| !handle.is_null())
            .ok_or(BufferError::InvalidHandle)?;
        Ok(BufferLease {
            registry: self,
            handle,
        })
    }

    pub fn describe(&self, handle: BufferHandle) -> Result<BufferDesc, BufferError> {
        if handle.is_null() {
            return Err(BufferError::InvalidHandle);
        }
        self.platform
            .describe(handle)
            .ok_or(BufferError::InvalidHandle)
    }

    /// Maps the buffer for CPU reads.
    ///
    /// At most one mapping may be outstanding per handle, and it must be
    /// unlocked before the last reference is released.
    pub fn lock(&self, handle: BufferHandle) -> Result<MappedRegion, BufferError> {
        let desc = self.describe(handle)?;
        let len = desc
            .mapped_len()
            .ok_or(BufferError::LockFailed { status: 0 })?;
        let base = self
            .platform
            .lock(handle, UsageFlags::CPU_READ_OFTEN)
            .map_err(|status| BufferError::LockFailed { status })?;
        let base = NonNull::new(base).ok_or(BufferError::LockFailed { status: 0 })?;
        let region = MappedRegion {
            handle,
            base,
            len,
        };
        debug!(?handle, len = region.len, "locked buffer for CPU read");
        Ok(region)
    }

    /// Ends a mapping obtained from [`lock`](Self::lock).
    pub fn unlock(&self, handle: BufferHandle) {
        if handle.is_null() {
            return;
        }
        let status = self.platform.unlock(handle);
        if status != 0 {
            debug!(?handle, status, "unlock reported non-success");
        }
    }

    /// Locks the buffer, hands its bytes to `f`, and unlocks on every exit path.
    pub fn with_mapped<R>(
        &self,
        handle: BufferHandle,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, BufferError> {
        struct Unlock<'a, P: BufferPlatform>(&'a HandleRegistry<P>, BufferHandle);

        impl<P: BufferPlatform> Drop for Unlock<'_, P> {
            fn drop(&mut self) {
                self.0.unlock(self.1);
            }
        }

        let region = self.lock(handle)?;
        let _unlock = Unlock(self, handle);
        // SAFETY: the mapping stays valid until `_unlock` drops after `f` returns.
        let bytes = unsafe { region.as_slice() };
        Ok(f(bytes))
    }

    /// Allocates a single-layer buffer and hands it to the caller's runtime.
    ///
    /// The platform reference created by the allocation is always dropped
    /// before returning; the returned object carries the only reference.
    pub fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: UsageFlags,
    ) -> Result<ExternalBuffer, BufferError> {
        let desc = BufferDesc::new(width, height, format, usage);
        let handle = self
            .platform
            .allocate(&desc)
            .map_err(|status| {
                warn!(width, height, status, "buffer allocation failed");
                BufferError::AllocationFailed { status }
            })?;
        if handle.is_null() {
            return Err(BufferError::AllocationFailed { status: 0 });
        }

        let allocation = BufferLease {
            registry: self,
            handle,
        };
        let external = self
            .platform
            .export(allocation.handle())
            .ok_or(BufferError::AllocationFailed { status: 0 })?;
        drop(allocation);

        debug!(width, height, ?external, "allocated buffer");
        Ok(external)
    }

    /// Takes a reference on a native window surface; null passes through.
    pub fn acquire_surface(&self, surface: SurfaceHandle) -> SurfaceHandle {
        if surface.is_null() {
            return SurfaceHandle::NULL;
        }
        self.platform.acquire_surface(surface);
        debug!(?surface, "acquired native surface");
        surface
    }

    pub fn release_surface(&self, surface: SurfaceHandle) {
        if surface.is_null() {
            return;
        }
        self.platform.release_surface(surface);
        debug!(?surface, "released native surface");
    }
}

impl MappedRegion {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The buffer must still be locked and must not be unlocked while the
    /// returned slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.base.as_ptr(), self.len)
    }
}

impl<P: BufferPlatform> BufferLease<'_, P> {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Gives up scoped ownership; the caller becomes responsible for releasing.
    pub fn into_raw(mut self) -> BufferHandle {
        std::mem::replace(&mut self.handle, BufferHandle::NULL)
    }
}

impl<P: BufferPlatform> Drop for BufferLease<'_, P> {
    fn drop(&mut self) {
        self.registry.release(self.handle);
    }
}

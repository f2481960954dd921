use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::handle::{BufferDesc, BufferHandle, ExternalBuffer, SurfaceHandle, UsageFlags};
use crate::platform::BufferPlatform;

const EINVAL: i32 = -22;
const EBUSY: i32 = -16;
const ENOMEM: i32 = -12;

/// Tokens advance in page-sized steps so they look and hash like addresses.
const TOKEN_STEP: usize = 0x1000;

struct HeapBuffer {
    desc: BufferDesc,
    refs: usize,
    storage: Box<[u8]>,
    locked: bool,
}

#[derive(Default)]
struct HeapState {
    buffers: HashMap<usize, HeapBuffer>,
    surfaces: HashMap<usize, usize>,
    bytes_in_use: usize,
}

/// Heap-backed stand-in for a hardware buffer allocator.
///
/// Buffers are plain byte arrays with a row stride equal to their width, and
/// external objects share the native token. An optional byte budget makes
/// allocation fail the way a device running out of graphics memory would.
pub struct HeapPlatform {
    state: Mutex<HeapState>,
    next_token: AtomicUsize,
    budget: Option<usize>,
}

impl Default for HeapPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState::default()),
            next_token: AtomicUsize::new(TOKEN_STEP),
            budget: None,
        }
    }

    pub fn with_budget(bytes: usize) -> Self {
        Self {
            budget: Some(bytes),
            ..Self::new()
        }
    }

    /// Outstanding references on a buffer; `0` once it has been freed.
    pub fn ref_count(&self, token: usize) -> usize {
        self.state()
            .buffers
            .get(&token)
            .map(|buffer| buffer.refs)
            .unwrap_or(0)
    }

    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.state().bytes_in_use
    }

    pub fn is_locked(&self, handle: BufferHandle) -> bool {
        self.state()
            .buffers
            .get(&handle.as_raw())
            .is_some_and(|buffer| buffer.locked)
    }

    /// Creates a window surface owned by the caller with a single reference.
    pub fn create_surface(&self) -> SurfaceHandle {
        let token = self.mint_token();
        self.state().surfaces.insert(token, 1);
        SurfaceHandle::from_raw(token)
    }

    pub fn surface_ref_count(&self, surface: SurfaceHandle) -> usize {
        self.state()
            .surfaces
            .get(&surface.as_raw())
            .copied()
            .unwrap_or(0)
    }

    fn mint_token(&self) -> usize {
        self.next_token.fetch_add(TOKEN_STEP, Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, HeapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferPlatform for HeapPlatform {
    fn import(&self, external: ExternalBuffer) -> Option<BufferHandle> {
        let token = external.as_raw();
        self.state()
            .buffers
            .contains_key(&token)
            .then_some(BufferHandle::from_raw(token))
    }

    fn export(&self, handle: BufferHandle) -> Option<ExternalBuffer> {
        let mut state = self.state();
        let buffer = state.buffers.get_mut(&handle.as_raw())?;
        buffer.refs += 1;
        Some(ExternalBuffer::from_raw(handle.as_raw()))
    }

    fn acquire(&self, handle: BufferHandle) {
        let mut state = self.state();
        match state.buffers.get_mut(&handle.as_raw()) {
            Some(buffer) => buffer.refs += 1,
            None => warn!(?handle, "acquire on a buffer that is no longer allocated"),
        }
    }

    fn release(&self, handle: BufferHandle) {
        let mut state = self.state();
        let token = handle.as_raw();
        let Some(buffer) = state.buffers.get_mut(&token) else {
            warn!(?handle, "release on a buffer that is no longer allocated");
            return;
        };
        buffer.refs -= 1;
        if buffer.refs == 0 {
            if buffer.locked {
                warn!(?handle, "last reference dropped while buffer is still mapped");
            }
            if let Some(freed) = state.buffers.remove(&token) {
                state.bytes_in_use -= freed.storage.len();
            }
            debug!(?handle, "freed heap buffer");
        }
    }

    fn describe(&self, handle: BufferHandle) -> Option<BufferDesc> {
        self.state()
            .buffers
            .get(&handle.as_raw())
            .map(|buffer| buffer.desc)
    }

    fn lock(&self, handle: BufferHandle, usage: UsageFlags) -> Result<*mut u8, i32> {
        let mut state = self.state();
        let buffer = state.buffers.get_mut(&handle.as_raw()).ok_or(EINVAL)?;
        if usage.allows_cpu_read() && !buffer.desc.usage.allows_cpu_read() {
            return Err(EINVAL);
        }
        if buffer.locked {
            return Err(EBUSY);
        }
        buffer.locked = true;
        Ok(buffer.storage.as_mut_ptr())
    }

    fn unlock(&self, handle: BufferHandle) -> i32 {
        let mut state = self.state();
        match state.buffers.get_mut(&handle.as_raw()) {
            Some(buffer) if buffer.locked => {
                buffer.locked = false;
                0
            }
            _ => EINVAL,
        }
    }

    fn allocate(&self, desc: &BufferDesc) -> Result<BufferHandle, i32> {
        if desc.width == 0 || desc.height == 0 || desc.layers != 1 {
            return Err(EINVAL);
        }
        let mut desc = *desc;
        desc.stride = desc.width;
        let len = desc
            .mapped_len()
            .and_then(|len| len.checked_mul(desc.layers as usize))
            .ok_or(EINVAL)?;

        let mut state = self.state();
        if let Some(budget) = self.budget {
            match state.bytes_in_use.checked_add(len) {
                Some(total) if total <= budget => {}
                _ => return Err(ENOMEM),
            }
        }

        let mut storage = Vec::new();
        if storage.try_reserve_exact(len).is_err() {
            warn!(len, "heap allocation refused");
            return Err(ENOMEM);
        }
        storage.resize(len, 0u8);

        let token = self.mint_token();
        state.buffers.insert(
            token,
            HeapBuffer {
                desc,
                refs: 1,
                storage: storage.into_boxed_slice(),
                locked: false,
            },
        );
        state.bytes_in_use += len;
        Ok(BufferHandle::from_raw(token))
    }

    fn acquire_surface(&self, surface: SurfaceHandle) {
        let mut state = self.state();
        match state.surfaces.get_mut(&surface.as_raw()) {
            Some(refs) => *refs += 1,
            None => warn!(?surface, "acquire on an unknown surface"),
        }
    }

    fn release_surface(&self, surface: SurfaceHandle) {
        let mut state = self.state();
        let token = surface.as_raw();
        let Some(refs) = state.surfaces.get_mut(&token) else {
            warn!(?surface, "release on an unknown surface");
            return;
        };
        *refs -= 1;
        if *refs == 0 {
            state.surfaces.remove(&token);
        }
    }
}

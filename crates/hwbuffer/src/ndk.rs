//! `AHardwareBuffer` / `ANativeWindow` bindings from `libandroid`.

use std::ffi::{c_int, c_void};
use std::ptr;

use crate::handle::{
    BufferDesc, BufferHandle, ExternalBuffer, PixelFormat, SurfaceHandle, UsageFlags,
};
use crate::platform::BufferPlatform;

#[repr(C)]
#[derive(Default)]
struct AHardwareBufferDesc {
    width: u32,
    height: u32,
    layers: u32,
    format: u32,
    usage: u64,
    stride: u32,
    rfu0: u32,
    rfu1: u64,
}

#[repr(C)]
struct AHardwareBuffer {
    _private: [u8; 0],
}

#[repr(C)]
struct ANativeWindow {
    _private: [u8; 0],
}

#[repr(C)]
#[allow(dead_code)]
struct ARect {
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
}

#[link(name = "android")]
extern "C" {
    fn AHardwareBuffer_allocate(
        desc: *const AHardwareBufferDesc,
        out_buffer: *mut *mut AHardwareBuffer,
    ) -> c_int;
    fn AHardwareBuffer_acquire(buffer: *mut AHardwareBuffer);
    fn AHardwareBuffer_release(buffer: *mut AHardwareBuffer);
    fn AHardwareBuffer_describe(buffer: *const AHardwareBuffer, out_desc: *mut AHardwareBufferDesc);
    fn AHardwareBuffer_lock(
        buffer: *mut AHardwareBuffer,
        usage: u64,
        fence: i32,
        rect: *const ARect,
        out_virtual_address: *mut *mut c_void,
    ) -> c_int;
    fn AHardwareBuffer_unlock(buffer: *mut AHardwareBuffer, fence: *mut i32) -> c_int;
    fn ANativeWindow_acquire(window: *mut ANativeWindow);
    fn ANativeWindow_release(window: *mut ANativeWindow);
}

/// The NDK hardware buffer allocator.
///
/// Runtime-side objects are the raw `AHardwareBuffer*` values handed over by
/// the embedding layer after it has unwrapped its own wrapper object.
#[derive(Debug, Default)]
pub struct NdkPlatform;

impl NdkPlatform {
    pub fn new() -> Self {
        Self
    }
}

fn raw_buffer(handle: BufferHandle) -> *mut AHardwareBuffer {
    handle.as_raw() as *mut AHardwareBuffer
}

impl BufferPlatform for NdkPlatform {
    fn import(&self, external: ExternalBuffer) -> Option<BufferHandle> {
        (!external.is_null()).then_some(BufferHandle::from_raw(external.as_raw()))
    }

    fn export(&self, handle: BufferHandle) -> Option<ExternalBuffer> {
        if handle.is_null() {
            return None;
        }
        // SAFETY: `handle` is a live buffer the caller holds a reference on.
        unsafe { AHardwareBuffer_acquire(raw_buffer(handle)) };
        Some(ExternalBuffer::from_raw(handle.as_raw()))
    }

    fn acquire(&self, handle: BufferHandle) {
        // SAFETY: the registry never passes a null handle.
        unsafe { AHardwareBuffer_acquire(raw_buffer(handle)) }
    }

    fn release(&self, handle: BufferHandle) {
        // SAFETY: the registry never passes a null handle.
        unsafe { AHardwareBuffer_release(raw_buffer(handle)) }
    }

    fn describe(&self, handle: BufferHandle) -> Option<BufferDesc> {
        if handle.is_null() {
            return None;
        }
        let mut raw = AHardwareBufferDesc::default();
        // SAFETY: `raw` is a valid out-pointer and `handle` is live.
        unsafe { AHardwareBuffer_describe(raw_buffer(handle), &mut raw) };
        Some(BufferDesc {
            width: raw.width,
            height: raw.height,
            layers: raw.layers,
            format: PixelFormat(raw.format),
            usage: UsageFlags::from_bits_retain(raw.usage),
            stride: raw.stride,
        })
    }

    fn lock(&self, handle: BufferHandle, usage: UsageFlags) -> Result<*mut u8, i32> {
        let mut address: *mut c_void = ptr::null_mut();
        // SAFETY: fence -1 means no fence; a null rect maps the whole buffer.
        let status = unsafe {
            AHardwareBuffer_lock(
                raw_buffer(handle),
                usage.bits(),
                -1,
                ptr::null(),
                &mut address,
            )
        };
        if status != 0 {
            return Err(status);
        }
        Ok(address.cast())
    }

    fn unlock(&self, handle: BufferHandle) -> i32 {
        // SAFETY: a null fence pointer asks the call to wait for completion.
        unsafe { AHardwareBuffer_unlock(raw_buffer(handle), ptr::null_mut()) }
    }

    fn allocate(&self, desc: &BufferDesc) -> Result<BufferHandle, i32> {
        let raw = AHardwareBufferDesc {
            width: desc.width,
            height: desc.height,
            layers: desc.layers,
            format: desc.format.0,
            usage: desc.usage.bits(),
            ..AHardwareBufferDesc::default()
        };
        let mut buffer: *mut AHardwareBuffer = ptr::null_mut();
        // SAFETY: both pointers are valid for the duration of the call.
        let status = unsafe { AHardwareBuffer_allocate(&raw, &mut buffer) };
        if status != 0 {
            return Err(status);
        }
        Ok(BufferHandle::from_raw(buffer as usize))
    }

    fn acquire_surface(&self, surface: SurfaceHandle) {
        // SAFETY: the registry never passes a null surface.
        unsafe { ANativeWindow_acquire(surface.as_raw() as *mut ANativeWindow) }
    }

    fn release_surface(&self, surface: SurfaceHandle) {
        // SAFETY: the registry never passes a null surface.
        unsafe { ANativeWindow_release(surface.as_raw() as *mut ANativeWindow) }
    }
}

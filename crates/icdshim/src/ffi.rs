//! Loader-facing `vk_icd*` exports for the cdylib build.

#![allow(non_snake_case)]

use std::env;
use std::ffi::{c_char, c_void, CStr};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, OnceLock};

use bridgeconfig::BridgeConfig;
use tracing::warn;

use crate::loader::DlopenLoader;
use crate::prewarm::LoadOrderSequencer;
use crate::resolver::{ProcAddressResolver, ResolverSettings};

/// Path of a `gpubridge.toml` to read instead of the built-in defaults.
pub const CONFIG_FILE_ENV: &str = "GPUBRIDGE_CONFIG";

const VK_SUCCESS: i32 = 0;
const VK_ERROR_INITIALIZATION_FAILED: i32 = -3;

static RESOLVER: OnceLock<ProcAddressResolver> = OnceLock::new();

fn shim_config() -> BridgeConfig {
    let Some(path) = env::var_os(CONFIG_FILE_ENV).map(PathBuf::from) else {
        return BridgeConfig::default();
    };
    match BridgeConfig::load_or_default(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring unreadable shim config");
            BridgeConfig::default()
        }
    }
}

fn resolver() -> &'static ProcAddressResolver {
    RESOLVER.get_or_init(|| {
        let config = shim_config();
        let loader = Arc::new(DlopenLoader);
        if config.prewarm.enabled {
            LoadOrderSequencer::new(loader.clone(), config.prewarm.probe_symbol.clone())
                .prewarm(&config.prewarm.candidates);
        }
        ProcAddressResolver::new(ResolverSettings::from_config(&config.icd), loader)
    })
}

/// # Safety
/// `version` must be null or point to a writable `u32`.
#[no_mangle]
pub unsafe extern "C" fn vk_icdNegotiateLoaderICDInterfaceVersion(version: *mut u32) -> i32 {
    if version.is_null() {
        return VK_ERROR_INITIALIZATION_FAILED;
    }
    let requested = unsafe { *version };
    unsafe { *version = resolver().negotiate_interface_version(requested) };
    VK_SUCCESS
}

/// # Safety
/// `name` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn vk_icdGetInstanceProcAddr(
    instance: *mut c_void,
    name: *const c_char,
) -> *const c_void {
    if name.is_null() {
        return ptr::null();
    }
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        return ptr::null();
    };
    resolver()
        .resolve_for_instance(instance, name)
        .map_or(ptr::null(), |addr| addr.as_ptr())
}

/// # Safety
/// Never dereferences its arguments.
#[no_mangle]
pub unsafe extern "C" fn vk_icdGetPhysicalDeviceProcAddr(
    instance: *mut c_void,
    name: *const c_char,
) -> *const c_void {
    if name.is_null() {
        return ptr::null();
    }
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    resolver()
        .physical_device_proc_addr(instance, &name)
        .map_or(ptr::null(), |addr| addr.as_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_clamps_through_export() {
        let mut version = 10u32;
        let status = unsafe { vk_icdNegotiateLoaderICDInterfaceVersion(&mut version) };
        assert_eq!(status, VK_SUCCESS);
        assert_eq!(version, 5);

        let status = unsafe { vk_icdNegotiateLoaderICDInterfaceVersion(ptr::null_mut()) };
        assert_eq!(status, VK_ERROR_INITIALIZATION_FAILED);
    }

    #[test]
    fn null_names_resolve_to_null() {
        unsafe {
            assert!(vk_icdGetInstanceProcAddr(ptr::null_mut(), ptr::null()).is_null());
            let name = b"vkCreateDevice\0".as_ptr() as *const c_char;
            assert!(vk_icdGetPhysicalDeviceProcAddr(ptr::null_mut(), name).is_null());
        }
    }
}

/// Highest loader/ICD interface version this shim implements.
pub const MAX_INTERFACE_VERSION: u32 = 5;

/// Packs a Vulkan API version the way `VK_MAKE_VERSION` does.
pub const fn make_api_version(major: u32, minor: u32, patch: u32) -> u32 {
    (major << 22) | (minor << 12) | patch
}

/// API ceiling advertised to the renderer when nothing else is configured.
pub const DEFAULT_MAX_API_VERSION: u32 = make_api_version(1, 3, 128);

/// Agrees on an interface version: never above `supported`, never raised.
pub fn negotiate_interface_version(requested: u32, supported: u32) -> u32 {
    requested.min(supported)
}

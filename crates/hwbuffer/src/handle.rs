use std::fmt;

use bitflags::bitflags;

/// Bytes per pixel assumed when sizing a CPU mapping, whatever the declared format.
pub const CPU_BYTES_PER_PIXEL: usize = 4;

macro_rules! opaque_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(usize);

        impl $name {
            pub const NULL: Self = Self(0);

            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> usize {
                self.0
            }

            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

opaque_token!(
    /// Native buffer reference held by this layer. Crosses the process
    /// boundary as an address-sized integer; `NULL` is the failure sentinel.
    BufferHandle
);

opaque_token!(
    /// Buffer object as owned by the caller's runtime (the compositor side).
    ExternalBuffer
);

opaque_token!(
    /// Native window surface reference.
    SurfaceHandle
);

/// Platform pixel layout tag. Values follow the `AHARDWAREBUFFER_FORMAT_*` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const R8G8B8A8_UNORM: Self = Self(1);
    pub const R8G8B8X8_UNORM: Self = Self(2);
    pub const R8G8B8_UNORM: Self = Self(3);
    pub const R5G6B5_UNORM: Self = Self(4);
}

bitflags! {
    /// Buffer usage bits, matching `AHARDWAREBUFFER_USAGE_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UsageFlags: u64 {
        const CPU_READ_RARELY = 2;
        const CPU_READ_OFTEN = 3;
        const CPU_WRITE_RARELY = 2 << 4;
        const CPU_WRITE_OFTEN = 3 << 4;
        const GPU_SAMPLED_IMAGE = 1 << 8;
        const GPU_COLOR_OUTPUT = 1 << 9;
    }
}

impl UsageFlags {
    pub fn allows_cpu_read(self) -> bool {
        self.intersects(Self::CPU_READ_OFTEN)
    }
}

/// Shape of a buffer as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: PixelFormat,
    pub usage: UsageFlags,
    /// Row stride in pixels; filled in by the platform on allocation.
    pub stride: u32,
}

impl BufferDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat, usage: UsageFlags) -> Self {
        Self {
            width,
            height,
            layers: 1,
            format,
            usage,
            stride: 0,
        }
    }

    /// Byte length of a CPU mapping of this buffer, `None` when it does not
    /// fit in `usize`.
    pub fn mapped_len(&self) -> Option<usize> {
        (self.stride as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(CPU_BYTES_PER_PIXEL)
    }
}

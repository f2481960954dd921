use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

use crate::error::IcdError;

/// Symbol visibility requested from the dynamic linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Symbols join the global namespace so later loads can bind against them.
    Global,
    Local,
}

impl LoadMode {
    fn dlopen_flags(self) -> libc::c_int {
        match self {
            LoadMode::Global => libc::RTLD_NOW | libc::RTLD_GLOBAL,
            LoadMode::Local => libc::RTLD_NOW | libc::RTLD_LOCAL,
        }
    }
}

/// Non-null address of an exported function.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProcAddr(NonNull<c_void>);

// Function addresses are immutable process-wide values.
unsafe impl Send for ProcAddr {}
unsafe impl Sync for ProcAddr {}

impl ProcAddr {
    pub fn from_ptr(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr as *mut c_void).map(Self)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for ProcAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcAddr({:p})", self.0)
    }
}

/// An opened module that can be asked for symbols.
pub trait SymbolSource: Send + Sync {
    fn lookup(&self, symbol: &str) -> Option<ProcAddr>;
}

/// Opens modules by path. Implemented over `dlopen` in production.
pub trait ModuleLoader: Send + Sync {
    fn open(&self, path: &Path, mode: LoadMode) -> Result<Box<dyn SymbolSource>, IcdError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DlopenLoader;

impl ModuleLoader for DlopenLoader {
    fn open(&self, path: &Path, mode: LoadMode) -> Result<Box<dyn SymbolSource>, IcdError> {
        DynamicLibrary::open(path, mode).map(|lib| Box::new(lib) as Box<dyn SymbolSource>)
    }
}

/// A `dlopen` handle. Closed on drop, so callers that must keep the module
/// resident leak it.
#[derive(Debug)]
pub struct DynamicLibrary {
    handle: NonNull<c_void>,
}

// dlsym on a live handle is thread-safe.
unsafe impl Send for DynamicLibrary {}
unsafe impl Sync for DynamicLibrary {}

impl DynamicLibrary {
    /// A bare file name goes through the linker's search path; anything with
    /// a separator is opened as given.
    pub fn open(path: &Path, mode: LoadMode) -> Result<Self, IcdError> {
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| IcdError::Load {
            path: path.to_path_buf(),
            reason: "path contains an interior NUL byte".to_string(),
        })?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), mode.dlopen_flags()) };
        match NonNull::new(handle) {
            Some(handle) => Ok(Self { handle }),
            None => Err(IcdError::Load {
                path: path.to_path_buf(),
                reason: last_dl_error(),
            }),
        }
    }

    pub fn symbol(&self, symbol: &str) -> Result<ProcAddr, IcdError> {
        let c_symbol =
            CString::new(symbol).map_err(|_| IcdError::InvalidName(symbol.to_string()))?;
        let ptr = unsafe { libc::dlsym(self.handle.as_ptr(), c_symbol.as_ptr()) };
        ProcAddr::from_ptr(ptr).ok_or_else(|| IcdError::MissingSymbol {
            symbol: symbol.to_string(),
        })
    }
}

impl SymbolSource for DynamicLibrary {
    fn lookup(&self, symbol: &str) -> Option<ProcAddr> {
        self.symbol(symbol).ok()
    }
}

impl Drop for DynamicLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dynamic linker error".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }
            .to_string_lossy()
            .into_owned()
    }
}

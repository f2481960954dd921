//! Bridges the generic Vulkan ICD loader protocol to a vendor rendering
//! module that only understands its own symbol conventions.
//!
//! Two pieces cooperate:
//! - [`LoadOrderSequencer`] loads a fragile guest thunk early, with global
//!   symbol visibility, and pins it for the life of the process.
//! - [`ProcAddressResolver`] lazily loads the vendor module, runs its one-time
//!   connection setup, and maps standard entry-point names to vendor symbols.
//!
//! Both reach the dynamic linker through [`ModuleLoader`], so tests swap in a
//! fake symbol table.

mod error;
#[cfg(feature = "icd-exports")]
mod ffi;
mod loader;
mod naming;
mod prewarm;
mod resolver;
mod version;

#[cfg(test)]
mod fake;

pub use error::IcdError;
pub use loader::{DlopenLoader, DynamicLibrary, LoadMode, ModuleLoader, ProcAddr, SymbolSource};
pub use naming::{is_traced_name, vendor_symbol_name};
pub use prewarm::{LoadOrderSequencer, PrewarmOutcome};
pub use resolver::{ChannelState, ProcAddressResolver, ResolveMode, ResolverSettings};
pub use version::{
    make_api_version, negotiate_interface_version, DEFAULT_MAX_API_VERSION,
    MAX_INTERFACE_VERSION,
};

//! In-memory module table standing in for the dynamic linker.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::IcdError;
use crate::loader::{LoadMode, ModuleLoader, ProcAddr, SymbolSource};

#[derive(Default)]
pub struct FakeLoader {
    modules: HashMap<PathBuf, HashMap<String, usize>>,
    opens: Mutex<Vec<(PathBuf, LoadMode)>>,
    lookups: Arc<AtomicUsize>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a loadable module exporting `symbols`.
    pub fn with_module(mut self, path: impl Into<PathBuf>, symbols: &[(&str, *const c_void)]) -> Self {
        let table = symbols
            .iter()
            .map(|(name, ptr)| (name.to_string(), *ptr as usize))
            .collect();
        self.modules.insert(path.into(), table);
        self
    }

    /// Every open attempt, successful or not, in order.
    pub fn opens(&self) -> Vec<(PathBuf, LoadMode)> {
        self.opens.lock().unwrap().clone()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for FakeLoader {
    fn open(&self, path: &Path, mode: LoadMode) -> Result<Box<dyn SymbolSource>, IcdError> {
        self.opens.lock().unwrap().push((path.to_path_buf(), mode));
        match self.modules.get(path) {
            Some(symbols) => Ok(Box::new(FakeModule {
                symbols: symbols.clone(),
                lookups: Arc::clone(&self.lookups),
            })),
            None => Err(IcdError::Load {
                path: path.to_path_buf(),
                reason: "no such module".to_string(),
            }),
        }
    }
}

struct FakeModule {
    symbols: HashMap<String, usize>,
    lookups: Arc<AtomicUsize>,
}

impl SymbolSource for FakeModule {
    fn lookup(&self, symbol: &str) -> Option<ProcAddr> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.symbols
            .get(symbol)
            .and_then(|addr| ProcAddr::from_ptr(*addr as *const c_void))
    }
}

/// A stable, non-null address for symbols that are never called.
pub fn marker(tag: &'static u8) -> *const c_void {
    tag as *const u8 as *const c_void
}

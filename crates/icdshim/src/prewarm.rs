use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tracing::{debug, info, warn};

use crate::error::IcdError;
use crate::loader::{LoadMode, ModuleLoader, ProcAddr, SymbolSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrewarmOutcome {
    /// The module is resident and pinned. `probe` is `None` when the sanity
    /// symbol was missing; the module stays loaded either way.
    Loaded {
        path: PathBuf,
        probe: Option<ProcAddr>,
    },
    /// Every candidate failed. The process carries on without it.
    Unavailable { attempts: Vec<IcdError> },
}

impl PrewarmOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PrewarmOutcome::Loaded { .. })
    }

    pub fn loaded_path(&self) -> Option<&Path> {
        match self {
            PrewarmOutcome::Loaded { path, .. } => Some(path),
            PrewarmOutcome::Unavailable { .. } => None,
        }
    }
}

/// Loads a fragile guest component before anything else in the process does.
///
/// The first `prewarm` call does the work. Later calls return the same
/// outcome without touching the loader again.
pub struct LoadOrderSequencer {
    loader: Arc<dyn ModuleLoader>,
    probe_symbol: String,
    outcome: OnceLock<PrewarmOutcome>,
}

impl LoadOrderSequencer {
    pub fn new(loader: Arc<dyn ModuleLoader>, probe_symbol: impl Into<String>) -> Self {
        Self {
            loader,
            probe_symbol: probe_symbol.into(),
            outcome: OnceLock::new(),
        }
    }

    pub fn probe_symbol(&self) -> &str {
        &self.probe_symbol
    }

    /// Outcome of the earlier `prewarm`, if one ran.
    pub fn outcome(&self) -> Option<&PrewarmOutcome> {
        self.outcome.get()
    }

    pub fn prewarm(&self, candidates: &[PathBuf]) -> &PrewarmOutcome {
        self.outcome.get_or_init(|| self.load_first(candidates))
    }

    fn load_first(&self, candidates: &[PathBuf]) -> PrewarmOutcome {
        let mut attempts = Vec::with_capacity(candidates.len());

        for path in candidates {
            match self.loader.open(path, LoadMode::Global) {
                Ok(module) => {
                    let probe = module.lookup(&self.probe_symbol);
                    match probe {
                        Some(addr) => info!(
                            path = %path.display(),
                            symbol = %self.probe_symbol,
                            ?addr,
                            "prewarmed guest module"
                        ),
                        None => warn!(
                            path = %path.display(),
                            symbol = %self.probe_symbol,
                            "prewarmed guest module lacks probe symbol"
                        ),
                    }
                    pin(module);
                    return PrewarmOutcome::Loaded {
                        path: path.clone(),
                        probe,
                    };
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "prewarm candidate failed");
                    attempts.push(err);
                }
            }
        }

        warn!(
            candidates = candidates.len(),
            "no prewarm candidate could be loaded; continuing without it"
        );
        PrewarmOutcome::Unavailable { attempts }
    }
}

/// Keeps a module resident until the process exits.
fn pin(module: Box<dyn SymbolSource>) {
    Box::leak(module);
}

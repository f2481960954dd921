use std::env;
use std::ffi::{c_char, c_void, CString};
use std::mem;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use bridgeconfig::{IcdMode, IcdSettings};
use tracing::{debug, info, warn};

use crate::loader::{LoadMode, ModuleLoader, ProcAddr, SymbolSource};
use crate::naming::{is_traced_name, vendor_symbol_name};
use crate::version::{negotiate_interface_version, MAX_INTERFACE_VERSION};

type InitFn = unsafe extern "C" fn();
type ForwardFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *const c_void;

/// How standard names map onto the vendor module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveMode {
    /// Look up `prefix + name` directly.
    Prefixed { prefix: String },
    /// Ask the module's own `GetInstanceProcAddr`-shaped entry point.
    Forwarding { entry_point: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    /// Bare file name, tried through the linker's default search first.
    pub library: String,
    /// Variable naming a directory to retry `library` from.
    pub library_dir_env: Option<String>,
    /// Absolute paths tried last, in order.
    pub fallback_paths: Vec<PathBuf>,
    /// One-time connection setup exported by the module.
    pub init_symbol: Option<String>,
    pub mode: ResolveMode,
    pub max_interface_version: u32,
}

impl ResolverSettings {
    pub fn prefixed(library: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            library_dir_env: None,
            fallback_paths: Vec::new(),
            init_symbol: None,
            mode: ResolveMode::Prefixed {
                prefix: prefix.into(),
            },
            max_interface_version: MAX_INTERFACE_VERSION,
        }
    }

    pub fn forwarding(library: impl Into<String>, entry_point: impl Into<String>) -> Self {
        Self {
            mode: ResolveMode::Forwarding {
                entry_point: entry_point.into(),
            },
            ..Self::prefixed(library, "")
        }
    }

    /// Builds settings from the `[icd]` config table. The init symbol only
    /// applies to prefixed modules.
    pub fn from_config(icd: &IcdSettings) -> Self {
        let (mode, init_symbol) = match icd.mode {
            IcdMode::Prefixed => (
                ResolveMode::Prefixed {
                    prefix: icd.symbol_prefix.clone(),
                },
                icd.init_symbol.clone(),
            ),
            IcdMode::Forwarding => (
                ResolveMode::Forwarding {
                    entry_point: icd.forward_entry_point.clone(),
                },
                None,
            ),
        };
        Self {
            library: icd.library.clone(),
            library_dir_env: icd.library_dir_env.clone(),
            fallback_paths: icd.fallback_paths.clone(),
            init_symbol,
            mode,
            max_interface_version: icd.max_interface_version.min(MAX_INTERFACE_VERSION),
        }
    }

    /// Paths in the order they will be tried.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(&self.library)];
        if let Some(var) = &self.library_dir_env {
            match env::var_os(var) {
                Some(dir) if !dir.is_empty() => {
                    candidates.push(PathBuf::from(dir).join(&self.library))
                }
                _ => {}
            }
        }
        candidates.extend(self.fallback_paths.iter().cloned());
        candidates
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Unloaded = 0,
    LoadedUninitialized = 1,
    Initialized = 2,
    Failed = 3,
}

impl ChannelState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ChannelState::LoadedUninitialized,
            2 => ChannelState::Initialized,
            3 => ChannelState::Failed,
            _ => ChannelState::Unloaded,
        }
    }
}

struct Channel {
    path: Option<PathBuf>,
    module: Option<&'static dyn SymbolSource>,
    forward: Option<ForwardFn>,
}

impl Channel {
    fn failed(path: Option<PathBuf>) -> Self {
        Self {
            path,
            module: None,
            forward: None,
        }
    }

    fn is_ready(&self) -> bool {
        self.module.is_some()
    }
}

/// Resolves standard entry-point names against a lazily loaded vendor module.
///
/// The first resolution loads the module and runs its setup entry point.
/// Concurrent first callers block until that finishes and all observe the
/// same terminal state. A failure is permanent: every later lookup is `None`.
pub struct ProcAddressResolver {
    settings: ResolverSettings,
    loader: Arc<dyn ModuleLoader>,
    state: AtomicU8,
    channel: OnceLock<Channel>,
}

impl ProcAddressResolver {
    pub fn new(settings: ResolverSettings, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            settings,
            loader,
            state: AtomicU8::new(ChannelState::Unloaded as u8),
            channel: OnceLock::new(),
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Module the channel was opened from, once loading has been attempted.
    pub fn loaded_path(&self) -> Option<&std::path::Path> {
        self.channel.get().and_then(|channel| channel.path.as_deref())
    }

    pub fn negotiate_interface_version(&self, requested: u32) -> u32 {
        let agreed = negotiate_interface_version(requested, self.settings.max_interface_version);
        debug!(requested, agreed, "negotiated loader interface version");
        agreed
    }

    /// Loads and initializes the module if that has not happened yet.
    pub fn ensure_initialized(&self) -> ChannelState {
        self.channel();
        self.state()
    }

    pub fn resolve(&self, name: &str) -> Option<ProcAddr> {
        self.resolve_for_instance(std::ptr::null_mut(), name)
    }

    /// Like [`resolve`](Self::resolve), passing `instance` through in
    /// forwarding mode. Prefixed lookups ignore it.
    pub fn resolve_for_instance(&self, instance: *mut c_void, name: &str) -> Option<ProcAddr> {
        if name.is_empty() {
            return None;
        }
        let channel = self.channel();
        let module = channel.module?;

        let (symbol, addr) = match (&self.settings.mode, channel.forward) {
            (ResolveMode::Forwarding { .. }, Some(forward)) => {
                let c_name = CString::new(name).ok()?;
                let ptr = unsafe { forward(instance, c_name.as_ptr()) };
                (name.to_string(), ProcAddr::from_ptr(ptr))
            }
            (ResolveMode::Prefixed { prefix }, _) => {
                let symbol = vendor_symbol_name(prefix, name);
                let addr = module.lookup(&symbol);
                (symbol, addr)
            }
            (ResolveMode::Forwarding { .. }, None) => return None,
        };

        if is_traced_name(name) {
            debug!(name, %symbol, ?addr, "resolved entry point");
        }
        addr
    }

    /// Physical-device level lookups are not exposed through this shim.
    pub fn physical_device_proc_addr(&self, _instance: *mut c_void, _name: &str) -> Option<ProcAddr> {
        None
    }

    fn channel(&self) -> &Channel {
        self.channel.get_or_init(|| self.open_channel())
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn open_channel(&self) -> Channel {
        let Some((path, module)) = self.load_module() else {
            warn!(library = %self.settings.library, "vendor module unavailable; rendering channel disabled");
            self.set_state(ChannelState::Failed);
            return Channel::failed(None);
        };
        // Returned addresses must stay valid for the life of the process.
        let module: &'static dyn SymbolSource = Box::leak(module);
        self.set_state(ChannelState::LoadedUninitialized);

        if let Some(init_symbol) = &self.settings.init_symbol {
            let Some(init) = module.lookup(init_symbol) else {
                warn!(
                    path = %path.display(),
                    symbol = %init_symbol,
                    "vendor module has no init entry point; rendering channel disabled"
                );
                self.set_state(ChannelState::Failed);
                return Channel::failed(Some(path));
            };
            let init: InitFn = unsafe { mem::transmute::<*const c_void, InitFn>(init.as_ptr()) };
            unsafe { init() };
            debug!(symbol = %init_symbol, "vendor module initialized");
        }

        let forward = match &self.settings.mode {
            ResolveMode::Prefixed { .. } => None,
            ResolveMode::Forwarding { entry_point } => match module.lookup(entry_point) {
                Some(addr) => {
                    Some(unsafe { mem::transmute::<*const c_void, ForwardFn>(addr.as_ptr()) })
                }
                None => {
                    warn!(
                        path = %path.display(),
                        symbol = %entry_point,
                        "vendor module has no forwarding entry point; rendering channel disabled"
                    );
                    self.set_state(ChannelState::Failed);
                    return Channel::failed(Some(path));
                }
            },
        };

        info!(path = %path.display(), "rendering channel ready");
        self.set_state(ChannelState::Initialized);
        Channel {
            path: Some(path),
            module: Some(module),
            forward,
        }
    }

    fn load_module(&self) -> Option<(PathBuf, Box<dyn SymbolSource>)> {
        for path in self.settings.candidates() {
            match self.loader.open(&path, LoadMode::Local) {
                Ok(module) => {
                    debug!(path = %path.display(), "loaded vendor module");
                    return Some((path, module));
                }
                Err(err) => debug!(error = %err, "vendor module candidate failed"),
            }
        }
        None
    }
}

impl std::fmt::Debug for ProcAddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcAddressResolver")
            .field("settings", &self.settings)
            .field("state", &self.state())
            .field("ready", &self.channel.get().map(Channel::is_ready))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{marker, FakeLoader};
    use std::ffi::CStr;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    static CREATE_INSTANCE: u8 = 0;
    static FORWARDED: u8 = 0;

    static CONCURRENT_INITS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn concurrent_init() {
        CONCURRENT_INITS.fetch_add(1, Ordering::SeqCst);
        thread::sleep(std::time::Duration::from_millis(20));
    }

    static ONCE_INITS: AtomicUsize = AtomicUsize::new(0);
    extern "C" fn once_init() {
        ONCE_INITS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn forward_init() {}

    unsafe extern "C" fn fake_forward(instance: *mut c_void, name: *const c_char) -> *const c_void {
        match unsafe { CStr::from_ptr(name) }.to_bytes() {
            b"vkCreateInstance" => &FORWARDED as *const u8 as *const c_void,
            b"vkInstanceEcho" => instance as *const c_void,
            _ => std::ptr::null(),
        }
    }

    fn init_ptr(f: extern "C" fn()) -> *const c_void {
        f as *const c_void
    }

    fn vendor_loader(path: &str, init: extern "C" fn()) -> FakeLoader {
        FakeLoader::new().with_module(
            path,
            &[
                ("vortekInitOnce", init_ptr(init)),
                ("vt_call_vkCreateInstance", marker(&CREATE_INSTANCE)),
            ],
        )
    }

    fn prefixed_settings() -> ResolverSettings {
        ResolverSettings {
            init_symbol: Some("vortekInitOnce".to_string()),
            ..ResolverSettings::prefixed("libvulkan_vortek.so", "vt_call_")
        }
    }

    #[test]
    fn concurrent_first_use_initializes_once() {
        let loader = Arc::new(vendor_loader("libvulkan_vortek.so", concurrent_init));
        let resolver = Arc::new(ProcAddressResolver::new(prefixed_settings(), loader.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    resolver
                        .resolve("vkCreateInstance")
                        .map(|addr| addr.as_ptr() as usize)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(marker(&CREATE_INSTANCE) as usize));
        }
        assert_eq!(CONCURRENT_INITS.load(Ordering::SeqCst), 1);
        assert_eq!(loader.opens().len(), 1);
        assert_eq!(resolver.state(), ChannelState::Initialized);
    }

    #[test]
    fn prefixed_lookup_does_not_cache() {
        let loader = Arc::new(vendor_loader("libvulkan_vortek.so", once_init));
        let resolver = ProcAddressResolver::new(prefixed_settings(), loader.clone());
        assert_eq!(resolver.state(), ChannelState::Unloaded);

        assert!(resolver.resolve("vkCreateInstance").is_some());
        assert!(resolver.resolve("vkCreateInstance").is_some());
        assert!(resolver.resolve("vkCmdDraw").is_none());

        // Init symbol plus three name lookups.
        assert_eq!(loader.lookups(), 4);
        assert_eq!(ONCE_INITS.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.loaded_path(), Some(Path::new("libvulkan_vortek.so")));
    }

    #[test]
    fn empty_name_resolves_to_nothing() {
        let loader = Arc::new(vendor_loader("libvulkan_vortek.so", forward_init));
        let resolver = ProcAddressResolver::new(prefixed_settings(), loader);
        assert!(resolver.resolve("").is_none());
        assert!(resolver.resolve("vk\0CreateInstance").is_none());
    }

    #[test]
    fn falls_back_to_override_directory() {
        let var = "ICDSHIM_TEST_VENDOR_DIR_FALLBACK";
        env::set_var(var, "/opt/vendor/lib");
        let loader = Arc::new(vendor_loader("/opt/vendor/lib/libvulkan_vortek.so", forward_init));
        let settings = ResolverSettings {
            library_dir_env: Some(var.to_string()),
            ..prefixed_settings()
        };
        let resolver = ProcAddressResolver::new(settings, loader.clone());

        assert!(resolver.resolve("vkCreateInstance").is_some());
        assert_eq!(
            loader.opens(),
            vec![
                (PathBuf::from("libvulkan_vortek.so"), LoadMode::Local),
                (PathBuf::from("/opt/vendor/lib/libvulkan_vortek.so"), LoadMode::Local),
            ]
        );
        env::remove_var(var);
    }

    #[test]
    fn candidate_order_skips_unset_or_empty_override() {
        let var = "ICDSHIM_TEST_VENDOR_DIR_EMPTY";
        env::set_var(var, "");
        let settings = ResolverSettings {
            library_dir_env: Some(var.to_string()),
            fallback_paths: vec![PathBuf::from("/vendor/lib64/libvulkan_vortek.so")],
            ..prefixed_settings()
        };
        assert_eq!(
            settings.candidates(),
            vec![
                PathBuf::from("libvulkan_vortek.so"),
                PathBuf::from("/vendor/lib64/libvulkan_vortek.so"),
            ]
        );
        env::remove_var(var);
    }

    #[test]
    fn missing_module_always_returns_null() {
        let loader = Arc::new(FakeLoader::new());
        let resolver = ProcAddressResolver::new(prefixed_settings(), loader.clone());

        assert!(resolver.resolve("vkCreateInstance").is_none());
        assert!(resolver.resolve("vkCreateInstance").is_none());
        assert_eq!(resolver.state(), ChannelState::Failed);
        assert_eq!(loader.opens().len(), 1);
        assert!(resolver.loaded_path().is_none());
    }

    #[test]
    fn concurrent_first_use_of_missing_module_fails_once() {
        let loader = Arc::new(FakeLoader::new());
        let resolver = Arc::new(ProcAddressResolver::new(prefixed_settings(), loader.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resolver = Arc::clone(&resolver);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    resolver
                        .resolve("vkCreateInstance")
                        .map(|addr| addr.as_ptr() as usize)
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), None);
        }
        assert_eq!(loader.opens().len(), 1);
        assert_eq!(resolver.state(), ChannelState::Failed);
    }

    #[test]
    fn missing_init_entry_point_fails_channel() {
        let loader = Arc::new(FakeLoader::new().with_module(
            "libvulkan_vortek.so",
            &[("vt_call_vkCreateInstance", marker(&CREATE_INSTANCE))],
        ));
        let resolver = ProcAddressResolver::new(prefixed_settings(), loader);

        assert_eq!(resolver.ensure_initialized(), ChannelState::Failed);
        assert!(resolver.resolve("vkCreateInstance").is_none());
        assert_eq!(resolver.loaded_path(), Some(Path::new("libvulkan_vortek.so")));
    }

    #[test]
    fn forwarding_mode_delegates_to_entry_point() {
        let loader = Arc::new(FakeLoader::new().with_module(
            "libvulkan-host.so",
            &[("vkGetInstanceProcAddr", fake_forward as *const c_void)],
        ));
        let resolver = ProcAddressResolver::new(
            ResolverSettings::forwarding("libvulkan-host.so", "vkGetInstanceProcAddr"),
            loader,
        );

        assert_eq!(
            resolver.resolve("vkCreateInstance").map(ProcAddr::as_ptr),
            Some(&FORWARDED as *const u8 as *const c_void)
        );
        assert!(resolver.resolve("vkCmdDraw").is_none());

        let instance = 0x5000 as *mut c_void;
        assert_eq!(
            resolver
                .resolve_for_instance(instance, "vkInstanceEcho")
                .map(ProcAddr::as_ptr),
            Some(instance as *const c_void)
        );
    }

    #[test]
    fn forwarding_without_entry_point_fails_channel() {
        let loader = Arc::new(FakeLoader::new().with_module("libvulkan-host.so", &[]));
        let resolver = ProcAddressResolver::new(
            ResolverSettings::forwarding("libvulkan-host.so", "vkGetInstanceProcAddr"),
            loader,
        );
        assert!(resolver.resolve("vkCreateInstance").is_none());
        assert_eq!(resolver.state(), ChannelState::Failed);
    }

    #[test]
    fn settings_follow_config_mode() {
        let icd = IcdSettings::default();
        let settings = ResolverSettings::from_config(&icd);
        assert_eq!(settings, prefixed_settings_with_env());

        let forwarding = IcdSettings {
            mode: IcdMode::Forwarding,
            max_interface_version: 9,
            ..IcdSettings::default()
        };
        let settings = ResolverSettings::from_config(&forwarding);
        assert_eq!(
            settings.mode,
            ResolveMode::Forwarding {
                entry_point: "vkGetInstanceProcAddr".to_string()
            }
        );
        assert_eq!(settings.init_symbol, None);
        assert_eq!(settings.max_interface_version, 5);
    }

    fn prefixed_settings_with_env() -> ResolverSettings {
        ResolverSettings {
            library_dir_env: Some("FEX_VORTEK_NATIVELIB".to_string()),
            ..prefixed_settings()
        }
    }

    #[test]
    fn negotiation_and_physical_device_lookups() {
        let resolver = ProcAddressResolver::new(prefixed_settings(), Arc::new(FakeLoader::new()));
        assert_eq!(resolver.negotiate_interface_version(10), 5);
        assert_eq!(resolver.negotiate_interface_version(2), 2);
        assert!(resolver
            .physical_device_proc_addr(std::ptr::null_mut(), "vkCreateDevice")
            .is_none());
        assert_eq!(resolver.state(), ChannelState::Unloaded);
    }
}

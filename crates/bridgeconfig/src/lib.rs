use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Longest filesystem path a `sockaddr_un` can carry, excluding the trailing NUL.
pub const MAX_SOCKET_PATH_LEN: usize = 107;

pub const DEFAULT_SOCKET_PATH: &str = "/tmp/.vortek/V0";
pub const DEFAULT_BACKLOG: u32 = 5;
/// Largest listen backlog the kernel accepts (`SOMAXCONN` on Linux).
pub const MAX_BACKLOG: u32 = 4096;
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_VENDOR_LIBRARY: &str = "libvulkan_vortek.so";
pub const DEFAULT_LIBRARY_DIR_ENV: &str = "FEX_VORTEK_NATIVELIB";
pub const DEFAULT_SYMBOL_PREFIX: &str = "vt_call_";
pub const DEFAULT_INIT_SYMBOL: &str = "vortekInitOnce";
pub const DEFAULT_FORWARD_ENTRY_POINT: &str = "vkGetInstanceProcAddr";
pub const DEFAULT_MAX_INTERFACE_VERSION: u32 = 5;

pub const DEFAULT_PREWARM_CANDIDATE: &str = "/opt/fex/share/fex-emu/GuestThunks/libvulkan-guest.so";
pub const DEFAULT_PROBE_SYMBOL: &str = "vkGetInstanceProcAddr";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    pub version: u32,
    #[serde(default)]
    pub socket: SocketSettings,
    #[serde(default)]
    pub icd: IcdSettings,
    #[serde(default)]
    pub prewarm: PrewarmSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketSettings {
    pub path: PathBuf,
    pub backlog: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub accept_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IcdMode {
    /// Look up `<prefix><name>` in the vendor module.
    Prefixed,
    /// Hand every lookup to the vendor module's own `GetInstanceProcAddr`.
    Forwarding,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IcdSettings {
    pub mode: IcdMode,
    pub library: String,
    pub library_dir_env: Option<String>,
    pub fallback_paths: Vec<PathBuf>,
    pub symbol_prefix: String,
    pub init_symbol: Option<String>,
    pub forward_entry_point: String,
    pub max_interface_version: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PrewarmSettings {
    pub enabled: bool,
    pub candidates: Vec<PathBuf>,
    pub probe_symbol: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            version: 1,
            socket: SocketSettings::default(),
            icd: IcdSettings::default(),
            prewarm: PrewarmSettings::default(),
        }
    }
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
            backlog: DEFAULT_BACKLOG,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        }
    }
}

impl Default for IcdSettings {
    fn default() -> Self {
        Self {
            mode: IcdMode::Prefixed,
            library: DEFAULT_VENDOR_LIBRARY.to_string(),
            library_dir_env: Some(DEFAULT_LIBRARY_DIR_ENV.to_string()),
            fallback_paths: Vec::new(),
            symbol_prefix: DEFAULT_SYMBOL_PREFIX.to_string(),
            init_symbol: Some(DEFAULT_INIT_SYMBOL.to_string()),
            forward_entry_point: DEFAULT_FORWARD_ENTRY_POINT.to_string(),
            max_interface_version: DEFAULT_MAX_INTERFACE_VERSION,
        }
    }
}

impl Default for PrewarmSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            candidates: vec![PathBuf::from(DEFAULT_PREWARM_CANDIDATE)],
            probe_symbol: DEFAULT_PROBE_SYMBOL.to_string(),
        }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Duration::try_from_secs_f64(v)
                .map_err(|err| E::custom(format!("invalid duration {v}: {err}")))
        }
    }

    deserializer.deserialize_any(Visitor)
}

fn serialize_duration<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

impl BridgeConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: BridgeConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Reads `path`, falling back to the defaults when no file exists there.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        self.socket.validate()?;
        self.icd.validate()?;
        self.prewarm.validate()?;
        Ok(())
    }
}

impl SocketSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        let path_len = self.path.as_os_str().len();
        if path_len == 0 {
            return Err(ConfigError::Invalid("socket.path must not be empty".into()));
        }
        if path_len > MAX_SOCKET_PATH_LEN {
            return Err(ConfigError::Invalid(format!(
                "socket.path is {path_len} bytes; local sockets allow at most {MAX_SOCKET_PATH_LEN}"
            )));
        }
        if self.backlog == 0 {
            return Err(ConfigError::Invalid(
                "socket.backlog must be at least 1".into(),
            ));
        }
        if self.backlog > MAX_BACKLOG {
            return Err(ConfigError::Invalid(format!(
                "socket.backlog {} exceeds the system maximum of {MAX_BACKLOG}",
                self.backlog
            )));
        }
        if self.accept_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "socket.accept_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

impl IcdSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.library.trim().is_empty() {
            return Err(ConfigError::Invalid("icd.library must not be empty".into()));
        }
        if self.max_interface_version == 0 {
            return Err(ConfigError::Invalid(
                "icd.max_interface_version must be at least 1".into(),
            ));
        }
        if let Some(var) = &self.library_dir_env {
            if var.trim().is_empty() || var.contains('=') {
                return Err(ConfigError::Invalid(format!(
                    "icd.library_dir_env '{var}' is not a valid environment variable name"
                )));
            }
        }
        match self.mode {
            IcdMode::Prefixed => {
                if self.symbol_prefix.is_empty() {
                    return Err(ConfigError::Invalid(
                        "icd.symbol_prefix must not be empty in prefixed mode".into(),
                    ));
                }
                match &self.init_symbol {
                    Some(symbol) if !symbol.trim().is_empty() => {}
                    _ => {
                        return Err(ConfigError::Invalid(
                            "icd.init_symbol is required in prefixed mode".into(),
                        ))
                    }
                }
            }
            IcdMode::Forwarding => {
                if self.forward_entry_point.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "icd.forward_entry_point must not be empty in forwarding mode".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl PrewarmSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_symbol.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "prewarm.probe_symbol must not be empty".into(),
            ));
        }
        if self
            .candidates
            .iter()
            .any(|candidate| candidate.as_os_str().is_empty())
        {
            return Err(ConfigError::Invalid(
                "prewarm.candidates contains an empty path".into(),
            ));
        }
        Ok(())
    }
}

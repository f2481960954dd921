use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bridgeconfig::BridgeConfig;
use icdshim::{ChannelState, PrewarmOutcome};
use serde::Serialize;
use sockbroker::{prepare_socket_path, AcceptOutcome};
use tracing_subscriber::EnvFilter;

use crate::cli::{ProbeArgs, ServeArgs, WhereArgs};
use crate::context::BridgeContext;
use crate::paths::AppPaths;

/// Names the loader asks for before anything else.
const BOOTSTRAP_NAMES: &[&str] = &[
    "vkGetInstanceProcAddr",
    "vkEnumerateInstanceExtensionProperties",
    "vkCreateInstance",
];

pub fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(AppPaths::discover()?.config_file()),
    }
}

pub fn load_config(explicit: Option<&Path>) -> Result<BridgeConfig> {
    let path = config_path(explicit)?;
    let config = BridgeConfig::load_or_default(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;
    tracing::debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

pub fn serve(args: ServeArgs, mut config: BridgeConfig) -> Result<()> {
    if let Some(socket) = &args.socket {
        config.socket.path = socket.clone();
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.socket.accept_timeout = Duration::from_millis(timeout_ms);
    }
    config
        .validate()
        .context("invalid configuration after applying command-line overrides")?;

    let socket_path = match &args.rootfs {
        Some(rootfs) => {
            let relative = config
                .socket
                .path
                .strip_prefix("/")
                .unwrap_or(&config.socket.path)
                .to_path_buf();
            prepare_socket_path(rootfs, &relative).with_context(|| {
                format!("failed to prepare socket directory under {}", rootfs.display())
            })?
        }
        None => {
            if let Some(parent) = config.socket.path.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create socket directory {}", parent.display())
                })?;
            }
            config.socket.path.clone()
        }
    };

    let mut context = BridgeContext::new(config);
    context.prewarm();

    context
        .broker_mut()
        .bind(&socket_path)
        .with_context(|| format!("failed to listen on {}", socket_path.display()))?;
    tracing::info!(
        path = %socket_path.display(),
        timeout = ?context.config().socket.accept_timeout,
        "waiting for display clients"
    );

    let mut served: u32 = 0;
    loop {
        match context
            .broker()
            .accept_default()
            .context("failed while waiting for a display client")?
        {
            AcceptOutcome::Timeout => {
                tracing::debug!("no display client within timeout");
                if args.idle_exit {
                    tracing::info!("idle timeout reached; exiting (--idle-exit)");
                    break;
                }
            }
            AcceptOutcome::Connected(connection) => {
                served += 1;
                tracing::info!(fd = connection.as_raw_fd(), served, "display client connected");
                // Nothing consumes the protocol stream in this build.
                drop(connection);
                if args.max_connections > 0 && served >= args.max_connections {
                    tracing::info!(served, "connection limit reached; exiting");
                    break;
                }
            }
        }
    }

    context.broker_mut().close();
    Ok(())
}

pub fn probe(args: ProbeArgs, config: BridgeConfig) -> Result<()> {
    let buffer_size = args.buffer.as_deref().map(parse_surface_size).transpose()?;
    let context = BridgeContext::new(config);

    match context.prewarm() {
        Some(PrewarmOutcome::Loaded { path, probe }) => println!(
            "prewarm: loaded {} (probe {})",
            path.display(),
            if probe.is_some() { "ok" } else { "missing" }
        ),
        Some(PrewarmOutcome::Unavailable { attempts }) => {
            println!("prewarm: unavailable after {} attempt(s)", attempts.len())
        }
        None => println!("prewarm: disabled"),
    }

    let requested: Vec<&str> = if args.names.is_empty() {
        BOOTSTRAP_NAMES.to_vec()
    } else {
        args.names.iter().map(String::as_str).collect()
    };
    for name in requested {
        match context.resolve(name) {
            Some(addr) => println!("  {name:<40} -> {:p}", addr.as_ptr()),
            None => println!("  {name:<40} -> null"),
        }
    }

    let state = context.resolver().state();
    println!("channel: {}", describe_state(state));
    if let Some(path) = context.resolver().loaded_path() {
        println!("vendor module: {}", path.display());
    }

    if let Some((width, height)) = buffer_size {
        let mapped = context.buffer_self_check(width, height)?;
        println!("buffer {width}x{height}: mapped {mapped} bytes, released");
    }
    Ok(())
}

#[derive(Serialize)]
struct WhereReport<'a> {
    config_dir: Option<PathBuf>,
    config_file: &'a Path,
    config_file_exists: bool,
    config: &'a BridgeConfig,
}

pub fn where_cmd(args: WhereArgs, explicit: Option<&Path>, config: &BridgeConfig) -> Result<()> {
    let config_file = config_path(explicit)?;
    let config_dir = AppPaths::discover()
        .ok()
        .map(|paths| paths.config_dir().to_path_buf());
    let report = WhereReport {
        config_dir,
        config_file: &config_file,
        config_file_exists: config_file.is_file(),
        config,
    };

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("failed to encode report")?;
        println!("{json}");
        return Ok(());
    }

    if let Some(dir) = &report.config_dir {
        println!("Configuration directory: {}", dir.display());
    }
    println!(
        "Configuration file: {}{}",
        config_file.display(),
        if report.config_file_exists { "" } else { " (not present, using defaults)" }
    );
    println!("Socket:");
    println!("  path:            {}", config.socket.path.display());
    println!("  backlog:         {}", config.socket.backlog);
    println!(
        "  accept timeout:  {}ms",
        config.socket.accept_timeout.as_millis()
    );
    println!("Vendor channel:");
    println!("  mode:            {:?}", config.icd.mode);
    println!("  library:         {}", config.icd.library);
    if let Some(var) = &config.icd.library_dir_env {
        println!("  library dir env: {var}");
    }
    for path in &config.icd.fallback_paths {
        println!("  fallback:        {}", path.display());
    }
    println!("Prewarm:");
    println!("  enabled:         {}", config.prewarm.enabled);
    for candidate in &config.prewarm.candidates {
        println!("  candidate:       {}", candidate.display());
    }
    Ok(())
}

fn describe_state(state: ChannelState) -> &'static str {
    match state {
        ChannelState::Unloaded => "unloaded",
        ChannelState::LoadedUninitialized => "loaded, not initialised",
        ChannelState::Initialized => "initialised",
        ChannelState::Failed => "unavailable",
    }
}

pub fn parse_surface_size(spec: &str) -> Result<(u32, u32)> {
    let trimmed = spec.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| anyhow::anyhow!("expected WxH format, e.g. 64x64"))?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid width in size specification"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid height in size specification"))?;

    if width == 0 || height == 0 {
        bail!("buffer dimensions must be greater than zero");
    }

    Ok((width, height))
}

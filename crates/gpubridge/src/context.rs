use std::sync::Arc;

use anyhow::{Context, Result};
use bridgeconfig::BridgeConfig;
use hwbuffer::{BufferPlatform, HandleRegistry, NativePlatform, PixelFormat, UsageFlags};
use icdshim::{
    DlopenLoader, LoadOrderSequencer, ModuleLoader, PrewarmOutcome, ProcAddr,
    ProcAddressResolver, ResolverSettings,
};
use sockbroker::{BrokerOptions, ConnectionBroker};

/// Everything the bridge owns for the life of the process.
///
/// Built once in `main` and passed by reference; nothing here lives in a
/// global.
pub struct BridgeContext<P: BufferPlatform = NativePlatform> {
    config: BridgeConfig,
    registry: HandleRegistry<P>,
    broker: ConnectionBroker,
    sequencer: LoadOrderSequencer,
    resolver: ProcAddressResolver,
}

impl BridgeContext {
    pub fn new(config: BridgeConfig) -> Self {
        Self::with_parts(config, NativePlatform::new(), Arc::new(DlopenLoader))
    }
}

impl<P: BufferPlatform> BridgeContext<P> {
    pub fn with_parts(config: BridgeConfig, platform: P, loader: Arc<dyn ModuleLoader>) -> Self {
        let broker = ConnectionBroker::new(BrokerOptions {
            backlog: config.socket.backlog,
            accept_timeout: config.socket.accept_timeout,
        });
        let sequencer = LoadOrderSequencer::new(loader.clone(), config.prewarm.probe_symbol.clone());
        let resolver = ProcAddressResolver::new(ResolverSettings::from_config(&config.icd), loader);
        Self {
            config,
            registry: HandleRegistry::new(platform),
            broker,
            sequencer,
            resolver,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    #[cfg(test)]
    pub fn registry(&self) -> &HandleRegistry<P> {
        &self.registry
    }

    pub fn broker(&self) -> &ConnectionBroker {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut ConnectionBroker {
        &mut self.broker
    }

    pub fn resolver(&self) -> &ProcAddressResolver {
        &self.resolver
    }

    /// Runs the configured prewarm once. `None` when prewarm is disabled.
    pub fn prewarm(&self) -> Option<&PrewarmOutcome> {
        if !self.config.prewarm.enabled {
            return None;
        }
        Some(self.sequencer.prewarm(&self.config.prewarm.candidates))
    }

    /// Resolves `name`, making sure the guest component was prewarmed before
    /// the vendor module is touched.
    pub fn resolve(&self, name: &str) -> Option<ProcAddr> {
        self.prewarm();
        self.resolver.resolve(name)
    }

    /// Allocates a `width`x`height` readable buffer, maps it and lets every
    /// reference go again. Returns the mapped length.
    pub fn buffer_self_check(&self, width: u32, height: u32) -> Result<usize> {
        let external = self
            .registry
            .allocate(
                width,
                height,
                PixelFormat::R8G8B8A8_UNORM,
                UsageFlags::CPU_READ_OFTEN | UsageFlags::GPU_SAMPLED_IMAGE,
            )
            .with_context(|| format!("failed to allocate {width}x{height} buffer"))?;

        // Stands in for the runtime object that owns the allocation.
        let _owner = self
            .registry
            .adopt(external)
            .context("failed to import allocated buffer")?;

        let lease = self
            .registry
            .lease(external)
            .context("failed to import allocated buffer")?;
        let mapped = self
            .registry
            .with_mapped(lease.handle(), |bytes| bytes.len())
            .context("failed to map allocated buffer")?;
        Ok(mapped)
    }
}

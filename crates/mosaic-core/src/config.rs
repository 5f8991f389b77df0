//! Global compiler configuration.
//!
//! All behaviour of the core is driven by this struct; there are no other
//! environment inputs. `from_env` exists as a convenience fallback for
//! harnesses, mirroring the field set exactly.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Cluster count; drives subtensor counts everywhere.
    pub number_of_clusters: u32,

    /// Total DPU count across clusters.
    pub number_of_dpus: u32,

    /// Per-cluster scratchpad bytes.
    pub cmx_bytes: u64,

    /// DRAM scratch bytes available for spills.
    pub ddr_scratch_bytes: u64,

    /// Bytes per cycle the DMA engines sustain; cost model input.
    pub memory_bandwidth: f64,

    pub system_clock_mhz: f64,

    /// Channel-pad the network output to 16-alignment.
    pub pad_output: bool,

    /// Enable weight compression through the target codec.
    pub huffman_compression: bool,

    /// Bytes of CSRAM available for caching populated DMA inputs; 0 disables.
    pub csram_limit: u64,

    /// Emit real (physical) barrier indices instead of virtual ones.
    pub enable_static_barriers: bool,

    /// DMA port round-robin modulus.
    pub dma_controllers: u32,

    /// Channel alignment granularity.
    pub channel_padding: u32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            number_of_clusters: 4,
            number_of_dpus: 20,
            cmx_bytes: 917_504, // 896 KiB per cluster
            ddr_scratch_bytes: 512 * 1024 * 1024,
            memory_bandwidth: 32.0,
            system_clock_mhz: 700.0,
            pad_output: false,
            huffman_compression: false,
            csram_limit: 0,
            enable_static_barriers: false,
            dma_controllers: 1,
            channel_padding: 16,
        }
    }
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.number_of_clusters == 0 {
            return Err(Error::argument("config", "Number_of_Clusters must be >= 1"));
        }
        if self.number_of_dpus == 0 {
            return Err(Error::argument("config", "Number_of_DPUs must be >= 1"));
        }
        if self.number_of_dpus % self.number_of_clusters != 0 {
            return Err(Error::argument(
                "config",
                format!(
                    "Number_of_DPUs ({}) must divide evenly over {} clusters",
                    self.number_of_dpus, self.number_of_clusters
                ),
            ));
        }
        if self.cmx_bytes == 0 {
            return Err(Error::argument("config", "cmx must be non-zero"));
        }
        if self.dma_controllers == 0 {
            return Err(Error::argument("config", "dmaControllers must be >= 1"));
        }
        if self.channel_padding == 0 {
            return Err(Error::argument("config", "VPU2ChannelPadding must be >= 1"));
        }
        Ok(())
    }

    pub fn dpus_per_cluster(&self) -> u32 {
        self.number_of_dpus / self.number_of_clusters
    }

    /// Create a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        fn read<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|s| s.parse().ok())
        }

        if let Some(v) = read("MOSAIC_CLUSTERS") {
            cfg.number_of_clusters = v;
        }
        if let Some(v) = read("MOSAIC_DPUS") {
            cfg.number_of_dpus = v;
        }
        if let Some(v) = read("MOSAIC_CMX_BYTES") {
            cfg.cmx_bytes = v;
        }
        if let Some(v) = read("MOSAIC_DDR_SCRATCH_BYTES") {
            cfg.ddr_scratch_bytes = v;
        }
        if let Some(v) = read("MOSAIC_MEMORY_BANDWIDTH") {
            cfg.memory_bandwidth = v;
        }
        if let Some(v) = read("MOSAIC_CLOCK_MHZ") {
            cfg.system_clock_mhz = v;
        }
        if let Some(v) = read("MOSAIC_CSRAM_LIMIT") {
            cfg.csram_limit = v;
        }
        if let Some(v) = read("MOSAIC_DMA_CONTROLLERS") {
            cfg.dma_controllers = v;
        }
        cfg
    }
}

//! Background resource and health sampling
//!
//! This module provides the host resource sampler (procfs plus optional
//! `ethtool` NIC allowance counters) and the fixed-interval loop that feeds
//! samples from any source into an append-only stream.

mod host;
mod r#loop;

pub use host::{
    parse_cpu_times, parse_diskstats, parse_ethtool_stats, parse_meminfo, parse_net_dev,
    CpuTimes, DiskCounters, HostSampler, HostSamplerConfig, NetCounters,
};
pub use r#loop::{SampleSource, SamplingLoop};

use crate::models::ResourceSample;
use anyhow::Result;
use async_trait::async_trait;

/// Source of periodic resource samples
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    /// Take one sample
    async fn sample(&self) -> Result<ResourceSample>;
}

//! ## Configuration Module
//!
//! Defines [`FarmPoolConfig`], loaded from a TOML file by the binary.
//!
//! Only the `chain`, `relay`, `database_path` and `platform` sections are
//! mandatory; every tuning section falls back to the defaults below.

use config_helpers_farm::duration_from_toml;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use crate::{
    backoff::Backoff,
    error::{FarmPoolError, PoolResult},
};

/// Upper bound on concurrent submissions per batch window.
pub const MAX_WINDOW_SIZE: usize = 10;
/// Upper bound on any single plant retry delay.
pub const PLANT_RETRY_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize, Clone)]
pub struct FarmPoolConfig {
    chain: ChainConfig,
    relay: RelayConfig,
    database_path: PathBuf,
    platform: PlatformConfig,
    #[serde(default)]
    batch: BatchConfig,
    #[serde(default)]
    plant_retry: PlantRetryConfig,
    #[serde(default)]
    harvest: HarvestConfig,
    #[serde(default)]
    exit: ExitConfig,
    #[serde(default)]
    block_monitor: BlockMonitorConfig,
    #[serde(skip)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Address of the farm contract that exposes plant/work/harvest.
    pub farm_contract: String,
    /// Address of the token contract the farm stakes and rewards in.
    pub token_contract: String,
    #[serde(default)]
    pub rpc_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    pub payout_wallet: String,
    /// Used for legacy farmers that have no pool contract.
    #[serde(default = "default_reward_split_bps")]
    pub default_reward_split_bps: u32,
    #[serde(default = "default_platform_fee_bps")]
    pub default_platform_fee_bps: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(
        default = "default_window_pause",
        deserialize_with = "duration_from_toml"
    )]
    pub window_pause: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlantRetryConfig {
    #[serde(default = "default_plant_attempts")]
    pub max_attempts: u32,
    #[serde(
        default = "default_plant_base_delay",
        deserialize_with = "duration_from_toml"
    )]
    pub base_delay: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(
        default = "default_block_readiness_delay",
        deserialize_with = "duration_from_toml"
    )]
    pub block_readiness_delay: Duration,
    #[serde(
        default = "default_work_readiness_delay",
        deserialize_with = "duration_from_toml"
    )]
    pub work_readiness_delay: Duration,
    #[serde(default = "default_lookback", deserialize_with = "duration_from_toml")]
    pub lookback: Duration,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Harvest interval, in blocks, for farmers without a pool contract.
    #[serde(default = "default_harvest_interval")]
    pub default_interval: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExitConfig {
    #[serde(default = "default_exit_retries")]
    pub max_retries: u32,
    #[serde(
        default = "default_exit_base_delay",
        deserialize_with = "duration_from_toml"
    )]
    pub base_delay: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlockMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "duration_from_toml"
    )]
    pub poll_interval: Duration,
}

fn default_reward_split_bps() -> u32 {
    8000
}
fn default_platform_fee_bps() -> u32 {
    500
}
fn default_window_size() -> usize {
    MAX_WINDOW_SIZE
}
fn default_window_pause() -> Duration {
    Duration::from_secs(1)
}
fn default_plant_attempts() -> u32 {
    3
}
fn default_plant_base_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_block_readiness_delay() -> Duration {
    Duration::from_secs(60)
}
fn default_work_readiness_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_lookback() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}
fn default_max_candidates() -> usize {
    10
}
fn default_harvest_interval() -> u32 {
    1
}
fn default_exit_retries() -> u32 {
    5
}
fn default_exit_base_delay() -> Duration {
    Duration::from_secs(30)
}
fn default_true() -> bool {
    true
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            window_pause: default_window_pause(),
        }
    }
}

impl Default for PlantRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_plant_attempts(),
            base_delay: default_plant_base_delay(),
        }
    }
}

impl PlantRetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay).with_cap(PLANT_RETRY_CAP)
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            block_readiness_delay: default_block_readiness_delay(),
            work_readiness_delay: default_work_readiness_delay(),
            lookback: default_lookback(),
            max_candidates: default_max_candidates(),
            default_interval: default_harvest_interval(),
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            max_retries: default_exit_retries(),
            base_delay: default_exit_base_delay(),
        }
    }
}

impl ExitConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay)
    }
}

impl Default for BlockMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl FarmPoolConfig {
    pub fn new(
        chain: ChainConfig,
        relay: RelayConfig,
        database_path: PathBuf,
        platform: PlatformConfig,
    ) -> Self {
        Self {
            chain,
            relay,
            database_path,
            platform,
            batch: BatchConfig::default(),
            plant_retry: PlantRetryConfig::default(),
            harvest: HarvestConfig::default(),
            exit: ExitConfig::default(),
            block_monitor: BlockMonitorConfig::default(),
            log_file: None,
        }
    }

    /// Rejects values the pool cannot run with and clamps the batch window.
    pub fn validate(mut self) -> PoolResult<Self> {
        if self.platform.default_reward_split_bps + self.platform.default_platform_fee_bps > 10_000
        {
            return Err(FarmPoolError::InvalidConfig(
                "default reward split and platform fee exceed 10000 bps".to_string(),
            ));
        }
        if self.plant_retry.max_attempts == 0 {
            return Err(FarmPoolError::InvalidConfig(
                "plant_retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.harvest.max_candidates == 0 {
            return Err(FarmPoolError::InvalidConfig(
                "harvest.max_candidates must be at least 1".to_string(),
            ));
        }
        self.batch.window_size = self.batch.window_size.clamp(1, MAX_WINDOW_SIZE);
        Ok(self)
    }

    pub fn chain(&self) -> &ChainConfig {
        &self.chain
    }

    pub fn relay(&self) -> &RelayConfig {
        &self.relay
    }

    pub fn database_path(&self) -> &PathBuf {
        &self.database_path
    }

    pub fn platform(&self) -> &PlatformConfig {
        &self.platform
    }

    pub fn batch(&self) -> &BatchConfig {
        &self.batch
    }

    pub fn plant_retry(&self) -> &PlantRetryConfig {
        &self.plant_retry
    }

    pub fn harvest(&self) -> &HarvestConfig {
        &self.harvest
    }

    pub fn exit(&self) -> &ExitConfig {
        &self.exit
    }

    pub fn block_monitor(&self) -> &BlockMonitorConfig {
        &self.block_monitor
    }

    pub fn log_file(&self) -> Option<&std::path::Path> {
        self.log_file.as_deref()
    }

    pub fn set_log_file(&mut self, log_file: Option<PathBuf>) {
        if let Some(log_file) = log_file {
            self.log_file = Some(log_file);
        }
    }
}

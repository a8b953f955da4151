//! ## Farm Pool
//!
//! Coordinates a pool of farmers on a proof-of-work farm contract: plants
//! stakes, submits work and harvests rewards on their behalf, and pays out the
//! three-way reward split when a farmer leaves.
//!
//! [`FarmPool::start`] wires the SQLite ledger, the chain node and the
//! submission relay into a [`FarmPoolService`], re-arms exit retries left by a
//! previous run, starts the [`BlockMonitor`](block_monitor::BlockMonitor) and
//! then runs the status loop until a fatal status or Ctrl-C.

use async_channel::unbounded;
use std::sync::Arc;
use tokio::select;
use tracing::{error, info, warn};

use farm_rpc::{Auth, MiniRpcClient, RelayClient, Uri};

pub mod backoff;
pub mod block_monitor;
pub mod chain;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exit;
pub mod harvest_scheduler;
pub mod ledger;
pub mod service;
pub mod signer;
pub mod status;
pub mod submission;
pub mod task_queue;
pub mod types;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

use block_monitor::BlockMonitor;
use chain::NodeClient;
use config::FarmPoolConfig;
use error::{FarmPoolError, PoolResult};
use ledger::SqliteLedger;
pub use service::FarmPoolService;

#[derive(Debug, Clone)]
pub struct FarmPool {
    config: FarmPoolConfig,
}

impl FarmPool {
    pub fn new(config: FarmPoolConfig) -> FarmPool {
        FarmPool { config }
    }

    fn parse_uri(raw: &str, what: &str) -> PoolResult<Uri> {
        raw.parse::<Uri>()
            .map_err(|e| FarmPoolError::InvalidConfig(format!("invalid {what} url `{raw}`: {e}")))
    }

    pub async fn start(&self) -> PoolResult<()> {
        let config = self.config.clone().validate()?;
        info!(
            "Farm pool starting, farm contract {}",
            config.chain().farm_contract
        );

        let ledger = Arc::new(SqliteLedger::open(config.database_path())?);
        let rpc = MiniRpcClient::new(
            Self::parse_uri(&config.chain().rpc_url, "chain rpc")?,
            config.chain().rpc_token.clone().map(Auth::Bearer),
        );
        if let Err(e) = rpc.health().await {
            warn!("Chain node health check failed: {}", e);
        }
        let chain = Arc::new(NodeClient::new(
            rpc,
            config.chain().farm_contract.clone(),
            config.chain().token_contract.clone(),
        ));
        let relay = Arc::new(RelayClient::new(
            Self::parse_uri(&config.relay().url, "relay")?,
            config.relay().api_key.clone(),
        ));

        let (status_tx, status_rx) = unbounded();
        let service = FarmPoolService::new(
            &config,
            ledger.clone(),
            chain.clone(),
            relay,
            Some(status_tx.clone()),
        );

        let restored = service.restore_pending().await?;
        if restored > 0 {
            info!("Restored {} pending exit payouts", restored);
        }

        let monitor = if config.block_monitor().enabled {
            let monitor = BlockMonitor::new(
                chain,
                ledger,
                service.scheduler(),
                config.block_monitor().poll_interval,
            );
            Some(tokio::spawn(
                monitor.run(status::Sender::BlockMonitor(status_tx)),
            ))
        } else {
            info!("Block monitor disabled, waiting for external block signals");
            None
        };

        // Status loop, see `./status.rs`
        loop {
            let task_status = select! {
                task_status = status_rx.recv() => task_status,
                interrupt_signal = tokio::signal::ctrl_c() => {
                    match interrupt_signal {
                        Ok(()) => {
                            info!("Interrupt received");
                        },
                        Err(err) => {
                            error!("Unable to listen for interrupt signal: {}", err);
                        },
                    }
                    break;
                }
            };
            let task_status: status::Status = match task_status {
                Ok(status) => status,
                Err(e) => {
                    error!("Status channel closed: {}", e);
                    break;
                }
            };

            match task_status.state {
                status::State::BlockMonitorShutdown(err) => {
                    error!("SHUTDOWN from block monitor: {}", err);
                    break;
                }
                status::State::LedgerUnavailable(err) => {
                    error!("Ledger unavailable: {}", err);
                }
                status::State::Healthy(msg) => {
                    info!("HEALTHY message: {}", msg);
                }
            }
        }

        if let Some(monitor) = monitor {
            monitor.abort();
        }
        service.shutdown();
        info!("Farm pool stopped");
        Ok(())
    }
}

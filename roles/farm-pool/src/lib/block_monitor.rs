//! Watches the farm contract's block index and turns every new index into a
//! block-discovered signal for the harvest scheduler.

use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::{
    chain::ChainClient,
    error::PoolResult,
    harvest_scheduler::HarvestScheduler,
    ledger::Ledger,
    status::{self, ErrorBranch},
    types::BlockIndex,
};

pub struct BlockMonitor {
    chain: Arc<dyn ChainClient>,
    ledger: Arc<dyn Ledger>,
    scheduler: Arc<HarvestScheduler>,
    poll_interval: Duration,
    last_seen: Option<BlockIndex>,
}

impl BlockMonitor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        ledger: Arc<dyn Ledger>,
        scheduler: Arc<HarvestScheduler>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            chain,
            ledger,
            scheduler,
            poll_interval,
            last_seen: None,
        }
    }

    /// Reads the chain once. Returns the block index if it was not known before.
    pub async fn poll_once(&mut self) -> PoolResult<Option<BlockIndex>> {
        let index = self.chain.farm_index().await?;
        if self.last_seen == Some(index) {
            return Ok(None);
        }
        let is_new = self.ledger.record_block_discovered(index).await?;
        self.last_seen = Some(index);
        if !is_new {
            debug!(block_index = index, "Block already known");
            return Ok(None);
        }
        info!(block_index = index, "New block discovered");
        self.scheduler.on_block_discovered(index);
        Ok(Some(index))
    }

    pub async fn run(mut self, status_tx: status::Sender) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = self.poll_once().await {
                if status::handle_error(&status_tx, e).await == ErrorBranch::Break {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{task_queue::TaskKey, test_utils::Harness};

    #[tokio::test(start_paused = true)]
    async fn signals_each_new_block_once() {
        let h = Harness::with_farmers(0);
        let mut monitor = BlockMonitor::new(
            h.chain.clone(),
            h.ledger.clone(),
            h.scheduler.clone(),
            Duration::from_secs(5),
        );
        h.chain.set_farm_index(1000);
        assert_eq!(monitor.poll_once().await.unwrap(), Some(1000));
        assert_eq!(monitor.poll_once().await.unwrap(), None);
        assert!(h.queue.is_pending(&TaskKey::HarvestScanBlock(1000)));
        assert_eq!(h.ledger.current_block_index().await.unwrap(), Some(1000));

        h.chain.set_farm_index(1001);
        assert_eq!(monitor.poll_once().await.unwrap(), Some(1001));
    }

    #[tokio::test(start_paused = true)]
    async fn chain_errors_keep_the_monitor_running() {
        let h = Harness::with_farmers(0);
        h.chain.fail_farm_index(true);
        let monitor = BlockMonitor::new(
            h.chain.clone(),
            h.ledger.clone(),
            h.scheduler.clone(),
            Duration::from_secs(5),
        );
        let (tx, rx) = async_channel::unbounded();
        let handle = tokio::spawn(monitor.run(status::Sender::BlockMonitor(tx)));

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(rx.len() >= 2);
        h.chain.fail_farm_index(false);
        h.chain.set_farm_index(7);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.ledger.current_block_index().await.unwrap(), Some(7));
        assert!(!handle.is_finished());
        handle.abort();
    }
}

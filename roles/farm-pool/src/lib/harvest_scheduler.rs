//! ## Event-Driven Harvest Scheduler
//!
//! Harvest scans run only after one of two triggers: a block was discovered
//! ([`HarvestScheduler::on_block_discovered`]) or a farmer completed work
//! ([`HarvestScheduler::on_work_completed`]). Each trigger schedules a scan after
//! its readiness delay on the [`TaskQueue`]; a repeated trigger replaces the
//! waiting scan. Both triggers are keyed per block, so a work batch over many
//! farmers arms a single scan. Scans never overlap.
//!
//! A scan keeps no state of its own. The latest block index is read from the
//! ledger every time, and a pair that was harvested in the meantime simply no
//! longer shows up as a candidate.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::{
    config::HarvestConfig,
    coordinator::{BatchCoordinator, BatchResult},
    error::PoolResult,
    ledger::Ledger,
    status,
    task_queue::{TaskKey, TaskQueue},
    types::{unix_now, BlockIndex, FarmerId, HarvestCandidate, OperatorId},
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanReport {
    pub latest_block: Option<BlockIndex>,
    pub candidates: Vec<HarvestCandidate>,
    pub batches: Vec<BatchResult>,
}

pub struct HarvestScheduler {
    ledger: Arc<dyn Ledger>,
    coordinator: Arc<BatchCoordinator>,
    queue: Arc<TaskQueue>,
    settings: HarvestConfig,
    status: Option<status::Sender>,
    last_scan: StdMutex<Option<ScanReport>>,
    scanning: Mutex<()>,
}

impl HarvestScheduler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        coordinator: Arc<BatchCoordinator>,
        queue: Arc<TaskQueue>,
        settings: HarvestConfig,
        status: Option<status::Sender>,
    ) -> Self {
        Self {
            ledger,
            coordinator,
            queue,
            settings,
            status,
            last_scan: StdMutex::new(None),
            scanning: Mutex::new(()),
        }
    }

    /// Schedules a scan once the block had time to finalize.
    pub fn on_block_discovered(self: &Arc<Self>, block_index: BlockIndex) {
        debug!(block_index, "Block discovered, scheduling harvest scan");
        self.schedule(
            TaskKey::HarvestScanBlock(block_index),
            self.settings.block_readiness_delay,
        );
    }

    /// Schedules a scan shortly after work on `block_index` landed.
    pub fn on_work_completed(self: &Arc<Self>, block_index: BlockIndex, farmer_ids: &[FarmerId]) {
        if farmer_ids.is_empty() {
            return;
        }
        debug!(
            block_index,
            farmers = farmer_ids.len(),
            "Work completed, scheduling harvest scan"
        );
        self.schedule(
            TaskKey::HarvestScanWork(block_index),
            self.settings.work_readiness_delay,
        );
    }

    fn schedule(self: &Arc<Self>, key: TaskKey, delay: std::time::Duration) {
        let this = self.clone();
        self.queue.schedule_in(key, delay, async move {
            this.run_scan().await;
        });
    }

    async fn run_scan(&self) {
        match self.scan().await {
            Ok(report) => {
                *self.last_scan.lock().unwrap_or_else(PoisonError::into_inner) = Some(report);
            }
            Err(e) => {
                error!("Harvest scan failed: {}", e);
                if let Some(status) = &self.status {
                    status::handle_error(status, e).await;
                }
            }
        }
    }

    /// Report of the most recent scheduled scan.
    pub fn last_scan(&self) -> Option<ScanReport> {
        self.last_scan
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Finds harvest candidates and hands them to the coordinator, one batch
    /// per (operator, block). Waits for a scan already running to finish.
    pub async fn scan(&self) -> PoolResult<ScanReport> {
        let _scanning = self.scanning.lock().await;
        let Some(latest_block) = self.ledger.current_block_index().await? else {
            debug!("No block seen yet, nothing to harvest");
            return Ok(ScanReport::default());
        };
        let planted_since = unix_now().saturating_sub(self.settings.lookback.as_secs());
        let candidates = self
            .ledger
            .harvest_candidates(
                latest_block,
                self.settings.default_interval,
                planted_since,
                self.settings.max_candidates,
            )
            .await?;

        let unique: BTreeSet<HarvestCandidate> = candidates.into_iter().collect();
        let mut groups: BTreeMap<(OperatorId, BlockIndex), Vec<FarmerId>> = BTreeMap::new();
        for candidate in &unique {
            groups
                .entry((candidate.operator_id, candidate.block_index))
                .or_default()
                .push(candidate.farmer_id);
        }

        let mut report = ScanReport {
            latest_block: Some(latest_block),
            candidates: unique.into_iter().collect(),
            batches: Vec::with_capacity(groups.len()),
        };
        if report.candidates.is_empty() {
            debug!(latest_block, "No harvest candidates");
            return Ok(report);
        }
        info!(
            latest_block,
            candidates = report.candidates.len(),
            batches = groups.len(),
            "Harvesting"
        );
        for ((operator_id, block_index), farmer_ids) in groups {
            let batch = self
                .coordinator
                .harvest_batch(block_index, operator_id, &farmer_ids)
                .await?;
            report.batches.push(batch);
        }
        Ok(report)
    }
}

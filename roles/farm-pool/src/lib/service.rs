//! Entry points offered to the API layer.
//!
//! Every operation returns a structured result with a per-farmer or per-leg
//! breakdown. `Err` only carries infrastructure faults and invalid requests.

use std::sync::Arc;

use crate::{
    chain::{ChainClient, Relay},
    config::FarmPoolConfig,
    coordinator::{BatchCoordinator, BatchResult, WorkSubmission},
    error::PoolResult,
    exit::{ExitOrchestrator, ExitPayoutResult},
    harvest_scheduler::HarvestScheduler,
    ledger::Ledger,
    status,
    submission::TransactionSubmitter,
    task_queue::TaskQueue,
    types::{BlockIndex, ExitId, ExitSplit, FarmerId, OperatorId},
};

#[derive(Clone)]
pub struct FarmPoolService {
    coordinator: Arc<BatchCoordinator>,
    scheduler: Arc<HarvestScheduler>,
    exits: Arc<ExitOrchestrator>,
    queue: Arc<TaskQueue>,
}

impl FarmPoolService {
    /// Wires the coordinator, scheduler and exit orchestrator around shared
    /// ledger, chain and relay handles.
    pub fn new(
        config: &FarmPoolConfig,
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn ChainClient>,
        relay: Arc<dyn Relay>,
        status_tx: Option<async_channel::Sender<status::Status>>,
    ) -> Self {
        let queue = Arc::new(TaskQueue::new());
        let submitter = Arc::new(TransactionSubmitter::new(
            chain.clone(),
            relay,
            config.chain().farm_contract.clone(),
            config.chain().token_contract.clone(),
            config.plant_retry().backoff(),
            config.plant_retry().max_attempts,
        ));
        let coordinator = Arc::new(BatchCoordinator::new(
            ledger.clone(),
            chain.clone(),
            submitter.clone(),
            config.batch(),
        ));
        let scheduler = Arc::new(HarvestScheduler::new(
            ledger.clone(),
            coordinator.clone(),
            queue.clone(),
            config.harvest().clone(),
            status_tx.clone().map(status::Sender::HarvestScheduler),
        ));
        let exits = Arc::new(ExitOrchestrator::new(
            ledger,
            chain,
            submitter,
            queue.clone(),
            config.platform().clone(),
            config.exit(),
            status_tx.map(status::Sender::ExitOrchestrator),
        ));
        Self::from_parts(coordinator, scheduler, exits, queue)
    }

    pub(crate) fn from_parts(
        coordinator: Arc<BatchCoordinator>,
        scheduler: Arc<HarvestScheduler>,
        exits: Arc<ExitOrchestrator>,
        queue: Arc<TaskQueue>,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            exits,
            queue,
        }
    }

    pub fn scheduler(&self) -> Arc<HarvestScheduler> {
        self.scheduler.clone()
    }

    pub fn queue(&self) -> Arc<TaskQueue> {
        self.queue.clone()
    }

    pub async fn process_plant_request(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        capacity: usize,
    ) -> PoolResult<BatchResult> {
        self.coordinator
            .process_plant_request(block_index, operator_id, capacity)
            .await
    }

    /// Submits work and schedules one harvest check for the farmers whose
    /// work landed.
    pub async fn process_work_request(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        submissions: Vec<WorkSubmission>,
    ) -> PoolResult<BatchResult> {
        let result = self
            .coordinator
            .process_work_request(block_index, operator_id, submissions)
            .await?;
        self.scheduler
            .on_work_completed(block_index, &result.succeeded_ids());
        Ok(result)
    }

    pub async fn process_harvest_request(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> PoolResult<BatchResult> {
        self.coordinator
            .process_harvest_request(block_index, operator_id)
            .await
    }

    pub fn on_block_discovered(&self, block_index: BlockIndex) {
        self.scheduler.on_block_discovered(block_index);
    }

    pub fn on_work_completed(&self, block_index: BlockIndex, farmer_id: FarmerId) {
        self.scheduler.on_work_completed(block_index, &[farmer_id]);
    }

    pub async fn open_exit(&self, farmer_id: FarmerId) -> PoolResult<ExitSplit> {
        self.exits.open_exit(farmer_id).await
    }

    pub async fn execute_exit_payout(&self, exit_id: ExitId) -> PoolResult<ExitPayoutResult> {
        self.exits.execute_exit_payout(exit_id).await
    }

    pub async fn retry_failed_exit(&self, exit_id: ExitId) -> PoolResult<ExitPayoutResult> {
        self.exits.retry_failed_exit(exit_id).await
    }

    pub async fn cancel_exit(&self, exit_id: ExitId) -> PoolResult<ExitSplit> {
        self.exits.cancel_exit(exit_id).await
    }

    /// Re-arms exit retries persisted by a previous run.
    pub async fn restore_pending(&self) -> PoolResult<usize> {
        self.exits.restore_pending().await
    }

    /// Drops every scheduled scan and retry.
    pub fn shutdown(&self) {
        self.queue.abort_all();
    }
}

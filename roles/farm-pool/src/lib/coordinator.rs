//! ## Batch Operation Coordinator
//!
//! Fans one plant, work or harvest request out over many farmers of a pool
//! operator. Farmers are processed in windows of at most
//! [`MAX_WINDOW_SIZE`](crate::config::MAX_WINDOW_SIZE) concurrent submissions,
//! each farmer on its own task so that a failure, or even a panic, never takes
//! its siblings down. Every outcome of a window is appended to the ledger
//! before the next window starts.
//!
//! A (phase, block, farmer) triple is claimed for the whole batch that submits
//! it. Concurrent batches skip claimed farmers and re-read the ledger after
//! claiming, so one process never sends the same operation twice.

use futures::future::join_all;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    chain::ChainClient,
    config::BatchConfig,
    error::PoolResult,
    ledger::Ledger,
    submission::{Account, SubmissionOutcome, TransactionSubmitter},
    types::{
        apply_bps, Amount, BlockIndex, EnrolledFarmer, EntryStatus, FarmerId, NewLedgerEntry,
        OperationKind, OperatorId,
    },
};

/// A proof-of-work solution submitted on behalf of a farmer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSubmission {
    pub farmer_id: FarmerId,
    pub hash: String,
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAction {
    Plant { stake: Amount },
    Work { hash: String, nonce: u64, stake: Amount },
    Harvest,
}

impl BatchAction {
    fn kind(&self) -> OperationKind {
        match self {
            BatchAction::Plant { .. } => OperationKind::Plant,
            BatchAction::Work { .. } => OperationKind::Work,
            BatchAction::Harvest => OperationKind::Harvest,
        }
    }

    /// Amount written to the ledger before the outcome is known.
    fn amount(&self) -> Amount {
        match self {
            BatchAction::Plant { stake } | BatchAction::Work { stake, .. } => *stake,
            BatchAction::Harvest => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub farmer: EnrolledFarmer,
    pub action: BatchAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FarmerOutcome {
    pub farmer_id: FarmerId,
    pub amount: Amount,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

/// Per-farmer breakdown of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub kind: OperationKind,
    pub block_index: BlockIndex,
    pub operator_id: OperatorId,
    pub succeeded: Vec<FarmerOutcome>,
    pub failed: Vec<FarmerOutcome>,
    /// Harvests whose on-chain preconditions are not met yet. No row is written.
    pub not_ready: Vec<FarmerOutcome>,
    /// Farmers left for a later request, e.g. an unfunded custodial wallet.
    pub deferred: Vec<FarmerId>,
    /// Farmers with nothing to do, e.g. already planted for this block.
    pub skipped: Vec<FarmerId>,
    /// Sum of the succeeded amounts.
    pub total_amount: Amount,
}

impl BatchResult {
    pub fn new(kind: OperationKind, block_index: BlockIndex, operator_id: OperatorId) -> Self {
        Self {
            kind,
            block_index,
            operator_id,
            succeeded: Vec::new(),
            failed: Vec::new(),
            not_ready: Vec::new(),
            deferred: Vec::new(),
            skipped: Vec::new(),
            total_amount: 0,
        }
    }

    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.not_ready.len()
    }

    pub fn succeeded_ids(&self) -> Vec<FarmerId> {
        self.succeeded.iter().map(|o| o.farmer_id).collect()
    }
}

type ClaimKey = (OperationKind, BlockIndex, FarmerId);

/// Operations claimed by one batch, released when the batch returns.
struct Claims {
    in_flight: Arc<StdMutex<HashSet<ClaimKey>>>,
    held: Vec<ClaimKey>,
}

impl Claims {
    fn new(in_flight: Arc<StdMutex<HashSet<ClaimKey>>>) -> Self {
        Self {
            in_flight,
            held: Vec::new(),
        }
    }

    fn claim(&mut self, key: ClaimKey) -> bool {
        let claimed = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
        if claimed {
            self.held.push(key);
        }
        claimed
    }
}

impl Drop for Claims {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.held {
            in_flight.remove(key);
        }
    }
}

pub struct BatchCoordinator {
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn ChainClient>,
    submitter: Arc<TransactionSubmitter>,
    window_size: usize,
    window_pause: Duration,
    in_flight: Arc<StdMutex<HashSet<ClaimKey>>>,
}

impl BatchCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn ChainClient>,
        submitter: Arc<TransactionSubmitter>,
        settings: &BatchConfig,
    ) -> Self {
        Self {
            ledger,
            chain,
            submitter,
            window_size: settings.window_size.clamp(1, crate::config::MAX_WINDOW_SIZE),
            window_pause: settings.window_pause,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    /// Plants for up to `capacity` active farmers of `operator_id` that have
    /// not planted `block_index` yet.
    ///
    /// Wallets are checked on chain first. Unfunded wallets are deferred so a
    /// later request picks them up once funded. The stake is the contract's
    /// percentage of the live token balance, or of the cached balance when the
    /// lookup fails.
    pub async fn process_plant_request(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        capacity: usize,
    ) -> PoolResult<BatchResult> {
        self.ledger
            .ensure_block_operation(block_index, operator_id)
            .await?;
        let mut result = BatchResult::new(OperationKind::Plant, block_index, operator_id);

        let mut pending = Vec::new();
        for farmer in self.ledger.active_farmers(operator_id).await? {
            if self
                .ledger
                .successful_entry(OperationKind::Plant, block_index, farmer.id())
                .await?
                .is_some()
            {
                result.skipped.push(farmer.id());
            } else if pending.len() < capacity {
                pending.push(farmer);
            } else {
                result.deferred.push(farmer.id());
            }
        }

        let mut items = Vec::with_capacity(pending.len());
        for window in pending.chunks(self.window_size) {
            let balances = join_all(
                window
                    .iter()
                    .map(|f| self.chain.balance(&f.farmer.custodial_public_key)),
            )
            .await;
            for (farmer, balance) in window.iter().zip(balances) {
                let basis = match balance {
                    Ok(balance) => {
                        self.ledger
                            .update_farmer_balance(farmer.id(), balance.token)
                            .await?;
                        if !balance.is_funded() {
                            info!(
                                farmer_id = farmer.id(),
                                block_index, "Custodial wallet not funded yet, deferring plant"
                            );
                            self.defer_plant(&mut result, farmer, "custodial wallet not funded")
                                .await?;
                            continue;
                        }
                        balance.token
                    }
                    Err(e) => {
                        warn!(
                            farmer_id = farmer.id(),
                            "Balance lookup failed, sizing stake from cached balance: {}", e
                        );
                        if farmer.farmer.balance <= 0 {
                            self.defer_plant(&mut result, farmer, "no known funded balance")
                                .await?;
                            continue;
                        }
                        farmer.farmer.balance
                    }
                };
                let Some(stake) = apply_bps(basis, farmer.stake_percentage_bps()) else {
                    error!(
                        farmer_id = farmer.id(),
                        balance = %basis,
                        "Stake computation overflowed, skipping plant"
                    );
                    result.failed.push(FarmerOutcome {
                        farmer_id: farmer.id(),
                        amount: 0,
                        tx_hash: None,
                        error: Some("stake computation overflowed".into()),
                    });
                    continue;
                };
                let stake = stake.max(0);
                items.push(BatchItem {
                    farmer: farmer.clone(),
                    action: BatchAction::Plant { stake },
                });
            }
        }

        self.run_into(result, items).await
    }

    /// Marks a plant as waiting for funds. The row never counts as a planting,
    /// so the farmer stays eligible for the next request on the block.
    async fn defer_plant(
        &self,
        result: &mut BatchResult,
        farmer: &EnrolledFarmer,
        reason: &str,
    ) -> PoolResult<()> {
        self.ledger
            .record_planting(NewLedgerEntry {
                phase: OperationKind::Plant,
                block_index: result.block_index,
                farmer_id: farmer.id(),
                operator_id: result.operator_id,
                amount: 0,
                tx_hash: None,
                error: Some(reason.to_string()),
                status: EntryStatus::PendingRetry,
            })
            .await?;
        result.deferred.push(farmer.id());
        Ok(())
    }

    /// Submits work for farmers that planted `block_index` and have no
    /// successful work for it yet.
    pub async fn process_work_request(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        submissions: Vec<WorkSubmission>,
    ) -> PoolResult<BatchResult> {
        let mut result = BatchResult::new(OperationKind::Work, block_index, operator_id);
        let members = self.ledger.active_farmers(operator_id).await?;
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        for submission in submissions {
            if !seen.insert(submission.farmer_id) {
                result.skipped.push(submission.farmer_id);
                continue;
            }
            let Some(farmer) = members.iter().find(|f| f.id() == submission.farmer_id) else {
                debug!(
                    farmer_id = submission.farmer_id,
                    operator_id, "Work for a farmer outside the pool, skipping"
                );
                result.skipped.push(submission.farmer_id);
                continue;
            };
            let planting = self
                .ledger
                .successful_entry(OperationKind::Plant, block_index, farmer.id())
                .await?;
            let already_worked = self
                .ledger
                .successful_entry(OperationKind::Work, block_index, farmer.id())
                .await?
                .is_some();
            match planting {
                Some(planting) if !already_worked => items.push(BatchItem {
                    farmer: farmer.clone(),
                    action: BatchAction::Work {
                        hash: submission.hash,
                        nonce: submission.nonce,
                        stake: planting.amount,
                    },
                }),
                _ => result.skipped.push(farmer.id()),
            }
        }

        self.run_into(result, items).await
    }

    /// Harvests every farmer of `operator_id` with unharvested work on `block_index`.
    pub async fn process_harvest_request(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> PoolResult<BatchResult> {
        self.harvest(block_index, operator_id, None).await
    }

    /// Harvests the given farmers only, as found by the harvest scheduler.
    pub async fn harvest_batch(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        farmer_ids: &[FarmerId],
    ) -> PoolResult<BatchResult> {
        self.harvest(block_index, operator_id, Some(farmer_ids)).await
    }

    async fn harvest(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        only: Option<&[FarmerId]>,
    ) -> PoolResult<BatchResult> {
        let mut result = BatchResult::new(OperationKind::Harvest, block_index, operator_id);
        let harvestable = self
            .ledger
            .harvestable_farmers(block_index, operator_id)
            .await?;
        if let Some(only) = only {
            result.skipped = only
                .iter()
                .filter(|id| !harvestable.iter().any(|f| f.id() == **id))
                .copied()
                .collect();
        }
        let items = harvestable
            .into_iter()
            .filter(|f| only.map(|ids| ids.contains(&f.id())).unwrap_or(true))
            .map(|farmer| BatchItem {
                farmer,
                action: BatchAction::Harvest,
            })
            .collect();
        self.run_into(result, items).await
    }

    /// Executes `items` for one block and operator and records every outcome.
    pub async fn run(
        &self,
        kind: OperationKind,
        block_index: BlockIndex,
        operator_id: OperatorId,
        items: Vec<BatchItem>,
    ) -> PoolResult<BatchResult> {
        self.run_into(BatchResult::new(kind, block_index, operator_id), items)
            .await
    }

    async fn run_into(
        &self,
        mut result: BatchResult,
        items: Vec<BatchItem>,
    ) -> PoolResult<BatchResult> {
        let (kind, block_index, operator_id) =
            (result.kind, result.block_index, result.operator_id);
        let mut claims = Claims::new(self.in_flight.clone());
        let items = self.claim_items(&mut claims, &mut result, items).await?;
        if items.is_empty() {
            debug!(%kind, block_index, operator_id, "Nothing to submit");
            return Ok(result);
        }
        info!(
            %kind,
            block_index,
            operator_id,
            farmers = items.len(),
            "Starting batch"
        );

        for (n, window) in items.chunks(self.window_size).enumerate() {
            if n > 0 {
                tokio::time::sleep(self.window_pause).await;
            }
            let handles = window.iter().map(|item| {
                let submitter = self.submitter.clone();
                let item = item.clone();
                tokio::spawn(async move { execute(&submitter, block_index, item).await })
            });
            let outcomes = join_all(handles).await;

            let mut persist_error = None;
            for (item, joined) in window.iter().zip(outcomes) {
                let outcome = joined.unwrap_or_else(|e| SubmissionOutcome::Terminal {
                    error: format!("submission task failed: {e}"),
                });
                if let Err(e) = self
                    .record(&mut result, block_index, operator_id, item, outcome)
                    .await
                {
                    error!(
                        %kind,
                        block_index,
                        farmer_id = item.farmer.id(),
                        "Failed to record outcome: {}", e
                    );
                    persist_error.get_or_insert(e);
                }
            }
            if let Some(e) = persist_error {
                return Err(e.into());
            }
        }

        self.ledger
            .record_phase_completion(
                block_index,
                operator_id,
                kind,
                result.succeeded.len() as u32,
            )
            .await?;
        info!(
            %kind,
            block_index,
            operator_id,
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            not_ready = result.not_ready.len(),
            total = %result.total_amount,
            "Batch finished"
        );
        Ok(result)
    }

    /// Keeps the items no other batch is submitting and that have not
    /// succeeded in the meantime.
    async fn claim_items(
        &self,
        claims: &mut Claims,
        result: &mut BatchResult,
        items: Vec<BatchItem>,
    ) -> PoolResult<Vec<BatchItem>> {
        let mut claimed = Vec::with_capacity(items.len());
        for item in items {
            let kind = item.action.kind();
            let farmer_id = item.farmer.id();
            if !claims.claim((kind, result.block_index, farmer_id)) {
                debug!(%kind, farmer_id, block_index = result.block_index, "Already in flight");
                result.skipped.push(farmer_id);
                continue;
            }
            if self
                .ledger
                .successful_entry(kind, result.block_index, farmer_id)
                .await?
                .is_some()
            {
                result.skipped.push(farmer_id);
                continue;
            }
            claimed.push(item);
        }
        Ok(claimed)
    }

    async fn record(
        &self,
        result: &mut BatchResult,
        block_index: BlockIndex,
        operator_id: OperatorId,
        item: &BatchItem,
        outcome: SubmissionOutcome,
    ) -> Result<(), crate::ledger::LedgerError> {
        let farmer_id = item.farmer.id();
        let kind = item.action.kind();

        if let SubmissionOutcome::NotYetEligible { reason } = &outcome {
            debug!(farmer_id, block_index, "Harvest not ready: {}", reason);
            result.not_ready.push(FarmerOutcome {
                farmer_id,
                amount: 0,
                tx_hash: None,
                error: Some(reason.clone()),
            });
            return Ok(());
        }

        let amount = match (&item.action, outcome.is_success()) {
            (BatchAction::Harvest, true) => outcome.returned_amount().unwrap_or(0),
            (action, _) => action.amount(),
        };
        let entry = NewLedgerEntry {
            phase: kind,
            block_index,
            farmer_id,
            operator_id,
            amount,
            tx_hash: outcome.tx_hash().map(str::to_string),
            error: if outcome.is_success() {
                None
            } else {
                outcome.error().map(str::to_string)
            },
            status: if outcome.is_success() {
                EntryStatus::Success
            } else {
                EntryStatus::Failed
            },
        };
        let recorded = match kind {
            OperationKind::Plant => self.ledger.record_planting(entry).await?,
            OperationKind::Work => self.ledger.record_work(entry).await?,
            OperationKind::Harvest => self.ledger.record_harvest(entry).await?,
        };

        let Some(row) = recorded else {
            debug!(%kind, farmer_id, block_index, "Already recorded as successful");
            result.skipped.push(farmer_id);
            return Ok(());
        };
        let farmer_outcome = FarmerOutcome {
            farmer_id,
            amount: row.amount,
            tx_hash: row.tx_hash,
            error: row.error,
        };
        if row.status == EntryStatus::Success {
            result.total_amount += farmer_outcome.amount;
            result.succeeded.push(farmer_outcome);
        } else {
            warn!(
                %kind,
                farmer_id,
                block_index,
                "Submission failed: {}",
                farmer_outcome.error.as_deref().unwrap_or("unknown error")
            );
            result.failed.push(farmer_outcome);
        }
        Ok(())
    }
}

async fn execute(
    submitter: &TransactionSubmitter,
    block_index: BlockIndex,
    item: BatchItem,
) -> SubmissionOutcome {
    let account = match Account::from_farmer(&item.farmer.farmer) {
        Ok(account) => account,
        Err(e) => {
            return SubmissionOutcome::Terminal {
                error: e.to_string(),
            }
        }
    };
    match item.action {
        BatchAction::Plant { stake } => submitter.plant(&account, stake).await,
        BatchAction::Work { hash, nonce, .. } => submitter.work(&account, &hash, nonce).await,
        BatchAction::Harvest => submitter.harvest(&account, block_index).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ledger::MemoryLedger,
        test_utils::{Harness, FARMER_TOKENS},
        types::FarmerStatus,
    };

    #[tokio::test(start_paused = true)]
    async fn plant_stakes_share_of_live_balance() {
        let h = Harness::with_farmers(3);
        h.chain.set_token_balance(&h.address(2), 2_000);
        let result = h.coordinator.process_plant_request(100, 1, 10).await.unwrap();

        assert_eq!(result.succeeded.len(), 3);
        let stake_2 = result.succeeded.iter().find(|o| o.farmer_id == 2).unwrap().amount;
        // 50% stake in the fixture contracts
        assert_eq!(stake_2, 1_000);
        assert_eq!(result.total_amount, FARMER_TOKENS / 2 * 2 + 1_000);
        assert_eq!(h.ledger.farmer(2).unwrap().unwrap().balance, 2_000);

        let op = h.ledger.block_operation(100, 1).await.unwrap().unwrap();
        assert_eq!(op.plant_count, 3);
        assert!(op.plant_completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unfunded_wallets_are_deferred_not_dropped() {
        let h = Harness::with_farmers(2);
        h.chain.set_unfunded(&h.address(1));
        let result = h.coordinator.process_plant_request(100, 1, 10).await.unwrap();
        assert_eq!(result.deferred, vec![1]);
        assert_eq!(result.succeeded_ids(), vec![2]);
        let marked: Vec<_> = h
            .ledger
            .entries(OperationKind::Plant)
            .unwrap()
            .into_iter()
            .filter(|e| e.status == EntryStatus::PendingRetry)
            .collect();
        assert_eq!(marked.len(), 1);
        assert_eq!((marked[0].farmer_id, marked[0].block_index), (1, 100));

        h.chain.set_token_balance(&h.address(1), 500);
        let again = h.coordinator.process_plant_request(100, 1, 10).await.unwrap();
        assert_eq!(again.succeeded_ids(), vec![1]);
        assert_eq!(again.skipped, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_balance_fails_instead_of_clamping() {
        let h = Harness::with_farmers(2);
        h.chain.set_token_balance(&h.address(1), i128::MAX);
        let result = h.coordinator.process_plant_request(100, 1, 10).await.unwrap();
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].farmer_id, 1);
        assert_eq!(result.succeeded_ids(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn balance_failure_falls_back_to_cached_balance() {
        let h = Harness::with_farmers(1);
        h.chain.fail_balance(&h.address(1));
        h.ledger.update_farmer_balance(1, 600).await.unwrap();
        let result = h.coordinator.process_plant_request(100, 1, 10).await.unwrap();
        assert_eq!(result.succeeded[0].amount, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_limits_plantings() {
        let h = Harness::with_farmers(4);
        let result = h.coordinator.process_plant_request(100, 1, 3).await.unwrap();
        assert_eq!(result.succeeded.len(), 3);
        assert_eq!(result.deferred, vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn windows_bound_parallelism() {
        let h = Harness::with_farmers(25);
        h.chain.set_latency(Duration::from_millis(100));
        let result = h.coordinator.process_plant_request(100, 1, 25).await.unwrap();
        assert_eq!(result.succeeded.len(), 25);
        assert!(h.chain.max_in_flight() <= 10, "{}", h.chain.max_in_flight());
        assert!(h.chain.max_in_flight() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_farmer_does_not_abort_window() {
        let h = Harness::with_farmers(5);
        h.coordinator.process_plant_request(100, 1, 10).await.unwrap();
        h.chain.panic_for(&h.address(3));

        let submissions = (1..=5)
            .map(|farmer_id| WorkSubmission {
                farmer_id,
                hash: "0000abcd".into(),
                nonce: farmer_id * 7,
            })
            .collect();
        let result = h
            .coordinator
            .process_work_request(100, 1, submissions)
            .await
            .unwrap();
        assert_eq!(result.succeeded.len(), 4);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].farmer_id, 3);
        assert_eq!(h.ledger.entries(OperationKind::Work).unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn work_requires_planting_and_runs_once() {
        let h = Harness::with_farmers(2);
        let submit = |farmer_id| WorkSubmission {
            farmer_id,
            hash: "00ff".into(),
            nonce: 1,
        };
        h.coordinator
            .run(
                OperationKind::Plant,
                100,
                1,
                vec![BatchItem {
                    farmer: h.enrolled(1).await,
                    action: BatchAction::Plant { stake: 40 },
                }],
            )
            .await
            .unwrap();

        let result = h
            .coordinator
            .process_work_request(100, 1, vec![submit(1), submit(2), submit(1)])
            .await
            .unwrap();
        assert_eq!(result.succeeded_ids(), vec![1]);
        assert_eq!(result.succeeded[0].amount, 40);
        assert_eq!(result.skipped, vec![2, 1]);

        let again = h
            .coordinator
            .process_work_request(100, 1, vec![submit(1)])
            .await
            .unwrap();
        assert!(again.succeeded.is_empty());
        assert_eq!(again.skipped, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_harvest_writes_no_row() {
        let h = Harness::with_farmers(2);
        h.plant_and_work(100, &[1, 2]).await;
        h.chain
            .fail_simulation_for(&h.address(2), "harvest", "Error(Contract, #13)");
        h.chain.set_result("harvest", serde_json::json!({ "i128": "250" }));

        let result = h.coordinator.process_harvest_request(100, 1).await.unwrap();
        assert_eq!(result.succeeded_ids(), vec![1]);
        assert_eq!(result.total_amount, 250);
        assert_eq!(result.not_ready.len(), 1);
        assert!(result.failed.is_empty());
        assert_eq!(h.ledger.entries(OperationKind::Harvest).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_outage_fails_loudly() {
        let h = Harness::with_farmers(1);
        let ledger: &MemoryLedger = &h.ledger;
        ledger.set_unavailable(true);
        assert!(h.coordinator.process_plant_request(100, 1, 10).await.is_err());
        ledger.set_unavailable(false);
        assert_eq!(
            h.ledger.farmer(1).unwrap().unwrap().status,
            FarmerStatus::Active
        );
    }
}

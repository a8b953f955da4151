//! ## Exit Payout Orchestrator
//!
//! Drives one [`ExitSplit`] through
//! `processing -> completed | failed -> (retry) processing -> ...`.
//!
//! The farmer, operator and platform legs are sent in that order as separate
//! transfers from the farmer's custodial wallet. Each leg's hash is persisted
//! as soon as the relay accepts it, and a leg that already carries a hash is
//! never sent again, so retries only pick up the missing legs. A wallet that
//! cannot cover the outstanding legs fails the exit for good.
//!
//! Every path that touches a record (payout, manual retry, scheduled retry,
//! cancel) first claims its id; a second caller on a claimed exit is turned
//! away instead of sending the legs again.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::Backoff,
    chain::ChainClient,
    config::{ExitConfig, PlatformConfig},
    error::{FarmPoolError, PoolResult},
    ledger::Ledger,
    status,
    submission::{Account, SubmissionOutcome, TransactionSubmitter},
    task_queue::{TaskKey, TaskQueue},
    types::{
        unix_now, Amount, ContractStatus, ExitId, ExitLeg, ExitSplit, ExitStatus, FarmerId,
        FarmerStatus, PlatformFee, SplitShares,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Completed,
    /// At least one leg failed; another attempt is scheduled.
    RetryScheduled { attempt: u32, delay: Duration },
    /// The exit failed and will not be retried automatically.
    Failed { error: String },
    /// The record is not in a state that allows a payout.
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegResult {
    pub leg: ExitLeg,
    pub amount: Amount,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    /// Zero amount, or already paid by an earlier attempt.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitPayoutResult {
    pub exit_id: ExitId,
    pub outcome: ExitOutcome,
    pub legs: Vec<LegResult>,
    pub retry_count: u32,
}

impl ExitPayoutResult {
    fn without_legs(split: &ExitSplit, outcome: ExitOutcome) -> Self {
        Self {
            exit_id: split.id,
            outcome,
            legs: Vec::new(),
            retry_count: split.retry_count,
        }
    }
}

type InFlight = Arc<StdMutex<HashSet<ExitId>>>;

/// Exclusive hold on one exit record, released on drop.
struct ExitClaim {
    exit_id: ExitId,
    in_flight: InFlight,
}

impl Drop for ExitClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.exit_id);
    }
}

pub struct ExitOrchestrator {
    in_flight: InFlight,
    ledger: Arc<dyn Ledger>,
    chain: Arc<dyn ChainClient>,
    submitter: Arc<TransactionSubmitter>,
    queue: Arc<TaskQueue>,
    platform: PlatformConfig,
    max_retries: u32,
    backoff: Backoff,
    status: Option<status::Sender>,
}

impl ExitOrchestrator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        chain: Arc<dyn ChainClient>,
        submitter: Arc<TransactionSubmitter>,
        queue: Arc<TaskQueue>,
        platform: PlatformConfig,
        settings: &ExitConfig,
        status: Option<status::Sender>,
    ) -> Self {
        Self {
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
            ledger,
            chain,
            submitter,
            queue,
            platform,
            max_retries: settings.max_retries,
            backoff: settings.backoff(),
            status,
        }
    }

    /// Opens an exit for `farmer_id` over all harvest rewards not paid out yet.
    /// Refused while any successful work of the farmer is still unharvested.
    pub async fn open_exit(&self, farmer_id: FarmerId) -> PoolResult<ExitSplit> {
        let enrolled = self
            .ledger
            .enrolled_farmer(farmer_id)
            .await?
            .ok_or(FarmPoolError::FarmerNotFound(farmer_id))?;
        if enrolled.farmer.status == FarmerStatus::Exiting {
            return Err(FarmPoolError::InvalidState(format!(
                "farmer {farmer_id} already has an exit in progress"
            )));
        }
        let operator_id = enrolled.operator_id().ok_or_else(|| {
            FarmPoolError::InvalidState(format!("farmer {farmer_id} is not in a pool"))
        })?;

        let unharvested = self.ledger.unharvested_work(farmer_id).await?;
        if !unharvested.is_empty() {
            let blocks: Vec<_> = unharvested.iter().map(|w| w.block_index).collect();
            return Err(FarmPoolError::InvalidState(format!(
                "farmer {farmer_id} still has unharvested work on blocks {blocks:?}"
            )));
        }

        let harvests = self.ledger.unexited_harvests(farmer_id).await?;
        if harvests.is_empty() {
            return Err(FarmPoolError::InvalidState(format!(
                "farmer {farmer_id} has no harvested rewards to pay out"
            )));
        }
        let total: Amount = harvests.iter().map(|h| h.amount).sum();
        let (split_bps, fee_bps) = match &enrolled.contract {
            Some(contract) => (contract.reward_split_bps, contract.platform_fee_bps),
            None => (
                self.platform.default_reward_split_bps,
                self.platform.default_platform_fee_bps,
            ),
        };
        let Some(shares) = SplitShares::compute(total, split_bps, fee_bps) else {
            error!(farmer_id, total = %total, "Exit split overflowed");
            return Err(FarmPoolError::InvalidState(format!(
                "rewards of farmer {farmer_id} are too large to split"
            )));
        };

        if let Some(contract) = &enrolled.contract {
            self.ledger
                .set_contract_status(contract.id, ContractStatus::Exiting)
                .await?;
        }
        self.ledger
            .set_farmer_status(farmer_id, FarmerStatus::Exiting)
            .await?;
        let split = self
            .ledger
            .create_exit_record(ExitSplit::new(
                farmer_id,
                operator_id,
                enrolled.contract.as_ref().map(|c| c.id),
                total,
                shares,
                harvests.iter().map(|h| h.id).collect(),
            ))
            .await?;
        info!(
            exit_id = split.id,
            farmer_id,
            total = %total,
            farmer_share = %split.farmer_share,
            operator_share = %split.operator_share,
            platform_fee = %split.platform_fee,
            "Exit opened"
        );
        Ok(split)
    }

    fn claim(&self, exit_id: ExitId) -> Option<ExitClaim> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(exit_id)
            .then(|| ExitClaim {
                exit_id,
                in_flight: self.in_flight.clone(),
            })
    }

    async fn busy(&self, exit_id: ExitId) -> PoolResult<ExitPayoutResult> {
        let split = self.load(exit_id).await?;
        debug!(exit_id, "Exit payout already in progress");
        Ok(ExitPayoutResult::without_legs(
            &split,
            ExitOutcome::Rejected {
                reason: format!("exit {exit_id} payout already in progress"),
            },
        ))
    }

    /// Pays out a `processing` exit.
    pub async fn execute_exit_payout(
        self: &Arc<Self>,
        exit_id: ExitId,
    ) -> PoolResult<ExitPayoutResult> {
        let Some(_claim) = self.claim(exit_id) else {
            return self.busy(exit_id).await;
        };
        self.pay(exit_id).await
    }

    async fn pay(self: &Arc<Self>, exit_id: ExitId) -> PoolResult<ExitPayoutResult> {
        let mut split = self.load(exit_id).await?;
        if split.status != ExitStatus::Processing {
            return Ok(ExitPayoutResult::without_legs(
                &split,
                ExitOutcome::Rejected {
                    reason: format!("exit {exit_id} is {}", split.status),
                },
            ));
        }
        let farmer = self
            .ledger
            .enrolled_farmer(split.farmer_id)
            .await?
            .ok_or(FarmPoolError::FarmerNotFound(split.farmer_id))?
            .farmer;
        let operator = self.ledger.operator(split.operator_id).await?.ok_or_else(|| {
            FarmPoolError::InvalidState(format!("operator {} not found", split.operator_id))
        })?;

        let account = match Account::from_farmer(&farmer) {
            Ok(account) => account,
            Err(e) => return self.fail_terminally(split, e.to_string()).await,
        };

        let outstanding = split.outstanding();
        match self.chain.balance(&account.address).await {
            Ok(balance) if balance.token < outstanding => {
                let error = format!(
                    "insufficient custodial balance: {} available, {} required",
                    balance.token, outstanding
                );
                return self.fail_terminally(split, error).await;
            }
            Ok(_) => {}
            Err(e) => {
                let error = format!("balance lookup failed: {e}");
                return self.fail_with_retry(split, vec![error], Vec::new()).await;
            }
        }

        let mut legs = Vec::with_capacity(ExitLeg::ORDER.len());
        let mut errors = Vec::new();
        for leg in ExitLeg::ORDER {
            let amount = split.amount(leg);
            if !split.leg_pending(leg) {
                legs.push(LegResult {
                    leg,
                    amount,
                    tx_hash: split.tx_hash(leg).map(str::to_string),
                    error: None,
                    skipped: true,
                });
                continue;
            }
            let destination = match leg {
                ExitLeg::Farmer => farmer.payout_wallet.as_str(),
                ExitLeg::Operator => operator.payout_wallet.as_str(),
                ExitLeg::Platform => self.platform.payout_wallet.as_str(),
            };
            match self.submitter.transfer(&account, destination, amount).await {
                SubmissionOutcome::Confirmed { tx_hash, .. } => {
                    split.set_tx_hash(leg, tx_hash.clone());
                    self.ledger.update_exit_record(&split).await?;
                    debug!(exit_id, %leg, tx_hash = %tx_hash, "Exit leg paid");
                    legs.push(LegResult {
                        leg,
                        amount,
                        tx_hash: Some(tx_hash),
                        error: None,
                        skipped: false,
                    });
                }
                outcome => {
                    let error = outcome.error().unwrap_or("transfer failed").to_string();
                    warn!(exit_id, %leg, "Exit leg failed: {}", error);
                    errors.push(format!("{leg} leg: {error}"));
                    legs.push(LegResult {
                        leg,
                        amount,
                        tx_hash: None,
                        error: Some(error),
                        skipped: false,
                    });
                }
            }
        }

        if errors.is_empty() {
            self.complete(split, legs).await
        } else {
            self.fail_with_retry(split, errors, legs).await
        }
    }

    /// Forces one more attempt on a `failed` exit, even past the retry cap.
    pub async fn retry_failed_exit(
        self: &Arc<Self>,
        exit_id: ExitId,
    ) -> PoolResult<ExitPayoutResult> {
        let Some(_claim) = self.claim(exit_id) else {
            return self.busy(exit_id).await;
        };
        let mut split = self.load(exit_id).await?;
        if split.status != ExitStatus::Failed {
            return Ok(ExitPayoutResult::without_legs(
                &split,
                ExitOutcome::Rejected {
                    reason: format!(
                        "only failed exits can be retried, exit {exit_id} is {}",
                        split.status
                    ),
                },
            ));
        }
        self.queue.cancel(&TaskKey::ExitRetry(exit_id));
        info!(exit_id, retry_count = split.retry_count, "Manual exit retry");
        split.status = ExitStatus::Processing;
        split.next_retry_at = None;
        self.ledger.update_exit_record(&split).await?;
        self.pay(exit_id).await
    }

    /// Cancels a `processing` or `failed` exit and drops its scheduled retry.
    ///
    /// When no leg has been paid the farmer and its contract go back to active;
    /// otherwise they stay `exiting` for manual settlement.
    pub async fn cancel_exit(&self, exit_id: ExitId) -> PoolResult<ExitSplit> {
        let Some(_claim) = self.claim(exit_id) else {
            return Err(FarmPoolError::InvalidState(format!(
                "exit {exit_id} is being paid out and cannot be cancelled"
            )));
        };
        let mut split = self.load(exit_id).await?;
        if !matches!(split.status, ExitStatus::Processing | ExitStatus::Failed) {
            return Err(FarmPoolError::InvalidState(format!(
                "exit {exit_id} is {} and cannot be cancelled",
                split.status
            )));
        }
        self.queue.cancel(&TaskKey::ExitRetry(exit_id));
        split.status = ExitStatus::Cancelled;
        split.next_retry_at = None;
        self.ledger.update_exit_record(&split).await?;

        let nothing_paid = ExitLeg::ORDER.iter().all(|leg| split.tx_hash(*leg).is_none());
        if nothing_paid {
            if let Some(contract_id) = split.contract_id {
                self.ledger
                    .set_contract_status(contract_id, ContractStatus::Active)
                    .await?;
            }
            self.ledger
                .set_farmer_status(split.farmer_id, FarmerStatus::Active)
                .await?;
        } else {
            warn!(
                exit_id,
                farmer_id = split.farmer_id,
                "Cancelled exit had paid legs, farmer left exiting"
            );
        }
        info!(exit_id, "Exit cancelled");
        Ok(split)
    }

    /// Re-arms exits left over by a previous run: interrupted `processing`
    /// exits right away, `failed` ones at their persisted due time.
    pub async fn restore_pending(self: &Arc<Self>) -> PoolResult<usize> {
        let exits = self.ledger.resumable_exits().await?;
        let now = unix_now();
        for split in &exits {
            let delay = match (split.status, split.next_retry_at) {
                (ExitStatus::Failed, Some(due)) => Duration::from_secs(due.saturating_sub(now)),
                _ => Duration::ZERO,
            };
            info!(exit_id = split.id, status = %split.status, ?delay, "Restoring exit");
            self.schedule_retry(split.id, delay);
        }
        Ok(exits.len())
    }

    fn schedule_retry(self: &Arc<Self>, exit_id: ExitId, delay: Duration) {
        let this = self.clone();
        self.queue
            .schedule_in(TaskKey::ExitRetry(exit_id), delay, async move {
                if let Err(e) = this.run_scheduled(exit_id).await {
                    error!(exit_id, "Scheduled exit payout failed: {}", e);
                    if let Some(status) = &this.status {
                        status::handle_error(status, e).await;
                    }
                }
            });
    }

    async fn run_scheduled(self: &Arc<Self>, exit_id: ExitId) -> PoolResult<()> {
        let Some(_claim) = self.claim(exit_id) else {
            debug!(exit_id, "Exit payout already in progress, scheduled retry skipped");
            return Ok(());
        };
        let mut split = self.load(exit_id).await?;
        match split.status {
            ExitStatus::Failed => {
                split.status = ExitStatus::Processing;
                split.next_retry_at = None;
                self.ledger.update_exit_record(&split).await?;
            }
            ExitStatus::Processing => {}
            status => {
                debug!(exit_id, %status, "Scheduled retry no longer applies");
                return Ok(());
            }
        }
        let result = self.pay(exit_id).await?;
        debug!(exit_id, outcome = ?result.outcome, "Scheduled exit payout ran");
        Ok(())
    }

    async fn load(&self, exit_id: ExitId) -> PoolResult<ExitSplit> {
        self.ledger
            .exit_record(exit_id)
            .await?
            .ok_or(FarmPoolError::ExitNotFound(exit_id))
    }

    async fn complete(
        &self,
        mut split: ExitSplit,
        legs: Vec<LegResult>,
    ) -> PoolResult<ExitPayoutResult> {
        let now = unix_now();
        split.status = ExitStatus::Completed;
        split.error_message = None;
        split.next_retry_at = None;
        split.completed_at = Some(now);
        self.ledger.update_exit_record(&split).await?;

        self.ledger.mark_harvests_exited(&split.harvest_ids).await?;
        if let Some(contract_id) = split.contract_id {
            self.ledger
                .set_contract_status(contract_id, ContractStatus::Completed)
                .await?;
        }
        self.ledger.complete_farmer_exit(split.farmer_id).await?;
        self.ledger
            .decrement_active_farmers(split.operator_id)
            .await?;
        if split.platform_fee > 0 {
            self.ledger
                .record_platform_fee(PlatformFee {
                    exit_id: split.id,
                    amount: split.platform_fee,
                    tx_hash: split.platform_tx_hash.clone(),
                    collected_at: now,
                })
                .await?;
        }
        self.queue.cancel(&TaskKey::ExitRetry(split.id));
        info!(exit_id = split.id, farmer_id = split.farmer_id, "Exit completed");
        Ok(ExitPayoutResult {
            exit_id: split.id,
            outcome: ExitOutcome::Completed,
            legs,
            retry_count: split.retry_count,
        })
    }

    async fn fail_with_retry(
        self: &Arc<Self>,
        mut split: ExitSplit,
        errors: Vec<String>,
        legs: Vec<LegResult>,
    ) -> PoolResult<ExitPayoutResult> {
        let now = unix_now();
        let error = errors.join("; ");
        split.status = ExitStatus::Failed;
        split.retry_count += 1;
        split.last_retry_at = Some(now);
        split.error_message = Some(error.clone());

        let outcome = if split.retry_count < self.max_retries {
            let delay = self.backoff.delay(split.retry_count);
            split.next_retry_at = Some(now.saturating_add(delay.as_secs()));
            self.ledger.update_exit_record(&split).await?;
            self.schedule_retry(split.id, delay);
            warn!(
                exit_id = split.id,
                attempt = split.retry_count,
                ?delay,
                "Exit payout failed, retry scheduled: {}",
                error
            );
            ExitOutcome::RetryScheduled {
                attempt: split.retry_count,
                delay,
            }
        } else {
            split.next_retry_at = None;
            self.ledger.update_exit_record(&split).await?;
            error!(
                exit_id = split.id,
                retries = split.retry_count,
                "Exit payout failed, retries exhausted: {}",
                error
            );
            ExitOutcome::Failed { error }
        };
        Ok(ExitPayoutResult {
            exit_id: split.id,
            outcome,
            legs,
            retry_count: split.retry_count,
        })
    }

    async fn fail_terminally(
        &self,
        mut split: ExitSplit,
        error: String,
    ) -> PoolResult<ExitPayoutResult> {
        error!(exit_id = split.id, "Exit payout cannot proceed: {}", error);
        split.status = ExitStatus::Failed;
        split.last_retry_at = Some(unix_now());
        split.next_retry_at = None;
        split.error_message = Some(error.clone());
        self.ledger.update_exit_record(&split).await?;
        Ok(ExitPayoutResult::without_legs(
            &split,
            ExitOutcome::Failed { error },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;

    #[tokio::test(start_paused = true)]
    async fn open_exit_splits_unexited_rewards() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[600_000, 400_000]).await;
        let split = h.exits.open_exit(1).await.unwrap();
        assert_eq!(split.total_rewards, 1_000_000);
        assert_eq!(split.farmer_share, 800_000);
        assert_eq!(split.platform_fee, 50_000);
        assert_eq!(split.operator_share, 150_000);
        assert_eq!(split.harvest_ids.len(), 2);
        assert_eq!(split.status, ExitStatus::Processing);
        assert_eq!(
            h.ledger.contract(1).unwrap().unwrap().status,
            ContractStatus::Exiting
        );
        assert!(h.exits.open_exit(1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn exit_needs_harvests() {
        let h = Harness::with_farmers(1);
        assert!(matches!(
            h.exits.open_exit(1).await,
            Err(FarmPoolError::InvalidState(_))
        ));
        assert!(matches!(
            h.exits.open_exit(42).await,
            Err(FarmPoolError::FarmerNotFound(42))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exit_waits_for_outstanding_harvests() {
        let h = Harness::with_farmers(1);
        h.plant_and_work(100, &[1]).await;
        h.ledger.record_block_discovered(101).await.unwrap();
        match h.exits.open_exit(1).await {
            Err(FarmPoolError::InvalidState(e)) => assert!(e.contains("[100]"), "{e}"),
            other => panic!("expected a refusal, got {other:?}"),
        }
        assert_eq!(h.ledger.farmer(1).unwrap().unwrap().status, FarmerStatus::Active);

        h.coordinator.process_harvest_request(100, 1).await.unwrap();
        assert!(h.ledger.unharvested_work(1).await.unwrap().is_empty());
        let split = h.exits.open_exit(1).await.unwrap();
        assert_eq!(split.harvest_ids.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_payout_settles_everything() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[1_000_000]).await;
        let split = h.exits.open_exit(1).await.unwrap();

        let result = h.exits.execute_exit_payout(split.id).await.unwrap();
        assert_eq!(result.outcome, ExitOutcome::Completed);
        assert_eq!(h.relay.submitted().len(), 3);

        let stored = h.ledger.exit_record(split.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExitStatus::Completed);
        assert!(stored.completed_at.is_some());
        assert!(ExitLeg::ORDER.iter().all(|l| stored.tx_hash(*l).is_some()));
        assert!(h.ledger.unexited_harvests(1).await.unwrap().is_empty());
        assert_eq!(
            h.ledger.contract(1).unwrap().unwrap().status,
            ContractStatus::Completed
        );
        let farmer = h.ledger.farmer(1).unwrap().unwrap();
        assert_eq!(farmer.status, FarmerStatus::Inactive);
        assert_eq!(farmer.exit_count, 1);
        assert_eq!(h.ledger.operator(1).await.unwrap().unwrap().active_farmers, 0);
        assert_eq!(h.ledger.platform_fees().unwrap()[0].amount, 50_000);

        let again = h.exits.execute_exit_payout(split.id).await.unwrap();
        assert!(matches!(again.outcome, ExitOutcome::Rejected { .. }));
        assert_eq!(h.relay.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn insufficient_balance_is_terminal() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[1_000_000]).await;
        h.chain.set_token_balance(&h.address(1), 999_999);
        let split = h.exits.open_exit(1).await.unwrap();

        let result = h.exits.execute_exit_payout(split.id).await.unwrap();
        assert!(matches!(result.outcome, ExitOutcome::Failed { .. }));
        let stored = h.ledger.exit_record(split.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExitStatus::Failed);
        assert_eq!(stored.next_retry_at, None);
        assert!(h.relay.submitted().is_empty());
        assert!(!h.queue.is_pending(&TaskKey::ExitRetry(split.id)));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_legs_are_skipped() {
        let h = Harness::with_farmers(1);
        h.set_split(1, 10_000, 0);
        h.seed_harvests(1, &[500]).await;
        let split = h.exits.open_exit(1).await.unwrap();
        let result = h.exits.execute_exit_payout(split.id).await.unwrap();
        assert_eq!(result.outcome, ExitOutcome::Completed);
        assert_eq!(h.relay.submitted().len(), 1);
        assert!(result.legs[1].skipped && result.legs[2].skipped);
        assert!(h.ledger.platform_fees().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_grow_until_cap_then_stop() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[1_000]).await;
        h.chain.fail_simulation("transfer", "Error(Contract, #3)");
        let split = h.exits.open_exit(1).await.unwrap();

        let first = h.exits.execute_exit_payout(split.id).await.unwrap();
        let mut delays = vec![];
        if let ExitOutcome::RetryScheduled { delay, .. } = first.outcome {
            delays.push(delay);
        }
        // default: 5 retries, 30s base
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(60 * 60)).await;
        }
        let stored = h.ledger.exit_record(split.id).await.unwrap().unwrap();
        assert_eq!(stored.retry_count, 5);
        assert_eq!(stored.status, ExitStatus::Failed);
        assert_eq!(stored.next_retry_at, None);
        assert!(!h.queue.is_pending(&TaskKey::ExitRetry(split.id)));
        assert_eq!(delays, vec![Duration::from_secs(30)]);

        let backoff = ExitConfig::default().backoff();
        let growth: Vec<_> = (1..5).map(|n| backoff.delay(n)).collect();
        assert!(growth.windows(2).all(|w| w[1] > w[0]));

        h.chain.clear_simulation_failure("transfer");
        let forced = h.exits.retry_failed_exit(split.id).await.unwrap();
        assert_eq!(forced.outcome, ExitOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_scheduled_retry() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[1_000]).await;
        h.relay.push_response(500, "down");
        h.relay.push_response(500, "down");
        h.relay.push_response(500, "down");
        let split = h.exits.open_exit(1).await.unwrap();
        let result = h.exits.execute_exit_payout(split.id).await.unwrap();
        assert!(matches!(result.outcome, ExitOutcome::RetryScheduled { .. }));
        assert!(h.queue.is_pending(&TaskKey::ExitRetry(split.id)));

        let cancelled = h.exits.cancel_exit(split.id).await.unwrap();
        assert_eq!(cancelled.status, ExitStatus::Cancelled);
        assert!(!h.queue.is_pending(&TaskKey::ExitRetry(split.id)));
        assert_eq!(h.ledger.farmer(1).unwrap().unwrap().status, FarmerStatus::Active);
        assert!(h.exits.cancel_exit(split.id).await.is_err());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(h.relay.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_payouts_send_each_leg_once() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[1_000_000]).await;
        h.chain.set_latency(Duration::from_millis(100));
        let split = h.exits.open_exit(1).await.unwrap();

        let (a, b) = tokio::join!(
            h.exits.execute_exit_payout(split.id),
            h.exits.execute_exit_payout(split.id),
        );
        let mut outcomes = vec![a.unwrap().outcome, b.unwrap().outcome];
        outcomes.retain(|o| *o != ExitOutcome::Completed);
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], ExitOutcome::Rejected { .. }));

        assert_eq!(h.relay.submitted().len(), 3);
        assert_eq!(h.ledger.platform_fees().unwrap().len(), 1);
        assert_eq!(h.ledger.farmer(1).unwrap().unwrap().exit_count, 1);
        assert!(h.exits.cancel_exit(split.id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_refused_while_a_payout_runs() {
        let h = Harness::with_farmers(1);
        h.seed_harvests(1, &[1_000_000]).await;
        h.chain.set_latency(Duration::from_millis(100));
        let split = h.exits.open_exit(1).await.unwrap();

        let (paid, cancelled) = tokio::join!(h.exits.execute_exit_payout(split.id), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.exits.cancel_exit(split.id).await
        });
        assert_eq!(paid.unwrap().outcome, ExitOutcome::Completed);
        assert!(matches!(cancelled, Err(FarmPoolError::InvalidState(_))));
    }
}

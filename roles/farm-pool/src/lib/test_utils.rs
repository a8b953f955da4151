//! Fixtures shared by the unit tests: scripted chain and relay fakes, record
//! builders and a [`Harness`] wiring every component around a [`MemoryLedger`].

use async_trait::async_trait;
use farm_rpc::{ContractCall, RelayResponse, RpcError, SimulateResponse};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use crate::{
    chain::{ChainClient, Relay, WalletBalance},
    config::{ChainConfig, FarmPoolConfig, PlatformConfig, RelayConfig},
    coordinator::{BatchAction, BatchCoordinator, BatchItem, WorkSubmission},
    exit::ExitOrchestrator,
    harvest_scheduler::HarvestScheduler,
    ledger::{Ledger, MemoryLedger},
    service::FarmPoolService,
    signer::CustodialKey,
    submission::{Account, TransactionSubmitter},
    task_queue::TaskQueue,
    types::{
        unix_now, Amount, BlockIndex, ContractId, ContractStatus, EnrolledFarmer, EntryStatus,
        Farmer, FarmerId, FarmerStatus, NewLedgerEntry, OperationKind, OperatorId, PoolContract,
        PoolOperator,
    },
};

/// Token balance every fake custodial wallet starts with.
pub const FARMER_TOKENS: Amount = 10_000_000;
/// Stake used by [`Harness::plant_and_work`].
pub const PLANT_STAKE: Amount = 1_000;

pub const OPERATOR_ID: OperatorId = 1;
pub const PLATFORM_WALLET: &str = "GPLATFORM";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn seed_hex(id: u64) -> String {
    let mut seed = [7u8; 32];
    seed[..8].copy_from_slice(&id.to_le_bytes());
    hex::encode(seed)
}

/// Custodial address of the fixture wallet `id`.
pub fn address(id: u64) -> String {
    CustodialKey::from_hex(&seed_hex(id))
        .unwrap()
        .public_key_hex()
}

pub fn account(id: u64) -> Account {
    Account {
        address: address(id),
        key: CustodialKey::from_hex(&seed_hex(id)).unwrap(),
    }
}

pub fn farmer(id: FarmerId, status: FarmerStatus, operator_id: Option<OperatorId>) -> Farmer {
    Farmer {
        id,
        custodial_public_key: address(id),
        custodial_secret_key: seed_hex(id),
        payout_wallet: format!("GFARMER{id}"),
        balance: 0,
        stake_percentage_bps: 5000,
        status,
        operator_id,
        exit_count: 0,
    }
}

pub fn contract(
    id: ContractId,
    farmer_id: FarmerId,
    operator_id: OperatorId,
    status: ContractStatus,
) -> PoolContract {
    PoolContract {
        id,
        farmer_id,
        operator_id,
        stake_percentage_bps: 5000,
        harvest_interval: 1,
        reward_split_bps: 8000,
        platform_fee_bps: 500,
        status,
        created_at: unix_now(),
    }
}

pub fn operator(id: OperatorId) -> PoolOperator {
    PoolOperator {
        id,
        payout_wallet: format!("GOPERATOR{id}"),
        active_farmers: 0,
    }
}

pub fn entry(
    phase: OperationKind,
    block_index: BlockIndex,
    farmer_id: FarmerId,
    operator_id: OperatorId,
    status: EntryStatus,
) -> NewLedgerEntry {
    let success = status == EntryStatus::Success;
    NewLedgerEntry {
        phase,
        block_index,
        farmer_id,
        operator_id,
        amount: 100,
        tx_hash: success.then(|| format!("tx-{phase}-{block_index}-{farmer_id}")),
        error: (!success).then(|| "scripted failure".to_string()),
        status,
    }
}

#[derive(Default)]
struct ChainScript {
    balances: HashMap<String, WalletBalance>,
    failing_balances: HashSet<String>,
    panicking: HashSet<String>,
    simulation_failures: HashMap<String, String>,
    account_failures: HashMap<(String, String), String>,
    results: HashMap<String, Value>,
    farm_index: BlockIndex,
    farm_index_fails: bool,
    latency: Duration,
}

/// Scripted [`ChainClient`]. Unknown wallets are funded with [`FARMER_TOKENS`].
#[derive(Default)]
pub struct FakeChain {
    script: Mutex<ChainScript>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    pub fn set_token_balance(&self, account: &str, token: Amount) {
        lock(&self.script).balances.insert(
            account.to_string(),
            WalletBalance {
                native: 100,
                token,
                account_exists: true,
            },
        );
    }

    pub fn set_unfunded(&self, account: &str) {
        lock(&self.script).balances.insert(
            account.to_string(),
            WalletBalance {
                native: 0,
                token: 0,
                account_exists: false,
            },
        );
    }

    pub fn fail_balance(&self, account: &str) {
        lock(&self.script)
            .failing_balances
            .insert(account.to_string());
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.script).latency = latency;
    }

    /// Highest number of concurrent chain calls seen so far.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Simulations for `account` panic.
    pub fn panic_for(&self, account: &str) {
        lock(&self.script).panicking.insert(account.to_string());
    }

    /// Every simulation of `function` reports `error` until cleared.
    pub fn fail_simulation(&self, function: &str, error: &str) {
        lock(&self.script)
            .simulation_failures
            .insert(function.to_string(), error.to_string());
    }

    pub fn clear_simulation_failure(&self, function: &str) {
        lock(&self.script).simulation_failures.remove(function);
    }

    pub fn fail_simulation_for(&self, account: &str, function: &str, error: &str) {
        lock(&self.script).account_failures.insert(
            (account.to_string(), function.to_string()),
            error.to_string(),
        );
    }

    /// Return value reported by successful simulations of `function`.
    pub fn set_result(&self, function: &str, result: Value) {
        lock(&self.script)
            .results
            .insert(function.to_string(), result);
    }

    pub fn set_farm_index(&self, index: BlockIndex) {
        lock(&self.script).farm_index = index;
    }

    pub fn fail_farm_index(&self, fail: bool) {
        lock(&self.script).farm_index_fails = fail;
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn simulate(&self, call: &ContractCall) -> Result<SimulateResponse, RpcError> {
        let _flight = self.enter();
        let (latency, panics, failure, result, ledger) = {
            let script = lock(&self.script);
            let failure = script
                .account_failures
                .get(&(call.source_account.clone(), call.function.clone()))
                .or_else(|| script.simulation_failures.get(&call.function))
                .cloned();
            (
                script.latency,
                script.panicking.contains(&call.source_account),
                failure,
                script.results.get(&call.function).cloned(),
                script.farm_index,
            )
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if panics {
            panic!("scripted panic for {}", call.source_account);
        }
        if let Some(error) = failure {
            return Ok(SimulateResponse {
                error: Some(error),
                latest_ledger: Some(ledger),
                ..Default::default()
            });
        }
        let args = serde_json::to_string(&call.args)
            .map_err(|e| RpcError::Serialization(e.to_string()))?;
        Ok(SimulateResponse {
            transaction: Some(format!(
                "{}:{}:{}:{}",
                call.contract_id, call.function, call.source_account, args
            )),
            auth: vec![format!("auth:{}", call.source_account)],
            result,
            error: None,
            latest_ledger: Some(ledger),
        })
    }

    async fn balance(&self, account: &str) -> Result<WalletBalance, RpcError> {
        let _flight = self.enter();
        let (latency, fails, balance) = {
            let script = lock(&self.script);
            (
                script.latency,
                script.failing_balances.contains(account),
                script.balances.get(account).copied(),
            )
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fails {
            return Err(RpcError::Http("scripted balance failure".to_string()));
        }
        Ok(balance.unwrap_or(WalletBalance {
            native: 100,
            token: FARMER_TOKENS,
            account_exists: true,
        }))
    }

    async fn farm_index(&self) -> Result<BlockIndex, RpcError> {
        let script = lock(&self.script);
        if script.farm_index_fails {
            return Err(RpcError::Http("node unreachable".to_string()));
        }
        Ok(script.farm_index)
    }
}

/// Scripted [`Relay`]. Queued responses are served first, then every blob is
/// accepted with a `tx-N` hash.
#[derive(Default)]
pub struct FakeRelay {
    responses: Mutex<VecDeque<RelayResponse>>,
    submitted: Mutex<Vec<String>>,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, status: u16, body: &str) {
        lock(&self.responses).push_back(RelayResponse {
            status,
            body: body.to_string(),
        });
    }

    /// Every blob received so far, in order.
    pub fn submitted(&self) -> Vec<String> {
        lock(&self.submitted).clone()
    }
}

#[async_trait]
impl Relay for FakeRelay {
    async fn submit(&self, blob: &str) -> Result<RelayResponse, RpcError> {
        let n = {
            let mut submitted = lock(&self.submitted);
            submitted.push(blob.to_string());
            submitted.len()
        };
        Ok(lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| RelayResponse {
                status: 200,
                body: format!(r#"{{"hash":"tx-{n}"}}"#),
            }))
    }
}

pub fn test_config() -> FarmPoolConfig {
    FarmPoolConfig::new(
        ChainConfig {
            rpc_url: "http://127.0.0.1:8000/rpc".to_string(),
            farm_contract: "CFARM".to_string(),
            token_contract: "CTOKEN".to_string(),
            rpc_token: None,
        },
        RelayConfig {
            url: "http://127.0.0.1:8001/submit".to_string(),
            api_key: None,
        },
        PathBuf::from(":memory:"),
        PlatformConfig {
            payout_wallet: PLATFORM_WALLET.to_string(),
            default_reward_split_bps: 8000,
            default_platform_fee_bps: 500,
        },
    )
    .validate()
    .unwrap()
}

/// Every component of the pool around fakes, with default settings.
pub struct Harness {
    pub chain: Arc<FakeChain>,
    pub relay: Arc<FakeRelay>,
    pub ledger: Arc<MemoryLedger>,
    pub queue: Arc<TaskQueue>,
    pub coordinator: Arc<BatchCoordinator>,
    pub scheduler: Arc<HarvestScheduler>,
    pub exits: Arc<ExitOrchestrator>,
}

impl Harness {
    /// Operator 1 with farmers `1..=n`, each enrolled through the contract of
    /// the same id.
    pub fn with_farmers(n: u64) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let mut op = operator(OPERATOR_ID);
        op.active_farmers = n as u32;
        ledger.add_operator(op).unwrap();
        for id in 1..=n {
            ledger
                .add_farmer(farmer(id, FarmerStatus::Active, None))
                .unwrap();
            ledger
                .add_contract(contract(id, id, OPERATOR_ID, ContractStatus::Active))
                .unwrap();
        }
        Self::build(
            Arc::new(FakeChain::new()),
            Arc::new(FakeRelay::new()),
            ledger,
        )
    }

    fn build(chain: Arc<FakeChain>, relay: Arc<FakeRelay>, ledger: Arc<MemoryLedger>) -> Self {
        let config = test_config();
        let queue = Arc::new(TaskQueue::new());
        let submitter = Arc::new(TransactionSubmitter::new(
            chain.clone(),
            relay.clone(),
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
            None,
        ));
        let exits = Arc::new(ExitOrchestrator::new(
            ledger.clone(),
            chain.clone(),
            submitter,
            queue.clone(),
            config.platform().clone(),
            config.exit(),
            None,
        ));
        Self {
            chain,
            relay,
            ledger,
            queue,
            coordinator,
            scheduler,
            exits,
        }
    }

    /// Fresh components over the same ledger, chain and relay, as after a
    /// process restart. Pending tasks of `self` are dropped.
    pub fn restart(&self) -> Self {
        self.queue.abort_all();
        Self::build(self.chain.clone(), self.relay.clone(), self.ledger.clone())
    }

    pub fn service(&self) -> FarmPoolService {
        FarmPoolService::from_parts(
            self.coordinator.clone(),
            self.scheduler.clone(),
            self.exits.clone(),
            self.queue.clone(),
        )
    }

    pub fn address(&self, farmer_id: FarmerId) -> String {
        address(farmer_id)
    }

    pub async fn enrolled(&self, farmer_id: FarmerId) -> EnrolledFarmer {
        self.ledger.enrolled_farmer(farmer_id).await.unwrap().unwrap()
    }

    /// Plants [`PLANT_STAKE`] and submits work on `block_index` for `farmer_ids`.
    pub async fn plant_and_work(&self, block_index: BlockIndex, farmer_ids: &[FarmerId]) {
        let mut items = Vec::with_capacity(farmer_ids.len());
        for id in farmer_ids {
            items.push(BatchItem {
                farmer: self.enrolled(*id).await,
                action: BatchAction::Plant { stake: PLANT_STAKE },
            });
        }
        let planted = self
            .coordinator
            .run(OperationKind::Plant, block_index, OPERATOR_ID, items)
            .await
            .unwrap();
        assert_eq!(planted.succeeded.len(), farmer_ids.len());

        let submissions = farmer_ids
            .iter()
            .map(|&farmer_id| WorkSubmission {
                farmer_id,
                hash: "0000beef".to_string(),
                nonce: farmer_id,
            })
            .collect();
        let worked = self
            .coordinator
            .process_work_request(block_index, OPERATOR_ID, submissions)
            .await
            .unwrap();
        assert_eq!(worked.succeeded.len(), farmer_ids.len());
    }

    fn update_contract(&self, contract_id: ContractId, f: impl FnOnce(&mut PoolContract)) {
        let mut contract = self.ledger.contract(contract_id).unwrap().unwrap();
        f(&mut contract);
        self.ledger.add_contract(contract).unwrap();
    }

    pub fn set_harvest_interval(&self, contract_id: ContractId, blocks: u32) {
        self.update_contract(contract_id, |c| c.harvest_interval = blocks);
    }

    pub fn set_split(&self, contract_id: ContractId, reward_split_bps: u32, platform_fee_bps: u32) {
        self.update_contract(contract_id, |c| {
            c.reward_split_bps = reward_split_bps;
            c.platform_fee_bps = platform_fee_bps;
        });
    }

    /// Appends successful harvest rows, one block per amount.
    pub async fn seed_harvests(&self, farmer_id: FarmerId, amounts: &[Amount]) {
        for (n, amount) in amounts.iter().enumerate() {
            let mut row = entry(
                OperationKind::Harvest,
                1 + n as BlockIndex,
                farmer_id,
                OPERATOR_ID,
                EntryStatus::Success,
            );
            row.amount = *amount;
            self.ledger.record_harvest(row).await.unwrap().unwrap();
        }
    }
}

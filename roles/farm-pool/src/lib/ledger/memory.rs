use async_trait::async_trait;
use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use super::{Ledger, LedgerError, LedgerResult};
use crate::types::{
    unix_now, Amount, BlockIndex, BlockOperation, ContractId, ContractStatus, EnrolledFarmer,
    EntryId, EntryStatus, ExitId, ExitSplit, ExitStatus, Farmer, FarmerId, FarmerStatus,
    HarvestCandidate, LedgerEntry, NewLedgerEntry, OperationKind, OperatorId, PlatformFee,
    PoolContract, PoolOperator,
};

#[derive(Default)]
struct Inner {
    farmers: HashMap<FarmerId, Farmer>,
    contracts: HashMap<ContractId, PoolContract>,
    operators: HashMap<OperatorId, PoolOperator>,
    blocks: BTreeSet<BlockIndex>,
    block_operations: HashMap<(BlockIndex, OperatorId), BlockOperation>,
    entries: Vec<LedgerEntry>,
    exits: HashMap<ExitId, ExitSplit>,
    platform_fees: Vec<PlatformFee>,
    next_entry_id: EntryId,
    next_exit_id: ExitId,
}

impl Inner {
    fn latest_contract(&self, farmer_id: FarmerId) -> Option<&PoolContract> {
        self.contracts
            .values()
            .filter(|c| c.farmer_id == farmer_id)
            .max_by_key(|c| c.id)
    }

    fn enrolled(&self, farmer_id: FarmerId) -> Option<EnrolledFarmer> {
        self.farmers.get(&farmer_id).map(|farmer| EnrolledFarmer {
            farmer: farmer.clone(),
            contract: self.latest_contract(farmer_id).cloned(),
        })
    }

    fn successful(
        &self,
        phase: OperationKind,
        block_index: BlockIndex,
        farmer_id: FarmerId,
    ) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| {
            e.phase == phase
                && e.block_index == block_index
                && e.farmer_id == farmer_id
                && e.is_success()
        })
    }

    fn append(&mut self, entry: NewLedgerEntry, created_at: u64) -> Option<LedgerEntry> {
        if entry.status == EntryStatus::Success
            && self
                .successful(entry.phase, entry.block_index, entry.farmer_id)
                .is_some()
        {
            return None;
        }
        self.next_entry_id += 1;
        let row = LedgerEntry::from_new(self.next_entry_id, entry, created_at);
        self.entries.push(row.clone());
        Some(row)
    }

    fn unharvested_work(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().filter(move |e| {
            e.phase == OperationKind::Work
                && e.is_success()
                && self
                    .successful(OperationKind::Harvest, e.block_index, e.farmer_id)
                    .is_none()
        })
    }
}

/// In-process [`Ledger`] used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> LedgerResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable(
                "memory ledger switched off".to_string(),
            ));
        }
        Ok(self.inner.lock()?)
    }

    /// Makes every subsequent call fail as if the store went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn add_operator(&self, operator: PoolOperator) -> LedgerResult<()> {
        self.lock()?.operators.insert(operator.id, operator);
        Ok(())
    }

    pub fn add_farmer(&self, farmer: Farmer) -> LedgerResult<()> {
        self.lock()?.farmers.insert(farmer.id, farmer);
        Ok(())
    }

    pub fn add_contract(&self, contract: PoolContract) -> LedgerResult<()> {
        self.lock()?.contracts.insert(contract.id, contract);
        Ok(())
    }

    /// Appends a row with an explicit creation time.
    pub fn append_entry_at(
        &self,
        entry: NewLedgerEntry,
        created_at: u64,
    ) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self.lock()?.append(entry, created_at))
    }

    pub fn entries(&self, phase: OperationKind) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| e.phase == phase)
            .cloned()
            .collect())
    }

    pub fn farmer(&self, farmer_id: FarmerId) -> LedgerResult<Option<Farmer>> {
        Ok(self.lock()?.farmers.get(&farmer_id).cloned())
    }

    pub fn contract(&self, contract_id: ContractId) -> LedgerResult<Option<PoolContract>> {
        Ok(self.lock()?.contracts.get(&contract_id).cloned())
    }

    pub fn platform_fees(&self) -> LedgerResult<Vec<PlatformFee>> {
        Ok(self.lock()?.platform_fees.clone())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn active_farmers(&self, operator_id: OperatorId) -> LedgerResult<Vec<EnrolledFarmer>> {
        let inner = self.lock()?;
        let mut farmers: Vec<EnrolledFarmer> = inner
            .farmers
            .keys()
            .filter_map(|id| inner.enrolled(*id))
            .filter(|f| f.operator_id() == Some(operator_id) && f.is_active_member())
            .collect();
        farmers.sort_by_key(|f| f.id());
        Ok(farmers)
    }

    async fn enrolled_farmer(&self, farmer_id: FarmerId) -> LedgerResult<Option<EnrolledFarmer>> {
        Ok(self.lock()?.enrolled(farmer_id))
    }

    async fn update_farmer_balance(
        &self,
        farmer_id: FarmerId,
        balance: Amount,
    ) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let farmer = inner
            .farmers
            .get_mut(&farmer_id)
            .ok_or_else(|| LedgerError::NotFound(format!("farmer {farmer_id}")))?;
        farmer.balance = balance;
        Ok(())
    }

    async fn set_farmer_status(
        &self,
        farmer_id: FarmerId,
        status: FarmerStatus,
    ) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let farmer = inner
            .farmers
            .get_mut(&farmer_id)
            .ok_or_else(|| LedgerError::NotFound(format!("farmer {farmer_id}")))?;
        farmer.status = status;
        Ok(())
    }

    async fn complete_farmer_exit(&self, farmer_id: FarmerId) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let farmer = inner
            .farmers
            .get_mut(&farmer_id)
            .ok_or_else(|| LedgerError::NotFound(format!("farmer {farmer_id}")))?;
        farmer.status = FarmerStatus::Inactive;
        farmer.exit_count += 1;
        Ok(())
    }

    async fn set_contract_status(
        &self,
        contract_id: ContractId,
        status: ContractStatus,
    ) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        let contract = inner
            .contracts
            .get_mut(&contract_id)
            .ok_or_else(|| LedgerError::NotFound(format!("contract {contract_id}")))?;
        contract.status = status;
        Ok(())
    }

    async fn operator(&self, operator_id: OperatorId) -> LedgerResult<Option<PoolOperator>> {
        Ok(self.lock()?.operators.get(&operator_id).cloned())
    }

    async fn decrement_active_farmers(&self, operator_id: OperatorId) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        if let Some(operator) = inner.operators.get_mut(&operator_id) {
            operator.active_farmers = operator.active_farmers.saturating_sub(1);
        }
        Ok(())
    }

    async fn record_block_discovered(&self, block_index: BlockIndex) -> LedgerResult<bool> {
        Ok(self.lock()?.blocks.insert(block_index))
    }

    async fn current_block_index(&self) -> LedgerResult<Option<BlockIndex>> {
        let inner = self.lock()?;
        let from_operations = inner.block_operations.keys().map(|(b, _)| *b).max();
        Ok(inner.blocks.iter().next_back().copied().max(from_operations))
    }

    async fn ensure_block_operation(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<BlockOperation> {
        let mut inner = self.lock()?;
        Ok(inner
            .block_operations
            .entry((block_index, operator_id))
            .or_insert_with(|| BlockOperation::new(block_index, operator_id))
            .clone())
    }

    async fn block_operation(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<Option<BlockOperation>> {
        Ok(self
            .lock()?
            .block_operations
            .get(&(block_index, operator_id))
            .cloned())
    }

    async fn record_phase_completion(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        phase: OperationKind,
        succeeded: u32,
    ) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        inner
            .block_operations
            .entry((block_index, operator_id))
            .or_insert_with(|| BlockOperation::new(block_index, operator_id))
            .record_phase(phase, succeeded, unix_now());
        Ok(())
    }

    async fn record_planting(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
        debug_assert_eq!(entry.phase, OperationKind::Plant);
        Ok(self.lock()?.append(entry, unix_now()))
    }

    async fn record_work(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
        debug_assert_eq!(entry.phase, OperationKind::Work);
        Ok(self.lock()?.append(entry, unix_now()))
    }

    async fn record_harvest(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
        debug_assert_eq!(entry.phase, OperationKind::Harvest);
        Ok(self.lock()?.append(entry, unix_now()))
    }

    async fn successful_entry(
        &self,
        phase: OperationKind,
        block_index: BlockIndex,
        farmer_id: FarmerId,
    ) -> LedgerResult<Option<LedgerEntry>> {
        Ok(self
            .lock()?
            .successful(phase, block_index, farmer_id)
            .cloned())
    }

    async fn unharvested_work(&self, farmer_id: FarmerId) -> LedgerResult<Vec<LedgerEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .unharvested_work()
            .filter(|e| e.farmer_id == farmer_id)
            .cloned()
            .collect())
    }

    async fn harvestable_farmers(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<Vec<EnrolledFarmer>> {
        let inner = self.lock()?;
        let ids: BTreeSet<FarmerId> = inner
            .unharvested_work()
            .filter(|e| e.block_index == block_index && e.operator_id == operator_id)
            .map(|e| e.farmer_id)
            .collect();
        Ok(ids.into_iter().filter_map(|id| inner.enrolled(id)).collect())
    }

    async fn harvest_candidates(
        &self,
        latest_block: BlockIndex,
        default_interval: u32,
        planted_since: u64,
        limit: usize,
    ) -> LedgerResult<Vec<HarvestCandidate>> {
        let inner = self.lock()?;
        let candidates: BTreeSet<HarvestCandidate> = inner
            .unharvested_work()
            .filter(|work| {
                inner
                    .successful(OperationKind::Plant, work.block_index, work.farmer_id)
                    .map(|planting| planting.created_at >= planted_since)
                    .unwrap_or(false)
            })
            .filter(|work| {
                let interval = inner
                    .latest_contract(work.farmer_id)
                    .filter(|c| c.operator_id == work.operator_id)
                    .map(|c| c.harvest_interval)
                    .unwrap_or(default_interval);
                work.block_index as u64 + interval as u64 <= latest_block as u64
            })
            .map(|work| HarvestCandidate {
                block_index: work.block_index,
                farmer_id: work.farmer_id,
                operator_id: work.operator_id,
            })
            .collect();
        Ok(candidates.into_iter().take(limit).collect())
    }

    async fn unexited_harvests(&self, farmer_id: FarmerId) -> LedgerResult<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .entries
            .iter()
            .filter(|e| {
                e.phase == OperationKind::Harvest
                    && e.farmer_id == farmer_id
                    && e.is_success()
                    && !e.exited
            })
            .cloned()
            .collect())
    }

    async fn mark_harvests_exited(&self, ids: &[EntryId]) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        for entry in inner.entries.iter_mut() {
            if entry.phase == OperationKind::Harvest && ids.contains(&entry.id) {
                entry.exited = true;
            }
        }
        Ok(())
    }

    async fn create_exit_record(&self, mut split: ExitSplit) -> LedgerResult<ExitSplit> {
        let mut inner = self.lock()?;
        inner.next_exit_id += 1;
        split.id = inner.next_exit_id;
        inner.exits.insert(split.id, split.clone());
        Ok(split)
    }

    async fn exit_record(&self, exit_id: ExitId) -> LedgerResult<Option<ExitSplit>> {
        Ok(self.lock()?.exits.get(&exit_id).cloned())
    }

    async fn update_exit_record(&self, split: &ExitSplit) -> LedgerResult<()> {
        let mut inner = self.lock()?;
        match inner.exits.get_mut(&split.id) {
            Some(stored) => {
                *stored = split.clone();
                Ok(())
            }
            None => Err(LedgerError::NotFound(format!("exit {}", split.id))),
        }
    }

    async fn resumable_exits(&self) -> LedgerResult<Vec<ExitSplit>> {
        let inner = self.lock()?;
        let mut exits: Vec<ExitSplit> = inner
            .exits
            .values()
            .filter(|e| match e.status {
                ExitStatus::Processing => true,
                ExitStatus::Failed => e.next_retry_at.is_some(),
                _ => false,
            })
            .cloned()
            .collect();
        exits.sort_by_key(|e| e.id);
        Ok(exits)
    }

    async fn record_platform_fee(&self, fee: PlatformFee) -> LedgerResult<()> {
        self.lock()?.platform_fees.push(fee);
        Ok(())
    }
}

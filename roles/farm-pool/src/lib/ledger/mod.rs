//! ## Ledger
//!
//! Narrow query interface over the relational store holding farmers, pool
//! contracts, block records, the planting/work/harvest ledger and exit splits.
//!
//! Ledger rows are append-only, one per (phase, block, farmer) attempt. At most
//! one *successful* row may exist per (phase, block, farmer); a second
//! successful insert is dropped and reported as `None` rather than failing, so
//! two concurrent harvests of the same pair never corrupt the ledger.

mod memory;
mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use std::fmt;

use crate::types::{
    Amount, BlockIndex, BlockOperation, ContractId, ContractStatus, EnrolledFarmer, EntryId,
    ExitId, ExitSplit, FarmerId, FarmerStatus, HarvestCandidate, LedgerEntry, NewLedgerEntry,
    OperationKind, OperatorId, PlatformFee, PoolOperator,
};

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug)]
pub enum LedgerError {
    /// The store could not be reached or a lock was poisoned.
    Unavailable(String),
    /// A row the caller relied on does not exist.
    NotFound(String),
    /// A stored value could not be decoded.
    Corrupt(String),
    Sqlite(rusqlite::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Unavailable(e) => write!(f, "ledger unavailable: {e}"),
            LedgerError::NotFound(e) => write!(f, "not found: {e}"),
            LedgerError::Corrupt(e) => write!(f, "corrupt ledger value: {e}"),
            LedgerError::Sqlite(e) => write!(f, "sqlite: {e}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Sqlite(e)
    }
}

impl<T> From<std::sync::PoisonError<T>> for LedgerError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        LedgerError::Unavailable(format!("poisoned lock: {e}"))
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    // farmers, contracts and operators

    /// Farmers enrolled with `operator_id` through an active contract, plus
    /// legacy farmers marked active for that operator.
    async fn active_farmers(&self, operator_id: OperatorId) -> LedgerResult<Vec<EnrolledFarmer>>;

    /// A farmer with its most recent pool contract.
    async fn enrolled_farmer(&self, farmer_id: FarmerId) -> LedgerResult<Option<EnrolledFarmer>>;

    async fn update_farmer_balance(&self, farmer_id: FarmerId, balance: Amount)
        -> LedgerResult<()>;

    async fn set_farmer_status(&self, farmer_id: FarmerId, status: FarmerStatus)
        -> LedgerResult<()>;

    /// Marks the farmer inactive and bumps its exit count.
    async fn complete_farmer_exit(&self, farmer_id: FarmerId) -> LedgerResult<()>;

    async fn set_contract_status(
        &self,
        contract_id: ContractId,
        status: ContractStatus,
    ) -> LedgerResult<()>;

    async fn operator(&self, operator_id: OperatorId) -> LedgerResult<Option<PoolOperator>>;

    async fn decrement_active_farmers(&self, operator_id: OperatorId) -> LedgerResult<()>;

    // blocks

    /// Returns `false` when the block was already known.
    async fn record_block_discovered(&self, block_index: BlockIndex) -> LedgerResult<bool>;

    /// Highest block index seen so far.
    async fn current_block_index(&self) -> LedgerResult<Option<BlockIndex>>;

    async fn ensure_block_operation(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<BlockOperation>;

    async fn block_operation(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<Option<BlockOperation>>;

    async fn record_phase_completion(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        phase: OperationKind,
        succeeded: u32,
    ) -> LedgerResult<()>;

    // planting / work / harvest rows

    async fn record_planting(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>>;

    async fn record_work(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>>;

    async fn record_harvest(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>>;

    /// The successful row of `phase` for (block, farmer), if any.
    async fn successful_entry(
        &self,
        phase: OperationKind,
        block_index: BlockIndex,
        farmer_id: FarmerId,
    ) -> LedgerResult<Option<LedgerEntry>>;

    /// Successful work rows of `farmer_id` that have no successful harvest yet.
    async fn unharvested_work(&self, farmer_id: FarmerId) -> LedgerResult<Vec<LedgerEntry>>;

    /// Farmers of `operator_id` with successful work on `block_index` and no
    /// successful harvest for it.
    async fn harvestable_farmers(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<Vec<EnrolledFarmer>>;

    /// Harvest candidates across all operators, oldest block first.
    ///
    /// A candidate has a successful planting created at or after
    /// `planted_since`, a successful work, no successful harvest, and its block
    /// lies at least the contract's harvest interval (or `default_interval`)
    /// behind `latest_block`.
    async fn harvest_candidates(
        &self,
        latest_block: BlockIndex,
        default_interval: u32,
        planted_since: u64,
        limit: usize,
    ) -> LedgerResult<Vec<HarvestCandidate>>;

    /// Successful harvest rows of `farmer_id` not yet paid out by an exit.
    async fn unexited_harvests(&self, farmer_id: FarmerId) -> LedgerResult<Vec<LedgerEntry>>;

    async fn mark_harvests_exited(&self, ids: &[EntryId]) -> LedgerResult<()>;

    // exits

    /// Stores a new exit record and returns it with its assigned id.
    async fn create_exit_record(&self, split: ExitSplit) -> LedgerResult<ExitSplit>;

    async fn exit_record(&self, exit_id: ExitId) -> LedgerResult<Option<ExitSplit>>;

    async fn update_exit_record(&self, split: &ExitSplit) -> LedgerResult<()>;

    /// Exits that were interrupted while `processing`, or are `failed` with a
    /// retry still due.
    async fn resumable_exits(&self) -> LedgerResult<Vec<ExitSplit>>;

    async fn record_platform_fee(&self, fee: PlatformFee) -> LedgerResult<()>;
}

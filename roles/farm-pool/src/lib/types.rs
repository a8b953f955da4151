//! Domain records shared by the coordinator, the scheduler and the exit orchestrator.
//!
//! Amounts are on-chain atomic units held as `i128`, the farm contract's native
//! width. Rates are basis points where `10_000` is 100%.

use std::{fmt, str::FromStr};

pub type Amount = i128;
pub type BlockIndex = u32;
pub type FarmerId = u64;
pub type OperatorId = u64;
pub type ContractId = u64;
pub type ExitId = u64;
pub type EntryId = u64;

pub const BPS_DENOMINATOR: i128 = 10_000;

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// `amount * bps / 10_000`, rounded toward zero. `None` on overflow.
pub fn apply_bps(amount: Amount, bps: u32) -> Option<Amount> {
    amount
        .checked_mul(bps as i128)
        .map(|scaled| scaled / BPS_DENOMINATOR)
}

/// Parses an atomic amount from its decimal string form.
pub fn parse_amount(raw: &str) -> Option<Amount> {
    raw.trim().parse::<i128>().ok()
}

/// Error returned when a persisted enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel(pub String);

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown label `{}`", self.0)
    }
}

impl std::error::Error for UnknownLabel {}

macro_rules! labelled_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownLabel;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($label => Ok($name::$variant),)+
                    other => Err(UnknownLabel(other.to_string())),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FarmerStatus {
    Registered,
    Funded,
    Active,
    Inactive,
    Exiting,
}

labelled_enum!(FarmerStatus {
    Registered => "registered",
    Funded => "funded",
    Active => "active",
    Inactive => "inactive",
    Exiting => "exiting",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractStatus {
    Pending,
    Active,
    Exiting,
    Completed,
}

labelled_enum!(ContractStatus {
    Pending => "pending",
    Active => "active",
    Exiting => "exiting",
    Completed => "completed",
});

/// The three per-block phases a farmer goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Plant,
    Work,
    Harvest,
}

labelled_enum!(OperationKind {
    Plant => "plant",
    Work => "work",
    Harvest => "harvest",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Success,
    Failed,
    /// Plant held back until the custodial wallet is funded.
    PendingRetry,
}

labelled_enum!(EntryStatus {
    Success => "success",
    Failed => "failed",
    PendingRetry => "pending_retry",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

labelled_enum!(ExitStatus {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// A farmer account whose custodial wallet the pool signs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Farmer {
    pub id: FarmerId,
    pub custodial_public_key: String,
    /// Hex-encoded ed25519 seed. Read-only to this crate.
    pub custodial_secret_key: String,
    pub payout_wallet: String,
    /// Last balance observed on chain; only a fallback for stake sizing.
    pub balance: Amount,
    pub stake_percentage_bps: u32,
    pub status: FarmerStatus,
    /// Operator of a legacy farmer that joined before pool contracts existed.
    pub operator_id: Option<OperatorId>,
    pub exit_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolContract {
    pub id: ContractId,
    pub farmer_id: FarmerId,
    pub operator_id: OperatorId,
    pub stake_percentage_bps: u32,
    /// Minimum number of blocks between work and harvest.
    pub harvest_interval: u32,
    /// Share of rewards going to the farmer.
    pub reward_split_bps: u32,
    pub platform_fee_bps: u32,
    pub status: ContractStatus,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOperator {
    pub id: OperatorId,
    pub payout_wallet: String,
    pub active_farmers: u32,
}

/// A farmer together with the contract binding it to an operator, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrolledFarmer {
    pub farmer: Farmer,
    pub contract: Option<PoolContract>,
}

impl EnrolledFarmer {
    pub fn id(&self) -> FarmerId {
        self.farmer.id
    }

    pub fn operator_id(&self) -> Option<OperatorId> {
        self.contract
            .as_ref()
            .map(|c| c.operator_id)
            .or(self.farmer.operator_id)
    }

    /// Enrolled through an active contract, or a legacy farmer marked active.
    pub fn is_active_member(&self) -> bool {
        match &self.contract {
            Some(contract) => contract.status == ContractStatus::Active,
            None => self.farmer.status == FarmerStatus::Active && self.farmer.operator_id.is_some(),
        }
    }

    pub fn stake_percentage_bps(&self) -> u32 {
        self.contract
            .as_ref()
            .map(|c| c.stake_percentage_bps)
            .unwrap_or(self.farmer.stake_percentage_bps)
    }
}

/// Per-block, per-operator progress through the three phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOperation {
    pub block_index: BlockIndex,
    pub operator_id: OperatorId,
    pub plant_count: u32,
    pub work_count: u32,
    pub harvest_count: u32,
    pub plant_completed_at: Option<u64>,
    pub work_completed_at: Option<u64>,
    pub harvest_completed_at: Option<u64>,
    pub created_at: u64,
}

impl BlockOperation {
    pub fn new(block_index: BlockIndex, operator_id: OperatorId) -> Self {
        Self {
            block_index,
            operator_id,
            plant_count: 0,
            work_count: 0,
            harvest_count: 0,
            plant_completed_at: None,
            work_completed_at: None,
            harvest_completed_at: None,
            created_at: unix_now(),
        }
    }

    pub fn record_phase(&mut self, phase: OperationKind, succeeded: u32, at: u64) {
        let (count, completed_at) = match phase {
            OperationKind::Plant => (&mut self.plant_count, &mut self.plant_completed_at),
            OperationKind::Work => (&mut self.work_count, &mut self.work_completed_at),
            OperationKind::Harvest => (&mut self.harvest_count, &mut self.harvest_completed_at),
        };
        *count += succeeded;
        *completed_at = Some(at);
    }
}

/// A planting, work or harvest row about to be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub phase: OperationKind,
    pub block_index: BlockIndex,
    pub farmer_id: FarmerId,
    pub operator_id: OperatorId,
    pub amount: Amount,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub status: EntryStatus,
}

/// An appended planting, work or harvest row. Immutable apart from `exited`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub phase: OperationKind,
    pub block_index: BlockIndex,
    pub farmer_id: FarmerId,
    pub operator_id: OperatorId,
    pub amount: Amount,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub status: EntryStatus,
    pub created_at: u64,
    /// Set on harvest rows once their reward was paid out by an exit.
    pub exited: bool,
}

impl LedgerEntry {
    pub fn from_new(id: EntryId, entry: NewLedgerEntry, created_at: u64) -> Self {
        Self {
            id,
            phase: entry.phase,
            block_index: entry.block_index,
            farmer_id: entry.farmer_id,
            operator_id: entry.operator_id,
            amount: entry.amount,
            tx_hash: entry.tx_hash,
            error: entry.error,
            status: entry.status,
            created_at,
            exited: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == EntryStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HarvestCandidate {
    pub block_index: BlockIndex,
    pub farmer_id: FarmerId,
    pub operator_id: OperatorId,
}

/// Fixed three-way split of an exiting farmer's rewards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitShares {
    pub farmer: Amount,
    pub operator: Amount,
    pub platform: Amount,
}

impl SplitShares {
    /// Splits `total` so that the three shares always add back up to it.
    ///
    /// The platform fee and the farmer share are rounded down, the operator
    /// receives the remainder. `None` when `total` is too large to scale.
    pub fn compute(total: Amount, reward_split_bps: u32, platform_fee_bps: u32) -> Option<Self> {
        let reward_split_bps = reward_split_bps.min(10_000);
        let platform_fee_bps = platform_fee_bps.min(10_000 - reward_split_bps);
        let farmer = apply_bps(total, reward_split_bps)?;
        let platform = apply_bps(total, platform_fee_bps)?;
        Some(Self {
            farmer,
            operator: total - farmer - platform,
            platform,
        })
    }

    pub fn total(&self) -> Amount {
        self.farmer + self.operator + self.platform
    }
}

/// One of the three transfers of an exit payout, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitLeg {
    Farmer,
    Operator,
    Platform,
}

impl ExitLeg {
    pub const ORDER: [ExitLeg; 3] = [ExitLeg::Farmer, ExitLeg::Operator, ExitLeg::Platform];
}

labelled_enum!(ExitLeg {
    Farmer => "farmer",
    Operator => "operator",
    Platform => "platform",
});

/// Exit payout record, the unit of the exit state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSplit {
    pub id: ExitId,
    pub farmer_id: FarmerId,
    pub operator_id: OperatorId,
    pub contract_id: Option<ContractId>,
    pub total_rewards: Amount,
    pub farmer_share: Amount,
    pub operator_share: Amount,
    pub platform_fee: Amount,
    pub farmer_tx_hash: Option<String>,
    pub operator_tx_hash: Option<String>,
    pub platform_tx_hash: Option<String>,
    pub status: ExitStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    /// Harvest rows whose rewards make up `total_rewards`.
    pub harvest_ids: Vec<EntryId>,
    pub created_at: u64,
    pub last_retry_at: Option<u64>,
    /// Due time of the pending automatic retry, if one is scheduled.
    pub next_retry_at: Option<u64>,
    pub completed_at: Option<u64>,
}

impl ExitSplit {
    pub fn new(
        farmer_id: FarmerId,
        operator_id: OperatorId,
        contract_id: Option<ContractId>,
        total_rewards: Amount,
        shares: SplitShares,
        harvest_ids: Vec<EntryId>,
    ) -> Self {
        Self {
            id: 0,
            farmer_id,
            operator_id,
            contract_id,
            total_rewards,
            farmer_share: shares.farmer,
            operator_share: shares.operator,
            platform_fee: shares.platform,
            farmer_tx_hash: None,
            operator_tx_hash: None,
            platform_tx_hash: None,
            status: ExitStatus::Processing,
            retry_count: 0,
            error_message: None,
            harvest_ids,
            created_at: unix_now(),
            last_retry_at: None,
            next_retry_at: None,
            completed_at: None,
        }
    }

    pub fn amount(&self, leg: ExitLeg) -> Amount {
        match leg {
            ExitLeg::Farmer => self.farmer_share,
            ExitLeg::Operator => self.operator_share,
            ExitLeg::Platform => self.platform_fee,
        }
    }

    pub fn tx_hash(&self, leg: ExitLeg) -> Option<&str> {
        match leg {
            ExitLeg::Farmer => self.farmer_tx_hash.as_deref(),
            ExitLeg::Operator => self.operator_tx_hash.as_deref(),
            ExitLeg::Platform => self.platform_tx_hash.as_deref(),
        }
    }

    pub fn set_tx_hash(&mut self, leg: ExitLeg, hash: String) {
        let slot = match leg {
            ExitLeg::Farmer => &mut self.farmer_tx_hash,
            ExitLeg::Operator => &mut self.operator_tx_hash,
            ExitLeg::Platform => &mut self.platform_tx_hash,
        };
        *slot = Some(hash);
    }

    /// A leg still has to be sent when it carries a non-zero amount and no hash.
    pub fn leg_pending(&self, leg: ExitLeg) -> bool {
        self.amount(leg) > 0 && self.tx_hash(leg).is_none()
    }

    /// Sum of the legs that still have to be sent.
    pub fn outstanding(&self) -> Amount {
        ExitLeg::ORDER
            .iter()
            .filter(|leg| self.leg_pending(**leg))
            .map(|leg| self.amount(*leg))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformFee {
    pub exit_id: ExitId,
    pub amount: Amount,
    pub tx_hash: Option<String>,
    pub collected_at: u64,
}

use async_trait::async_trait;
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::{
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::info;

use super::{Ledger, LedgerError, LedgerResult};
use crate::types::{
    unix_now, Amount, BlockIndex, BlockOperation, ContractId, ContractStatus, EnrolledFarmer,
    EntryId, ExitId, ExitSplit, Farmer, FarmerId, FarmerStatus, HarvestCandidate, LedgerEntry,
    NewLedgerEntry, OperationKind, OperatorId, PlatformFee, PoolContract, PoolOperator,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pool_operators (
    id INTEGER PRIMARY KEY,
    payout_wallet TEXT NOT NULL,
    active_farmers INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS farmers (
    id INTEGER PRIMARY KEY,
    custodial_public_key TEXT NOT NULL,
    custodial_secret_key TEXT NOT NULL,
    payout_wallet TEXT NOT NULL,
    balance TEXT NOT NULL DEFAULT '0',
    stake_percentage_bps INTEGER NOT NULL,
    status TEXT NOT NULL,
    operator_id INTEGER REFERENCES pool_operators(id),
    exit_count INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS pool_contracts (
    id INTEGER PRIMARY KEY,
    farmer_id INTEGER NOT NULL REFERENCES farmers(id),
    operator_id INTEGER NOT NULL REFERENCES pool_operators(id),
    stake_percentage_bps INTEGER NOT NULL,
    harvest_interval INTEGER NOT NULL,
    reward_split_bps INTEGER NOT NULL,
    platform_fee_bps INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS pool_contracts_farmer ON pool_contracts(farmer_id);
CREATE TABLE IF NOT EXISTS blocks (
    block_index INTEGER PRIMARY KEY,
    discovered_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS block_operations (
    block_index INTEGER NOT NULL,
    operator_id INTEGER NOT NULL,
    plant_count INTEGER NOT NULL DEFAULT 0,
    work_count INTEGER NOT NULL DEFAULT 0,
    harvest_count INTEGER NOT NULL DEFAULT 0,
    plant_completed_at INTEGER,
    work_completed_at INTEGER,
    harvest_completed_at INTEGER,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (block_index, operator_id)
);
CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    phase TEXT NOT NULL,
    block_index INTEGER NOT NULL,
    farmer_id INTEGER NOT NULL,
    operator_id INTEGER NOT NULL,
    amount TEXT NOT NULL,
    tx_hash TEXT,
    error TEXT,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    exited INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS ledger_entries_one_success
    ON ledger_entries(phase, block_index, farmer_id) WHERE status = 'success';
CREATE INDEX IF NOT EXISTS ledger_entries_farmer ON ledger_entries(farmer_id, phase);
CREATE TABLE IF NOT EXISTS exit_splits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    farmer_id INTEGER NOT NULL,
    operator_id INTEGER NOT NULL,
    contract_id INTEGER,
    total_rewards TEXT NOT NULL,
    farmer_share TEXT NOT NULL,
    operator_share TEXT NOT NULL,
    platform_fee TEXT NOT NULL,
    farmer_tx_hash TEXT,
    operator_tx_hash TEXT,
    platform_tx_hash TEXT,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    harvest_ids TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER NOT NULL,
    last_retry_at INTEGER,
    next_retry_at INTEGER,
    completed_at INTEGER
);
CREATE TABLE IF NOT EXISTS platform_fees (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exit_id INTEGER NOT NULL REFERENCES exit_splits(id),
    amount TEXT NOT NULL,
    tx_hash TEXT,
    collected_at INTEGER NOT NULL
);
";

/// Farmer joined with its most recent contract. Farmer columns 0..=8,
/// contract columns 9..=17.
const ENROLLED_SELECT: &str = "
SELECT f.id, f.custodial_public_key, f.custodial_secret_key, f.payout_wallet, f.balance,
       f.stake_percentage_bps, f.status, f.operator_id, f.exit_count,
       c.id, c.farmer_id, c.operator_id, c.stake_percentage_bps, c.harvest_interval,
       c.reward_split_bps, c.platform_fee_bps, c.status, c.created_at
FROM farmers f
LEFT JOIN pool_contracts c
    ON c.id = (SELECT MAX(id) FROM pool_contracts WHERE farmer_id = f.id)";

const ENTRY_COLUMNS: &str = "id, phase, block_index, farmer_id, operator_id, amount, tx_hash, \
                             error, status, created_at, exited";

const EXIT_COLUMNS: &str = "id, farmer_id, operator_id, contract_id, total_rewards, farmer_share, \
                            operator_share, platform_fee, farmer_tx_hash, operator_tx_hash, \
                            platform_tx_hash, status, retry_count, error_message, harvest_ids, \
                            created_at, last_retry_at, next_retry_at, completed_at";

const BLOCK_OPERATION_COLUMNS: &str = "block_index, operator_id, plant_count, work_count, \
                                       harvest_count, plant_completed_at, work_completed_at, \
                                       harvest_completed_at, created_at";

/// Reads a TEXT column through `FromStr`, reporting bad values as conversion failures.
fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn unsigned(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|v| v as u64)
}

fn unsigned_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    row.get::<_, Option<i64>>(idx).map(|v| v.map(|v| v as u64))
}

fn opt_i64(v: Option<u64>) -> Option<i64> {
    v.map(|v| v as i64)
}

fn enrolled_from_row(row: &Row<'_>) -> rusqlite::Result<EnrolledFarmer> {
    let farmer = Farmer {
        id: unsigned(row, 0)?,
        custodial_public_key: row.get(1)?,
        custodial_secret_key: row.get(2)?,
        payout_wallet: row.get(3)?,
        balance: parsed::<Amount>(row, 4)?,
        stake_percentage_bps: row.get(5)?,
        status: parsed::<FarmerStatus>(row, 6)?,
        operator_id: unsigned_opt(row, 7)?,
        exit_count: row.get(8)?,
    };
    let contract = match unsigned_opt(row, 9)? {
        Some(id) => Some(PoolContract {
            id,
            farmer_id: unsigned(row, 10)?,
            operator_id: unsigned(row, 11)?,
            stake_percentage_bps: row.get(12)?,
            harvest_interval: row.get(13)?,
            reward_split_bps: row.get(14)?,
            platform_fee_bps: row.get(15)?,
            status: parsed::<ContractStatus>(row, 16)?,
            created_at: unsigned(row, 17)?,
        }),
        None => None,
    };
    Ok(EnrolledFarmer { farmer, contract })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: unsigned(row, 0)?,
        phase: parsed(row, 1)?,
        block_index: row.get(2)?,
        farmer_id: unsigned(row, 3)?,
        operator_id: unsigned(row, 4)?,
        amount: parsed(row, 5)?,
        tx_hash: row.get(6)?,
        error: row.get(7)?,
        status: parsed(row, 8)?,
        created_at: unsigned(row, 9)?,
        exited: row.get(10)?,
    })
}

fn exit_from_row(row: &Row<'_>) -> rusqlite::Result<ExitSplit> {
    let harvest_ids: String = row.get(14)?;
    let harvest_ids: Vec<EntryId> = serde_json::from_str(&harvest_ids)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(14, Type::Text, Box::new(e)))?;
    Ok(ExitSplit {
        id: unsigned(row, 0)?,
        farmer_id: unsigned(row, 1)?,
        operator_id: unsigned(row, 2)?,
        contract_id: unsigned_opt(row, 3)?,
        total_rewards: parsed(row, 4)?,
        farmer_share: parsed(row, 5)?,
        operator_share: parsed(row, 6)?,
        platform_fee: parsed(row, 7)?,
        farmer_tx_hash: row.get(8)?,
        operator_tx_hash: row.get(9)?,
        platform_tx_hash: row.get(10)?,
        status: parsed(row, 11)?,
        retry_count: row.get(12)?,
        error_message: row.get(13)?,
        harvest_ids,
        created_at: unsigned(row, 15)?,
        last_retry_at: unsigned_opt(row, 16)?,
        next_retry_at: unsigned_opt(row, 17)?,
        completed_at: unsigned_opt(row, 18)?,
    })
}

fn block_operation_from_row(row: &Row<'_>) -> rusqlite::Result<BlockOperation> {
    Ok(BlockOperation {
        block_index: row.get(0)?,
        operator_id: unsigned(row, 1)?,
        plant_count: row.get(2)?,
        work_count: row.get(3)?,
        harvest_count: row.get(4)?,
        plant_completed_at: unsigned_opt(row, 5)?,
        work_completed_at: unsigned_opt(row, 6)?,
        harvest_completed_at: unsigned_opt(row, 7)?,
        created_at: unsigned(row, 8)?,
    })
}

fn harvest_ids_json(ids: &[EntryId]) -> LedgerResult<String> {
    serde_json::to_string(ids).map_err(|e| LedgerError::Corrupt(e.to_string()))
}

/// [`Ledger`] backed by a SQLite database.
///
/// Amounts are stored as decimal TEXT so the full `i128` range survives.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> LedgerResult<Self> {
        info!("Opening ledger database at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> LedgerResult<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }

    pub fn insert_operator(&self, operator: &PoolOperator) -> LedgerResult<()> {
        self.conn()?.execute(
            "INSERT INTO pool_operators (id, payout_wallet, active_farmers) VALUES (?1, ?2, ?3)",
            params![operator.id as i64, operator.payout_wallet, operator.active_farmers],
        )?;
        Ok(())
    }

    pub fn insert_farmer(&self, farmer: &Farmer) -> LedgerResult<()> {
        self.conn()?.execute(
            "INSERT INTO farmers (id, custodial_public_key, custodial_secret_key, payout_wallet,
                 balance, stake_percentage_bps, status, operator_id, exit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                farmer.id as i64,
                farmer.custodial_public_key,
                farmer.custodial_secret_key,
                farmer.payout_wallet,
                farmer.balance.to_string(),
                farmer.stake_percentage_bps,
                farmer.status.as_str(),
                opt_i64(farmer.operator_id),
                farmer.exit_count,
            ],
        )?;
        Ok(())
    }

    pub fn insert_contract(&self, contract: &PoolContract) -> LedgerResult<()> {
        self.conn()?.execute(
            "INSERT INTO pool_contracts (id, farmer_id, operator_id, stake_percentage_bps,
                 harvest_interval, reward_split_bps, platform_fee_bps, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                contract.id as i64,
                contract.farmer_id as i64,
                contract.operator_id as i64,
                contract.stake_percentage_bps,
                contract.harvest_interval,
                contract.reward_split_bps,
                contract.platform_fee_bps,
                contract.status.as_str(),
                contract.created_at as i64,
            ],
        )?;
        Ok(())
    }

    /// Runs `f` on the blocking pool with the connection locked.
    async fn run<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> LedgerResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| LedgerError::Unavailable(format!("ledger task failed: {e}")))?
    }
}

fn append(conn: &Connection, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
    let created_at = unix_now();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO ledger_entries
             (phase, block_index, farmer_id, operator_id, amount, tx_hash, error, status,
              created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            entry.phase.as_str(),
            entry.block_index,
            entry.farmer_id as i64,
            entry.operator_id as i64,
            entry.amount.to_string(),
            entry.tx_hash,
            entry.error,
            entry.status.as_str(),
            created_at as i64,
        ],
    )?;
    if inserted == 0 {
        return Ok(None);
    }
    let id = conn.last_insert_rowid() as EntryId;
    Ok(Some(LedgerEntry::from_new(id, entry, created_at)))
}

fn enrolled_where(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> LedgerResult<Vec<EnrolledFarmer>> {
    let mut stmt = conn.prepare(&format!("{ENROLLED_SELECT} WHERE {filter} ORDER BY f.id"))?;
    let rows = stmt.query_map(params, enrolled_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn active_farmers(&self, operator_id: OperatorId) -> LedgerResult<Vec<EnrolledFarmer>> {
        self.run(move |conn| {
            enrolled_where(
                conn,
                "(c.id IS NOT NULL AND c.operator_id = ?1 AND c.status = 'active')
                 OR (c.id IS NULL AND f.operator_id = ?1 AND f.status = 'active')",
                &[&(operator_id as i64)],
            )
        })
        .await
    }

    async fn enrolled_farmer(&self, farmer_id: FarmerId) -> LedgerResult<Option<EnrolledFarmer>> {
        self.run(move |conn| {
            Ok(enrolled_where(conn, "f.id = ?1", &[&(farmer_id as i64)])?
                .into_iter()
                .next())
        })
        .await
    }

    async fn update_farmer_balance(
        &self,
        farmer_id: FarmerId,
        balance: Amount,
    ) -> LedgerResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE farmers SET balance = ?2 WHERE id = ?1",
                params![farmer_id as i64, balance.to_string()],
            )?;
            match changed {
                0 => Err(LedgerError::NotFound(format!("farmer {farmer_id}"))),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn set_farmer_status(
        &self,
        farmer_id: FarmerId,
        status: FarmerStatus,
    ) -> LedgerResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE farmers SET status = ?2 WHERE id = ?1",
                params![farmer_id as i64, status.as_str()],
            )?;
            match changed {
                0 => Err(LedgerError::NotFound(format!("farmer {farmer_id}"))),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn complete_farmer_exit(&self, farmer_id: FarmerId) -> LedgerResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE farmers SET status = ?2, exit_count = exit_count + 1 WHERE id = ?1",
                params![farmer_id as i64, FarmerStatus::Inactive.as_str()],
            )?;
            match changed {
                0 => Err(LedgerError::NotFound(format!("farmer {farmer_id}"))),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn set_contract_status(
        &self,
        contract_id: ContractId,
        status: ContractStatus,
    ) -> LedgerResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE pool_contracts SET status = ?2 WHERE id = ?1",
                params![contract_id as i64, status.as_str()],
            )?;
            match changed {
                0 => Err(LedgerError::NotFound(format!("contract {contract_id}"))),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn operator(&self, operator_id: OperatorId) -> LedgerResult<Option<PoolOperator>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, payout_wallet, active_farmers FROM pool_operators WHERE id = ?1",
                    params![operator_id as i64],
                    |row| {
                        Ok(PoolOperator {
                            id: unsigned(row, 0)?,
                            payout_wallet: row.get(1)?,
                            active_farmers: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
        .await
    }

    async fn decrement_active_farmers(&self, operator_id: OperatorId) -> LedgerResult<()> {
        self.run(move |conn| {
            conn.execute(
                "UPDATE pool_operators SET active_farmers = active_farmers - 1
                 WHERE id = ?1 AND active_farmers > 0",
                params![operator_id as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_block_discovered(&self, block_index: BlockIndex) -> LedgerResult<bool> {
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO blocks (block_index, discovered_at) VALUES (?1, ?2)",
                params![block_index, unix_now() as i64],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn current_block_index(&self) -> LedgerResult<Option<BlockIndex>> {
        self.run(move |conn| {
            Ok(conn.query_row(
                "SELECT MAX(b) FROM (SELECT block_index AS b FROM blocks
                                     UNION ALL SELECT block_index FROM block_operations)",
                [],
                |row| row.get::<_, Option<BlockIndex>>(0),
            )?)
        })
        .await
    }

    async fn ensure_block_operation(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<BlockOperation> {
        self.run(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO block_operations (block_index, operator_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![block_index, operator_id as i64, unix_now() as i64],
            )?;
            Ok(conn.query_row(
                &format!(
                    "SELECT {BLOCK_OPERATION_COLUMNS} FROM block_operations
                     WHERE block_index = ?1 AND operator_id = ?2"
                ),
                params![block_index, operator_id as i64],
                block_operation_from_row,
            )?)
        })
        .await
    }

    async fn block_operation(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<Option<BlockOperation>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {BLOCK_OPERATION_COLUMNS} FROM block_operations
                         WHERE block_index = ?1 AND operator_id = ?2"
                    ),
                    params![block_index, operator_id as i64],
                    block_operation_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn record_phase_completion(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
        phase: OperationKind,
        succeeded: u32,
    ) -> LedgerResult<()> {
        self.run(move |conn| {
            let (count, completed_at) = match phase {
                OperationKind::Plant => ("plant_count", "plant_completed_at"),
                OperationKind::Work => ("work_count", "work_completed_at"),
                OperationKind::Harvest => ("harvest_count", "harvest_completed_at"),
            };
            let now = unix_now() as i64;
            conn.execute(
                "INSERT OR IGNORE INTO block_operations (block_index, operator_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![block_index, operator_id as i64, now],
            )?;
            conn.execute(
                &format!(
                    "UPDATE block_operations SET {count} = {count} + ?3, {completed_at} = ?4
                     WHERE block_index = ?1 AND operator_id = ?2"
                ),
                params![block_index, operator_id as i64, succeeded, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn record_planting(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
        self.run(move |conn| append(conn, entry)).await
    }

    async fn record_work(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
        self.run(move |conn| append(conn, entry)).await
    }

    async fn record_harvest(&self, entry: NewLedgerEntry) -> LedgerResult<Option<LedgerEntry>> {
        self.run(move |conn| append(conn, entry)).await
    }

    async fn successful_entry(
        &self,
        phase: OperationKind,
        block_index: BlockIndex,
        farmer_id: FarmerId,
    ) -> LedgerResult<Option<LedgerEntry>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM ledger_entries
                         WHERE phase = ?1 AND block_index = ?2 AND farmer_id = ?3
                           AND status = 'success'"
                    ),
                    params![phase.as_str(), block_index, farmer_id as i64],
                    entry_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn unharvested_work(&self, farmer_id: FarmerId) -> LedgerResult<Vec<LedgerEntry>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries w
                 WHERE w.phase = 'work' AND w.status = 'success' AND w.farmer_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM ledger_entries h
                                   WHERE h.phase = 'harvest' AND h.status = 'success'
                                     AND h.block_index = w.block_index
                                     AND h.farmer_id = w.farmer_id)
                 ORDER BY w.block_index"
            ))?;
            let rows = stmt.query_map(params![farmer_id as i64], entry_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn harvestable_farmers(
        &self,
        block_index: BlockIndex,
        operator_id: OperatorId,
    ) -> LedgerResult<Vec<EnrolledFarmer>> {
        self.run(move |conn| {
            enrolled_where(
                conn,
                "f.id IN (SELECT w.farmer_id FROM ledger_entries w
                          WHERE w.phase = 'work' AND w.status = 'success'
                            AND w.block_index = ?1 AND w.operator_id = ?2
                            AND NOT EXISTS (SELECT 1 FROM ledger_entries h
                                            WHERE h.phase = 'harvest' AND h.status = 'success'
                                              AND h.block_index = w.block_index
                                              AND h.farmer_id = w.farmer_id))",
                &[&block_index, &(operator_id as i64)],
            )
        })
        .await
    }

    async fn harvest_candidates(
        &self,
        latest_block: BlockIndex,
        default_interval: u32,
        planted_since: u64,
        limit: usize,
    ) -> LedgerResult<Vec<HarvestCandidate>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT w.block_index, w.farmer_id, w.operator_id
                 FROM ledger_entries w
                 JOIN ledger_entries p
                   ON p.phase = 'plant' AND p.status = 'success'
                  AND p.block_index = w.block_index AND p.farmer_id = w.farmer_id
                 LEFT JOIN pool_contracts c
                   ON c.id = (SELECT MAX(id) FROM pool_contracts WHERE farmer_id = w.farmer_id)
                  AND c.operator_id = w.operator_id
                 WHERE w.phase = 'work' AND w.status = 'success'
                   AND p.created_at >= ?2
                   AND NOT EXISTS (SELECT 1 FROM ledger_entries h
                                   WHERE h.phase = 'harvest' AND h.status = 'success'
                                     AND h.block_index = w.block_index
                                     AND h.farmer_id = w.farmer_id)
                   AND w.block_index + COALESCE(c.harvest_interval, ?3) <= ?1
                 ORDER BY w.block_index, w.farmer_id, w.operator_id
                 LIMIT ?4",
            )?;
            let rows = stmt.query_map(
                params![
                    latest_block,
                    planted_since as i64,
                    default_interval,
                    limit as i64
                ],
                |row| {
                    Ok(HarvestCandidate {
                        block_index: row.get(0)?,
                        farmer_id: unsigned(row, 1)?,
                        operator_id: unsigned(row, 2)?,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn unexited_harvests(&self, farmer_id: FarmerId) -> LedgerResult<Vec<LedgerEntry>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries
                 WHERE phase = 'harvest' AND status = 'success' AND exited = 0 AND farmer_id = ?1
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![farmer_id as i64], entry_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn mark_harvests_exited(&self, ids: &[EntryId]) -> LedgerResult<()> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE ledger_entries SET exited = 1 WHERE id = ?1 AND phase = 'harvest'",
                )?;
                for id in &ids {
                    stmt.execute(params![*id as i64])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_exit_record(&self, mut split: ExitSplit) -> LedgerResult<ExitSplit> {
        self.run(move |conn| {
            let harvest_ids = harvest_ids_json(&split.harvest_ids)?;
            conn.execute(
                "INSERT INTO exit_splits (farmer_id, operator_id, contract_id, total_rewards,
                     farmer_share, operator_share, platform_fee, farmer_tx_hash, operator_tx_hash,
                     platform_tx_hash, status, retry_count, error_message, harvest_ids, created_at,
                     last_retry_at, next_retry_at, completed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                         ?18)",
                params![
                    split.farmer_id as i64,
                    split.operator_id as i64,
                    opt_i64(split.contract_id),
                    split.total_rewards.to_string(),
                    split.farmer_share.to_string(),
                    split.operator_share.to_string(),
                    split.platform_fee.to_string(),
                    split.farmer_tx_hash,
                    split.operator_tx_hash,
                    split.platform_tx_hash,
                    split.status.as_str(),
                    split.retry_count,
                    split.error_message,
                    harvest_ids,
                    split.created_at as i64,
                    opt_i64(split.last_retry_at),
                    opt_i64(split.next_retry_at),
                    opt_i64(split.completed_at),
                ],
            )?;
            split.id = conn.last_insert_rowid() as ExitId;
            Ok(split)
        })
        .await
    }

    async fn exit_record(&self, exit_id: ExitId) -> LedgerResult<Option<ExitSplit>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {EXIT_COLUMNS} FROM exit_splits WHERE id = ?1"),
                    params![exit_id as i64],
                    exit_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn update_exit_record(&self, split: &ExitSplit) -> LedgerResult<()> {
        let split = split.clone();
        self.run(move |conn| {
            let harvest_ids = harvest_ids_json(&split.harvest_ids)?;
            let changed = conn.execute(
                "UPDATE exit_splits SET farmer_tx_hash = ?2, operator_tx_hash = ?3,
                     platform_tx_hash = ?4, status = ?5, retry_count = ?6, error_message = ?7,
                     harvest_ids = ?8, last_retry_at = ?9, next_retry_at = ?10, completed_at = ?11
                 WHERE id = ?1",
                params![
                    split.id as i64,
                    split.farmer_tx_hash,
                    split.operator_tx_hash,
                    split.platform_tx_hash,
                    split.status.as_str(),
                    split.retry_count,
                    split.error_message,
                    harvest_ids,
                    opt_i64(split.last_retry_at),
                    opt_i64(split.next_retry_at),
                    opt_i64(split.completed_at),
                ],
            )?;
            match changed {
                0 => Err(LedgerError::NotFound(format!("exit {}", split.id))),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn resumable_exits(&self) -> LedgerResult<Vec<ExitSplit>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXIT_COLUMNS} FROM exit_splits
                 WHERE status = 'processing' OR (status = 'failed' AND next_retry_at IS NOT NULL)
                 ORDER BY id"
            ))?;
            let rows = stmt.query_map([], exit_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn record_platform_fee(&self, fee: PlatformFee) -> LedgerResult<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO platform_fees (exit_id, amount, tx_hash, collected_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    fee.exit_id as i64,
                    fee.amount.to_string(),
                    fee.tx_hash,
                    fee.collected_at as i64
                ],
            )?;
            Ok(())
        })
        .await
    }
}

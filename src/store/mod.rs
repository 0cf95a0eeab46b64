//! The batch store (C3, §4.3): the sole shared mutable resource (§5), backed
//! by an embedded SQLite database in WAL mode.

use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use crate::domain::batch::{TransferBatch, TransferBatchDto};
use crate::domain::transfer::{Transfer, TransferId, TransferStatus};
use crate::error::{Error, Result};

/// A row in the persistent store: `{created_at, dto}` (§3 data model).
#[derive(Debug, Clone)]
pub struct StoredTransferBatch {
    pub id: i64,
    pub created_at: i64,
    pub dto: TransferBatchDto,
    pub terminal: bool,
}

impl StoredTransferBatch {
    pub fn into_batch(self) -> Result<TransferBatch> {
        TransferBatch::from_dto(self.dto)
    }
}

pub struct BatchStore {
    conn: Connection,
}

impl BatchStore {
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let path = path.to_owned();
        let conn = Connection::open(&path)
            .await
            .map_err(|e| Error::Store(format!("opening {}: {e}", path.display())))?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA foreign_keys=ON;
                 CREATE TABLE IF NOT EXISTS batches (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     transfer_ids TEXT NOT NULL UNIQUE,
                     dto TEXT NOT NULL,
                     terminal INTEGER NOT NULL DEFAULT 0,
                     created_at INTEGER NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_batches_terminal_created
                     ON batches (terminal, created_at);
                 CREATE TABLE IF NOT EXISTS transfers (
                     transfer_id TEXT PRIMARY KEY,
                     status TEXT NOT NULL,
                     btc_address TEXT NOT NULL,
                     nonce INTEGER NOT NULL,
                     total_amount_sat INTEGER NOT NULL,
                     origin_address TEXT NOT NULL,
                     origin_tx_hash TEXT NOT NULL,
                     origin_log_index INTEGER NOT NULL,
                     origin_block_number INTEGER NOT NULL,
                     bitcoin_tx_hash TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_transfers_new_ordering
                     ON transfers (status, origin_block_number, origin_log_index);",
            )
            .map_err(rusqlite::Error::from)
        })
        .await
        .map_err(|e| Error::Store(format!("schema init: {e}")))?;
        Ok(Self { conn })
    }

    /// Record transfers discovered by a chain scan, ignoring ones already known.
    pub async fn insert_new_transfers(&self, transfers: Vec<Transfer>) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for t in &transfers {
                    tx.execute(
                        "INSERT OR IGNORE INTO transfers
                         (transfer_id, status, btc_address, nonce, total_amount_sat,
                          origin_address, origin_tx_hash, origin_log_index, origin_block_number, bitcoin_tx_hash)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        rusqlite::params![
                            t.transfer_id.to_string(),
                            status_str(t.status),
                            t.btc_address,
                            t.nonce,
                            t.total_amount_sat as i64,
                            t.origin_address,
                            format!("{:#x}", t.origin_tx_hash),
                            t.origin_log_index as i64,
                            t.origin_block_number as i64,
                            t.bitcoin_tx_hash.map(|h| format!("{:#x}", h)),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Store(format!("insert_new_transfers: {e}")))
    }

    /// Oldest non-terminal stored batch, by `created_at` (§4.3).
    pub async fn get_current_pending_batch(&self) -> Result<Option<StoredTransferBatch>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, transfer_ids, dto, terminal, created_at FROM batches
                     WHERE terminal = 0 ORDER BY created_at ASC LIMIT 1",
                )?;
                let row = stmt
                    .query_row([], |row| row_to_stored(row))
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(|e| Error::Store(format!("get_current_pending_batch: {e}")))
    }

    /// Insert or update a batch by its identity (sorted transfer ids). A new
    /// batch must not be created while a non-terminal batch already exists
    /// (§4.3, §9 resolved Open Question): the existence check and the insert
    /// happen inside one transaction so two concurrent callers cannot both
    /// succeed.
    pub async fn upsert(&self, batch: &TransferBatch, created_at: i64) -> Result<()> {
        let identity_key = identity_key(batch);
        let dto = batch.to_dto()?;
        let dto_json = serde_json::to_string(&dto)?;
        let terminal = batch.is_terminal();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM batches WHERE transfer_ids = ?1",
                        [&identity_key],
                        |row| row.get(0),
                    )
                    .optional()?;

                if existing.is_none() {
                    let pending: Option<i64> = tx
                        .query_row("SELECT id FROM batches WHERE terminal = 0 LIMIT 1", [], |row| row.get(0))
                        .optional()?;
                    if pending.is_some() {
                        return Err(rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                            Some("a non-terminal batch already exists".to_string()),
                        ));
                    }
                }

                tx.execute(
                    "INSERT INTO batches (transfer_ids, dto, terminal, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(transfer_ids) DO UPDATE SET dto = excluded.dto, terminal = excluded.terminal",
                    rusqlite::params![identity_key, dto_json, terminal as i64, created_at],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| match &e {
                tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ffi::ErrorCode::ConstraintViolation =>
                {
                    Error::AlreadyApplied("a non-terminal batch already exists".into())
                }
                other => Error::Store(format!("upsert: {other}")),
            })
    }

    /// Transfers matching `ids`, in the store's current view (§4.3).
    pub async fn find_transfers(&self, ids: Vec<TransferId>) -> Result<Vec<Transfer>> {
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.conn
            .call(move |conn| {
                let mut out = Vec::with_capacity(id_strings.len());
                for id in &id_strings {
                    let transfer = conn
                        .query_row(
                            "SELECT transfer_id, status, btc_address, nonce, total_amount_sat,
                                    origin_address, origin_tx_hash, origin_log_index, origin_block_number, bitcoin_tx_hash
                             FROM transfers WHERE transfer_id = ?1",
                            [id],
                            row_to_transfer,
                        )
                        .optional()?;
                    if let Some(t) = transfer {
                        out.push(t);
                    }
                }
                Ok(out)
            })
            .await
            .map_err(|e| Error::Store(format!("find_transfers: {e}")))
    }

    /// Up to `limit` `New` transfers ordered by `(block, log_index)` (§4.3, §4.5).
    pub async fn next_new_transfers(&self, limit: usize) -> Result<Vec<Transfer>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT transfer_id, status, btc_address, nonce, total_amount_sat,
                            origin_address, origin_tx_hash, origin_log_index, origin_block_number, bitcoin_tx_hash
                     FROM transfers WHERE status = ?1
                     ORDER BY origin_block_number ASC, origin_log_index ASC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![status_str(TransferStatus::New), limit as i64], row_to_transfer)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(|e| Error::Store(format!("next_new_transfers: {e}")))
    }

    /// Bulk-advance `ids` to `status` (§4.5 `mark_as_*_in_chain`).
    pub async fn update_transfer_status(&self, ids: Vec<TransferId>, status: TransferStatus) -> Result<()> {
        let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for id in &id_strings {
                    tx.execute(
                        "UPDATE transfers SET status = ?1 WHERE transfer_id = ?2",
                        rusqlite::params![status_str(status), id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(|e| Error::Store(format!("update_transfer_status: {e}")))
    }
}

fn identity_key(batch: &TransferBatch) -> String {
    batch
        .identity()
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn status_str(status: TransferStatus) -> &'static str {
    match status {
        TransferStatus::New => "new",
        TransferStatus::Sending => "sending",
        TransferStatus::Mined => "mined",
        TransferStatus::Refunded => "refunded",
        TransferStatus::Reclaimed => "reclaimed",
    }
}

fn status_from_str(s: &str) -> rusqlite::Result<TransferStatus> {
    match s {
        "new" => Ok(TransferStatus::New),
        "sending" => Ok(TransferStatus::Sending),
        "mined" => Ok(TransferStatus::Mined),
        "refunded" => Ok(TransferStatus::Refunded),
        "reclaimed" => Ok(TransferStatus::Reclaimed),
        other => Err(rusqlite::Error::InvalidColumnType(
            0,
            format!("unknown transfer status {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn row_to_stored(row: &rusqlite::Row) -> rusqlite::Result<StoredTransferBatch> {
    let dto_json: String = row.get(2)?;
    let dto: TransferBatchDto = serde_json::from_str(&dto_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(StoredTransferBatch {
        id: row.get(0)?,
        created_at: row.get(4)?,
        dto,
        terminal: row.get::<_, i64>(3)? != 0,
    })
}

fn row_to_transfer(row: &rusqlite::Row) -> rusqlite::Result<Transfer> {
    let status: String = row.get(1)?;
    let origin_tx_hash: String = row.get(6)?;
    let bitcoin_tx_hash: Option<String> = row.get(9)?;
    Ok(Transfer {
        transfer_id: parse_transfer_id(&row.get::<_, String>(0)?)?,
        status: status_from_str(&status)?,
        btc_address: row.get(2)?,
        nonce: row.get(3)?,
        total_amount_sat: row.get::<_, i64>(4)? as u64,
        origin_address: row.get(5)?,
        origin_tx_hash: parse_h256(&origin_tx_hash)?,
        origin_log_index: row.get::<_, i64>(7)? as u64,
        origin_block_number: row.get::<_, i64>(8)? as u64,
        bitcoin_tx_hash: bitcoin_tx_hash.map(|s| parse_h256(&s)).transpose()?,
    })
}

fn parse_transfer_id(s: &str) -> rusqlite::Result<TransferId> {
    let bytes = hex::decode(s.trim_start_matches("0x")).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "transfer id is not 32 bytes".into(), rusqlite::types::Type::Text)
    })?;
    Ok(TransferId(array))
}

fn parse_h256(s: &str) -> rusqlite::Result<ethers::types::H256> {
    s.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(0, "invalid h256".into(), rusqlite::types::Type::Text)
    })
}

//! Transfer Recorder Module
//!
//! SQLite-backed store for witness records, token pairs and scan cursors.
//!
//! The transfers table is keyed by `(chain, cashier, idx)`. Inserting a transfer
//! that already exists is a no-op, which makes rescanning a block range after a
//! restart harmless: the service only ever acts on what the store says.
//!
//! Table names are configurable. They are interpolated into the SQL text, so the
//! configuration layer only accepts plain identifiers.

use chrono::{DateTime, Utc};
use ethereum_types::{Address, H256, U256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

use crate::address::{parse_hex_address, to_hex_address};
use crate::error::{WitnessError, WitnessResult};
use crate::transfer::{
    ChainKind, CursorKey, TokenPair, Transfer, TransferKey, TransferStatus, WitnessRecord,
};

const RECORD_COLUMNS: &str = "chain, cashier, idx, token, sender, recipient, amount, \
    block_height, tx_hash, log_index, status, id, signature, created_at, updated_at";

// ============================================================================
// RECORDER IMPLEMENTATION
// ============================================================================

/// Durable store for witness state.
#[derive(Debug, Clone)]
pub struct Recorder {
    pool: SqlitePool,
    transfers: String,
    token_pairs: String,
    cursors: String,
}

impl Recorder {
    /// Opens the store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - `sqlite://path/to/file.db` or `sqlite::memory:`
    /// * `transfer_table` - Name of the transfers table; the cursor table is `<name>_cursors`
    /// * `token_pair_table` - Name of the token pairs table
    ///
    /// # Returns
    ///
    /// * `Ok(Recorder)` - Connected store; call [`start`](Self::start) before use
    /// * `Err(WitnessError::Storage)` - Bad URL or the database could not be opened
    pub async fn connect(
        database_url: &str,
        transfer_table: &str,
        token_pair_table: &str,
    ) -> WitnessResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        // Every connection to an in-memory database sees its own empty database.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        Ok(Self {
            pool,
            transfers: transfer_table.to_string(),
            token_pairs: token_pair_table.to_string(),
            cursors: format!("{}_cursors", transfer_table),
        })
    }

    /// Creates the tables if they do not exist yet.
    pub async fn start(&self) -> WitnessResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    chain TEXT NOT NULL,
                    cashier TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    token TEXT NOT NULL,
                    sender TEXT NOT NULL,
                    recipient TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    block_height INTEGER NOT NULL,
                    tx_hash TEXT NOT NULL,
                    log_index INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    id TEXT,
                    signature BLOB,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    checked_at INTEGER,
                    PRIMARY KEY (chain, cashier, idx)
                )",
                self.transfers
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_status ON {0} (chain, cashier, status)",
                self.transfers
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    token TEXT PRIMARY KEY,
                    co_token TEXT NOT NULL
                )",
                self.token_pairs
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    chain TEXT NOT NULL,
                    cashier TEXT NOT NULL,
                    height INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (chain, cashier)
                )",
                self.cursors
            ),
        ];

        for statement in statements.iter() {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        self.add_checked_at_column().await?;

        info!(
            "Recorder started with tables {}, {}, {}",
            self.transfers, self.token_pairs, self.cursors
        );
        Ok(())
    }

    /// Adds `checked_at` to transfer tables created before it existed.
    async fn add_checked_at_column(&self) -> WitnessResult<()> {
        let present: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = 'checked_at'",
        )
        .bind(&self.transfers)
        .fetch_one(&self.pool)
        .await?;
        if present == 0 {
            let sql = format!("ALTER TABLE {} ADD COLUMN checked_at INTEGER", self.transfers);
            sqlx::query(&sql).execute(&self.pool).await?;
            info!("Added checked_at column to {}", self.transfers);
        }
        Ok(())
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Recorder closed");
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Inserts a transfer with status `Discovered`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - A new row was inserted
    /// * `Ok(false)` - A row with the same `(chain, cashier, index)` already existed; nothing changed
    pub async fn record_transfer(&self, transfer: &Transfer) -> WitnessResult<bool> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
             ON CONFLICT (chain, cashier, idx) DO NOTHING",
            self.transfers, RECORD_COLUMNS
        );

        let result = sqlx::query(&sql)
            .bind(transfer.chain.as_str())
            .bind(to_hex_address(&transfer.cashier))
            .bind(transfer.index as i64)
            .bind(to_hex_address(&transfer.token))
            .bind(to_hex_address(&transfer.sender))
            .bind(to_hex_address(&transfer.recipient))
            .bind(transfer.amount.to_string())
            .bind(transfer.block_height as i64)
            .bind(hex_h256(&transfer.tx_hash))
            .bind(transfer.log_index as i64)
            .bind(TransferStatus::Discovered.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Loads the record for a transfer key.
    pub async fn get_record(&self, key: &TransferKey) -> WitnessResult<Option<WitnessRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE chain = ? AND cashier = ? AND idx = ?",
            RECORD_COLUMNS, self.transfers
        );
        let row = sqlx::query(&sql)
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .bind(key.index as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    /// Sets the status of an existing record.
    pub async fn update_status(&self, key: &TransferKey, status: TransferStatus) -> WitnessResult<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE chain = ? AND cashier = ? AND idx = ?",
            self.transfers
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .bind(key.index as i64)
            .execute(&self.pool)
            .await?;
        expect_one_row(result.rows_affected(), key)
    }

    /// Stores the attestation id and moves the record to `Validated`.
    pub async fn mark_validated(&self, key: &TransferKey, id: &H256) -> WitnessResult<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, id = ?, updated_at = ? WHERE chain = ? AND cashier = ? AND idx = ?",
            self.transfers
        );
        let result = sqlx::query(&sql)
            .bind(TransferStatus::Validated.as_str())
            .bind(hex_h256(id))
            .bind(Utc::now().timestamp_millis())
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .bind(key.index as i64)
            .execute(&self.pool)
            .await?;
        expect_one_row(result.rows_affected(), key)
    }

    /// Stores the witness signature and moves the record to `Signed`.
    pub async fn mark_signed(&self, key: &TransferKey, signature: &[u8]) -> WitnessResult<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, signature = ?, updated_at = ? WHERE chain = ? AND cashier = ? AND idx = ?",
            self.transfers
        );
        let result = sqlx::query(&sql)
            .bind(TransferStatus::Signed.as_str())
            .bind(signature)
            .bind(Utc::now().timestamp_millis())
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .bind(key.index as i64)
            .execute(&self.pool)
            .await?;
        expect_one_row(result.rows_affected(), key)
    }

    /// All records of one cashier in the given status, in `(block_height, log_index)` order.
    pub async fn records_with_status(
        &self,
        chain: ChainKind,
        cashier: &Address,
        status: TransferStatus,
    ) -> WitnessResult<Vec<WitnessRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE chain = ? AND cashier = ? AND status = ?
             ORDER BY block_height ASC, log_index ASC",
            RECORD_COLUMNS, self.transfers
        );
        let rows = sqlx::query(&sql)
            .bind(chain.as_str())
            .bind(to_hex_address(cashier))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Up to `limit` `Submitted` records of one cashier, least recently
    /// checked first. Records never checked come before all others.
    pub async fn settlement_candidates(
        &self,
        chain: ChainKind,
        cashier: &Address,
        limit: u32,
    ) -> WitnessResult<Vec<WitnessRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE chain = ? AND cashier = ? AND status = ?
             ORDER BY checked_at ASC, block_height ASC, log_index ASC
             LIMIT ?",
            RECORD_COLUMNS, self.transfers
        );
        let rows = sqlx::query(&sql)
            .bind(chain.as_str())
            .bind(to_hex_address(cashier))
            .bind(TransferStatus::Submitted.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Stamps the time of the latest settlement check on a record.
    pub async fn mark_checked(&self, key: &TransferKey) -> WitnessResult<()> {
        let sql = format!(
            "UPDATE {} SET checked_at = ? WHERE chain = ? AND cashier = ? AND idx = ?",
            self.transfers
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .bind(key.index as i64)
            .execute(&self.pool)
            .await?;
        expect_one_row(result.rows_affected(), key)
    }

    // ------------------------------------------------------------------------
    // Cursor
    // ------------------------------------------------------------------------

    /// Highest fully scanned height for a cashier, if one was ever stored.
    pub async fn get_cursor(&self, key: &CursorKey) -> WitnessResult<Option<u64>> {
        let sql = format!(
            "SELECT height FROM {} WHERE chain = ? AND cashier = ?",
            self.cursors
        );
        let height: Option<i64> = sqlx::query_scalar(&sql)
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .fetch_optional(&self.pool)
            .await?;
        Ok(height.map(|h| h as u64))
    }

    /// Stores the scan cursor. Callers must only advance it after the covered
    /// range is fully recorded.
    pub async fn set_cursor(&self, key: &CursorKey, height: u64) -> WitnessResult<()> {
        let sql = format!(
            "INSERT INTO {} (chain, cashier, height, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT (chain, cashier) DO UPDATE SET height = excluded.height, updated_at = excluded.updated_at",
            self.cursors
        );
        sqlx::query(&sql)
            .bind(key.chain.as_str())
            .bind(to_hex_address(&key.cashier))
            .bind(height as i64)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Token pairs
    // ------------------------------------------------------------------------

    /// Destination token for a source token, if the pair is whitelisted.
    pub async fn token_pair(&self, token: &Address) -> WitnessResult<Option<TokenPair>> {
        let sql = format!("SELECT co_token FROM {} WHERE token = ?", self.token_pairs);
        let co_token: Option<String> = sqlx::query_scalar(&sql)
            .bind(to_hex_address(token))
            .fetch_optional(&self.pool)
            .await?;

        co_token
            .map(|co_token| {
                Ok(TokenPair {
                    token: *token,
                    co_token: stored_address(&co_token)?,
                })
            })
            .transpose()
    }

    /// Whitelists a token pair, replacing any previous mapping for the token.
    pub async fn add_token_pair(&self, pair: &TokenPair) -> WitnessResult<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} (token, co_token) VALUES (?, ?)",
            self.token_pairs
        );
        sqlx::query(&sql)
            .bind(to_hex_address(&pair.token))
            .bind(to_hex_address(&pair.co_token))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ============================================================================
// ROW DECODING
// ============================================================================

fn record_from_row(row: &SqliteRow) -> WitnessResult<WitnessRecord> {
    let chain: String = row.try_get("chain")?;
    let status: String = row.try_get("status")?;
    let amount: String = row.try_get("amount")?;
    let id: Option<String> = row.try_get("id")?;

    let transfer = Transfer {
        chain: chain.parse().map_err(WitnessError::CorruptRecord)?,
        cashier: stored_address(&row.try_get::<String, _>("cashier")?)?,
        token: stored_address(&row.try_get::<String, _>("token")?)?,
        index: row.try_get::<i64, _>("idx")? as u64,
        sender: stored_address(&row.try_get::<String, _>("sender")?)?,
        recipient: stored_address(&row.try_get::<String, _>("recipient")?)?,
        amount: U256::from_dec_str(&amount)
            .map_err(|e| WitnessError::CorruptRecord(format!("bad amount '{}': {:?}", amount, e)))?,
        block_height: row.try_get::<i64, _>("block_height")? as u64,
        tx_hash: stored_h256(&row.try_get::<String, _>("tx_hash")?)?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
    };

    Ok(WitnessRecord {
        transfer,
        status: status.parse().map_err(WitnessError::CorruptRecord)?,
        id: id.as_deref().map(stored_h256).transpose()?,
        signature: row.try_get("signature")?,
        created_at: stored_time(row.try_get("created_at")?)?,
        updated_at: stored_time(row.try_get("updated_at")?)?,
    })
}

fn expect_one_row(rows_affected: u64, key: &TransferKey) -> WitnessResult<()> {
    if rows_affected == 0 {
        return Err(WitnessError::CorruptRecord(format!(
            "no record for transfer {}",
            key
        )));
    }
    Ok(())
}

fn hex_h256(value: &H256) -> String {
    format!("0x{}", hex::encode(value.as_bytes()))
}

fn stored_address(value: &str) -> WitnessResult<Address> {
    parse_hex_address(value).map_err(|e| WitnessError::CorruptRecord(e.to_string()))
}

fn stored_h256(value: &str) -> WitnessResult<H256> {
    let bytes = hex::decode(value.strip_prefix("0x").unwrap_or(value))
        .map_err(|e| WitnessError::CorruptRecord(format!("bad hash '{}': {}", value, e)))?;
    if bytes.len() != 32 {
        return Err(WitnessError::CorruptRecord(format!(
            "bad hash '{}': expected 32 bytes",
            value
        )));
    }
    Ok(H256::from_slice(&bytes))
}

fn stored_time(millis: i64) -> WitnessResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| WitnessError::CorruptRecord(format!("bad timestamp {}", millis)))
}

//! Unit tests for the SQLite recorder
//!
//! These tests verify transfer recording, status transitions, cursor
//! persistence and token pair lookups against an in-memory database.

use ethereum_types::H256;
use std::str::FromStr;
use witness_service::{ChainKind, CursorKey, Recorder, TokenPair, TransferStatus};

#[path = "mod.rs"]
mod test_helpers;
use test_helpers::{
    addr, create_base_transfer, setup_recorder, DUMMY_CASHIER_ADDR, DUMMY_CO_TOKEN_ADDR,
    DUMMY_TOKEN_ADDR, DUMMY_UNKNOWN_TOKEN_ADDR,
};

fn cursor_key() -> CursorKey {
    CursorKey {
        chain: ChainKind::Ethereum,
        cashier: addr(DUMMY_CASHIER_ADDR),
    }
}

// ============================================================================
// TRANSFER TESTS
// ============================================================================

/// Test that recording the same transfer twice is a no-op the second time
/// What is tested: record_transfer returns true then false for the same key
/// Why: Rescanning a range after a restart must not duplicate records
#[tokio::test]
async fn test_record_transfer_is_idempotent() {
    let recorder = setup_recorder().await;
    let transfer = create_base_transfer(1, 101, 0);

    assert!(recorder.record_transfer(&transfer).await.unwrap());
    assert!(!recorder.record_transfer(&transfer).await.unwrap());

    let records = recorder
        .records_with_status(ChainKind::Ethereum, &transfer.cashier, TransferStatus::Discovered)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
}

/// Test that a re-observed key keeps its first content and status
/// What is tested: a second insert with different fields does not overwrite the row
/// Why: The stored record is the source of truth once it exists
#[tokio::test]
async fn test_record_transfer_keeps_existing_row() {
    let recorder = setup_recorder().await;
    let transfer = create_base_transfer(1, 101, 0);
    recorder.record_transfer(&transfer).await.unwrap();
    recorder
        .update_status(&transfer.key(), TransferStatus::Failed)
        .await
        .unwrap();

    let mut moved = transfer.clone();
    moved.block_height = 150;
    assert!(!recorder.record_transfer(&moved).await.unwrap());

    let record = recorder.get_record(&transfer.key()).await.unwrap().unwrap();
    assert_eq!(record.transfer, transfer);
    assert_eq!(record.status, TransferStatus::Failed);
}

/// Test that a stored record reads back with every field intact
/// What is tested: get_record after record_transfer
/// Why: Resumed transfers are signed from the stored copy
#[tokio::test]
async fn test_get_record_returns_stored_transfer() {
    let recorder = setup_recorder().await;
    let transfer = create_base_transfer(7, 120, 3);
    recorder.record_transfer(&transfer).await.unwrap();

    let record = recorder.get_record(&transfer.key()).await.unwrap().unwrap();
    assert_eq!(record.transfer, transfer);
    assert_eq!(record.status, TransferStatus::Discovered);
    assert!(record.id.is_none());
    assert!(record.signature.is_none());
    assert!(record.created_at <= record.updated_at);
}

/// Test that an unknown key yields no record
/// What is tested: get_record on an empty store
/// Why: The service distinguishes new and known transfers by this lookup
#[tokio::test]
async fn test_get_nonexistent_record() {
    let recorder = setup_recorder().await;
    let transfer = create_base_transfer(1, 101, 0);
    assert!(recorder.get_record(&transfer.key()).await.unwrap().is_none());
}

/// Test the validated and signed transitions
/// What is tested: mark_validated stores the id, mark_signed stores the signature
/// Why: A signature must survive restarts so it is never re-derived
#[tokio::test]
async fn test_mark_validated_then_signed() {
    let recorder = setup_recorder().await;
    let transfer = create_base_transfer(1, 101, 0);
    let key = transfer.key();
    recorder.record_transfer(&transfer).await.unwrap();

    let id = H256::repeat_byte(0xab);
    recorder.mark_validated(&key, &id).await.unwrap();
    let record = recorder.get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, TransferStatus::Validated);
    assert_eq!(record.id, Some(id));

    let signature = vec![7u8; 65];
    recorder.mark_signed(&key, &signature).await.unwrap();
    let record = recorder.get_record(&key).await.unwrap().unwrap();
    assert_eq!(record.status, TransferStatus::Signed);
    assert_eq!(record.id, Some(id));
    assert_eq!(record.signature, Some(signature));
}

/// Test that updating a missing record is an error
/// What is tested: update_status on an unknown key
/// Why: Silent no-op updates would hide bookkeeping bugs
#[tokio::test]
async fn test_update_status_of_missing_record_fails() {
    let recorder = setup_recorder().await;
    let transfer = create_base_transfer(1, 101, 0);
    let result = recorder
        .update_status(&transfer.key(), TransferStatus::Submitted)
        .await;
    assert!(result.is_err());
}

/// Test that status queries return records in chain order
/// What is tested: records_with_status ordering by (block_height, log_index)
/// Why: Retried submissions must keep the original order
#[tokio::test]
async fn test_records_with_status_ordered_by_position() {
    let recorder = setup_recorder().await;
    for transfer in [
        create_base_transfer(3, 105, 0),
        create_base_transfer(1, 101, 2),
        create_base_transfer(2, 101, 5),
    ] {
        recorder.record_transfer(&transfer).await.unwrap();
    }

    let records = recorder
        .records_with_status(
            ChainKind::Ethereum,
            &addr(DUMMY_CASHIER_ADDR),
            TransferStatus::Discovered,
        )
        .await
        .unwrap();
    let indexes: Vec<u64> = records.iter().map(|r| r.transfer.index).collect();
    assert_eq!(indexes, vec![1, 2, 3]);
}

/// Records every transfer and moves it to `Submitted`.
async fn record_submitted(recorder: &Recorder, transfers: &[witness_service::Transfer]) {
    for transfer in transfers {
        recorder.record_transfer(transfer).await.unwrap();
        recorder
            .update_status(&transfer.key(), TransferStatus::Submitted)
            .await
            .unwrap();
    }
}

/// Test the settlement candidate query
/// What is tested: only Submitted records are returned, at most `limit`, never-checked first
/// in chain order, and a checked record moves behind the unchecked ones
/// Why: Settlement lookups are budgeted per cycle and must reach every record eventually
#[tokio::test]
async fn test_settlement_candidates_rotate() {
    let recorder = setup_recorder().await;
    let transfers = [
        create_base_transfer(1, 101, 0),
        create_base_transfer(2, 102, 0),
        create_base_transfer(3, 103, 0),
    ];
    record_submitted(&recorder, &transfers).await;
    let signed = create_base_transfer(4, 100, 0);
    recorder.record_transfer(&signed).await.unwrap();

    let cashier = addr(DUMMY_CASHIER_ADDR);
    let indexes = |records: Vec<witness_service::WitnessRecord>| -> Vec<u64> {
        records.iter().map(|r| r.transfer.index).collect()
    };

    let first = recorder
        .settlement_candidates(ChainKind::Ethereum, &cashier, 2)
        .await
        .unwrap();
    assert_eq!(indexes(first), vec![1, 2]);

    recorder.mark_checked(&transfers[0].key()).await.unwrap();
    recorder.mark_checked(&transfers[1].key()).await.unwrap();

    let second = recorder
        .settlement_candidates(ChainKind::Ethereum, &cashier, 2)
        .await
        .unwrap();
    assert_eq!(indexes(second)[0], 3);

    let all = recorder
        .settlement_candidates(ChainKind::Ethereum, &cashier, 10)
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

/// Test stamping a missing record
/// What is tested: mark_checked on an unknown key fails
/// Why: A silent no-op would hide a lost record
#[tokio::test]
async fn test_mark_checked_missing_record_fails() {
    let recorder = setup_recorder().await;
    let result = recorder
        .mark_checked(&create_base_transfer(9, 101, 0).key())
        .await;
    assert!(result.is_err());
}

/// Test that large amounts survive storage
/// What is tested: U256 amounts beyond u64 are stored losslessly
/// Why: Token amounts routinely exceed 64 bits with 18 decimals
#[tokio::test]
async fn test_large_amount_round_trip() {
    let recorder = setup_recorder().await;
    let mut transfer = create_base_transfer(1, 101, 0);
    transfer.amount = ethereum_types::U256::from_dec_str("123456789012345678901234567890").unwrap();
    recorder.record_transfer(&transfer).await.unwrap();

    let record = recorder.get_record(&transfer.key()).await.unwrap().unwrap();
    assert_eq!(record.transfer.amount, transfer.amount);
}

// ============================================================================
// CURSOR TESTS
// ============================================================================

/// Test that the cursor is absent until set and then overwritten in place
/// What is tested: get_cursor / set_cursor
/// Why: The scan resumes from the stored cursor after a restart
#[tokio::test]
async fn test_cursor_set_and_get() {
    let recorder = setup_recorder().await;
    let key = cursor_key();

    assert_eq!(recorder.get_cursor(&key).await.unwrap(), None);
    recorder.set_cursor(&key, 102).await.unwrap();
    assert_eq!(recorder.get_cursor(&key).await.unwrap(), Some(102));
    recorder.set_cursor(&key, 103).await.unwrap();
    assert_eq!(recorder.get_cursor(&key).await.unwrap(), Some(103));
}

/// Test that cursors are kept per cashier
/// What is tested: two cursor keys do not share state
/// Why: Several witnesses may share one store
#[tokio::test]
async fn test_cursor_is_per_cashier() {
    let recorder = setup_recorder().await;
    let other = CursorKey {
        chain: ChainKind::Iotex,
        cashier: addr(DUMMY_CASHIER_ADDR),
    };

    recorder.set_cursor(&cursor_key(), 500).await.unwrap();
    assert_eq!(recorder.get_cursor(&other).await.unwrap(), None);
}

// ============================================================================
// TOKEN PAIR TESTS
// ============================================================================

/// Test token pair lookups
/// What is tested: token_pair for registered and unregistered tokens
/// Why: Validation rejects transfers of tokens without a pair
#[tokio::test]
async fn test_token_pair_lookup() {
    let recorder = setup_recorder().await;

    let pair = recorder.token_pair(&addr(DUMMY_TOKEN_ADDR)).await.unwrap();
    assert_eq!(
        pair,
        Some(TokenPair {
            token: addr(DUMMY_TOKEN_ADDR),
            co_token: addr(DUMMY_CO_TOKEN_ADDR),
        })
    );
    assert_eq!(
        recorder.token_pair(&addr(DUMMY_UNKNOWN_TOKEN_ADDR)).await.unwrap(),
        None
    );
}

// ============================================================================
// PERSISTENCE TESTS
// ============================================================================

/// Test that state survives reopening a file-backed store
/// What is tested: records and cursor are read back by a second Recorder
/// Why: Restart safety depends on durable writes
#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("witness.db").display());
    let transfer = create_base_transfer(1, 101, 0);

    {
        let recorder = Recorder::connect(&url, "transfers", "token_pairs").await.unwrap();
        recorder.start().await.unwrap();
        recorder.record_transfer(&transfer).await.unwrap();
        recorder.set_cursor(&cursor_key(), 101).await.unwrap();
        recorder.close().await;
    }

    let recorder = Recorder::connect(&url, "transfers", "token_pairs").await.unwrap();
    recorder.start().await.unwrap();
    assert!(recorder.get_record(&transfer.key()).await.unwrap().is_some());
    assert_eq!(recorder.get_cursor(&cursor_key()).await.unwrap(), Some(101));
    assert!(!recorder.record_transfer(&transfer).await.unwrap());
}

/// Test that custom table names are honoured
/// What is tested: a recorder with non-default table names works end to end
/// Why: Table names come from configuration
#[tokio::test]
async fn test_custom_table_names() {
    let recorder = Recorder::connect("sqlite::memory:", "eth_witness", "eth_pairs")
        .await
        .unwrap();
    recorder.start().await.unwrap();
    let transfer = create_base_transfer(1, 101, 0);
    assert!(recorder.record_transfer(&transfer).await.unwrap());
    recorder.set_cursor(&cursor_key(), 9).await.unwrap();
    assert_eq!(recorder.get_cursor(&cursor_key()).await.unwrap(), Some(9));
}

/// Test opening a store created before settlement checks were tracked
/// What is tested: start() adds the checked_at column to an existing transfers table
/// Why: Upgrading the witness must not require dropping its database
#[tokio::test]
async fn test_start_upgrades_existing_table() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("witness.db").display());

    {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(&url)
            .unwrap()
            .create_if_missing(true);
        let pool = sqlx::SqlitePool::connect_with(options).await.unwrap();
        sqlx::query(
            "CREATE TABLE transfers (
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
                PRIMARY KEY (chain, cashier, idx)
            )",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool.close().await;
    }

    let recorder = Recorder::connect(&url, "transfers", "token_pairs").await.unwrap();
    recorder.start().await.unwrap();
    let transfer = create_base_transfer(1, 101, 0);
    record_submitted(&recorder, std::slice::from_ref(&transfer)).await;
    recorder.mark_checked(&transfer.key()).await.unwrap();

    // A second start on an upgraded table is a no-op.
    recorder.start().await.unwrap();
    let candidates = recorder
        .settlement_candidates(ChainKind::Ethereum, &addr(DUMMY_CASHIER_ADDR), 10)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 1);
}

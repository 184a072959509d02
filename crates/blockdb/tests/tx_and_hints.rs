use cairn_blockdb::schema::tx_key;
use cairn_blockdb::{
    Backend, BlockDb, DbConfig, DbMode, StoredHeader, StoredTx, StoredTxHints,
};
use cairn_primitives::block::{Block, BlockHeader};
use cairn_primitives::outpoint::OutPoint;
use cairn_primitives::transaction::{Transaction, TxIn, TxOut};
use cairn_primitives::Hash256;
use cairn_storage::WriteBatch;

fn open_db() -> BlockDb {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DbConfig::new(dir.path(), Backend::Memory, DbMode::Full);
    config.select_network("Regtest");
    BlockDb::open_databases(config).expect("open")
}

fn coinbase(height: u32) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn store_header_at(db: &BlockDb, height: u32, nonce: u32) {
    let block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [height as u8; 32],
            merkle_root: [nonce as u8; 32],
            time: 1_600_000_000 + height,
            bits: 0x207fffff,
            nonce,
        },
        transactions: vec![coinbase(height)],
    };
    let mut batch = WriteBatch::new();
    let mut sbh = StoredHeader::from_block(&block, height);
    db.put_stored_header(&mut batch, &mut sbh, false, true)
        .expect("put header");
    db.commit_batch(batch).expect("commit");
}

fn stored_tx_with_hash(hash: Hash256, height: u32, tx_index: u16) -> StoredTx {
    let mut stx = StoredTx::from_transaction(&coinbase(height), height, 0, tx_index);
    stx.hash = hash;
    stx
}

#[test]
fn stored_tx_fragmentation_round_trip() {
    let db = open_db();
    store_header_at(&db, 7, 1);

    let stx = StoredTx::from_transaction(&coinbase(7), 7, 0, 0);
    let mut batch = WriteBatch::new();
    db.put_stored_tx(&mut batch, &stx, true).unwrap();
    db.commit_batch(batch).unwrap();

    // The record is fragmented; outputs come back from their own slots.
    let loaded = db.get_stored_tx(7, 0, 0, true).unwrap().expect("stored");
    assert!(loaded.fragmented);
    assert_eq!(loaded.outputs.len(), 1);
    assert_eq!(loaded.outputs[&0].value, 50_000);
    assert_eq!(loaded.to_transaction().unwrap(), coinbase(7));

    let without = db.get_stored_tx(7, 0, 0, false).unwrap().expect("stored");
    assert!(without.outputs.is_empty());
    assert_eq!(without.num_txout, 1);

    assert_eq!(db.get_stxo_count_for_tx(&tx_key(7, 0, 0)).unwrap(), Some(1));
    assert_eq!(
        db.get_tx_hash_for_db_key(&tx_key(7, 0, 0)).unwrap(),
        Some(stx.hash)
    );
    let txout = db.get_tx_out_copy(&tx_key(7, 0, 0), 0).unwrap().unwrap();
    assert_eq!(txout.value, 50_000);
}

#[test]
fn hint_collisions_resolve_by_full_hash() {
    let db = open_db();
    store_header_at(&db, 1, 1);
    store_header_at(&db, 2, 2);

    // Two transactions whose hashes share the 4-byte bucket prefix.
    let mut hash_a = [0u8; 32];
    hash_a[0..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    hash_a[4] = 1;
    let mut hash_b = hash_a;
    hash_b[4] = 2;

    let stx_a = stored_tx_with_hash(hash_a, 1, 0);
    let stx_b = stored_tx_with_hash(hash_b, 2, 0);

    let mut batch = WriteBatch::new();
    db.put_stored_tx(&mut batch, &stx_a, true).unwrap();
    db.put_stored_tx(&mut batch, &stx_b, true).unwrap();
    let mut hints = StoredTxHints::new([0xde, 0xad, 0xbe, 0xef]);
    hints.push(stx_a.db_key());
    hints.push(stx_b.db_key());
    db.put_stored_tx_hints(&mut batch, &hints);
    db.commit_batch(batch).unwrap();

    let found_a = db.get_stored_tx_by_hash(&hash_a).unwrap().expect("tx a");
    assert_eq!(found_a.db_key(), stx_a.db_key());
    let found_b = db.get_stored_tx_by_hash(&hash_b).unwrap().expect("tx b");
    assert_eq!(found_b.db_key(), stx_b.db_key());

    // Absent hash sharing the prefix: bucket walked, nothing matches.
    let mut hash_c = hash_a;
    hash_c[4] = 3;
    assert!(db.get_stored_tx_by_hash(&hash_c).unwrap().is_none());
}

#[test]
fn preferred_hint_moves_to_front() {
    let db = open_db();
    store_header_at(&db, 1, 1);
    store_header_at(&db, 2, 2);

    let mut hash = [0u8; 32];
    hash[0..4].copy_from_slice(&[1, 2, 3, 4]);
    let stx_a = stored_tx_with_hash(hash, 1, 0);

    let mut batch = WriteBatch::new();
    db.put_stored_tx(&mut batch, &stx_a, true).unwrap();
    let mut hints = StoredTxHints::new([1, 2, 3, 4]);
    hints.push(stx_a.db_key());
    db.put_stored_tx_hints(&mut batch, &hints);
    db.commit_batch(batch).unwrap();

    // Prefer a second candidate; it is appended and listed first.
    let newcomer = tx_key(2, 0, 0);
    let mut batch = WriteBatch::new();
    db.update_preferred_tx_hint(&mut batch, &hash, newcomer)
        .unwrap();
    db.commit_batch(batch).unwrap();

    let bucket = db
        .get_stored_tx_hints(&[1, 2, 3, 4])
        .unwrap()
        .expect("bucket");
    assert_eq!(bucket.db_keys.len(), 2);
    assert_eq!(bucket.keys_preferred_first()[0], newcomer);

    // Lookups still resolve by full hash even with the preferred pointer
    // on a slot that does not match.
    let found = db.get_stored_tx_by_hash(&hash).unwrap().expect("tx a");
    assert_eq!(found.db_key(), stx_a.db_key());
}

#[test]
fn side_branch_txs_are_not_returned_by_hash() {
    let db = open_db();
    store_header_at(&db, 3, 1);

    let mut hash = [0u8; 32];
    hash[0..4].copy_from_slice(&[9, 9, 9, 9]);
    // Record lives at dup 1, but dup 0 is the valid one.
    let mut stx = stored_tx_with_hash(hash, 3, 0);
    stx.dup_id = 1;
    for txout in stx.outputs.values_mut() {
        txout.dup_id = 1;
    }

    let mut batch = WriteBatch::new();
    db.put_stored_tx(&mut batch, &stx, true).unwrap();
    let mut hints = StoredTxHints::new([9, 9, 9, 9]);
    hints.push(stx.db_key());
    db.put_stored_tx_hints(&mut batch, &hints);
    db.commit_batch(batch).unwrap();

    assert!(db.get_stored_tx_by_hash(&hash).unwrap().is_none());
}

#[test]
fn zero_conf_records_are_partitioned_and_sweepable() {
    let db = open_db();
    let tx = coinbase(99);

    let mut batch = WriteBatch::new();
    db.put_stored_zc(&mut batch, &tx, 0).unwrap();
    db.put_stored_zc(&mut batch, &tx, 1).unwrap();
    db.commit_batch(batch).unwrap();

    let zc = db.get_stored_zc_tx(0).unwrap().expect("zc tx");
    assert_eq!(zc.hash, tx.txid());
    assert_eq!(zc.outputs.len(), 1);
    assert!(db.get_stored_zc_tx(2).unwrap().is_none());

    // Sweep on shutdown.
    let mut batch = WriteBatch::new();
    db.clear_zero_conf(&mut batch).unwrap();
    db.commit_batch(batch).unwrap();
    assert!(db.get_stored_zc_tx(0).unwrap().is_none());
    assert!(db.get_stored_zc_tx(1).unwrap().is_none());
}

use cairn_blockdb::schema::DUP_VALID;
use cairn_blockdb::{Backend, BlockDb, DbConfig, DbMode, StoredHeader};
use cairn_primitives::block::{Block, BlockHeader};
use cairn_primitives::outpoint::OutPoint;
use cairn_primitives::transaction::{Transaction, TxIn, TxOut};
use cairn_primitives::Hash256;
use cairn_storage::WriteBatch;

fn open_db(mode: DbMode) -> BlockDb {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DbConfig::new(dir.path(), Backend::Memory, mode);
    config.select_network("Regtest");
    match mode {
        DbMode::Super => BlockDb::open_databases_supernode(config).expect("open"),
        _ => BlockDb::open_databases(config).expect("open"),
    }
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

fn make_block(prev_block: Hash256, height: u32, nonce: u32) -> Block {
    Block {
        header: BlockHeader {
            version: 1,
            prev_block,
            merkle_root: [height as u8; 32],
            time: 1_600_000_000 + height,
            bits: 0x207fffff,
            nonce,
        },
        transactions: vec![coinbase(height)],
    }
}

#[test]
fn genesis_insert_gets_dup_zero() {
    let db = open_db(DbMode::Full);
    let genesis = make_block([0u8; 32], 0, 0);
    let genesis_hash = genesis.hash();

    let mut batch = WriteBatch::new();
    let mut sbh = StoredHeader::from_block(&genesis, 0);
    let dup = db
        .put_stored_header(&mut batch, &mut sbh, false, true)
        .expect("put header");
    db.commit_batch(batch).expect("commit");

    assert_eq!(dup, 0);
    assert_eq!(db.get_valid_dup_id_for_height(0).unwrap(), Some(0));
    let bare = db.get_bare_header(0, 0).unwrap().expect("stored");
    assert_eq!(bare.hash, genesis_hash);
    assert_eq!(bare.height, 0);
    assert_eq!(db.get_dup_for_block_hash(&genesis_hash).unwrap(), Some(0));
}

#[test]
fn competing_tips_share_a_height() {
    let db = open_db(DbMode::Full);
    let parent = make_block([0u8; 32], 2, 7);
    let tip_a = make_block(parent.hash(), 3, 100);
    let tip_b = make_block(parent.hash(), 3, 200);
    assert_ne!(tip_a.hash(), tip_b.hash());

    let mut batch = WriteBatch::new();
    let mut sbh_a = StoredHeader::from_block(&tip_a, 3);
    let dup_a = db
        .put_stored_header(&mut batch, &mut sbh_a, false, true)
        .unwrap();
    db.commit_batch(batch).unwrap();

    let mut batch = WriteBatch::new();
    let mut sbh_b = StoredHeader::from_block(&tip_b, 3);
    let dup_b = db
        .put_stored_header(&mut batch, &mut sbh_b, false, true)
        .unwrap();
    db.commit_batch(batch).unwrap();

    assert_eq!(dup_a, 0);
    assert_eq!(dup_b, 1);

    let list = db.get_stored_head_hgt_list(3).unwrap().expect("list");
    assert_eq!(list.entries.len(), 2);
    assert_eq!(list.dup_for_hash(&tip_a.hash()), Some(0));
    assert_eq!(list.dup_for_hash(&tip_b.hash()), Some(1));
    // Exactly one dup is valid, and the first writer kept it.
    assert_eq!(list.valid_dup, Some(0));
    assert_eq!(db.get_valid_dup_id_for_height(3).unwrap(), Some(0));

    // Both headers remain addressable.
    assert_eq!(
        db.get_bare_header(3, 0).unwrap().unwrap().hash,
        tip_a.hash()
    );
    assert_eq!(
        db.get_bare_header(3, 1).unwrap().unwrap().hash,
        tip_b.hash()
    );
}

#[test]
fn reinserting_a_header_keeps_its_dup() {
    let db = open_db(DbMode::Full);
    let block = make_block([0u8; 32], 5, 1);

    for _ in 0..2 {
        let mut batch = WriteBatch::new();
        let mut sbh = StoredHeader::from_block(&block, 5);
        let dup = db
            .put_stored_header(&mut batch, &mut sbh, false, true)
            .unwrap();
        db.commit_batch(batch).unwrap();
        assert_eq!(dup, 0);
    }
    let list = db.get_stored_head_hgt_list(5).unwrap().unwrap();
    assert_eq!(list.entries.len(), 1);
}

#[test]
fn valid_dup_sentinel_resolves_lookup() {
    let db = open_db(DbMode::Full);
    let tip_a = make_block([0u8; 32], 4, 1);
    let tip_b = make_block([1u8; 32], 4, 2);

    let mut batch = WriteBatch::new();
    let mut sbh = StoredHeader::from_block(&tip_a, 4);
    db.put_stored_header(&mut batch, &mut sbh, false, true)
        .unwrap();
    let mut sbh = StoredHeader::from_block(&tip_b, 4);
    db.put_stored_header(&mut batch, &mut sbh, false, false)
        .unwrap();
    db.commit_batch(batch).unwrap();

    // 0xff asks for whichever dup is valid.
    let resolved = db.get_bare_header(4, DUP_VALID).unwrap().expect("valid tip");
    assert_eq!(resolved.hash, tip_a.hash());

    // Flip validity and the sentinel follows.
    let mut batch = WriteBatch::new();
    db.mark_block_header_valid(&mut batch, 4, 1).unwrap();
    db.commit_batch(batch).unwrap();
    let resolved = db.get_bare_header(4, DUP_VALID).unwrap().expect("valid tip");
    assert_eq!(resolved.hash, tip_b.hash());
}

#[test]
fn set_valid_dup_respects_overwrite_flag() {
    let db = open_db(DbMode::Full);
    let tip_a = make_block([0u8; 32], 9, 1);
    let tip_b = make_block([1u8; 32], 9, 2);
    let mut batch = WriteBatch::new();
    let mut sbh = StoredHeader::from_block(&tip_a, 9);
    db.put_stored_header(&mut batch, &mut sbh, false, true)
        .unwrap();
    let mut sbh = StoredHeader::from_block(&tip_b, 9);
    db.put_stored_header(&mut batch, &mut sbh, false, false)
        .unwrap();
    db.commit_batch(batch).unwrap();

    // Without overwrite the existing choice stands.
    let mut batch = WriteBatch::new();
    db.set_valid_dup_id_for_height(&mut batch, 9, 1, false)
        .unwrap();
    db.commit_batch(batch).unwrap();
    assert_eq!(db.get_valid_dup_id_for_height(9).unwrap(), Some(0));

    let mut batch = WriteBatch::new();
    db.set_valid_dup_id_for_height(&mut batch, 9, 1, true).unwrap();
    db.commit_batch(batch).unwrap();
    assert_eq!(db.get_valid_dup_id_for_height(9).unwrap(), Some(1));
}

#[test]
fn dup_cache_reloads_from_mirror() {
    let db = open_db(DbMode::Full);
    let block = make_block([0u8; 32], 12, 3);
    let mut batch = WriteBatch::new();
    let mut sbh = StoredHeader::from_block(&block, 12);
    db.put_stored_header(&mut batch, &mut sbh, false, true)
        .unwrap();
    db.commit_batch(batch).unwrap();

    db.clear_dup_cache();
    db.load_valid_dup_cache().unwrap();
    assert_eq!(db.get_valid_dup_id_for_height(12).unwrap(), Some(0));
}

#[test]
fn read_all_headers_streams_every_record() {
    let db = open_db(DbMode::Full);
    let mut hashes = Vec::new();
    for height in 0..4u32 {
        let block = make_block([height as u8; 32], height, height);
        hashes.push(block.hash());
        let mut batch = WriteBatch::new();
        let mut sbh = StoredHeader::from_block(&block, height);
        db.put_stored_header(&mut batch, &mut sbh, false, true)
            .unwrap();
        db.commit_batch(batch).unwrap();
    }
    let mut seen = Vec::new();
    db.read_all_headers(&mut |sbh| seen.push(sbh.hash)).unwrap();
    assert_eq!(seen.len(), 4);
    for hash in hashes {
        assert!(seen.contains(&hash));
    }
}

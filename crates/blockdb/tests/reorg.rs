use cairn_blockdb::{Backend, BlockDb, DbConfig, DbMode, StoredHeader};
use cairn_primitives::block::{Block, BlockHeader};
use cairn_primitives::outpoint::OutPoint;
use cairn_primitives::script::ScrAddr;
use cairn_primitives::transaction::{Transaction, TxIn, TxOut};
use cairn_primitives::Hash256;
use cairn_storage::{Column, WriteBatch};

fn open_fullnode() -> BlockDb {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DbConfig::new(dir.path(), Backend::Memory, DbMode::Full);
    config.select_network("Regtest");
    BlockDb::open_databases(config).expect("open")
}

fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
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
            value: 50,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn spend(prev_txid: Hash256, prev_index: u32, value: i64, script: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: prev_txid,
                index: prev_index,
            },
            script_sig: vec![0x00],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: script,
        }],
        lock_time: 0,
    }
}

fn make_block(prev: Hash256, height: u32, nonce: u32, extra: Vec<Transaction>) -> Block {
    let mut transactions = vec![coinbase(height)];
    transactions.extend(extra);
    Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [height as u8; 32],
            time: 1_600_000_000 + height,
            bits: 0x207fffff,
            nonce,
        },
        transactions,
    }
}

fn apply(db: &BlockDb, block: &Block, height: u32) {
    let mut batch = WriteBatch::new();
    db.apply_block(&mut batch, block, height).expect("apply");
    db.commit_batch(batch).expect("commit");
}

fn dump(db: &BlockDb, column: Column) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut iter = db.get_iterator(column).expect("iterator");
    let mut out = Vec::new();
    let mut more = iter.seek_to_first().expect("seek");
    while more {
        out.push((
            iter.key().unwrap().to_vec(),
            iter.value().unwrap().to_vec(),
        ));
        more = iter.advance().expect("advance");
    }
    out
}

#[test]
fn undo_data_is_the_inverse_of_apply() {
    let db = open_fullnode();
    let script_x = p2pkh_script(0x11);
    let script_y = p2pkh_script(0x22);
    db.add_registered_script(&script_x, Some(0));
    db.add_registered_script(&script_y, Some(0));

    let b0 = make_block([0u8; 32], 0, 0, Vec::new());
    apply(&db, &b0, 0);
    let fund = spend(b0.transactions[0].txid(), 0, 40, script_x.clone());
    let b1 = make_block(b0.hash(), 1, 1, vec![fund.clone()]);
    apply(&db, &b1, 1);

    let blkdata_before = dump(&db, Column::Blkdata);
    let history_before = dump(&db, Column::History);
    let hints_before = dump(&db, Column::Txhints);

    // Apply a block that both spends and creates tracked outputs.
    let churn = spend(fund.txid(), 0, 35, script_y.clone());
    let b2 = make_block(b1.hash(), 2, 2, vec![churn]);
    apply(&db, &b2, 2);
    assert_ne!(dump(&db, Column::Blkdata), blkdata_before);

    // Reverse it from the stored undo record.
    let sud = db
        .get_stored_undo_data(2, 0)
        .expect("undo read")
        .expect("undo stored");
    assert_eq!(sud.block_hash, b2.hash());
    assert_eq!(sud.stxos_removed.len(), 1);
    assert_eq!(sud.outputs_added.len(), 2);

    let mut batch = WriteBatch::new();
    db.unapply_block(&mut batch, &sud).expect("unapply");
    db.commit_batch(batch).expect("commit");

    assert_eq!(dump(&db, Column::Blkdata), blkdata_before);
    assert_eq!(dump(&db, Column::History), history_before);
    assert_eq!(dump(&db, Column::Txhints), hints_before);
    assert_eq!(db.get_top_block_height(Column::Headers).unwrap(), 1);
    assert_eq!(db.get_top_block_hash(Column::Headers).unwrap(), b1.hash());
    assert_eq!(db.get_balance_for_scr_addr(&ScrAddr::from_script(&script_x), false).unwrap(), 40);
}

#[test]
fn reorg_switches_branches_and_flips_dups() {
    let db = open_fullnode();
    let script_x = p2pkh_script(0x11);
    let script_y = p2pkh_script(0x22);
    let script_c = p2pkh_script(0x33);
    db.add_registered_script(&script_x, Some(0));
    db.add_registered_script(&script_y, Some(0));
    db.add_registered_script(&script_c, Some(0));
    let addr_x = ScrAddr::from_script(&script_x);
    let addr_y = ScrAddr::from_script(&script_y);
    let addr_c = ScrAddr::from_script(&script_c);

    // Branch A: blocks 0..=5; X funded at 2, X spent to Y at 4.
    let b0 = make_block([0u8; 32], 0, 0, Vec::new());
    apply(&db, &b0, 0);
    let b1 = make_block(b0.hash(), 1, 1, Vec::new());
    apply(&db, &b1, 1);
    let fund = spend(b1.transactions[0].txid(), 0, 40, script_x.clone());
    let b2 = make_block(b1.hash(), 2, 2, vec![fund.clone()]);
    apply(&db, &b2, 2);
    let b3 = make_block(b2.hash(), 3, 3, Vec::new());
    apply(&db, &b3, 3);
    let spend_a = spend(fund.txid(), 0, 40, script_y.clone());
    let b4a = make_block(b3.hash(), 4, 0xa4, vec![spend_a.clone()]);
    apply(&db, &b4a, 4);
    let b5a = make_block(b4a.hash(), 5, 0xa5, Vec::new());
    apply(&db, &b5a, 5);

    assert_eq!(db.get_balance_for_scr_addr(&addr_y, false).unwrap(), 40);
    assert_eq!(db.get_balance_for_scr_addr(&addr_x, false).unwrap(), 0);
    assert!(db.get_stored_tx_by_hash(&spend_a.txid()).unwrap().is_some());

    // Branch B: 4'..6' forking at height 3, spending X to C instead.
    let spend_b = spend(fund.txid(), 0, 40, script_c.clone());
    let b4b = make_block(b3.hash(), 4, 0xb4, vec![spend_b.clone()]);
    let b5b = make_block(b4b.hash(), 5, 0xb5, Vec::new());
    let b6b = make_block(b5b.hash(), 6, 0xb6, Vec::new());

    // Side-branch blocks arrive first and are stored without touching
    // the valid chain.
    for (block, height) in [(&b4b, 4u32), (&b5b, 5u32)] {
        let mut batch = WriteBatch::new();
        let mut sbh = StoredHeader::from_block(block, height);
        db.put_stored_header(&mut batch, &mut sbh, true, false)
            .expect("store side block");
        db.commit_batch(batch).expect("commit");
    }
    assert_eq!(db.get_valid_dup_id_for_height(4).unwrap(), Some(0));
    assert_eq!(db.get_top_block_hash(Column::Headers).unwrap(), b5a.hash());

    // The branch outgrows the main chain: unwind to the fork, replay B,
    // all in one batch.
    let mut batch = WriteBatch::new();
    for height in [5u32, 4u32] {
        let dup = db.get_valid_dup_id_for_height(height).unwrap().unwrap();
        let sud = db
            .get_stored_undo_data(height, dup)
            .unwrap()
            .expect("undo stored");
        db.unapply_block(&mut batch, &sud).expect("unapply");
    }
    db.apply_block(&mut batch, &b4b, 4).expect("apply 4'");
    db.apply_block(&mut batch, &b5b, 5).expect("apply 5'");
    db.apply_block(&mut batch, &b6b, 6).expect("apply 6'");
    db.commit_batch(batch).expect("commit reorg");

    // Top and valid dups follow the new branch.
    assert_eq!(db.get_top_block_height(Column::Headers).unwrap(), 6);
    assert_eq!(db.get_top_block_hash(Column::Headers).unwrap(), b6b.hash());
    assert_eq!(db.get_valid_dup_id_for_height(4).unwrap(), Some(1));
    assert_eq!(db.get_valid_dup_id_for_height(5).unwrap(), Some(1));
    assert_eq!(db.get_valid_dup_id_for_height(6).unwrap(), Some(0));

    // Both headers survive at the contested heights.
    let list = db.get_stored_head_hgt_list(4).unwrap().unwrap();
    assert_eq!(list.entries.len(), 2);

    // Histories moved with the branch.
    assert_eq!(db.get_balance_for_scr_addr(&addr_y, false).unwrap(), 0);
    assert_eq!(db.get_balance_for_scr_addr(&addr_c, false).unwrap(), 40);
    assert_eq!(db.get_balance_for_scr_addr(&addr_x, false).unwrap(), 0);

    // Tx-by-hash resolves through the valid branch only.
    assert!(db.get_stored_tx_by_hash(&spend_a.txid()).unwrap().is_none());
    let found = db.get_stored_tx_by_hash(&spend_b.txid()).unwrap().unwrap();
    assert_eq!(found.height, 4);
    assert_eq!(found.dup_id, 1);

    // The spent output records the new spender.
    let fund_tx = db.get_stored_tx_by_hash(&fund.txid()).unwrap().unwrap();
    let stxo = &fund_tx.outputs[&0];
    match stxo.spentness {
        cairn_blockdb::Spentness::SpentBy(spender) => {
            let (height, dup, _, _) =
                cairn_blockdb::schema::parse_txout_key(&spender).unwrap();
            assert_eq!((height, dup), (4, 1));
        }
        other => panic!("expected spent output, got {other:?}"),
    }
}

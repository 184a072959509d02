//! Fullnode and supernode layouts must agree on every mode-independent
//! read: block lookup, tx lookup, and balances.

use cairn_blockdb::{Backend, BlockDb, DbConfig, DbMode};
use cairn_primitives::block::{Block, BlockHeader};
use cairn_primitives::outpoint::OutPoint;
use cairn_primitives::script::ScrAddr;
use cairn_primitives::transaction::{Transaction, TxIn, TxOut};
use cairn_primitives::Hash256;
use cairn_storage::{Column, WriteBatch};

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

fn spend(prev_txid: Hash256, value: i64, script: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint {
                hash: prev_txid,
                index: 0,
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

fn build_chain() -> Vec<Block> {
    let script_x = p2pkh_script(0x11);
    let script_y = p2pkh_script(0x22);

    let mut blocks = Vec::new();
    let b0 = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_600_000_000,
            bits: 0x207fffff,
            nonce: 0,
        },
        transactions: vec![coinbase(0)],
    };
    blocks.push(b0);

    for height in 1u32..=4 {
        let prev = blocks[height as usize - 1].clone();
        let mut transactions = vec![coinbase(height)];
        match height {
            2 => transactions.push(spend(
                blocks[0].transactions[0].txid(),
                40,
                script_x.clone(),
            )),
            3 => {
                let fund_txid = blocks[2].transactions[1].txid();
                transactions.push(spend(fund_txid, 40, script_y.clone()));
            }
            _ => {}
        }
        blocks.push(Block {
            header: BlockHeader {
                version: 1,
                prev_block: prev.hash(),
                merkle_root: [height as u8; 32],
                time: 1_600_000_000 + height,
                bits: 0x207fffff,
                nonce: height,
            },
            transactions,
        });
    }
    blocks
}

fn ingest(db: &BlockDb, blocks: &[Block]) {
    for (height, block) in blocks.iter().enumerate() {
        let mut batch = WriteBatch::new();
        db.apply_block(&mut batch, block, height as u32).expect("apply");
        db.commit_batch(batch).expect("commit");
    }
}

#[test]
fn modes_agree_on_reads() {
    let chain = build_chain();
    let script_x = p2pkh_script(0x11);
    let script_y = p2pkh_script(0x22);

    let full_dir = tempfile::tempdir().expect("tempdir");
    let mut full_config = DbConfig::new(full_dir.path(), Backend::Memory, DbMode::Full);
    full_config.select_network("Regtest");
    let full = BlockDb::open_databases(full_config).expect("open full");
    full.add_registered_script(&script_x, Some(0));
    full.add_registered_script(&script_y, Some(0));

    let super_dir = tempfile::tempdir().expect("tempdir");
    let mut super_config = DbConfig::new(super_dir.path(), Backend::Memory, DbMode::Super);
    super_config.select_network("Regtest");
    let supernode = BlockDb::open_databases_supernode(super_config).expect("open super");

    ingest(&full, &chain);
    ingest(&supernode, &chain);

    for db in [&full, &supernode] {
        assert_eq!(db.get_top_block_height(Column::Headers).unwrap(), 4);
        assert_eq!(
            db.get_top_block_hash(Column::Headers).unwrap(),
            chain[4].hash()
        );
    }

    // Block lookup by height and by hash.
    for height in 0..=4u32 {
        let expected_hash = chain[height as usize].hash();
        for db in [&full, &supernode] {
            let sbh = db
                .get_stored_header(height, 0xff, true)
                .unwrap()
                .expect("block");
            assert_eq!(sbh.hash, expected_hash);
            assert_eq!(sbh.num_tx as usize, chain[height as usize].transactions.len());
            assert_eq!(
                sbh.to_block().expect("materialized block"),
                chain[height as usize]
            );
            let bare = db.get_bare_header_by_hash(&expected_hash).unwrap().unwrap();
            assert_eq!(bare.height, height);
        }
    }

    // Tx lookup by hash.
    for block in &chain {
        for tx in &block.transactions {
            let txid = tx.txid();
            let from_full = full.get_stored_tx_by_hash(&txid).unwrap().expect("tx");
            let from_super = supernode.get_stored_tx_by_hash(&txid).unwrap().expect("tx");
            assert_eq!(from_full.db_key(), from_super.db_key());
            assert_eq!(from_full.hash, from_super.hash);
            assert_eq!(
                from_full.to_transaction().unwrap(),
                from_super.to_transaction().unwrap()
            );
        }
    }

    // Balances for the scripts the fullnode tracks.
    for script in [&script_x, &script_y] {
        let addr = ScrAddr::from_script(script);
        assert_eq!(
            full.get_balance_for_scr_addr(&addr, false).unwrap(),
            supernode.get_balance_for_scr_addr(&addr, false).unwrap()
        );
    }
    let addr_y = ScrAddr::from_script(&script_y);
    assert_eq!(supernode.get_balance_for_scr_addr(&addr_y, false).unwrap(), 40);
}

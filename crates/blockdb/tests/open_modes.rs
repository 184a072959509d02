use cairn_blockdb::{Backend, BlockDb, DbConfig, DbError, DbMode, NO_TOP_HEIGHT};
use cairn_storage::Column;

fn config(base: &std::path::Path, backend: Backend, mode: DbMode, network: &str) -> DbConfig {
    let mut config = DbConfig::new(base, backend, mode);
    config.select_network(network);
    config
}

#[test]
fn fresh_open_seeds_db_info() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = BlockDb::open_databases(config(dir.path(), Backend::Memory, DbMode::Full, "Main"))
        .expect("open");
    assert!(db.databases_are_open());

    for column in Column::ALL {
        let info = db.get_stored_db_info(column).expect("info").expect("seeded");
        assert_eq!(info.magic, [0xf9, 0xbe, 0xb4, 0xd9]);
        assert_eq!(info.top_block_height, NO_TOP_HEIGHT);
        assert_eq!(info.top_block_hash, [0u8; 32]);
    }
    assert_eq!(db.get_top_block_height(Column::Headers).unwrap(), NO_TOP_HEIGHT);
    assert_eq!(db.get_top_block_hash(Column::Headers).unwrap(), [0u8; 32]);
}

#[test]
fn unselected_network_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DbConfig::new(dir.path(), Backend::Memory, DbMode::Full);
    config.select_network("Bogusnet");
    match BlockDb::open_databases(config) {
        Err(DbError::Config(_)) => {}
        Err(other) => panic!("expected config error, got {other}"),
        Ok(_) => panic!("open succeeded without a network"),
    }
}

#[test]
fn opener_and_mode_must_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let super_config = config(dir.path(), Backend::Memory, DbMode::Super, "Main");
    assert!(matches!(
        BlockDb::open_databases(super_config.clone()),
        Err(DbError::Config(_))
    ));
    let full_config = config(dir.path(), Backend::Memory, DbMode::Full, "Main");
    assert!(matches!(
        BlockDb::open_databases_supernode(full_config),
        Err(DbError::Config(_))
    ));
    assert!(BlockDb::open_databases_supernode(super_config).is_ok());
}

#[test]
fn reopen_verifies_magic() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let _db =
            BlockDb::open_databases(config(dir.path(), Backend::Fjall, DbMode::Full, "Main"))
                .expect("first open");
    }
    // Same directory, different network: the stored magic must win.
    match BlockDb::open_databases(config(dir.path(), Backend::Fjall, DbMode::Full, "Test")) {
        Err(DbError::Corrupt(_)) => {}
        Err(other) => panic!("expected corrupt error, got {other}"),
        Ok(_) => panic!("open succeeded with the wrong magic"),
    }
    // The right network reopens cleanly.
    BlockDb::open_databases(config(dir.path(), Backend::Fjall, DbMode::Full, "Main"))
        .expect("reopen");
}

#[test]
fn reopen_verifies_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let _db =
            BlockDb::open_databases(config(dir.path(), Backend::Fjall, DbMode::Full, "Main"))
                .expect("first open");
    }
    match BlockDb::open_databases(config(dir.path(), Backend::Fjall, DbMode::Lite, "Main")) {
        Err(DbError::Corrupt(_)) => {}
        Err(other) => panic!("expected corrupt error, got {other}"),
        Ok(_) => panic!("open succeeded with the wrong mode"),
    }
}

#[test]
fn close_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db =
        BlockDb::open_databases(config(dir.path(), Backend::Memory, DbMode::Full, "Main"))
            .expect("open");
    db.close_databases();
    assert!(!db.databases_are_open());
    db.close_databases();
    assert!(!db.databases_are_open());
    assert!(matches!(
        db.get_top_block_height(Column::Headers),
        Err(DbError::NotOpen)
    ));
}

#[test]
fn destroy_and_reset_starts_fresh() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db =
        BlockDb::open_databases(config(dir.path(), Backend::Fjall, DbMode::Full, "Main"))
            .expect("open");
    let info = db
        .get_stored_db_info(Column::Headers)
        .unwrap()
        .expect("seeded");
    db.destroy_and_reset_databases().expect("reset");
    assert!(db.databases_are_open());
    let fresh = db
        .get_stored_db_info(Column::Headers)
        .unwrap()
        .expect("re-seeded");
    assert_eq!(fresh, info);
}

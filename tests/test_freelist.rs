use lumokv::{Database, DbFlags, Environment, EnvironmentBuilder, Transaction, WriteFlags};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = EnvironmentBuilder::new()
        .set_max_dbs(2)
        .set_page_size(1024)
        .set_map_size(1 << 26)
        .open(temp_dir.path())
        .unwrap();
    (temp_dir, env)
}

fn insert_range(env: &Environment, db: Database, count: u32) {
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..count {
        txn.put(db, &i.to_be_bytes(), &[i as u8; 100], WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
}

fn delete_range(env: &Environment, db: Database, count: u32) {
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..count {
        txn.del(db, &i.to_be_bytes()).unwrap();
    }
    txn.commit().unwrap();
}

#[test]
fn test_delete_all_returns_to_baseline() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(Some("churn"), DbFlags::CREATE).unwrap();
    let baseline = env.info().pages_in_use;

    insert_range(&env, db, 1000);
    let grown = env.info();
    assert!(grown.pages_in_use > baseline + 50);

    delete_range(&env, db, 1000);
    let info = env.info();
    assert_eq!(info.pages_in_use, baseline);
    assert_eq!(info.pending_pages, 0);
    assert!(info.free_pages > 50);

    // a second round runs on reclaimed pages
    insert_range(&env, db, 1000);
    assert!(env.info().last_pgno < info.last_pgno + 8);
    delete_range(&env, db, 1000);
    assert_eq!(env.info().pages_in_use, baseline);
}

#[test]
fn test_reader_pins_retired_pages() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();
    insert_range(&env, db, 1000);

    let reader = env.begin_ro_txn().unwrap();
    delete_range(&env, db, 1000);
    let info = env.info();
    assert!(info.pending_pages > 50);
    assert_eq!(env.reader_list()[0].txn_id, reader.id());

    // the new writer may not take pages the reader still sees
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..200u32 {
        txn.put(db, &(i + 5000).to_be_bytes(), &[0xee; 100], WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    for i in 0..1000u32 {
        assert_eq!(reader.get(db, &i.to_be_bytes()).unwrap(), &[i as u8; 100]);
    }
    assert_eq!(reader.stat(db).unwrap().entries, 1000);
    drop(reader);

    let info = env.info();
    assert_eq!(info.pending_pages, 0);
    assert!(info.free_pages > 50);
}

#[test]
fn test_free_list_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let before = {
        let env = EnvironmentBuilder::new().set_page_size(1024).open(dir.path()).unwrap();
        insert_range(&env, Database::main(), 2000);
        delete_range(&env, Database::main(), 1500);
        let info = env.info();
        env.close().unwrap();
        info
    };

    let env = EnvironmentBuilder::new().set_page_size(1024).open(dir.path()).unwrap();
    let info = env.info();
    assert_eq!(info.free_pages, before.free_pages);
    assert_eq!(info.free_chain_pages, before.free_chain_pages);
    assert_eq!(info.pages_in_use, before.pages_in_use);

    // refilling takes pages from the free list
    insert_range(&env, Database::main(), 1500);
    assert!(env.info().free_pages + 50 < info.free_pages);
    assert_eq!(env.stat().unwrap().entries, 2000);
}

#[test]
fn test_abort_returns_pages() {
    let (_dir, env) = setup_test_env();
    insert_range(&env, Database::main(), 500);
    delete_range(&env, Database::main(), 500);
    let free = env.info().free_pages;

    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..500u32 {
        txn.put(Database::main(), &i.to_be_bytes(), &[1; 100], WriteFlags::empty()).unwrap();
    }
    txn.abort();
    assert_eq!(env.info().free_pages, free);
}

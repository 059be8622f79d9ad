use lumokv::{CursorPosition, Database, DbFlags, Environment, EnvironmentBuilder, Error, Transaction, WriteFlags};
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = EnvironmentBuilder::new()
        .set_max_dbs(2)
        .set_page_size(512)
        .set_map_size(1 << 24)
        .open(temp_dir.path())
        .unwrap();
    (temp_dir, env)
}

fn value_for(i: u64) -> [u8; 32] {
    let mut value = [0u8; 32];
    value[..8].copy_from_slice(&i.to_be_bytes());
    value[8..].fill(b'a'.wrapping_add(i as u8));
    value
}

#[test]
fn test_ten_keys_forward_then_end() {
    let (_dir, env) = setup_test_env();
    let db = env.open_db(Some("counters"), DbFlags::CREATE).unwrap();

    let mut txn = env.begin_rw_txn().unwrap();
    // inserted out of order on purpose
    for i in [3u64, 9, 0, 5, 1, 8, 2, 7, 4, 6] {
        txn.put(db, &i.to_be_bytes(), &value_for(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    let (key, value) = cursor.go_to_range(&0u64.to_be_bytes()).unwrap().unwrap();
    assert_eq!(key, &0u64.to_be_bytes()[..]);
    assert_eq!(value, &value_for(0)[..]);

    for i in 1..10u64 {
        let (key, value) = cursor.go_to_next().unwrap().unwrap();
        assert_eq!(key, &i.to_be_bytes()[..]);
        assert_eq!(value, &value_for(i)[..]);
        assert_eq!(cursor.position(), CursorPosition::Valid);
    }

    // tenth step runs off the end and stays there
    assert!(cursor.go_to_next().unwrap().is_none());
    assert_eq!(cursor.position(), CursorPosition::End);
    assert!(matches!(cursor.get_current(), Err(Error::NotFound)));
    assert!(cursor.go_to_next().unwrap().is_none());

    // stepping back from the end lands on the last key
    let (key, _) = cursor.go_to_prev().unwrap().unwrap();
    assert_eq!(key, &9u64.to_be_bytes()[..]);
}

#[test]
fn test_backward_to_start() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..300u64 {
        txn.put(db, &i.to_be_bytes(), &value_for(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    let mut expected = 300u64;
    while let Some((key, _)) = cursor.go_to_prev().unwrap() {
        expected -= 1;
        assert_eq!(key, &expected.to_be_bytes()[..]);
    }
    assert_eq!(expected, 0);
    assert_eq!(cursor.position(), CursorPosition::Start);
    assert!(cursor.go_to_prev().unwrap().is_none());

    let (key, _) = cursor.go_to_next().unwrap().unwrap();
    assert_eq!(key, &0u64.to_be_bytes()[..]);
}

#[test]
fn test_positioning() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();
    let mut txn = env.begin_rw_txn().unwrap();
    for i in (0..200u64).map(|i| i * 10) {
        txn.put(db, &i.to_be_bytes(), &value_for(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    assert_eq!(cursor.position(), CursorPosition::Unset);

    let (key, _) = cursor.go_to_last().unwrap().unwrap();
    assert_eq!(key, &1990u64.to_be_bytes()[..]);
    let (key, _) = cursor.go_to_first().unwrap().unwrap();
    assert_eq!(key, &0u64.to_be_bytes()[..]);

    let (key, value) = cursor.go_to_key(&730u64.to_be_bytes()).unwrap();
    assert_eq!(key, &730u64.to_be_bytes()[..]);
    assert_eq!(value, &value_for(730)[..]);
    let (key, value) = cursor.get_current_copy().unwrap();
    assert_eq!(key, 730u64.to_be_bytes().to_vec());
    assert_eq!(value, value_for(730).to_vec());

    assert!(matches!(cursor.go_to_key(&735u64.to_be_bytes()), Err(Error::NotFound)));
    assert_eq!(cursor.position(), CursorPosition::Unset);

    let (key, _) = cursor.go_to_range(&735u64.to_be_bytes()).unwrap().unwrap();
    assert_eq!(key, &740u64.to_be_bytes()[..]);
    let (key, _) = cursor.go_to_prev().unwrap().unwrap();
    assert_eq!(key, &730u64.to_be_bytes()[..]);

    assert!(cursor.go_to_range(&5000u64.to_be_bytes()).unwrap().is_none());
    assert_eq!(cursor.position(), CursorPosition::End);
}

#[test]
fn test_repeated_scans_rewind_with_range() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..1000u64 {
        txn.put(db, &i.to_be_bytes(), &value_for(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    let start = 0u64.to_be_bytes();
    for _ in 0..3 {
        let mut entry = cursor.go_to_range(&start).unwrap();
        let mut count = 0u64;
        while let Some((key, value)) = entry {
            assert_eq!(key, &count.to_be_bytes()[..]);
            assert_eq!(value.len(), 32);
            count += 1;
            entry = cursor.go_to_next().unwrap();
        }
        assert_eq!(count, 1000);
    }
}

#[test]
fn test_iter_range_bounds() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();
    let mut txn = env.begin_rw_txn().unwrap();
    for name in ["apple", "banana", "cherry", "date", "elderberry", "fig"] {
        txn.put(db, name.as_bytes(), name.to_uppercase().as_bytes(), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    let keys: Vec<&[u8]> = cursor
        .iter_range(b"b", Some(&b"date"[..]))
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(keys, vec![&b"banana"[..], &b"cherry"[..], &b"date"[..]]);

    let tail: Vec<&[u8]> = cursor.iter_range(b"e", None).map(|entry| entry.unwrap().1).collect();
    assert_eq!(tail, vec![&b"ELDERBERRY"[..], &b"FIG"[..]]);

    assert_eq!(cursor.iter_range(b"zzz", None).count(), 0);
}

#[test]
fn test_cursor_on_write_transaction() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..100u64 {
        txn.put(db, &i.to_be_bytes(), &value_for(i), WriteFlags::empty()).unwrap();
    }
    // the cursor sees uncommitted pages
    {
        let mut cursor = txn.open_cursor(db).unwrap();
        let mut count = 0;
        while cursor.go_to_next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 100);
    }
    txn.del(db, &50u64.to_be_bytes()).unwrap();
    let mut cursor = db.cursor(&txn).unwrap();
    let (key, _) = cursor.go_to_range(&50u64.to_be_bytes()).unwrap().unwrap();
    assert_eq!(key, &51u64.to_be_bytes()[..]);
    cursor.close();
    txn.commit().unwrap();
}

#[test]
fn test_empty_and_emptied_database() {
    let (_dir, env) = setup_test_env();
    let db = Database::main();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    assert!(cursor.go_to_first().unwrap().is_none());
    assert_eq!(cursor.position(), CursorPosition::End);
    assert!(cursor.go_to_last().unwrap().is_none());
    assert_eq!(cursor.position(), CursorPosition::Start);
    assert!(cursor.go_to_range(b"a").unwrap().is_none());
    drop(cursor);
    drop(txn);

    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..500u64 {
        txn.put(db, &i.to_be_bytes(), &value_for(i), WriteFlags::empty()).unwrap();
    }
    txn.commit().unwrap();
    let mut txn = env.begin_rw_txn().unwrap();
    for i in 0..500u64 {
        txn.del(db, &i.to_be_bytes()).unwrap();
    }
    txn.commit().unwrap();

    let txn = env.begin_ro_txn().unwrap();
    let mut cursor = txn.open_cursor(db).unwrap();
    assert!(cursor.go_to_next().unwrap().is_none());
    assert_eq!(txn.stat(db).unwrap().depth, 1);
}

use std::collections::BTreeMap;
use std::path::Path;

use lumokv::{Database, Environment, EnvironmentBuilder, Error, Transaction, WriteFlags};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(0u8..6, 1..5)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key_strategy(), prop::collection::vec(any::<u8>(), 0..60))
            .prop_map(|(k, v)| Op::Put(k, v)),
        1 => key_strategy().prop_map(Op::Del),
    ]
}

fn open(path: &Path) -> Environment {
    EnvironmentBuilder::new()
        .set_page_size(512)
        .set_map_size(1 << 24)
        .open(path)
        .unwrap()
}

fn check(env: &Environment, model: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), TestCaseError> {
    let txn = env.begin_ro_txn().unwrap();
    let db = Database::main();
    prop_assert_eq!(txn.stat(db).unwrap().entries, model.len());

    let mut cursor = txn.open_cursor(db).unwrap();
    let mut scanned = Vec::new();
    while let Some((key, value)) = cursor.go_to_next().unwrap() {
        scanned.push((key.to_vec(), value.to_vec()));
    }
    let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    prop_assert_eq!(scanned, expected);

    for (key, value) in model {
        prop_assert_eq!(txn.get(db, key).unwrap(), value.as_slice());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_batches_match_btreemap(
        batches in prop::collection::vec(
            (prop::collection::vec(op_strategy(), 1..80), any::<bool>(), any::<bool>()),
            1..8,
        )
    ) {
        let dir = TempDir::new().unwrap();
        let mut env = Some(open(dir.path()));
        let mut model = BTreeMap::new();

        for (ops, commit, reopen) in batches {
            let current = env.as_ref().unwrap();
            let mut pending = model.clone();
            let mut txn = current.begin_rw_txn().unwrap();
            for op in ops {
                match op {
                    Op::Put(key, value) => {
                        txn.put(Database::main(), &key, &value, WriteFlags::empty()).unwrap();
                        pending.insert(key, value);
                    }
                    Op::Del(key) => {
                        let res = txn.del(Database::main(), &key);
                        prop_assert_eq!(res.is_ok(), pending.remove(&key).is_some());
                        if let Err(e) = res {
                            prop_assert!(matches!(e, Error::NotFound));
                        }
                    }
                }
            }
            if commit {
                txn.commit().unwrap();
                model = pending;
            } else {
                txn.abort();
            }

            if reopen {
                drop(env.take());
                env = Some(open(dir.path()));
            }
            check(env.as_ref().unwrap(), &model)?;
        }
    }
}

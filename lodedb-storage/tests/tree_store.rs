//! End-to-end tests of trees stored in a log: build, save, flush,
//! reopen and recover.

use lodedb_storage::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

const STRUCTURE_ID: i32 = 5;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn key(i: u32) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

fn store_config() -> StoreConfig {
    StoreConfig::from_toml_str(
        r#"
        [log]
        page_size = "1KiB"
        segment_size = "64KiB"

        [tree]
        page_budget = "1KiB"
        max_embedded_key_size = 64
        "#,
    )
    .unwrap()
}

fn open_log(path: &Path, config: &StoreConfig) -> Arc<Log> {
    let storage = Arc::new(FileLogStorage::open(path).unwrap());
    Arc::new(Log::open(storage, config.log.clone()).unwrap())
}

fn open_tree(log: &Arc<Log>, config: &StoreConfig, root: u64) -> ImmutableTree {
    ImmutableTree::open(Arc::clone(log), config.tree.clone(), STRUCTURE_ID, root).unwrap()
}

fn scan<T: TraversableTree>(tree: &T) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = TreeCursor::new(None);
    let mut res = vec![];
    while cursor.get_next(tree).unwrap() {
        res.push((
            cursor.get_key().unwrap().to_vec(),
            cursor.get_value().unwrap().to_vec(),
        ));
    }
    res
}

#[test]
fn test_thousand_keys_lifecycle() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lode.log");
    let config = store_config();
    let root = {
        let log = open_log(&path, &config);
        let mut tree = open_tree(&log, &config, NULL_ADDRESS).mutable_copy();
        for i in 1..=1000u32 {
            tree.put(&key(i), format!("v{i}").as_bytes()).unwrap();
        }
        assert_eq!(&tree.get(&key(500)).unwrap().unwrap()[..], b"v500");
        let root = tree.save().unwrap();
        log.flush().unwrap();
        root
    };

    let log = open_log(&path, &config);
    let tree = open_tree(&log, &config, root);
    assert_eq!(tree.size(), 1000);
    assert_eq!(&tree.get(&key(500)).unwrap().unwrap()[..], b"v500");
    let entries = scan(&tree);
    assert_eq!(entries.len(), 1000);
    assert_eq!(entries[0].0, key(1));
    assert_eq!(entries[999].0, key(1000));

    let mut mtree = tree.mutable_copy();
    for i in 1..=500u32 {
        assert!(mtree.delete(&key(i)).unwrap());
    }
    let root = mtree.save().unwrap();
    log.flush().unwrap();
    drop(log);

    let log = open_log(&path, &config);
    let tree = open_tree(&log, &config, root);
    assert_eq!(tree.size(), 500);
    let mut cursor = tree.open_cursor();
    assert!(cursor.get_next(&tree).unwrap());
    assert_eq!(&cursor.get_key().unwrap()[..], &key(501)[..]);
    assert!(!tree.has_key(&key(500)).unwrap());
    assert!(tree.has_pair(&key(777), b"v777").unwrap());
}

#[test]
fn test_random_versions_against_btreemap() {
    init_logger();
    let config = store_config();
    let storage = Arc::new(MemLogStorage::new());
    let log = Arc::new(Log::open(storage.clone(), config.log.clone()).unwrap());
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let mut model = BTreeMap::new();
    let mut versions = vec![];
    let mut root = NULL_ADDRESS;
    for _ in 0..5 {
        let mut tree = open_tree(&log, &config, root).mutable_copy();
        for _ in 0..800 {
            let k = rng.random_range(0..1500u32);
            let mut k = key(k);
            if rng.random_bool(0.1) {
                k.extend_from_slice(&[b'#'; 100]);
            }
            match rng.random_range(0..10) {
                0..=5 => {
                    let v = vec![rng.random::<u8>(); rng.random_range(1..64)];
                    tree.put(&k, &v).unwrap();
                    model.insert(k, v);
                }
                6 => {
                    let v = vec![7u8; 3];
                    let added = tree.add(&k, &v).unwrap();
                    assert_eq!(added, !model.contains_key(&k));
                    model.entry(k).or_insert(v);
                }
                _ => {
                    assert_eq!(tree.delete(&k).unwrap(), model.remove(&k).is_some());
                }
            }
        }
        // mutable tree reads its own writes.
        assert_eq!(scan(&tree).len(), model.len());
        root = tree.save().unwrap();
        versions.push((root, model.clone()));
    }
    log.flush().unwrap();

    // every saved version stays readable after reopen.
    let log = Arc::new(Log::open(storage, config.log.clone()).unwrap());
    for (root, model) in versions {
        let tree = open_tree(&log, &config, root);
        assert_eq!(tree.size(), model.len() as u64);
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(scan(&tree), expected);
    }
}

#[test]
fn test_recover_from_damaged_tail() {
    init_logger();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lode.log");
    let config = store_config();
    let (first, second) = {
        let log = open_log(&path, &config);
        let mut tree = open_tree(&log, &config, NULL_ADDRESS).mutable_copy();
        for i in 0..300u32 {
            tree.put(&key(i), b"first").unwrap();
        }
        let first = tree.save().unwrap();
        log.flush().unwrap();
        let mut tree = open_tree(&log, &config, first).mutable_copy();
        for i in 300..600u32 {
            tree.put(&key(i), b"second").unwrap();
        }
        let second = tree.save().unwrap();
        log.flush().unwrap();
        (first, second)
    };
    {
        let storage = FileLogStorage::open(&path).unwrap();
        storage.write_at(second + 8, &[0xff; 4]).unwrap();
        storage.sync().unwrap();
    }

    let log = open_log(&path, &config);
    assert!(ImmutableTree::open(
        Arc::clone(&log),
        config.tree.clone(),
        STRUCTURE_ID,
        second
    )
    .is_err());
    let tree = open_tree(&log, &config, first);
    let entries = scan(&tree);
    assert_eq!(entries.len(), 300);
    assert!(entries.iter().all(|(_, v)| v == b"first"));

    // log stays writable after recovery.
    let mut mtree = tree.mutable_copy();
    mtree.put(&key(1000), b"third").unwrap();
    let third = mtree.save().unwrap();
    log.flush().unwrap();
    let log = open_log(&path, &config);
    let tree = open_tree(&log, &config, third);
    assert_eq!(tree.size(), 301);
}

#[test]
fn test_encrypted_store() {
    init_logger();
    let mut config = store_config();
    config.log = config.log.clone().cipher(&[3u8; CIPHER_KEY_LEN], 1234);
    let storage = Arc::new(MemLogStorage::new());
    let root = {
        let log = Arc::new(Log::open(storage.clone(), config.log.clone()).unwrap());
        let mut tree = open_tree(&log, &config, NULL_ADDRESS).mutable_copy();
        for i in 0..200u32 {
            tree.put(&key(i), b"classified payload").unwrap();
        }
        let root = tree.save().unwrap();
        log.flush().unwrap();
        root
    };
    let raw = storage.snapshot();
    assert!(!raw
        .windows(b"classified".len())
        .any(|w| w == b"classified"));
    let log = Arc::new(Log::open(storage, config.log.clone()).unwrap());
    let tree = open_tree(&log, &config, root);
    assert_eq!(scan(&tree).len(), 200);
}

#[test]
fn test_reclaim_moves_live_data() {
    init_logger();
    let mut config = store_config();
    config.log = config.log.clone().segment_size(8192u64);
    let storage = Arc::new(MemLogStorage::new());
    let log = Arc::new(Log::open(storage, config.log.clone()).unwrap());
    let mut tree = open_tree(&log, &config, NULL_ADDRESS).mutable_copy();
    for i in 0..500u32 {
        tree.put(&key(i), &key(i * 3)).unwrap();
    }
    let root = tree.save().unwrap();
    let expected = scan(&open_tree(&log, &config, root));

    // reclaim segments one by one, the oldest first.
    let mut root = root;
    let mut expired = ExpiredLoggableCollection::new();
    for segment in 0..2u64 {
        let start = (segment * 8192).max(8);
        let mut tree = open_tree(&log, &config, root).mutable_copy();
        tree.reclaim(log.loggables(start)).unwrap();
        root = tree.save().unwrap();
        expired.merge(tree.take_expired_loggables());
        let tree = open_tree(&log, &config, root);
        assert_eq!(scan(&tree), expected);
        assert!(tree
            .address_iterator()
            .map(|a| a.unwrap())
            .all(|a| a / 8192 != segment));
    }
    let live: Vec<u64> = open_tree(&log, &config, root)
        .address_iterator()
        .map(|a| a.unwrap())
        .collect();
    assert!(expired.into_sorted_vec().iter().all(|a| !live.contains(a)));
}

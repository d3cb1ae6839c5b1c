use machi::{Locator, MachiStore};
use rand::prelude::*;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Counts regular files in a directory.
fn file_count(dir: &std::path::Path) -> usize {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

#[test]
fn append_get_trim_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 37, true).unwrap();

    let key = store.append(b"1").unwrap();
    assert_eq!(
        key,
        Locator {
            gen: 0,
            offset: 0,
            len: 1
        }
    );
    assert_eq!(store.get(key).unwrap(), Some(b"1".to_vec()));

    store.trim(key).unwrap();
    assert_eq!(store.get(key).unwrap(), None);

    store.close().unwrap();
}

#[test]
fn permuted_workload_round_trips() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 37, true).unwrap();
    let mut rng = thread_rng();

    let repeat: u64 = 683;
    let mut order: Vec<u64> = (0..repeat).collect();
    order.shuffle(&mut rng);

    let mut keys = std::collections::HashMap::new();
    for &i in &order {
        let key = store.append(i.to_string().as_bytes()).unwrap();
        keys.insert(i, key);
    }

    order.shuffle(&mut rng);
    for &i in &order {
        let data = store.get(keys[&i]).unwrap();
        assert_eq!(data, Some(i.to_string().into_bytes()));
    }

    assert_eq!(store.keys().unwrap().len(), repeat as usize);

    order.shuffle(&mut rng);
    for &i in &order {
        store.trim(keys[&i]).unwrap();
    }
    for &i in &order {
        assert_eq!(store.get(keys[&i]).unwrap(), None);
    }
    assert!(store.keys().unwrap().is_empty());

    store.close().unwrap();
}

#[test]
fn offsets_are_monotone_within_a_generation() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 1000, true).unwrap();

    let payloads: [&[u8]; 4] = [b"a", b"longer payload", b"xy", b"0123456789"];
    let mut expected_offset = 0;
    for payload in payloads {
        let key = store.append(payload).unwrap();
        assert_eq!(key.gen, 0);
        assert_eq!(key.offset, expected_offset);
        assert_eq!(key.len, payload.len() as u64);
        expected_offset += payload.len() as u64;
    }

    store.close().unwrap();
}

#[test]
fn rotation_advances_generation_by_one() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 5, true).unwrap();

    for _ in 0..5 {
        let key = store.append(b"x").unwrap();
        assert_eq!(key.gen, 0);
    }
    // The fifth append hit the watermark, so the sixth lands one
    // generation later.
    let key = store.append(b"x").unwrap();
    assert_eq!(key.gen, 1);

    store.close().unwrap();
}

#[test]
fn back_generation_is_reaped_when_last_entry_is_trimmed() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 2, false).unwrap();

    let a = store.append(b"a").unwrap();
    let b = store.append(b"b").unwrap();
    assert_eq!(a.gen, 0);
    assert_eq!(b.gen, 0);

    let index_path = temp_dir.path().join("0.machi");
    let data_path = temp_dir.path().join("0.machd");
    assert!(index_path.exists());
    assert!(data_path.exists());

    store.trim(a).unwrap();
    assert!(index_path.exists());

    store.trim(b).unwrap();
    assert!(!index_path.exists());
    assert!(!data_path.exists());

    store.close().unwrap();
}

#[test]
fn shortened_locator_reads_prefix() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 10, true).unwrap();

    let key = store.append(b"hello world").unwrap();
    let prefix = store
        .get(Locator { len: 5, ..key })
        .unwrap()
        .expect("entry is live");
    assert_eq!(prefix, b"hello");

    store.close().unwrap();
}

#[test]
fn oversized_read_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 10, true).unwrap();

    let key = store.append(b"hello").unwrap();
    assert!(store.get(Locator { len: 6, ..key }).is_err());

    store.close().unwrap();
}

#[test]
fn trim_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 10, true).unwrap();

    let key = store.append(b"payload").unwrap();
    store.trim(key).unwrap();
    store.trim(key).unwrap();
    assert_eq!(store.get(key).unwrap(), None);

    // Unknown generations are a no-op too.
    store
        .trim(Locator {
            gen: 42,
            offset: 0,
            len: 1,
        })
        .unwrap();

    store.close().unwrap();
}

#[test]
fn reopen_over_placeholders_rotates_past_them() {
    let temp_dir = TempDir::new().unwrap();

    // Leave one live entry in generation 0 behind.
    let store = MachiStore::open(temp_dir.path(), 29, false).unwrap();
    store.append(b"1").unwrap();
    store.close().unwrap();

    // Stale empty pair left by some earlier run.
    std::fs::write(temp_dir.path().join("1.machi"), b"").unwrap();
    std::fs::write(temp_dir.path().join("1.machd"), b"").unwrap();

    let store = MachiStore::open(temp_dir.path(), 29, false).unwrap();
    for i in 0..30 {
        store.append(i.to_string().as_bytes()).unwrap();
    }

    // Generations 0 and 1 recovered, 2 filled and retired, 3 front:
    // four index/data pairs.
    assert_eq!(file_count(temp_dir.path()), 8);

    let keys = store.keys().unwrap();
    assert_eq!(keys.len(), 31);
    for key in keys {
        store.trim(key).unwrap();
    }
    assert!(store.keys().unwrap().is_empty());

    store.close().unwrap();
}

#[test]
fn temp_store_refuses_stale_generation_files() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("0.machi"), b"").unwrap();

    match MachiStore::open(temp_dir.path(), 10, true) {
        Err(machi::MachiError::AlreadyExists(path)) => {
            assert!(path.ends_with("0.machi"));
        }
        other => panic!("expected AlreadyExists, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn temp_store_removes_everything_on_close() {
    let temp_dir = TempDir::new().unwrap();
    let store = MachiStore::open(temp_dir.path(), 3, true).unwrap();

    // Enough appends to retire a couple of generations.
    for i in 0..8 {
        store.append(i.to_string().as_bytes()).unwrap();
    }
    assert!(file_count(temp_dir.path()) > 0);

    store.close().unwrap();
    assert_eq!(file_count(temp_dir.path()), 0);
}

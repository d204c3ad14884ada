use tempfile::tempdir;

use super::*;
use crate::storage::BatchOp;
use crate::storage::StorageEngine;

#[test]
fn trees_should_survive_reopen() {
    let dir = tempdir().unwrap();
    {
        let engine = SledEngine::open(dir.path()).unwrap();
        let tree = engine.open_tree("data").unwrap();
        tree.insert(b"/registry/peers/n1", b"{}").unwrap();
        engine.flush().unwrap();
    }

    let engine = SledEngine::open(dir.path()).unwrap();
    let tree = engine.open_tree("data").unwrap();
    assert_eq!(tree.get(b"/registry/peers/n1").unwrap(), Some(b"{}".to_vec()));
}

#[test]
fn scan_and_range_should_follow_key_order() {
    let dir = tempdir().unwrap();
    let engine = SledEngine::open(dir.path()).unwrap();
    let tree = engine.open_tree("data").unwrap();
    tree.apply_batch(vec![
        BatchOp::Insert(b"/p/b".to_vec(), b"2".to_vec()),
        BatchOp::Insert(b"/p/a".to_vec(), b"1".to_vec()),
        BatchOp::Insert(b"/q".to_vec(), b"3".to_vec()),
    ])
    .unwrap();

    let scanned = tree.scan_prefix(b"/p/").unwrap();
    assert_eq!(scanned[0].0, b"/p/a".to_vec());
    assert_eq!(scanned[1].0, b"/p/b".to_vec());
    assert_eq!(scanned.len(), 2);

    let ranged = tree.range(b"/p/b", Some(b"/q".to_vec())).unwrap();
    assert_eq!(ranged.len(), 1);
    assert_eq!(tree.last().unwrap().unwrap().0, b"/q".to_vec());

    tree.apply_batch(vec![BatchOp::Remove(b"/q".to_vec())]).unwrap();
    assert_eq!(tree.len(), 2);
}

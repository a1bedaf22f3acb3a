#![cfg(feature = "fjall")]

use std::collections::HashSet;

use novoindex_storage::fjall::{FjallOptions, FjallStore};
use novoindex_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Utxo, b"state", b"value").expect("put");
    assert_eq!(
        store.get(Column::Utxo, b"state").expect("get"),
        Some(b"value".to_vec())
    );

    store.put(Column::Utxo, b"U\x00\x00\x00\x01", b"a").expect("put");
    store.put(Column::Utxo, b"U\x00\x00\x00\x02", b"b").expect("put");
    store.put(Column::Header, b"U\x00\x00\x00\x03", b"c").expect("put");
    let rows: HashSet<_> = store
        .scan_prefix(Column::Utxo, b"U")
        .expect("scan")
        .into_iter()
        .collect();
    assert_eq!(
        rows,
        HashSet::from([
            (b"U\x00\x00\x00\x01".to_vec(), b"a".to_vec()),
            (b"U\x00\x00\x00\x02".to_vec(), b"b".to_vec()),
        ])
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::TxCount, b"\x00\x00\x00\x00", b"ok");
    batch.delete(Column::Utxo, b"state");
    store.write_batch(&batch).expect("batch commit");

    assert!(store.get(Column::Utxo, b"state").expect("get").is_none());
    assert_eq!(
        store.get(Column::TxCount, b"\x00\x00\x00\x00").expect("get"),
        Some(b"ok".to_vec())
    );
}

#[test]
fn fjall_reopen_keeps_committed_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let options = FjallOptions {
            sync_writes: true,
            ..FjallOptions::default()
        };
        let store = FjallStore::open_with_options(dir.path(), options).expect("open fjall");
        let mut batch = WriteBatch::new();
        batch.put(Column::RawBlock, b"\x00\x00\x00\x07", b"block");
        store.write_batch(&batch).expect("commit");
    }
    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert_eq!(
        store.get(Column::RawBlock, b"\x00\x00\x00\x07").expect("get"),
        Some(b"block".to_vec())
    );
}

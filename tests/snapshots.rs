// tests/snapshots.rs
//
// Изоляция снапшотов: RO-батч, открытый до серии коммитов, читает
// прежнее состояние по всем ключам; свежий RO-батч видит финал.
// Плюс: одиночный writer (ConcurrentWriter) и UseAfterDispose.
//
// Запуск:
//   cargo test --test snapshots -- --nocapture

use anyhow::Result;

use paprika::data::keccak256;
use paprika::{Account, CommitOptions, PagedDb, PaprikaConfig, StoreError, U256};

fn mem_db() -> Result<PagedDb> {
    PagedDb::in_memory(PaprikaConfig::default().with_arena_bytes(16 * 1024 * 1024))
}

#[test]
fn reader_keeps_pre_write_state_across_three_commits() -> Result<()> {
    let db = mem_db()?;
    let keys: Vec<_> = (0u8..3).map(|i| keccak256(&[i])).collect();

    // базовое состояние
    let mut batch = db.begin_batch()?;
    for k in &keys {
        batch.set_account(k, &Account { balance: U256::from(100u64), nonce: 1, ..Account::EMPTY })?;
    }
    batch.commit(CommitOptions::FlushDataThenRoot)?;

    let reader = db.begin_read_only_batch("pinned")?;
    let pinned_root = reader.state_root();

    // три коммита, каждый переписывает свой ключ
    for (i, k) in keys.iter().enumerate() {
        let mut batch = db.begin_batch()?;
        batch.set_account(
            k,
            &Account { balance: U256::from(1000 + i as u64), nonce: 2, ..Account::EMPTY },
        )?;
        batch.commit(CommitOptions::FlushDataThenRoot)?;
    }

    // закреплённый снапшот не видит ни одной новой записи
    for k in &keys {
        let acc = reader.get_account(k)?;
        assert_eq!(acc.balance, U256::from(100u64), "snapshot must see pre-write state");
        assert_eq!(acc.nonce, 1);
    }
    assert_eq!(reader.state_root(), pinned_root);

    // свежий снапшот видит финальные значения
    let fresh = db.begin_read_only_batch("fresh")?;
    for (i, k) in keys.iter().enumerate() {
        assert_eq!(fresh.get_account(k)?.balance, U256::from(1000 + i as u64));
    }
    assert_ne!(fresh.state_root(), pinned_root);
    Ok(())
}

#[test]
fn second_writer_is_rejected() -> Result<()> {
    let db = mem_db()?;
    let _first = db.begin_batch()?;
    let err = db.begin_batch().expect_err("second write batch must fail");
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::ConcurrentWriter)));
    Ok(())
}

#[test]
fn writer_slot_frees_on_drop_and_commit() -> Result<()> {
    let db = mem_db()?;
    {
        let _batch = db.begin_batch()?;
        // брошенный батч ничего не публикует
    }
    let mut batch = db.begin_batch()?;
    batch.set_account(&keccak256(b"x"), &Account { nonce: 1, ..Account::EMPTY })?;
    batch.commit(CommitOptions::FlushDataThenRoot)?;
    let _third = db.begin_batch()?;
    Ok(())
}

#[test]
fn disposed_reader_rejects_reads() -> Result<()> {
    let db = mem_db()?;
    let mut reader = db.begin_read_only_batch("short-lived")?;
    reader.dispose();
    let err = reader.get_account(&keccak256(b"any")).expect_err("read after dispose");
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::UseAfterDispose)));
    Ok(())
}

// tests/reorg.rs
//
// Реорг: reorganize_back_to(h) находит удержанный исторический корень и
// открывает батч от него; чтения совпадают с состоянием сразу после
// батча, породившего h. Неизвестный корень — SnapshotMissing.
//
// Запуск:
//   cargo test --test reorg -- --nocapture

use anyhow::Result;

use paprika::data::keccak256;
use paprika::{Account, CommitOptions, PagedDb, PaprikaConfig, StoreError, U256};

fn mem_db(history: u32) -> Result<PagedDb> {
    PagedDb::in_memory(
        PaprikaConfig::default()
            .with_arena_bytes(16 * 1024 * 1024)
            .with_history_depth(history),
    )
}

#[test]
fn reorg_restores_historical_reads() -> Result<()> {
    let db = mem_db(4)?;
    let k = keccak256(b"reorg-key");

    let mut batch = db.begin_batch()?;
    batch.set_account(&k, &Account { balance: U256::from(1u64), nonce: 1, ..Account::EMPTY })?;
    batch.set_block_number(1);
    let root_a = batch.commit(CommitOptions::FlushDataThenRoot)?;

    let mut batch = db.begin_batch()?;
    batch.set_account(&k, &Account { balance: U256::from(2u64), nonce: 2, ..Account::EMPTY })?;
    batch.set_block_number(2);
    let root_b = batch.commit(CommitOptions::FlushDataThenRoot)?;
    assert_ne!(root_a, root_b);

    // откат к корню A: батч читает состояние A
    let mut reorg = db.reorganize_back_to(&root_a)?;
    assert_eq!(reorg.get_account(&k)?.balance, U256::from(1u64));
    let recommitted = reorg.commit(CommitOptions::FlushDataThenRoot)?;
    assert_eq!(recommitted, root_a, "empty batch over A must re-produce A's root");

    // после коммита линия B недостижима
    let read = db.begin_read_only_batch("after-reorg")?;
    assert_eq!(read.get_account(&k)?.balance, U256::from(1u64));
    assert_eq!(read.state_root(), root_a);
    Ok(())
}

#[test]
fn reorg_to_unknown_root_is_snapshot_missing() -> Result<()> {
    let db = mem_db(2)?;
    let err = db
        .reorganize_back_to(&keccak256(b"never-committed"))
        .err()
        .expect("unknown root must fail");
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::SnapshotMissing)));

    // неудачный реорг не оставляет висящего writer-флага
    let _batch = db.begin_batch()?;
    Ok(())
}

#[test]
fn reorg_beyond_history_window_is_missing() -> Result<()> {
    let db = mem_db(2)?;
    let k = keccak256(b"old");

    let mut batch = db.begin_batch()?;
    batch.set_account(&k, &Account { nonce: 1, ..Account::EMPTY })?;
    let old_root = batch.commit(CommitOptions::FlushDataThenRoot)?;

    // вытолкнуть old_root из кольца истории
    for i in 2..=4u64 {
        let mut batch = db.begin_batch()?;
        batch.set_account(&k, &Account { nonce: i, ..Account::EMPTY })?;
        batch.commit(CommitOptions::FlushDataThenRoot)?;
    }

    let err = db.reorganize_back_to(&old_root).err().expect("aged-out root must fail");
    assert!(matches!(err.downcast_ref::<StoreError>(), Some(StoreError::SnapshotMissing)));
    Ok(())
}

// tests/determinism.rs
//
// Детерминизм корня: одна и та же финальная карта ключ→значение даёт один
// и тот же state root независимо от порядка и нарезки записей по батчам.
// Плюс персистентность: файловая арена после переоткрытия отдаёт тот же
// корень и те же значения.
//
// Запуск:
//   cargo test --test determinism -- --nocapture

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use paprika::data::keccak256;
use paprika::{Account, CommitOptions, Keccak, PagedDb, PaprikaConfig, U256};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_arena(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("paprika-test-{prefix}-{pid}-{t}-{id}.pk"))
}

fn accounts(n: u8) -> Vec<(Keccak, Account)> {
    (0..n)
        .map(|i| {
            (
                keccak256(&[i, 0x11]),
                Account {
                    balance: U256::from(i as u64 * 1000 + 5),
                    nonce: i as u64,
                    ..Account::EMPTY
                },
            )
        })
        .collect()
}

#[test]
fn same_final_map_same_root() -> Result<()> {
    let set = accounts(40);

    // один батч, прямой порядок
    let db1 = PagedDb::in_memory(PaprikaConfig::default().with_arena_bytes(32 * 1024 * 1024))?;
    let mut batch = db1.begin_batch()?;
    for (k, a) in &set {
        batch.set_account(k, a)?;
    }
    let root_forward = batch.commit(CommitOptions::FlushDataThenRoot)?;

    // много батчей, обратный порядок, с промежуточным мусором
    let db2 = PagedDb::in_memory(PaprikaConfig::default().with_arena_bytes(32 * 1024 * 1024))?;
    let garbage = keccak256(b"garbage");
    let mut batch = db2.begin_batch()?;
    batch.set_account(&garbage, &Account { nonce: 99, ..Account::EMPTY })?;
    batch.commit(CommitOptions::FlushDataThenRoot)?;
    for chunk in set.chunks(7).rev() {
        let mut batch = db2.begin_batch()?;
        for (k, a) in chunk.iter().rev() {
            batch.set_account(k, a)?;
        }
        batch.commit(CommitOptions::FlushDataThenRoot)?;
    }
    let mut batch = db2.begin_batch()?;
    batch.delete_account(&garbage)?;
    let root_backward = batch.commit(CommitOptions::FlushDataThenRoot)?;

    assert_eq!(root_forward, root_backward, "root must depend on the map, not the history");
    Ok(())
}

#[test]
fn file_arena_survives_reopen() -> Result<()> {
    let path = unique_arena("reopen");
    let cfg = PaprikaConfig::default().with_arena_bytes(8 * 1024 * 1024);
    let set = accounts(20);

    let root = {
        let db = PagedDb::open(&path, cfg.clone())?;
        let mut batch = db.begin_batch()?;
        for (k, a) in &set {
            batch.set_account(k, a)?;
        }
        batch.set_block_number(7);
        batch.commit(CommitOptions::FlushDataThenRoot)?
    };

    {
        let db = PagedDb::open(&path, cfg)?;
        assert_eq!(db.state_root()?, root, "reopened arena must expose the committed root");
        assert_eq!(db.block_number()?, 7);
        let read = db.begin_read_only_batch("reopened")?;
        for (k, a) in &set {
            assert_eq!(&read.get_account(k)?, a);
        }
        // и дальше можно писать
        let mut batch = db.begin_batch()?;
        batch.set_account(&keccak256(b"new-after-reopen"), &Account { nonce: 1, ..Account::EMPTY })?;
        let new_root = batch.commit(CommitOptions::FlushDataThenRoot)?;
        assert_ne!(new_root, root);
    }

    let _ = std::fs::remove_file(&path);
    let mut lock = path.as_os_str().to_os_string();
    lock.push(".lock");
    let _ = std::fs::remove_file(PathBuf::from(lock));
    Ok(())
}

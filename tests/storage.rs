// tests/storage.rs
//
// Storage-ячейки: запись/чтение, нулевое значение = удаление,
// delete_storage_by_prefix стирает все слоты аккаунта, storage_root
// возвращается к корню пустого трие (известный вектор).
//
// Запуск:
//   cargo test --test storage -- --nocapture

use anyhow::Result;

use paprika::data::keccak256;
use paprika::{Account, CommitOptions, PagedDb, PaprikaConfig, U256, EMPTY_TRIE_ROOT};

fn mem_db() -> Result<PagedDb> {
    PagedDb::in_memory(PaprikaConfig::default().with_arena_bytes(64 * 1024 * 1024))
}

#[test]
fn storage_roundtrip_and_zero_deletes() -> Result<()> {
    let db = mem_db()?;
    let contract = keccak256(b"contract");
    let s0 = keccak256(b"slot-0");
    let s1 = keccak256(b"slot-1");

    let mut batch = db.begin_batch()?;
    batch.set_account(&contract, &Account { nonce: 1, ..Account::EMPTY })?;
    batch.set_storage(&contract, &s0, &U256::from(11u64))?;
    batch.set_storage(&contract, &s1, &U256::from(22u64))?;
    let root_with = batch.commit(CommitOptions::FlushDataThenRoot)?;

    let read = db.begin_read_only_batch("verify")?;
    assert_eq!(read.get_storage(&contract, &s0)?, U256::from(11u64));
    assert_eq!(read.get_storage(&contract, &s1)?, U256::from(22u64));
    let acc = read.get_account(&contract)?;
    assert_ne!(acc.storage_root, EMPTY_TRIE_ROOT);
    drop(read);

    // нулевая запись удаляет ячейку, состояние и корень меняются
    let mut batch = db.begin_batch()?;
    batch.set_storage(&contract, &s1, &U256::zero())?;
    let root_less = batch.commit(CommitOptions::FlushDataThenRoot)?;
    assert_ne!(root_with, root_less);

    let read = db.begin_read_only_batch("verify2")?;
    assert_eq!(read.get_storage(&contract, &s1)?, U256::zero());
    assert_eq!(read.get_storage(&contract, &s0)?, U256::from(11u64));
    Ok(())
}

#[test]
fn delete_storage_by_prefix_resets_storage_root() -> Result<()> {
    let db = mem_db()?;
    let contract = keccak256(b"big-contract");
    let other = keccak256(b"other-contract");
    let other_slot = keccak256(b"other-slot");

    let slots: Vec<_> = (0u32..500).map(|i| keccak256(&i.to_le_bytes())).collect();

    let mut batch = db.begin_batch()?;
    batch.set_account(&contract, &Account { nonce: 1, ..Account::EMPTY })?;
    batch.set_account(&other, &Account { nonce: 2, ..Account::EMPTY })?;
    for (i, slot) in slots.iter().enumerate() {
        batch.set_storage(&contract, slot, &U256::from(i as u64 + 1))?;
    }
    batch.set_storage(&other, &other_slot, &U256::from(0xBEEFu64))?;
    batch.commit(CommitOptions::FlushDataThenRoot)?;

    let read = db.begin_read_only_batch("before")?;
    assert_ne!(read.get_account(&contract)?.storage_root, EMPTY_TRIE_ROOT);
    drop(read);

    // очистка префиксом: все слоты контракта исчезают разом
    let mut batch = db.begin_batch()?;
    batch.delete_storage_by_prefix(&contract)?;
    batch.commit(CommitOptions::FlushDataThenRoot)?;

    let read = db.begin_read_only_batch("after")?;
    for slot in slots.iter().step_by(7) {
        assert_eq!(read.get_storage(&contract, slot)?, U256::zero());
    }
    // storage_root контракта вернулся к корню пустого трие
    assert_eq!(read.get_account(&contract)?.storage_root, EMPTY_TRIE_ROOT);
    // сам аккаунт жив
    assert_eq!(read.get_account(&contract)?.nonce, 1);
    // чужой storage не задет
    assert_eq!(read.get_storage(&other, &other_slot)?, U256::from(0xBEEFu64));
    assert_ne!(read.get_account(&other)?.storage_root, EMPTY_TRIE_ROOT);
    Ok(())
}

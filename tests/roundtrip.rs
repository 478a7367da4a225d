// tests/roundtrip.rs
//
// Свойство round-trip: последняя запись по ключу читается обратно,
// удалённые ключи дают Account::EMPTY. Плюс сценарий одного аккаунта
// (корень совпадает с независимо собранным MPT-листом) и массовая
// вставка со случайными ключами.
//
// Запуск:
//   cargo test --test roundtrip -- --nocapture

use anyhow::Result;
use rlp::RlpStream;

use paprika::data::keccak256;
use paprika::key;
use paprika::nibble::hp_encode;
use paprika::{Account, CommitOptions, PagedDb, PaprikaConfig, U256, EMPTY_TRIE_ROOT};

fn mem_db(bytes: u64) -> Result<PagedDb> {
    PagedDb::in_memory(PaprikaConfig::default().with_arena_bytes(bytes))
}

#[test]
fn single_account_root_matches_hand_built_leaf() -> Result<()> {
    let db = mem_db(4 * 1024 * 1024)?;
    let k0 = keccak256(&[0u8; 32]);
    let acc = Account {
        balance: U256::from(10u64),
        nonce: 1,
        ..Account::EMPTY
    };

    let mut batch = db.begin_batch()?;
    batch.set_account(&k0, &acc)?;
    batch.set_block_number(1);
    let root = batch.commit(CommitOptions::FlushDataThenRoot)?;

    // независимая сборка корня: единственный лист с полным путём
    let mut value = RlpStream::new_list(4);
    value.append(&acc.nonce);
    value.append(&acc.balance);
    value.append(&acc.storage_root);
    value.append(&acc.code_hash);
    let mut leaf = RlpStream::new_list(2);
    leaf.append(&hp_encode(&key::keccak_nibbles(&k0), true));
    leaf.append(&value.out().to_vec());
    let expected = keccak256(&leaf.out());

    assert_eq!(root, expected, "state root must equal the MPT of one leaf");
    assert_eq!(db.state_root()?, root);
    assert_eq!(db.block_number()?, 1);

    let read = db.begin_read_only_batch("verify")?;
    assert_eq!(read.get_account(&k0)?, acc);
    Ok(())
}

#[test]
fn last_write_wins_and_deletes_read_empty() -> Result<()> {
    let db = mem_db(8 * 1024 * 1024)?;
    let a = keccak256(b"alpha");
    let b = keccak256(b"beta");

    let mut batch = db.begin_batch()?;
    batch.set_account(&a, &Account { balance: U256::from(1u64), nonce: 1, ..Account::EMPTY })?;
    batch.set_account(&a, &Account { balance: U256::from(2u64), nonce: 2, ..Account::EMPTY })?;
    batch.set_account(&b, &Account { balance: U256::from(3u64), nonce: 3, ..Account::EMPTY })?;
    batch.delete_account(&b)?;
    batch.commit(CommitOptions::FlushDataThenRoot)?;

    let read = db.begin_read_only_batch("verify")?;
    let got = read.get_account(&a)?;
    assert_eq!(got.balance, U256::from(2u64));
    assert_eq!(got.nonce, 2);
    assert_eq!(read.get_account(&b)?, Account::EMPTY, "deleted key must read empty");
    Ok(())
}

#[test]
fn bulk_random_inserts_stay_readable() -> Result<()> {
    let db = mem_db(64 * 1024 * 1024)?;
    let mut rng = oorandom::Rand64::new(0xC0FFEE);
    let count = 2000u64;

    let keys: Vec<_> = (0..count)
        .map(|i| {
            let mut seed = [0u8; 16];
            seed[..8].copy_from_slice(&rng.rand_u64().to_le_bytes());
            seed[8..].copy_from_slice(&i.to_le_bytes());
            keccak256(&seed)
        })
        .collect();

    let mut batch = db.begin_batch()?;
    for (i, k) in keys.iter().enumerate() {
        let acc = Account {
            balance: U256::from(i as u64),
            nonce: i as u64,
            ..Account::EMPTY
        };
        batch.set_account(k, &acc)?;
    }
    let root = batch.commit(CommitOptions::FlushDataThenRoot)?;
    assert_ne!(root, EMPTY_TRIE_ROOT);

    let read = db.begin_read_only_batch("verify")?;
    for (i, k) in keys.iter().enumerate() {
        let acc = read.get_account(k)?;
        assert_eq!(acc.balance, U256::from(i as u64), "key #{} mismatch", i);
        assert_eq!(acc.nonce, i as u64);
    }
    // незаписанный ключ
    assert_eq!(read.get_account(&keccak256(b"missing"))?, Account::EMPTY);

    // арена не должна быть забита под завязку
    let stats = db.stats()?;
    assert!(
        stats.used_ratio() < 0.95,
        "arena must stay below 95% after bulk insert, used {:.2}",
        stats.used_ratio()
    );
    assert!(stats.reachable_pages > 0);
    Ok(())
}

// tests/blockchain.rs
//
// Конвейер блоков: start_new/commit/finalize, фоновой flusher, водяной
// знак flushed. Оракул — обычные HashMap'ы; после прогона выборка ключей
// сверяется и через оверлей нового блока, и через RO-батч стора.
//
// Запуск:
//   cargo test --test blockchain -- --nocapture

use anyhow::Result;
use std::collections::HashMap;

use paprika::data::keccak256;
use paprika::{Account, Blockchain, Keccak, PagedDb, PaprikaConfig, U256};

fn chain(cfg: PaprikaConfig) -> Result<Blockchain> {
    let db = PagedDb::in_memory(cfg.clone())?;
    Blockchain::new(db, cfg)
}

#[test]
fn single_block_lifecycle() -> Result<()> {
    let cfg = PaprikaConfig::default().with_arena_bytes(16 * 1024 * 1024);
    let chain = chain(cfg)?;
    let genesis = chain.db().state_root()?;
    let k = keccak256(b"first");

    let mut block = chain.start_new(&genesis)?;
    block.set_account(&k, &Account { balance: U256::from(10u64), nonce: 1, ..Account::EMPTY })?;
    // запись видна внутри блока ещё до commit
    assert_eq!(block.get_account(&k)?.balance, U256::from(10u64));
    let root = block.commit(1)?;

    chain.finalize(&root)?;
    chain.wait_flushed(1)?;
    assert_eq!(chain.flushed_watermark()?, (1, root));
    assert_eq!(chain.db().state_root()?, root);

    let read = chain.db().begin_read_only_batch("verify")?;
    assert_eq!(read.get_account(&k)?.balance, U256::from(10u64));
    Ok(())
}

#[test]
fn pending_parent_is_visible_to_children() -> Result<()> {
    let cfg = PaprikaConfig::default().with_arena_bytes(16 * 1024 * 1024);
    let chain = chain(cfg)?;
    let genesis = chain.db().state_root()?;
    let k = keccak256(b"layered");

    // блок 1 не финализирован — живёт только в памяти
    let mut b1 = chain.start_new(&genesis)?;
    b1.set_account(&k, &Account { balance: U256::from(1u64), nonce: 1, ..Account::EMPTY })?;
    let r1 = b1.commit(1)?;

    // блок 2 поверх незаписанного родителя видит его состояние
    let mut b2 = chain.start_new(&r1)?;
    assert_eq!(b2.get_account(&k)?.balance, U256::from(1u64));
    b2.set_account(&k, &Account { balance: U256::from(2u64), nonce: 2, ..Account::EMPTY })?;
    let r2 = b2.commit(2)?;

    // финализация головы тянет родителя в стор
    chain.finalize(&r2)?;
    chain.wait_flushed(2)?;
    let read = chain.db().begin_read_only_batch("verify")?;
    assert_eq!(read.get_account(&k)?.balance, U256::from(2u64));
    assert_eq!(read.state_root(), r2);
    Ok(())
}

#[test]
fn unknown_parent_is_rejected() -> Result<()> {
    let cfg = PaprikaConfig::default().with_arena_bytes(8 * 1024 * 1024);
    let chain = chain(cfg)?;
    let bogus: Keccak = keccak256(b"no-such-block");
    assert!(chain.start_new(&bogus).is_err());
    Ok(())
}

#[test]
fn pipelined_blocks_agree_with_oracle() -> Result<()> {
    let cfg = PaprikaConfig::default()
        .with_arena_bytes(128 * 1024 * 1024)
        .with_max_pending_blocks(64);
    let chain = chain(cfg)?;
    let mut rng = oorandom::Rand64::new(0xFEED_BEEF);

    let accounts: Vec<Keccak> = (0u8..50).map(|i| keccak256(&[i, 0x55])).collect();
    let slots: Vec<Keccak> = (0u8..10).map(|i| keccak256(&[i, 0x77])).collect();

    let mut acc_oracle: HashMap<Keccak, Account> = HashMap::new();
    let mut st_oracle: HashMap<(Keccak, Keccak), U256> = HashMap::new();

    let blocks = 60u32;
    let mut parent = chain.db().state_root()?;
    for number in 1..=blocks {
        let mut block = chain.start_new(&parent)?;

        // 5-20 обновлений аккаунтов на блок
        let updates = 5 + (rng.rand_u64() % 16) as usize;
        for _ in 0..updates {
            let a = accounts[(rng.rand_u64() % accounts.len() as u64) as usize];
            let acc = Account {
                balance: U256::from(rng.rand_u64()),
                nonce: number as u64,
                ..Account::EMPTY
            };
            block.set_account(&a, &acc)?;
            acc_oracle.insert(a, acc);
        }
        // 1-5 storage-записей (иногда нулевых — удаления)
        let writes = 1 + (rng.rand_u64() % 5) as usize;
        for _ in 0..writes {
            let a = accounts[(rng.rand_u64() % accounts.len() as u64) as usize];
            if acc_oracle.get(&a).is_none() {
                continue;
            }
            let s = slots[(rng.rand_u64() % slots.len() as u64) as usize];
            let v = if rng.rand_u64() % 4 == 0 {
                U256::zero()
            } else {
                U256::from(rng.rand_u64())
            };
            block.set_storage(&a, &s, &v)?;
            st_oracle.insert((a, s), v);
        }

        parent = block.commit(number)?;
        // периодическая финализация c отставанием
        if number % 8 == 0 {
            chain.finalize(&parent)?;
        }
    }
    chain.finalize(&parent)?;
    chain.wait_flushed(blocks)?;

    // storage_root оракула не отслеживается — сверяем значимые поля
    let read = chain.db().begin_read_only_batch("oracle")?;
    for (a, expected) in &acc_oracle {
        let got = read.get_account(a)?;
        assert_eq!(got.balance, expected.balance, "balance mismatch for {:x}", a);
        assert_eq!(got.nonce, expected.nonce);
    }
    for ((a, s), expected) in &st_oracle {
        if acc_oracle.get(a).is_none() {
            continue;
        }
        assert_eq!(read.get_storage(a, s)?, *expected, "slot mismatch for {:x}/{:x}", a, s);
    }
    assert_eq!(read.state_root(), parent, "final root must match last committed block");
    Ok(())
}

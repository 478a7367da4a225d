//! merkle — инкрементальный Merkle-Patricia слой.
//!
//! Работает поверх абстракции TrieStore: один и тот же код обслуживает
//! write-батч PagedDb и in-memory оверлей блока. Узлы хранятся записями,
//! ключёванными позицией в трие (path-keyed): правка структуры не
//! перемещает непричастные поддеревья.
//!
//! pre_commit: по множеству затронутых ключей батча
//! 1) перестраивает storage-трие затронутых аккаунтов и их корни,
//! 2) переписывает storage_root в записях аккаунтов,
//! 3) перестраивает state-трие и возвращает 32-байтный корень состояния.
//!
//! Хеширование мемоизируется позаписно; правка пути сбрасывает memo у всех
//! пройденных узлов. Верхние MERKLE_MEMO_SKIP_LEVELS уровней state-трие не
//! мемоизируются: они пересчитываются в каждом батче.
//!
//! Инвариант фиксированной длины ключей (64 нибла keccak): ветки никогда
//! не несут значение, 17-й элемент RLP ветки всегда пустая строка.

pub mod node;

use anyhow::{anyhow, Result};
use rlp::RlpStream;
use std::collections::{BTreeMap, BTreeSet};

use crate::consts::MERKLE_MEMO_SKIP_LEVELS;
use crate::data::{keccak256, u256_from_trimmed_be, Account, Keccak, EMPTY_TRIE_ROOT};
use crate::key;
use crate::metrics::{record_merkle_memo_hit, record_merkle_node_hashed};
use crate::nibble::hp_encode;

use node::{KeccakOrRlp, Node};

/// Абстракция хранилища для merkle-слоя: сырые записи по нибловым ключам
/// (включая типовой нибл, см. key.rs).
pub trait TrieStore {
    fn get_raw(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set_raw(&mut self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete_raw(&mut self, key: &[u8]) -> Result<()>;
}

/// Множество ключей, изменённых с прошлого коммита.
#[derive(Debug, Default, Clone)]
pub struct Touched {
    pub accounts: BTreeSet<Keccak>,
    pub storage: BTreeMap<Keccak, BTreeSet<Keccak>>,
    pub cleared_storage: BTreeSet<Keccak>,
}

impl Touched {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storage.is_empty() && self.cleared_storage.is_empty()
    }
}

#[derive(Clone, Copy)]
enum Plane<'a> {
    State,
    Storage(&'a Keccak),
}

impl Plane<'_> {
    fn node_key(&self, pos: &[u8]) -> Vec<u8> {
        match self {
            Plane::State => key::merkle_node_key(pos),
            Plane::Storage(account) => key::storage_node_key(account, pos),
        }
    }

    fn memo_allowed(&self, depth: usize) -> bool {
        match self {
            Plane::State => depth >= MERKLE_MEMO_SKIP_LEVELS,
            Plane::Storage(_) => true,
        }
    }
}

#[inline]
fn lcp(a: &[u8], b: &[u8]) -> usize {
    let n = a.len().min(b.len());
    (0..n).take_while(|&i| a[i] == b[i]).count()
}

/// Вычислить корень состояния по затронутым ключам батча.
pub fn pre_commit<S: TrieStore>(store: &mut S, touched: &Touched) -> Result<Keccak> {
    let mut accounts: BTreeSet<Keccak> = touched.accounts.clone();

    let mut storage_accounts: BTreeSet<Keccak> = touched.storage.keys().copied().collect();
    storage_accounts.extend(touched.cleared_storage.iter().copied());

    for account in &storage_accounts {
        let plane = Plane::Storage(account);
        if let Some(slots) = touched.storage.get(account) {
            for slot in slots {
                let cell_key = key::storage_cell_key(account, slot);
                let slot_path = key::keccak_nibbles(slot);
                match store.get_raw(&cell_key)? {
                    Some(_) => trie_insert(store, plane, &slot_path)?,
                    None => trie_remove(store, plane, &slot_path)?,
                }
            }
        }

        let storage_root = compute_root(store, plane)?;
        let root_key = key::storage_tree_root_key(account);
        if storage_root == EMPTY_TRIE_ROOT {
            store.delete_raw(&root_key)?;
        } else {
            store.set_raw(&root_key, storage_root.as_bytes())?;
        }

        let account_key = key::account_key(account);
        if let Some(raw) = store.get_raw(&account_key)? {
            let mut acc = Account::read_from(&raw)?;
            if acc.storage_root != storage_root {
                acc.storage_root = storage_root;
                if acc.is_empty() {
                    store.delete_raw(&account_key)?;
                } else {
                    store.set_raw(&account_key, &acc.encode())?;
                }
            }
            accounts.insert(*account);
        }
        // storage без записи аккаунта в state-корень не попадает
    }

    for account in &accounts {
        let path = key::keccak_nibbles(account);
        match store.get_raw(&key::account_key(account))? {
            Some(_) => trie_insert(store, Plane::State, &path)?,
            None => trie_remove(store, Plane::State, &path)?,
        }
    }

    compute_root(store, Plane::State)
}

/// Корень отдельного storage-трие (для инспекции и тестов).
pub fn storage_root<S: TrieStore>(store: &mut S, account: &Keccak) -> Result<Keccak> {
    compute_root(store, Plane::Storage(account))
}

// ---------------- структурные правки ----------------

/// Обеспечить лист на полном пути. Все пройденные узлы теряют memo.
fn trie_insert<S: TrieStore>(store: &mut S, plane: Plane<'_>, path: &[u8]) -> Result<()> {
    let mut pos: Vec<u8> = Vec::new();
    loop {
        let pos_key = plane.node_key(&pos);
        let rest = &path[pos.len()..];
        let rec = store.get_raw(&pos_key)?;
        match rec.as_deref().map(Node::decode).transpose()? {
            None => {
                store.set_raw(&pos_key, &Node::Leaf { path: rest.to_vec() }.encode())?;
                return Ok(());
            }
            Some(Node::Leaf { path: lp }) => {
                if lp == rest {
                    return Ok(());
                }
                // раскол листа: общий префикс, ветка, два листа
                let common = lcp(&lp, rest);
                let old_nib = lp[common];
                let new_nib = rest[common];

                let mut old_pos = pos.clone();
                old_pos.extend_from_slice(&lp[..common + 1]);
                store.set_raw(
                    &plane.node_key(&old_pos),
                    &Node::Leaf { path: lp[common + 1..].to_vec() }.encode(),
                )?;

                let mut new_pos = pos.clone();
                new_pos.extend_from_slice(&rest[..common + 1]);
                store.set_raw(
                    &plane.node_key(&new_pos),
                    &Node::Leaf { path: rest[common + 1..].to_vec() }.encode(),
                )?;

                let bitmap = (1u16 << old_nib) | (1u16 << new_nib);
                let mut branch_pos = pos.clone();
                branch_pos.extend_from_slice(&rest[..common]);
                store.set_raw(
                    &plane.node_key(&branch_pos),
                    &Node::Branch { bitmap, memo: None }.encode(),
                )?;

                if common > 0 {
                    store.set_raw(
                        &pos_key,
                        &Node::Extension { path: rest[..common].to_vec(), memo: None }.encode(),
                    )?;
                }
                return Ok(());
            }
            Some(Node::Extension { path: ep, .. }) => {
                let common = lcp(&ep, rest);
                if common == ep.len() {
                    store.set_raw(
                        &pos_key,
                        &Node::Extension { path: ep.clone(), memo: None }.encode(),
                    )?;
                    pos.extend_from_slice(&ep);
                    continue;
                }
                // разрез расширения веткой в точке расхождения
                let old_nib = ep[common];
                let new_nib = rest[common];
                let mut branch_pos = pos.clone();
                branch_pos.extend_from_slice(&ep[..common]);

                if common + 1 < ep.len() {
                    // остаток старого расширения между веткой и прежним ребёнком
                    let mut tail_pos = branch_pos.clone();
                    tail_pos.push(old_nib);
                    store.set_raw(
                        &plane.node_key(&tail_pos),
                        &Node::Extension { path: ep[common + 1..].to_vec(), memo: None }.encode(),
                    )?;
                }
                // при common+1 == ep.len() прежний ребёнок уже стоит на нужной позиции

                let mut new_pos = branch_pos.clone();
                new_pos.push(new_nib);
                store.set_raw(
                    &plane.node_key(&new_pos),
                    &Node::Leaf { path: rest[common + 1..].to_vec() }.encode(),
                )?;

                let bitmap = (1u16 << old_nib) | (1u16 << new_nib);
                store.set_raw(
                    &plane.node_key(&branch_pos),
                    &Node::Branch { bitmap, memo: None }.encode(),
                )?;

                if common > 0 {
                    store.set_raw(
                        &pos_key,
                        &Node::Extension { path: ep[..common].to_vec(), memo: None }.encode(),
                    )?;
                }
                return Ok(());
            }
            Some(Node::Branch { bitmap, .. }) => {
                let nib = rest[0];
                store.set_raw(
                    &pos_key,
                    &Node::Branch { bitmap: bitmap | (1u16 << nib), memo: None }.encode(),
                )?;
                pos.push(nib);
                continue;
            }
        }
    }
}

/// Убрать лист с полного пути и нормализовать структуру вокруг него.
fn trie_remove<S: TrieStore>(store: &mut S, plane: Plane<'_>, path: &[u8]) -> Result<()> {
    let mut pos: Vec<u8> = Vec::new();
    let mut chain: Vec<(Vec<u8>, Node)> = Vec::new();
    loop {
        let pos_key = plane.node_key(&pos);
        let rest = &path[pos.len()..];
        let raw = match store.get_raw(&pos_key)? {
            Some(r) => r,
            None => return Ok(()),
        };
        match Node::decode(&raw)? {
            Node::Leaf { path: lp } => {
                if lp != rest {
                    return Ok(());
                }
                store.delete_raw(&pos_key)?;
                break;
            }
            Node::Extension { path: ep, .. } => {
                if rest.len() < ep.len() || rest[..ep.len()] != ep[..] {
                    return Ok(());
                }
                let cleared = Node::Extension { path: ep.clone(), memo: None };
                store.set_raw(&pos_key, &cleared.encode())?;
                chain.push((pos.clone(), cleared));
                pos.extend_from_slice(&ep);
            }
            Node::Branch { bitmap, .. } => {
                let nib = rest[0];
                if !node::has_child(bitmap, nib) {
                    return Ok(());
                }
                let cleared = Node::Branch { bitmap, memo: None };
                store.set_raw(&pos_key, &cleared.encode())?;
                chain.push((pos.clone(), cleared));
                pos.push(nib);
            }
        }
    }

    // единственный лист трие удалён
    let Some((branch_pos, parent)) = chain.pop() else {
        return Ok(());
    };
    let Node::Branch { bitmap, .. } = parent else {
        return Err(anyhow!("trie corruption: extension directly above a leaf"));
    };

    let removed_nib = path[branch_pos.len()];
    let bitmap = bitmap & !(1u16 << removed_nib);
    let branch_key = plane.node_key(&branch_pos);

    match bitmap.count_ones() {
        0 => Err(anyhow!("trie corruption: branch had a single child")),
        1 => {
            // схлопывание: оставшийся ребёнок поднимается на место ветки
            let sibling_nib = bitmap.trailing_zeros() as u8;
            let mut sibling_pos = branch_pos.clone();
            sibling_pos.push(sibling_nib);
            let sibling_key = plane.node_key(&sibling_pos);
            let sibling_raw = store
                .get_raw(&sibling_key)?
                .ok_or_else(|| anyhow!("trie corruption: missing sibling node"))?;
            let merged = match Node::decode(&sibling_raw)? {
                Node::Leaf { path: lp } => {
                    store.delete_raw(&sibling_key)?;
                    let mut p = vec![sibling_nib];
                    p.extend_from_slice(&lp);
                    Node::Leaf { path: p }
                }
                Node::Extension { path: ep, .. } => {
                    store.delete_raw(&sibling_key)?;
                    let mut p = vec![sibling_nib];
                    p.extend_from_slice(&ep);
                    Node::Extension { path: p, memo: None }
                }
                // ветка-сосед остаётся на месте, сверху встаёт расширение в один нибл
                Node::Branch { .. } => Node::Extension { path: vec![sibling_nib], memo: None },
            };

            // слияние с расширением-родителем, чтобы не плодить цепочки ext-ext
            let parent_ext = chain.last().and_then(|(apos, n)| match n {
                Node::Extension { path: ap, .. } if apos.len() + ap.len() == branch_pos.len() => {
                    Some((apos.clone(), ap.clone()))
                }
                _ => None,
            });
            match parent_ext {
                Some((parent_pos, parent_path)) => {
                    let parent_key = plane.node_key(&parent_pos);
                    let merged_up = match merged {
                        Node::Leaf { path: mp } => {
                            let mut p = parent_path;
                            p.extend_from_slice(&mp);
                            Node::Leaf { path: p }
                        }
                        Node::Extension { path: mp, .. } => {
                            let mut p = parent_path;
                            p.extend_from_slice(&mp);
                            Node::Extension { path: p, memo: None }
                        }
                        Node::Branch { .. } => unreachable!("merged node is never a branch"),
                    };
                    store.set_raw(&parent_key, &merged_up.encode())?;
                    store.delete_raw(&branch_key)?;
                }
                None => {
                    store.set_raw(&branch_key, &merged.encode())?;
                }
            }
            Ok(())
        }
        _ => {
            store.set_raw(&branch_key, &Node::Branch { bitmap, memo: None }.encode())?;
            Ok(())
        }
    }
}

// ---------------- хеширование ----------------

fn leaf_value<S: TrieStore>(store: &mut S, plane: Plane<'_>, full_path: &[u8]) -> Result<Vec<u8>> {
    match plane {
        Plane::State => {
            let mut k = Vec::with_capacity(1 + full_path.len());
            k.push(key::DataType::Account.nibble());
            k.extend_from_slice(full_path);
            let raw = store
                .get_raw(&k)?
                .ok_or_else(|| anyhow!("state trie leaf without an account record"))?;
            let acc = Account::read_from(&raw)?;
            let mut s = RlpStream::new_list(4);
            s.append(&acc.nonce);
            s.append(&acc.balance);
            s.append(&acc.storage_root);
            s.append(&acc.code_hash);
            Ok(s.out().to_vec())
        }
        Plane::Storage(account) => {
            let mut k = Vec::with_capacity(65 + full_path.len());
            k.push(key::DataType::StorageCell.nibble());
            key::push_keccak_nibbles(&mut k, account);
            k.extend_from_slice(full_path);
            let raw = store
                .get_raw(&k)?
                .ok_or_else(|| anyhow!("storage trie leaf without a cell record"))?;
            let value = u256_from_trimmed_be(&raw)?;
            Ok(rlp::encode(&value).to_vec())
        }
    }
}

fn finish_node(bytes: Vec<u8>) -> KeccakOrRlp {
    record_merkle_node_hashed();
    if bytes.len() < 32 {
        KeccakOrRlp::Rlp(bytes)
    } else {
        KeccakOrRlp::Keccak(keccak256(&bytes))
    }
}

/// Ссылка на узел в позиции pos; memo переиспользуется и пополняется.
fn node_ref<S: TrieStore>(
    store: &mut S,
    plane: Plane<'_>,
    pos: &mut Vec<u8>,
) -> Result<KeccakOrRlp> {
    let pos_key = plane.node_key(pos);
    let raw = store
        .get_raw(&pos_key)?
        .ok_or_else(|| anyhow!("trie corruption: missing node at depth {}", pos.len()))?;
    match Node::decode(&raw)? {
        Node::Leaf { path: lp } => {
            let mut full = pos.clone();
            full.extend_from_slice(&lp);
            let value = leaf_value(store, plane, &full)?;
            let mut s = RlpStream::new_list(2);
            s.append(&hp_encode(&lp, true));
            s.append(&value);
            Ok(finish_node(s.out().to_vec()))
        }
        Node::Extension { path: ep, memo } => {
            if let Some(h) = memo {
                record_merkle_memo_hit();
                return Ok(KeccakOrRlp::Keccak(h));
            }
            let depth = pos.len();
            pos.extend_from_slice(&ep);
            let child = node_ref(store, plane, pos)?;
            pos.truncate(depth);

            let mut s = RlpStream::new_list(2);
            s.append(&hp_encode(&ep, false));
            child.append_to(&mut s);
            let result = finish_node(s.out().to_vec());
            if let KeccakOrRlp::Keccak(h) = &result {
                if plane.memo_allowed(depth) {
                    store.set_raw(&pos_key, &Node::Extension { path: ep, memo: Some(*h) }.encode())?;
                }
            }
            Ok(result)
        }
        Node::Branch { bitmap, memo } => {
            if let Some(h) = memo {
                record_merkle_memo_hit();
                return Ok(KeccakOrRlp::Keccak(h));
            }
            let depth = pos.len();
            let mut s = RlpStream::new_list(17);
            for nib in 0..16u8 {
                if node::has_child(bitmap, nib) {
                    pos.push(nib);
                    let child = node_ref(store, plane, pos)?;
                    pos.pop();
                    child.append_to(&mut s);
                } else {
                    s.append_empty_data();
                }
            }
            s.append_empty_data();
            let result = finish_node(s.out().to_vec());
            if let KeccakOrRlp::Keccak(h) = &result {
                if plane.memo_allowed(depth) {
                    store.set_raw(&pos_key, &Node::Branch { bitmap, memo: Some(*h) }.encode())?;
                }
            }
            Ok(result)
        }
    }
}

fn compute_root<S: TrieStore>(store: &mut S, plane: Plane<'_>) -> Result<Keccak> {
    if store.get_raw(&plane.node_key(&[]))?.is_none() {
        return Ok(EMPTY_TRIE_ROOT);
    }
    let mut pos = Vec::new();
    match node_ref(store, plane, &mut pos)? {
        KeccakOrRlp::Keccak(h) => Ok(h),
        // корень хешируется всегда, даже если его RLP короче 32 байт
        KeccakOrRlp::Rlp(raw) => Ok(keccak256(&raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{u256_to_trimmed_be, U256};
    use std::collections::BTreeMap;

    /// Простейший TrieStore поверх BTreeMap для модульных тестов слоя.
    #[derive(Default)]
    struct MemStore {
        map: BTreeMap<Vec<u8>, Vec<u8>>,
    }

    impl TrieStore for MemStore {
        fn get_raw(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.map.get(key).cloned())
        }
        fn set_raw(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
            self.map.insert(key.to_vec(), value.to_vec());
            Ok(())
        }
        fn delete_raw(&mut self, key: &[u8]) -> Result<()> {
            self.map.remove(key);
            Ok(())
        }
    }

    fn put_account(store: &mut MemStore, account: &Keccak, balance: u64, nonce: u64) {
        let acc = Account {
            balance: U256::from(balance),
            nonce,
            ..Account::EMPTY
        };
        store.map.insert(key::account_key(account), acc.encode());
    }

    fn run_pre_commit(store: &mut MemStore, touched: &Touched) -> Keccak {
        pre_commit(store, touched).unwrap()
    }

    #[test]
    fn empty_state_hashes_to_empty_root() {
        let mut store = MemStore::default();
        let touched = Touched::default();
        assert_eq!(run_pre_commit(&mut store, &touched), EMPTY_TRIE_ROOT);
    }

    #[test]
    fn single_account_root_is_deterministic_and_nonempty() {
        let mut store = MemStore::default();
        let a = keccak256(&[0u8; 32]);
        put_account(&mut store, &a, 10, 1);
        let mut touched = Touched::default();
        touched.accounts.insert(a);

        let r1 = run_pre_commit(&mut store, &touched);
        assert_ne!(r1, EMPTY_TRIE_ROOT);
        // повторный прогон того же состояния — тот же корень (memo-путь)
        let r2 = run_pre_commit(&mut store, &touched);
        assert_eq!(r1, r2);
    }

    #[test]
    fn root_is_insert_order_independent() {
        let keys: Vec<Keccak> = (0u8..40).map(|i| keccak256(&[i])).collect();

        let mut forward = MemStore::default();
        let mut touched_fwd = Touched::default();
        for (i, k) in keys.iter().enumerate() {
            put_account(&mut forward, k, i as u64 + 1, 1);
            touched_fwd.accounts.insert(*k);
        }
        let root_fwd = run_pre_commit(&mut forward, &touched_fwd);

        // обратный порядок вставки структурных правок
        let mut backward = MemStore::default();
        for (i, k) in keys.iter().enumerate() {
            put_account(&mut backward, k, i as u64 + 1, 1);
        }
        for k in keys.iter().rev() {
            let mut t = Touched::default();
            t.accounts.insert(*k);
            run_pre_commit(&mut backward, &t);
        }
        let root_bwd = run_pre_commit(&mut backward, &Touched::default());
        assert_eq!(root_fwd, root_bwd);
    }

    #[test]
    fn insert_then_remove_restores_previous_root() {
        let mut store = MemStore::default();
        let a = keccak256(b"a");
        let b = keccak256(b"b");

        put_account(&mut store, &a, 1, 1);
        let mut t = Touched::default();
        t.accounts.insert(a);
        let root_one = run_pre_commit(&mut store, &t);

        put_account(&mut store, &b, 2, 2);
        let mut t2 = Touched::default();
        t2.accounts.insert(b);
        let root_two = run_pre_commit(&mut store, &t2);
        assert_ne!(root_one, root_two);

        store.map.remove(&key::account_key(&b));
        let root_back = run_pre_commit(&mut store, &t2);
        assert_eq!(root_back, root_one);
    }

    #[test]
    fn removing_last_account_yields_empty_root() {
        let mut store = MemStore::default();
        let a = keccak256(b"solo");
        put_account(&mut store, &a, 5, 0);
        let mut t = Touched::default();
        t.accounts.insert(a);
        run_pre_commit(&mut store, &t);

        store.map.remove(&key::account_key(&a));
        assert_eq!(run_pre_commit(&mut store, &t), EMPTY_TRIE_ROOT);
    }

    #[test]
    fn storage_updates_flow_into_account_and_state_root() {
        let mut store = MemStore::default();
        let a = keccak256(b"contract");
        put_account(&mut store, &a, 1, 1);
        let mut t = Touched::default();
        t.accounts.insert(a);
        let plain_root = run_pre_commit(&mut store, &t);

        let slot = keccak256(b"slot0");
        store.map.insert(
            key::storage_cell_key(&a, &slot),
            u256_to_trimmed_be(&U256::from(777u64)),
        );
        let mut t2 = Touched::default();
        t2.storage.entry(a).or_default().insert(slot);
        let with_storage = run_pre_commit(&mut store, &t2);
        assert_ne!(plain_root, with_storage);

        let acc = Account::read_from(store.map.get(&key::account_key(&a)).unwrap()).unwrap();
        assert_ne!(acc.storage_root, EMPTY_TRIE_ROOT);
        assert!(store.map.contains_key(&key::storage_tree_root_key(&a)));

        // удаление ячейки возвращает и storage_root, и state root
        store.map.remove(&key::storage_cell_key(&a, &slot));
        let cleared = run_pre_commit(&mut store, &t2);
        assert_eq!(cleared, plain_root);
        let acc = Account::read_from(store.map.get(&key::account_key(&a)).unwrap()).unwrap();
        assert_eq!(acc.storage_root, EMPTY_TRIE_ROOT);
        assert!(!store.map.contains_key(&key::storage_tree_root_key(&a)));
    }
}

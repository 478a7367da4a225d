//! key — типы данных и сборка нибловых ключей обеих плоскостей.
//!
//! Каждый ключ начинается с нибла типа, дальше — keccak-компоненты и/или
//! путь узла. Благодаря типовому ниблу account-записи, storage-ячейки и
//! merkle-узлы не пересекаются ни в одной странице, а delete_by_prefix
//! по аккаунту не задевает чужие записи.

use crate::data::Keccak;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Аккаунт: `1 ++ keccak(addr)`, 65 ниблов, data-плоскость.
    Account = 1,
    /// Ячейка storage: `2 ++ account ++ slot`, 129 ниблов, data-плоскость.
    StorageCell = 2,
    /// Узел state-трие: `3 ++ node_path`, merkle-плоскость.
    Merkle = 3,
    /// Корень storage-трие аккаунта: `4 ++ account`, merkle-плоскость.
    StorageTreeRoot = 4,
    /// Узел storage-трие: `5 ++ account ++ node_path`, merkle-плоскость.
    StorageTreeStorageCell = 5,
}

impl DataType {
    #[inline]
    pub fn nibble(self) -> u8 {
        self as u8
    }

    /// В какой из двух плоскостей живёт запись этого типа.
    #[inline]
    pub fn is_merkle_plane(self) -> bool {
        matches!(
            self,
            DataType::Merkle | DataType::StorageTreeRoot | DataType::StorageTreeStorageCell
        )
    }
}

/// Добавить 64 нибла keccak-ключа.
#[inline]
pub fn push_keccak_nibbles(out: &mut Vec<u8>, k: &Keccak) {
    for b in k.as_bytes() {
        out.push(b >> 4);
        out.push(b & 0x0F);
    }
}

/// 64 нибла keccak-ключа отдельным вектором.
pub fn keccak_nibbles(k: &Keccak) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    push_keccak_nibbles(&mut out, k);
    out
}

/// Обратная сборка keccak из 64 распакованных ниблов.
pub fn keccak_from_nibbles(nibbles: &[u8]) -> Keccak {
    debug_assert_eq!(nibbles.len(), 64);
    let mut out = [0u8; 32];
    for (i, pair) in nibbles.chunks(2).enumerate() {
        out[i] = (pair[0] << 4) | (pair[1] & 0x0F);
    }
    Keccak::from(out)
}

pub fn account_key(account: &Keccak) -> Vec<u8> {
    let mut out = Vec::with_capacity(65);
    out.push(DataType::Account.nibble());
    push_keccak_nibbles(&mut out, account);
    out
}

pub fn storage_cell_key(account: &Keccak, slot: &Keccak) -> Vec<u8> {
    let mut out = Vec::with_capacity(129);
    out.push(DataType::StorageCell.nibble());
    push_keccak_nibbles(&mut out, account);
    push_keccak_nibbles(&mut out, slot);
    out
}

/// Префикс всех storage-ячеек аккаунта (для delete_by_prefix).
pub fn storage_cell_prefix(account: &Keccak) -> Vec<u8> {
    let mut out = Vec::with_capacity(65);
    out.push(DataType::StorageCell.nibble());
    push_keccak_nibbles(&mut out, account);
    out
}

pub fn merkle_node_key(node_path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + node_path.len());
    out.push(DataType::Merkle.nibble());
    out.extend_from_slice(node_path);
    out
}

pub fn storage_tree_root_key(account: &Keccak) -> Vec<u8> {
    let mut out = Vec::with_capacity(65);
    out.push(DataType::StorageTreeRoot.nibble());
    push_keccak_nibbles(&mut out, account);
    out
}

pub fn storage_node_key(account: &Keccak, node_path: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(65 + node_path.len());
    out.push(DataType::StorageTreeStorageCell.nibble());
    push_keccak_nibbles(&mut out, account);
    out.extend_from_slice(node_path);
    out
}

/// Префикс всех узлов storage-трие аккаунта.
pub fn storage_node_prefix(account: &Keccak) -> Vec<u8> {
    let mut out = Vec::with_capacity(65);
    out.push(DataType::StorageTreeStorageCell.nibble());
    push_keccak_nibbles(&mut out, account);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::keccak256;

    #[test]
    fn key_shapes() {
        let a = keccak256(b"account");
        let s = keccak256(b"slot");
        assert_eq!(account_key(&a).len(), 65);
        assert_eq!(storage_cell_key(&a, &s).len(), 129);
        assert_eq!(merkle_node_key(&[1, 2, 3]).len(), 4);
        assert_eq!(storage_tree_root_key(&a).len(), 65);
        assert!(storage_cell_key(&a, &s).starts_with(&storage_cell_prefix(&a)));
        assert!(storage_node_key(&a, &[7]).starts_with(&storage_node_prefix(&a)));
    }

    #[test]
    fn type_nibble_separates_planes() {
        let a = keccak256(b"x");
        assert_eq!(account_key(&a)[0], 1);
        assert_eq!(storage_cell_prefix(&a)[0], 2);
        assert!(DataType::Merkle.is_merkle_plane());
        assert!(!DataType::Account.is_merkle_plane());
    }
}

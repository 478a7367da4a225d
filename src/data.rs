//! data — базовые типы значений: Keccak/U256, аккаунт и его бинарная упаковка.
//!
//! Формат аккаунта в data-плоскости (104 байта, фиксированный):
//! [balance 32B BE][nonce u64 LE][code_hash 32B][storage_root 32B]
//!
//! Отсутствие записи означает пустой аккаунт (Account::EMPTY).

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use hex_literal::hex;
use sha3::{Digest, Keccak256};

pub use primitive_types::{H256, U256};

/// 32-байтный keccak-дайджест (адресует и ключи, и узлы трие).
pub type Keccak = H256;

/// keccak256(""): код пустого контракта.
pub const EMPTY_CODE_HASH: Keccak = H256(hex!(
    "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
));

/// keccak256(rlp("")): корень пустого MPT.
pub const EMPTY_TRIE_ROOT: Keccak = H256(hex!(
    "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
));

/// Keccak-256 поверх произвольных байтов.
#[inline]
pub fn keccak256(data: &[u8]) -> Keccak {
    let digest = Keccak256::digest(data);
    H256::from_slice(&digest)
}

pub const ACCOUNT_ENCODED_LEN: usize = 32 + 8 + 32 + 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
    pub code_hash: Keccak,
    pub storage_root: Keccak,
}

impl Account {
    pub const EMPTY: Account = Account {
        balance: U256([0; 4]),
        nonce: 0,
        code_hash: EMPTY_CODE_HASH,
        storage_root: EMPTY_TRIE_ROOT,
    };

    /// Пустой аккаунт не хранится: запись удаляется из обеих плоскостей.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero()
            && self.nonce == 0
            && self.code_hash == EMPTY_CODE_HASH
            && self.storage_root == EMPTY_TRIE_ROOT
    }

    pub fn write_to(&self, out: &mut [u8; ACCOUNT_ENCODED_LEN]) {
        self.balance.to_big_endian(&mut out[0..32]);
        LittleEndian::write_u64(&mut out[32..40], self.nonce);
        out[40..72].copy_from_slice(self.code_hash.as_bytes());
        out[72..104].copy_from_slice(self.storage_root.as_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = [0u8; ACCOUNT_ENCODED_LEN];
        self.write_to(&mut buf);
        buf.to_vec()
    }

    pub fn read_from(raw: &[u8]) -> Result<Account> {
        if raw.len() != ACCOUNT_ENCODED_LEN {
            return Err(anyhow!(
                "account record must be {} bytes, got {}",
                ACCOUNT_ENCODED_LEN,
                raw.len()
            ));
        }
        Ok(Account {
            balance: U256::from_big_endian(&raw[0..32]),
            nonce: LittleEndian::read_u64(&raw[32..40]),
            code_hash: H256::from_slice(&raw[40..72]),
            storage_root: H256::from_slice(&raw[72..104]),
        })
    }
}

impl Default for Account {
    fn default() -> Self {
        Account::EMPTY
    }
}

/// U256 -> минимальные BE-байты (без ведущих нулей); ноль -> пусто.
pub fn u256_to_trimmed_be(v: &U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    v.to_big_endian(&mut buf);
    let skip = buf.iter().take_while(|b| **b == 0).count();
    buf[skip..].to_vec()
}

/// Обратное преобразование: пустой срез -> ноль.
pub fn u256_from_trimmed_be(raw: &[u8]) -> Result<U256> {
    if raw.len() > 32 {
        return Err(anyhow!("storage value too long: {} bytes", raw.len()));
    }
    Ok(U256::from_big_endian(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_constants_match_keccak() {
        assert_eq!(keccak256(&[]), EMPTY_CODE_HASH);
        assert_eq!(keccak256(&rlp::encode(&Vec::<u8>::new())), EMPTY_TRIE_ROOT);
    }

    #[test]
    fn account_roundtrip() {
        let acc = Account {
            balance: U256::from(123456789u64),
            nonce: 42,
            code_hash: keccak256(b"code"),
            storage_root: EMPTY_TRIE_ROOT,
        };
        let enc = acc.encode();
        assert_eq!(enc.len(), ACCOUNT_ENCODED_LEN);
        assert_eq!(Account::read_from(&enc).unwrap(), acc);
    }

    #[test]
    fn trimmed_be_roundtrip() {
        for v in [U256::zero(), U256::from(1u64), U256::from(0xDEAD_BEEFu64), U256::MAX] {
            let enc = u256_to_trimmed_be(&v);
            assert_eq!(u256_from_trimmed_be(&enc).unwrap(), v);
        }
        assert!(u256_to_trimmed_be(&U256::zero()).is_empty());
    }
}

//! merkle/node — записи узлов трие и ссылки на детей.
//!
//! Формат записи (значение под Merkle-ключом):
//! [kind u8], дальше по виду:
//! - Branch (1):    [bitmap u16 LE][flags u8][keccak 32B, если flags&1]
//! - Extension (2): [path_len u8][packed path][flags u8][keccak 32B?]
//! - Leaf (3):      [path_len u8][packed path]
//!
//! flags&1 — мемоизированный keccak узла. Структурные правки пишут запись
//! с пустым memo; проход хеширования восстанавливает его.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use rlp::RlpStream;

use crate::data::Keccak;
use crate::nibble::{pack_nibbles, NibblePath};

const TAG_BRANCH: u8 = 1;
const TAG_EXTENSION: u8 = 2;
const TAG_LEAF: u8 = 3;
const FLAG_MEMO: u8 = 1;

/// Ссылка на дочерний узел: keccak, если RLP ребёнка >= 32 байт,
/// иначе сам RLP инлайном.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeccakOrRlp {
    Keccak(Keccak),
    Rlp(Vec<u8>),
}

impl KeccakOrRlp {
    pub fn append_to(&self, stream: &mut RlpStream) {
        match self {
            KeccakOrRlp::Keccak(h) => {
                stream.append(h);
            }
            KeccakOrRlp::Rlp(raw) => {
                stream.append_raw(raw, 1);
            }
        }
    }
}

/// Узел MPT в path-keyed хранилище: пути — распакованные ниблы.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Branch { bitmap: u16, memo: Option<Keccak> },
    Extension { path: Vec<u8>, memo: Option<Keccak> },
    Leaf { path: Vec<u8> },
}

impl Node {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Node::Branch { bitmap, memo } => {
                let mut out = Vec::with_capacity(4 + 32);
                out.push(TAG_BRANCH);
                let mut b = [0u8; 2];
                LittleEndian::write_u16(&mut b, *bitmap);
                out.extend_from_slice(&b);
                push_memo(&mut out, memo);
                out
            }
            Node::Extension { path, memo } => {
                let mut out = Vec::with_capacity(2 + path.len() / 2 + 33);
                out.push(TAG_EXTENSION);
                out.push(path.len() as u8);
                out.extend_from_slice(&pack_nibbles(path));
                push_memo(&mut out, memo);
                out
            }
            Node::Leaf { path } => {
                let mut out = Vec::with_capacity(2 + path.len() / 2);
                out.push(TAG_LEAF);
                out.push(path.len() as u8);
                out.extend_from_slice(&pack_nibbles(path));
                out
            }
        }
    }

    pub fn decode(raw: &[u8]) -> Result<Node> {
        if raw.is_empty() {
            return Err(anyhow!("empty trie node record"));
        }
        match raw[0] {
            TAG_BRANCH => {
                if raw.len() < 4 {
                    return Err(anyhow!("truncated branch record: {} bytes", raw.len()));
                }
                let bitmap = LittleEndian::read_u16(&raw[1..3]);
                let memo = read_memo(&raw[3..])?;
                Ok(Node::Branch { bitmap, memo })
            }
            TAG_EXTENSION => {
                let (path, rest) = read_path(&raw[1..])?;
                let memo = read_memo(rest)?;
                Ok(Node::Extension { path, memo })
            }
            TAG_LEAF => {
                let (path, _) = read_path(&raw[1..])?;
                Ok(Node::Leaf { path })
            }
            other => Err(anyhow!("unknown trie node tag {}", other)),
        }
    }

    /// Та же структура без memo (инвалидация при правках пути).
    pub fn without_memo(&self) -> Node {
        match self {
            Node::Branch { bitmap, .. } => Node::Branch { bitmap: *bitmap, memo: None },
            Node::Extension { path, .. } => Node::Extension { path: path.clone(), memo: None },
            Node::Leaf { path } => Node::Leaf { path: path.clone() },
        }
    }
}

fn push_memo(out: &mut Vec<u8>, memo: &Option<Keccak>) {
    match memo {
        Some(h) => {
            out.push(FLAG_MEMO);
            out.extend_from_slice(h.as_bytes());
        }
        None => out.push(0),
    }
}

fn read_memo(raw: &[u8]) -> Result<Option<Keccak>> {
    if raw.is_empty() {
        return Err(anyhow!("trie node record without flags byte"));
    }
    if raw[0] & FLAG_MEMO == 0 {
        return Ok(None);
    }
    if raw.len() < 33 {
        return Err(anyhow!("trie node record with truncated memo"));
    }
    Ok(Some(Keccak::from_slice(&raw[1..33])))
}

fn read_path(raw: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    if raw.is_empty() {
        return Err(anyhow!("trie node record without path length"));
    }
    let len = raw[0] as usize;
    let bytes = (len + 1) / 2;
    if raw.len() < 1 + bytes {
        return Err(anyhow!("trie node record with truncated path"));
    }
    let path = NibblePath::new(&raw[1..1 + bytes], 0, len).to_unpacked();
    Ok((path, &raw[1 + bytes..]))
}

#[inline]
pub fn has_child(bitmap: u16, nibble: u8) -> bool {
    bitmap & (1u16 << nibble) != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::keccak256;

    #[test]
    fn roundtrip_all_kinds() {
        let nodes = [
            Node::Branch { bitmap: 0b1010_0000_0000_0001, memo: None },
            Node::Branch { bitmap: 3, memo: Some(keccak256(b"b")) },
            Node::Extension { path: vec![1, 2, 3], memo: None },
            Node::Extension { path: vec![0xF], memo: Some(keccak256(b"e")) },
            Node::Leaf { path: vec![] },
            Node::Leaf { path: vec![0, 1, 2, 3, 4, 5] },
        ];
        for n in &nodes {
            let enc = n.encode();
            assert_eq!(&Node::decode(&enc).unwrap(), n);
        }
    }

    #[test]
    fn memo_strip() {
        let n = Node::Extension { path: vec![7], memo: Some(keccak256(b"x")) };
        match n.without_memo() {
            Node::Extension { memo, .. } => assert!(memo.is_none()),
            _ => unreachable!(),
        }
    }
}

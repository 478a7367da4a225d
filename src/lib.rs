// Базовые модули
pub mod config;
pub mod consts;
pub mod data;
pub mod error;
pub mod key;
pub mod metrics;

// Ядро хранилища
pub mod cache;
pub mod db; // src/db/{mod,batch,read}.rs
pub mod lock;
pub mod nibble;
pub mod page; // src/page/{mod,root,abandoned,data,merkle}.rs
pub mod pager; // src/pager/mod.rs
pub mod slotted;
pub mod stats;

// Merkle-слой и конвейер блоков
pub mod chain; // src/chain/mod.rs
pub mod merkle; // src/merkle/{mod,node}.rs

// Удобные реэкспорты
pub use chain::{Block, Blockchain};
pub use config::PaprikaConfig;
pub use data::{keccak256, Account, Keccak, U256, EMPTY_CODE_HASH, EMPTY_TRIE_ROOT};
pub use db::{Batch, CommitOptions, PagedDb, ReadOnlyBatch};
pub use error::StoreError;
pub use metrics::{metrics_snapshot, MetricsSnapshot};

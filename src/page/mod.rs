//! page — 4 KiB страницы: буфер, заголовок, адреса и диспетчеризация типов.
//!
//! Заголовок (8 B, LE): [page_type u8][level u8][metadata u16][batch_id u32].
//! Типизированные раскладки: root.rs (корневое кольцо), abandoned.rs
//! (очереди освобождённых страниц), data.rs (account-плоскость),
//! merkle.rs (merkle-плоскость).

pub mod abandoned;
pub mod data;
pub mod merkle;
pub mod root;

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::*;

/// Индекс страницы в арене. 0 — NULL (страница 0 занята корневым кольцом).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DbAddress(u32);

impl DbAddress {
    pub const NULL: DbAddress = DbAddress(NULL_ADDRESS);

    #[inline]
    pub fn new(raw: u32) -> Self {
        DbAddress(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == NULL_ADDRESS
    }

    #[inline]
    pub fn file_offset(self) -> usize {
        self.0 as usize * PAGE_SIZE
    }
}

impl std::fmt::Display for DbAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Free = PAGE_TYPE_FREE,
    Root = PAGE_TYPE_ROOT,
    Abandoned = PAGE_TYPE_ABANDONED,
    Data = PAGE_TYPE_DATA,
    Bottom = PAGE_TYPE_BOTTOM,
    StateRoot = PAGE_TYPE_STATE_ROOT,
    FanOut = PAGE_TYPE_FAN_OUT,
    Leaf = PAGE_TYPE_LEAF,
}

impl PageType {
    pub fn from_tag(tag: u8) -> Result<PageType> {
        Ok(match tag {
            PAGE_TYPE_FREE => PageType::Free,
            PAGE_TYPE_ROOT => PageType::Root,
            PAGE_TYPE_ABANDONED => PageType::Abandoned,
            PAGE_TYPE_DATA => PageType::Data,
            PAGE_TYPE_BOTTOM => PageType::Bottom,
            PAGE_TYPE_STATE_ROOT => PageType::StateRoot,
            PAGE_TYPE_FAN_OUT => PageType::FanOut,
            PAGE_TYPE_LEAF => PageType::Leaf,
            other => return Err(anyhow!("unknown page type tag {}", other)),
        })
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Владеющий буфер одной страницы.
#[derive(Clone)]
pub struct Page(Box<[u8; PAGE_SIZE]>);

impl Page {
    pub fn zeroed() -> Page {
        Page(Box::new([0u8; PAGE_SIZE]))
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Page> {
        if raw.len() != PAGE_SIZE {
            return Err(anyhow!("page buffer must be {} bytes, got {}", PAGE_SIZE, raw.len()));
        }
        let mut p = Page::zeroed();
        p.0.copy_from_slice(raw);
        Ok(p)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }

    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }

    #[inline]
    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_tag(self.0[OFF_TYPE])
    }

    #[inline]
    pub fn level(&self) -> u8 {
        self.0[OFF_LEVEL]
    }

    #[inline]
    pub fn metadata(&self) -> u16 {
        LittleEndian::read_u16(&self.0[OFF_METADATA..OFF_METADATA + 2])
    }

    #[inline]
    pub fn batch_id(&self) -> u32 {
        LittleEndian::read_u32(&self.0[OFF_BATCH_ID..OFF_BATCH_ID + 4])
    }

    #[inline]
    pub fn set_batch_id(&mut self, batch_id: u32) {
        LittleEndian::write_u32(&mut self.0[OFF_BATCH_ID..OFF_BATCH_ID + 4], batch_id);
    }

    /// Переинициализация: тип, уровень, batch_id; тело очищается.
    pub fn reinit(&mut self, ty: PageType, level: u8, batch_id: u32) {
        self.0.fill(0);
        self.0[OFF_TYPE] = ty.tag();
        self.0[OFF_LEVEL] = level;
        self.set_batch_id(batch_id);
    }
}

/// Тип страницы из сырого среза (для read-path без копии).
#[inline]
pub fn page_type_of(raw: &[u8]) -> Result<PageType> {
    PageType::from_tag(raw[OFF_TYPE])
}

/// batch_id из сырого среза.
#[inline]
pub fn batch_id_of(raw: &[u8]) -> u32 {
    LittleEndian::read_u32(&raw[OFF_BATCH_ID..OFF_BATCH_ID + 4])
}

/// Чтение u32-ячейки массива DbAddress внутри страницы.
#[inline]
pub fn read_address(raw: &[u8], off: usize) -> DbAddress {
    DbAddress::new(LittleEndian::read_u32(&raw[off..off + 4]))
}

#[inline]
pub fn write_address(raw: &mut [u8], off: usize, addr: DbAddress) {
    LittleEndian::write_u32(&mut raw[off..off + 4], addr.raw());
}

/// Инициализация страницы данного типа: заголовок + slotted-регион.
pub fn init_typed(page: &mut Page, ty: PageType, level: u8, batch_id: u32) {
    page.reinit(ty, level, batch_id);
    let raw = page.as_bytes_mut();
    match ty {
        PageType::Data => crate::slotted::slotted_init(&mut raw[DATA_OFF_MAP..]),
        PageType::Bottom => crate::slotted::slotted_init(&mut raw[BOTTOM_OFF_MAP..]),
        PageType::StateRoot => crate::slotted::slotted_init(&mut raw[STATE_ROOT_OFF_MAP..]),
        PageType::FanOut => crate::slotted::slotted_init(&mut raw[FAN_OUT_OFF_MAP..]),
        PageType::Leaf => crate::slotted::slotted_init(&mut raw[LEAF_OFF_MAP..]),
        PageType::Free | PageType::Root | PageType::Abandoned => {}
    }
}

/// Дочерние ссылки страницы (для обхода графа и освобождения поддеревьев).
pub fn child_addresses(raw: &[u8]) -> Result<Vec<DbAddress>> {
    let (off, n) = match page_type_of(raw)? {
        PageType::Data => (DATA_OFF_BUCKETS, DATA_BUCKETS),
        PageType::FanOut => (FAN_OUT_OFF_BUCKETS, FAN_OUT_BUCKETS),
        PageType::StateRoot => (STATE_ROOT_OFF_FANOUT, STATE_ROOT_FANOUT),
        PageType::Bottom | PageType::Leaf => return Ok(Vec::new()),
        other => return Err(anyhow!("page type {:?} has no child table", other)),
    };
    let mut out = Vec::new();
    for i in 0..n {
        let addr = read_address(raw, off + i * 4);
        if !addr.is_null() {
            out.push(addr);
        }
    }
    Ok(out)
}

//! stats — обход живого графа страниц и сводная статистика.
//!
//! accept() обходит страницы, достижимые из корня (обе плоскости плюс
//! abandoned-цепочки), и отдаёт их посетителю. collect_stats строит на
//! этом сводку для CLI status/stats.

use anyhow::Result;
use serde::Serialize;

use crate::consts::*;
use crate::page::root::RootPage;
use crate::page::{self, abandoned, DbAddress, PageType};
use crate::pager::PageManager;

pub trait PageVisitor {
    fn on_page(&mut self, ty: PageType, addr: DbAddress, level: u8);
}

fn walk_tree(pm: &PageManager, addr: DbAddress, visitor: &mut dyn PageVisitor) -> Result<()> {
    let raw = pm.page(addr)?;
    let ty = page::page_type_of(raw)?;
    visitor.on_page(ty, addr, raw[OFF_LEVEL]);
    for child in page::child_addresses(raw)? {
        walk_tree(pm, child, visitor)?;
    }
    Ok(())
}

/// Обойти все страницы, достижимые из данного корня.
pub fn accept(pm: &PageManager, root: &RootPage, visitor: &mut dyn PageVisitor) -> Result<()> {
    if !root.data_page().is_null() {
        walk_tree(pm, root.data_page(), visitor)?;
    }
    if !root.merkle_page().is_null() {
        walk_tree(pm, root.merkle_page(), visitor)?;
    }
    for slot in 0..ROOT_ABANDONED_SLOTS {
        let mut cursor = root.abandoned_slot(slot);
        while !cursor.is_null() {
            let raw = pm.page(cursor)?;
            visitor.on_page(PageType::Abandoned, cursor, 0);
            cursor = abandoned::next_page(raw);
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DbStats {
    pub batch_id: u32,
    pub block_number: u32,
    pub history_depth: u32,
    pub max_page: u32,
    pub next_free_page: u32,
    pub data_pages: u64,
    pub bottom_pages: u64,
    pub state_root_pages: u64,
    pub fan_out_pages: u64,
    pub leaf_pages: u64,
    pub abandoned_pages: u64,
    pub reachable_pages: u64,
}

impl DbStats {
    /// Доля занятых страниц арены (включая кольцо корней).
    pub fn used_ratio(&self) -> f64 {
        if self.max_page == 0 {
            return 0.0;
        }
        self.next_free_page as f64 / self.max_page as f64
    }
}

struct StatsVisitor {
    stats: DbStats,
}

impl PageVisitor for StatsVisitor {
    fn on_page(&mut self, ty: PageType, _addr: DbAddress, _level: u8) {
        self.stats.reachable_pages += 1;
        match ty {
            PageType::Data => self.stats.data_pages += 1,
            PageType::Bottom => self.stats.bottom_pages += 1,
            PageType::StateRoot => self.stats.state_root_pages += 1,
            PageType::FanOut => self.stats.fan_out_pages += 1,
            PageType::Leaf => self.stats.leaf_pages += 1,
            PageType::Abandoned => self.stats.abandoned_pages += 1,
            PageType::Free | PageType::Root => {}
        }
    }
}

pub fn collect_stats(pm: &PageManager, root: &RootPage) -> Result<DbStats> {
    let mut visitor = StatsVisitor {
        stats: DbStats {
            batch_id: root.batch_id(),
            block_number: root.block_number(),
            history_depth: root.history_depth(),
            max_page: pm.max_page(),
            next_free_page: root.next_free_page(),
            ..DbStats::default()
        },
    };
    accept(pm, root, &mut visitor)?;
    Ok(visitor.stats)
}

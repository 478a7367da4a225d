//! abandoned — страница-очередь освобождённых адресов.
//!
//! Тело: [abandoned_at_batch u32][next u32][count u16][pad u16]
//! [entries u32 x ABANDONED_CAPACITY].
//!
//! Страницы, зарегистрированные на переиспользование в батче N, живут в
//! цепочке таких страниц (через next), голова которой лежит в abandoned-
//! слоте корневой страницы. Переиспользование разрешено только когда
//! abandoned_at_batch < min_reusable_batch_id текущего батча.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::*;
use crate::page::{DbAddress, Page, PageType};

#[inline]
pub fn abandoned_at(raw: &[u8]) -> u32 {
    LittleEndian::read_u32(&raw[ABND_OFF_BATCH..ABND_OFF_BATCH + 4])
}

#[inline]
pub fn next_page(raw: &[u8]) -> DbAddress {
    super::read_address(raw, ABND_OFF_NEXT)
}

#[inline]
pub fn entry_count(raw: &[u8]) -> usize {
    LittleEndian::read_u16(&raw[ABND_OFF_COUNT..ABND_OFF_COUNT + 2]) as usize
}

#[inline]
pub fn entry_at(raw: &[u8], i: usize) -> DbAddress {
    super::read_address(raw, ABND_OFF_ENTRIES + i * 4)
}

pub fn entries(raw: &[u8]) -> Vec<DbAddress> {
    let n = entry_count(raw).min(ABANDONED_CAPACITY);
    (0..n).map(|i| entry_at(raw, i)).collect()
}

/// Инициализировать пустую очередь, зафиксировав батч освобождения.
pub fn abandoned_init(page: &mut Page, batch_id: u32, abandoned_at_batch: u32) {
    page.reinit(PageType::Abandoned, 0, batch_id);
    let raw = page.as_bytes_mut();
    LittleEndian::write_u32(&mut raw[ABND_OFF_BATCH..ABND_OFF_BATCH + 4], abandoned_at_batch);
}

pub fn set_next_page(page: &mut Page, next: DbAddress) {
    super::write_address(page.as_bytes_mut(), ABND_OFF_NEXT, next);
}

/// Добавить адрес; false — страница полна (нужна следующая в цепочке).
pub fn try_enqueue(page: &mut Page, addr: DbAddress) -> bool {
    let n = entry_count(page.as_bytes());
    if n >= ABANDONED_CAPACITY {
        return false;
    }
    let raw = page.as_bytes_mut();
    super::write_address(raw, ABND_OFF_ENTRIES + n * 4, addr);
    LittleEndian::write_u16(&mut raw[ABND_OFF_COUNT..ABND_OFF_COUNT + 2], (n + 1) as u16);
    true
}

/// Снять последний адрес; None — очередь пуста.
pub fn try_dequeue(page: &mut Page) -> Option<DbAddress> {
    let n = entry_count(page.as_bytes());
    if n == 0 {
        return None;
    }
    let addr = entry_at(page.as_bytes(), n - 1);
    let raw = page.as_bytes_mut();
    LittleEndian::write_u16(&mut raw[ABND_OFF_COUNT..ABND_OFF_COUNT + 2], (n - 1) as u16);
    Some(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_dequeue() {
        let mut page = Page::zeroed();
        abandoned_init(&mut page, 10, 9);
        assert_eq!(abandoned_at(page.as_bytes()), 9);
        assert!(next_page(page.as_bytes()).is_null());

        for i in 1..=5u32 {
            assert!(try_enqueue(&mut page, DbAddress::new(100 + i)));
        }
        assert_eq!(entry_count(page.as_bytes()), 5);
        assert_eq!(try_dequeue(&mut page), Some(DbAddress::new(105)));
        assert_eq!(entry_count(page.as_bytes()), 4);
        assert_eq!(entries(page.as_bytes()).len(), 4);
    }

    #[test]
    fn capacity_bound() {
        let mut page = Page::zeroed();
        abandoned_init(&mut page, 1, 0);
        for i in 0..ABANDONED_CAPACITY as u32 {
            assert!(try_enqueue(&mut page, DbAddress::new(i + 1)));
        }
        assert!(!try_enqueue(&mut page, DbAddress::new(0xFFFF)));
    }
}

//! root — корневая страница кольца истории.
//!
//! Тело (после заголовка): block_number, state_root, next_free_page,
//! data_page (корень account-плоскости), merkle_page (корень merkle-
//! плоскости), crc32c по payload'у и массив abandoned-слотов (головы
//! цепочек AbandonedPage, по слоту на недавний батч).
//!
//! CRC покрывает всё тело, кроме самого поля CRC. Невалидный CRC на
//! открытии означает, что слот кольца не дописан (например, crash при
//! FlushDataOnly) — такой корень пропускается в пользу предыдущего
//! долговечного.

use byteorder::{ByteOrder, LittleEndian};

use crate::consts::*;
use crate::data::Keccak;
use crate::page::{DbAddress, Page, PageType};

pub struct RootPage(Page);

impl RootPage {
    pub fn wrap(page: Page) -> RootPage {
        RootPage(page)
    }

    pub fn new_initial(history_depth: u32) -> RootPage {
        let mut page = Page::zeroed();
        page.reinit(PageType::Root, 0, 0);
        let mut root = RootPage(page);
        // первые history_depth страниц заняты кольцом
        root.set_history_depth(history_depth);
        root.set_next_free_page(history_depth);
        root.set_state_root(&crate::data::EMPTY_TRIE_ROOT);
        root.update_crc();
        root
    }

    #[inline]
    pub fn history_depth(&self) -> u32 {
        LittleEndian::read_u32(
            &self.0.as_bytes()[ROOT_OFF_HISTORY_DEPTH..ROOT_OFF_HISTORY_DEPTH + 4],
        )
    }

    #[inline]
    pub fn set_history_depth(&mut self, depth: u32) {
        LittleEndian::write_u32(
            &mut self.0.as_bytes_mut()[ROOT_OFF_HISTORY_DEPTH..ROOT_OFF_HISTORY_DEPTH + 4],
            depth,
        );
    }

    #[inline]
    pub fn page(&self) -> &Page {
        &self.0
    }

    #[inline]
    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.0
    }

    pub fn into_page(self) -> Page {
        self.0
    }

    #[inline]
    pub fn batch_id(&self) -> u32 {
        self.0.batch_id()
    }

    #[inline]
    pub fn set_batch_id(&mut self, id: u32) {
        self.0.set_batch_id(id);
    }

    #[inline]
    pub fn block_number(&self) -> u32 {
        LittleEndian::read_u32(&self.0.as_bytes()[ROOT_OFF_BLOCK_NUMBER..ROOT_OFF_BLOCK_NUMBER + 4])
    }

    #[inline]
    pub fn set_block_number(&mut self, n: u32) {
        LittleEndian::write_u32(
            &mut self.0.as_bytes_mut()[ROOT_OFF_BLOCK_NUMBER..ROOT_OFF_BLOCK_NUMBER + 4],
            n,
        );
    }

    pub fn state_root(&self) -> Keccak {
        Keccak::from_slice(&self.0.as_bytes()[ROOT_OFF_STATE_ROOT..ROOT_OFF_STATE_ROOT + 32])
    }

    pub fn set_state_root(&mut self, hash: &Keccak) {
        self.0.as_bytes_mut()[ROOT_OFF_STATE_ROOT..ROOT_OFF_STATE_ROOT + 32]
            .copy_from_slice(hash.as_bytes());
    }

    #[inline]
    pub fn next_free_page(&self) -> u32 {
        LittleEndian::read_u32(&self.0.as_bytes()[ROOT_OFF_NEXT_FREE..ROOT_OFF_NEXT_FREE + 4])
    }

    #[inline]
    pub fn set_next_free_page(&mut self, n: u32) {
        LittleEndian::write_u32(&mut self.0.as_bytes_mut()[ROOT_OFF_NEXT_FREE..ROOT_OFF_NEXT_FREE + 4], n);
    }

    #[inline]
    pub fn data_page(&self) -> DbAddress {
        super::read_address(self.0.as_bytes(), ROOT_OFF_DATA_PAGE)
    }

    #[inline]
    pub fn set_data_page(&mut self, addr: DbAddress) {
        super::write_address(self.0.as_bytes_mut(), ROOT_OFF_DATA_PAGE, addr);
    }

    #[inline]
    pub fn merkle_page(&self) -> DbAddress {
        super::read_address(self.0.as_bytes(), ROOT_OFF_MERKLE_PAGE)
    }

    #[inline]
    pub fn set_merkle_page(&mut self, addr: DbAddress) {
        super::write_address(self.0.as_bytes_mut(), ROOT_OFF_MERKLE_PAGE, addr);
    }

    #[inline]
    pub fn abandoned_slot(&self, i: usize) -> DbAddress {
        debug_assert!(i < ROOT_ABANDONED_SLOTS);
        super::read_address(self.0.as_bytes(), ROOT_OFF_ABANDONED + i * 4)
    }

    #[inline]
    pub fn set_abandoned_slot(&mut self, i: usize, addr: DbAddress) {
        debug_assert!(i < ROOT_ABANDONED_SLOTS);
        super::write_address(self.0.as_bytes_mut(), ROOT_OFF_ABANDONED + i * 4, addr);
    }

    /// Первый пустой abandoned-слот.
    pub fn free_abandoned_slot(&self) -> Option<usize> {
        (0..ROOT_ABANDONED_SLOTS).find(|&i| self.abandoned_slot(i).is_null())
    }

    fn crc_compute(&self) -> u32 {
        let raw = self.0.as_bytes();
        let mut crc = crc32c::crc32c(&raw[PAGE_HDR_SIZE..ROOT_OFF_CRC]);
        crc = crc32c::crc32c_append(crc, &raw[ROOT_OFF_ABANDONED..]);
        crc
    }

    pub fn update_crc(&mut self) {
        let crc = self.crc_compute();
        LittleEndian::write_u32(&mut self.0.as_bytes_mut()[ROOT_OFF_CRC..ROOT_OFF_CRC + 4], crc);
    }

    pub fn crc_valid(&self) -> bool {
        let stored = LittleEndian::read_u32(&self.0.as_bytes()[ROOT_OFF_CRC..ROOT_OFF_CRC + 4]);
        stored == self.crc_compute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::keccak256;

    #[test]
    fn roundtrip_fields_and_crc() {
        let mut root = RootPage::new_initial(2);
        assert!(root.crc_valid());
        assert_eq!(root.next_free_page(), 2);
        assert!(root.data_page().is_null());

        root.set_block_number(7);
        root.set_state_root(&keccak256(b"root"));
        root.set_data_page(DbAddress::new(5));
        root.set_abandoned_slot(3, DbAddress::new(9));
        assert!(!root.crc_valid());
        root.update_crc();
        assert!(root.crc_valid());

        assert_eq!(root.block_number(), 7);
        assert_eq!(root.state_root(), keccak256(b"root"));
        assert_eq!(root.data_page(), DbAddress::new(5));
        assert_eq!(root.abandoned_slot(3), DbAddress::new(9));
        assert_eq!(root.free_abandoned_slot(), Some(0));
    }
}

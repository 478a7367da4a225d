//! data — account-плоскость: DataPage и BottomPage.
//!
//! DataPage: 16 дочерних бакетов по первому ниблу остаточного пути +
//! сквозная slotted-карта для записей, чей бакет ещё не материализован.
//! Переполнение карты выселяет самый тяжёлый бакет в новую дочернюю
//! страницу (push down) и повторяет попытку.
//!
//! BottomPage: плоская slotted-карта без бакетов. Плотные и разреженные
//! регионы трие остаются компактными в одной странице; при переполнении
//! BottomPage повышается на месте до DataPage с перераспределением записей.
//!
//! Все мутирующие операции идут через CoW батча и возвращают актуальный
//! (возможно новый) адрес страницы — родитель перезаписывает свой бакет.

use anyhow::{anyhow, Result};

use crate::consts::*;
use crate::db::batch::Batch;
use crate::db::{PageSource, PageView};
use crate::nibble::NibblePath;
use crate::page::{self, DbAddress, Page, PageType};
use crate::slotted::*;

#[inline]
fn map(page: &Page) -> &[u8] {
    &page.as_bytes()[DATA_OFF_MAP..]
}

#[inline]
fn map_mut(page: &mut Page) -> &mut [u8] {
    &mut page.as_bytes_mut()[DATA_OFF_MAP..]
}

#[inline]
fn bucket(page: &Page, i: usize) -> DbAddress {
    page::read_address(page.as_bytes(), DATA_OFF_BUCKETS + i * 4)
}

#[inline]
fn set_bucket(page: &mut Page, i: usize, addr: DbAddress) {
    page::write_address(page.as_bytes_mut(), DATA_OFF_BUCKETS + i * 4, addr);
}

/// Чтение. addr не должен быть NULL.
pub fn data_get<S: PageSource>(
    src: &S,
    addr: DbAddress,
    path: &NibblePath<'_>,
) -> Result<Option<Vec<u8>>> {
    let view: PageView<'_> = src.view(addr)?;
    let raw = view.as_ref();
    match page::page_type_of(raw)? {
        PageType::Bottom => {
            Ok(slotted_get(&raw[BOTTOM_OFF_MAP..], &path.encode()).map(|v| v.to_vec()))
        }
        PageType::Data => {
            if !path.is_empty() {
                let child =
                    page::read_address(raw, DATA_OFF_BUCKETS + path.first_nibble() as usize * 4);
                if !child.is_null() {
                    let rest = path.slice_from(1);
                    return data_get(src, child, &rest);
                }
            }
            Ok(slotted_get(&raw[DATA_OFF_MAP..], &path.encode()).map(|v| v.to_vec()))
        }
        other => Err(anyhow!("data plane read hit a {:?} page at {}", other, addr)),
    }
}

/// Запись. NULL-адрес создаёт BottomPage указанного уровня.
pub fn data_set(
    batch: &mut Batch,
    addr: DbAddress,
    level: u8,
    path: &NibblePath<'_>,
    value: &[u8],
) -> Result<DbAddress> {
    let mut addr = addr;
    batch.ensure_writable_exists(&mut addr, PageType::Bottom, level)?;
    let mut page = batch.take_writable(addr)?;
    let res = match page.page_type()? {
        PageType::Bottom => bottom_set(batch, &mut page, path, value),
        PageType::Data => data_page_set(batch, &mut page, path, value),
        other => Err(anyhow!("data plane write hit a {:?} page at {}", other, addr)),
    };
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}

fn bottom_set(
    batch: &mut Batch,
    page: &mut Page,
    path: &NibblePath<'_>,
    value: &[u8],
) -> Result<()> {
    if slotted_set(&mut page.as_bytes_mut()[BOTTOM_OFF_MAP..], &path.encode(), value) {
        return Ok(());
    }
    promote_bottom(batch, page)?;
    data_page_set(batch, page, path, value)
}

/// Повышение BottomPage до DataPage на месте: записи перераспределяются
/// через обычный data-путь (может породить дочерние страницы).
fn promote_bottom(batch: &mut Batch, page: &mut Page) -> Result<()> {
    let level = page.level();
    let entries = slotted_enumerate(&page.as_bytes()[BOTTOM_OFF_MAP..]);
    page::init_typed(page, PageType::Data, level, batch.batch_id());
    for (k, v) in entries {
        let path = NibblePath::from_encoded(&k)?;
        data_page_set(batch, page, &path, &v)?;
    }
    Ok(())
}

fn data_page_set(
    batch: &mut Batch,
    page: &mut Page,
    path: &NibblePath<'_>,
    value: &[u8],
) -> Result<()> {
    if path.is_empty() {
        if slotted_set(map_mut(page), &path.encode(), value) {
            return Ok(());
        }
        return Err(anyhow!("data page: empty-path entry does not fit"));
    }

    let mut spills = 0usize;
    loop {
        let nib = path.first_nibble() as usize;
        let child = bucket(page, nib);
        if !child.is_null() {
            let level = page.level();
            let rest = path.slice_from(1);
            let new_child = data_set(batch, child, level + 1, &rest, value)?;
            set_bucket(page, nib, new_child);
            return Ok(());
        }
        if slotted_set(map_mut(page), &path.encode(), value) {
            return Ok(());
        }

        // карта полна: материализуем самый тяжёлый бакет
        let level = page.level();
        let child_addr = batch.get_new_page(PageType::Bottom, level + 1)?;
        let mut child = batch.take_writable(child_addr)?;
        let moved = slotted_push_down_biggest_bucket(
            map_mut(page),
            &mut child.as_bytes_mut()[BOTTOM_OFF_MAP..],
        );
        batch.put_page(child_addr, child);
        let moved = match moved {
            Ok(n) => n,
            Err(e) => {
                batch.release_page(child_addr);
                return Err(e);
            }
        };
        set_bucket(page, moved as usize, child_addr);

        spills += 1;
        if spills > DATA_BUCKETS {
            return Err(anyhow!("data page overflow: entry does not fit after push-down"));
        }
    }
}

/// Удаление одного ключа. Пустые дочерние страницы не схлопываются —
/// место возвращается на уровне abandoned-страниц.
pub fn data_delete(batch: &mut Batch, addr: DbAddress, path: &NibblePath<'_>) -> Result<DbAddress> {
    if addr.is_null() {
        return Ok(addr);
    }
    let addr = batch.ensure_writable(addr)?;
    let mut page = batch.take_writable(addr)?;
    let res = (|| -> Result<()> {
        match page.page_type()? {
            PageType::Bottom => {
                slotted_delete(&mut page.as_bytes_mut()[BOTTOM_OFF_MAP..], &path.encode());
                Ok(())
            }
            PageType::Data => {
                if !path.is_empty() {
                    let nib = path.first_nibble() as usize;
                    let child = bucket(&page, nib);
                    if !child.is_null() {
                        let rest = path.slice_from(1);
                        let new_child = data_delete(batch, child, &rest)?;
                        set_bucket(&mut page, nib, new_child);
                        return Ok(());
                    }
                }
                slotted_delete(map_mut(&mut page), &path.encode());
                Ok(())
            }
            other => Err(anyhow!("data plane delete hit a {:?} page at {}", other, addr)),
        }
    })();
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}

/// Удаление по префиксу: карта чистится фильтром, спуск — только в бакет
/// первого нибла префикса. Исчерпанный префикс стирает всё поддерево.
pub fn data_delete_by_prefix(
    batch: &mut Batch,
    addr: DbAddress,
    prefix: &NibblePath<'_>,
) -> Result<DbAddress> {
    if addr.is_null() {
        return Ok(addr);
    }
    let addr = batch.ensure_writable(addr)?;
    let mut page = batch.take_writable(addr)?;
    let res = (|| -> Result<()> {
        match page.page_type()? {
            PageType::Bottom => {
                slotted_delete_by_prefix(&mut page.as_bytes_mut()[BOTTOM_OFF_MAP..], prefix);
                Ok(())
            }
            PageType::Data => {
                if prefix.is_empty() {
                    for i in 0..DATA_BUCKETS {
                        let child = bucket(&page, i);
                        if !child.is_null() {
                            batch.free_subtree(child)?;
                            set_bucket(&mut page, i, DbAddress::NULL);
                        }
                    }
                    slotted_init(map_mut(&mut page));
                    return Ok(());
                }
                slotted_delete_by_prefix(map_mut(&mut page), prefix);
                let nib = prefix.first_nibble() as usize;
                let child = bucket(&page, nib);
                if !child.is_null() {
                    let rest = prefix.slice_from(1);
                    let new_child = data_delete_by_prefix(batch, child, &rest)?;
                    set_bucket(&mut page, nib, new_child);
                }
                Ok(())
            }
            other => Err(anyhow!("data plane prefix delete hit a {:?} page at {}", other, addr)),
        }
    })();
    batch.put_page(addr, page);
    res?;
    Ok(addr)
}

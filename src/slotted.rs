//! slotted — карта «ключ → байты» внутри региона страницы.
//!
//! Формат региона (LE):
//! - Header (6 B): [count u16][dead_bytes u16][payload_tail u16]
//! - Слоты (4 B): [fingerprint u16][offset u16], растут вверх от заголовка.
//!   offset == 0xFFFF — tombstone.
//! - Payload: записи [key_len u8][key ...][value_len u16][value ...],
//!   растут вниз от конца региона; payload_tail — начало нижней записи.
//!
//! Ключи — кодированные нибловые пути ([len u8][packed], см. nibble.rs).
//! Tombstone-слоты и мёртвые payload-байты лениво убираются компактацией,
//! когда вставка не помещается.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::hash::Hasher;

use crate::nibble::NibblePath;

pub const SLOTTED_HDR: usize = 6;
const HDR_OFF_COUNT: usize = 0;
const HDR_OFF_DEAD: usize = 2;
const HDR_OFF_TAIL: usize = 4;
const SLOT_SIZE: usize = 4;
const TOMBSTONE: u16 = 0xFFFF;

/// 16-битный отпечаток ключа (xxhash64, seed 0).
#[inline]
fn fingerprint(key: &[u8]) -> u16 {
    let mut h = twox_hash::XxHash64::with_seed(0);
    h.write(key);
    let v = h.finish();
    (v ^ (v >> 16) ^ (v >> 32)) as u16
}

#[inline]
fn record_size(key: &[u8], value: &[u8]) -> usize {
    1 + key.len() + 2 + value.len()
}

#[inline]
fn read_u16(buf: &[u8], off: usize) -> u16 {
    LittleEndian::read_u16(&buf[off..off + 2])
}

#[inline]
fn write_u16(buf: &mut [u8], off: usize, v: u16) {
    LittleEndian::write_u16(&mut buf[off..off + 2], v);
}

#[inline]
fn slot(buf: &[u8], idx: usize) -> (u16, u16) {
    let off = SLOTTED_HDR + idx * SLOT_SIZE;
    (read_u16(buf, off), read_u16(buf, off + 2))
}

#[inline]
fn write_slot(buf: &mut [u8], idx: usize, fp: u16, off: u16) {
    let o = SLOTTED_HDR + idx * SLOT_SIZE;
    write_u16(buf, o, fp);
    write_u16(buf, o + 2, off);
}

/// Запись по абсолютному смещению региона: (key, value).
fn read_record(buf: &[u8], off: usize) -> Option<(&[u8], &[u8])> {
    if off + 1 > buf.len() {
        return None;
    }
    let klen = buf[off] as usize;
    let voff = off + 1 + klen;
    if voff + 2 > buf.len() {
        return None;
    }
    let vlen = read_u16(buf, voff) as usize;
    let end = voff + 2 + vlen;
    if end > buf.len() {
        return None;
    }
    Some((&buf[off + 1..off + 1 + klen], &buf[voff + 2..end]))
}

/// Инициализировать пустой регион.
pub fn slotted_init(buf: &mut [u8]) {
    debug_assert!(buf.len() > SLOTTED_HDR && buf.len() <= TOMBSTONE as usize);
    write_u16(buf, HDR_OFF_COUNT, 0);
    write_u16(buf, HDR_OFF_DEAD, 0);
    write_u16(buf, HDR_OFF_TAIL, buf.len() as u16);
}

/// Число живых записей.
pub fn slotted_live_count(buf: &[u8]) -> usize {
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    (0..count).filter(|&i| slot(buf, i).1 != TOMBSTONE).count()
}

/// Свободные байты без учёта компактации.
pub fn slotted_free_bytes(buf: &[u8]) -> usize {
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    let tail = read_u16(buf, HDR_OFF_TAIL) as usize;
    tail.saturating_sub(SLOTTED_HDR + count * SLOT_SIZE)
}

/// Найти слот живого ключа.
fn find_slot(buf: &[u8], fp: u16, key: &[u8]) -> Option<usize> {
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    for i in 0..count {
        let (sfp, soff) = slot(buf, i);
        if soff == TOMBSTONE || sfp != fp {
            continue;
        }
        if let Some((k, _)) = read_record(buf, soff as usize) {
            if k == key {
                return Some(i);
            }
        }
    }
    None
}

pub fn slotted_get<'a>(buf: &'a [u8], key: &[u8]) -> Option<&'a [u8]> {
    let idx = find_slot(buf, fingerprint(key), key)?;
    let (_, off) = slot(buf, idx);
    read_record(buf, off as usize).map(|(_, v)| v)
}

/// Полная перепаковка региона: живые пары переносятся в чистый буфер.
pub fn slotted_compact(buf: &mut [u8]) {
    let live = slotted_enumerate(buf);
    let mut scratch = vec![0u8; buf.len()];
    slotted_init(&mut scratch);
    for (k, v) in &live {
        // живые данные всегда помещаются обратно
        let ok = raw_insert(&mut scratch, k, v);
        debug_assert!(ok);
    }
    buf.copy_from_slice(&scratch);
    crate::metrics::record_slotted_compaction();
}

/// Вставка без поиска существующего ключа (для компактации/пушдауна).
fn raw_insert(buf: &mut [u8], key: &[u8], value: &[u8]) -> bool {
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    let tail = read_u16(buf, HDR_OFF_TAIL) as usize;
    let rec = record_size(key, value);
    let slots_end = SLOTTED_HDR + (count + 1) * SLOT_SIZE;
    if tail < rec || tail - rec < slots_end {
        return false;
    }
    let off = tail - rec;
    buf[off] = key.len() as u8;
    buf[off + 1..off + 1 + key.len()].copy_from_slice(key);
    write_u16(buf, off + 1 + key.len(), value.len() as u16);
    buf[off + 1 + key.len() + 2..off + rec].copy_from_slice(value);
    write_slot(buf, count, fingerprint(key), off as u16);
    write_u16(buf, HDR_OFF_COUNT, (count + 1) as u16);
    write_u16(buf, HDR_OFF_TAIL, off as u16);
    true
}

fn try_set_inner(buf: &mut [u8], key: &[u8], value: &[u8], allow_compact: bool) -> bool {
    let fp = fingerprint(key);
    let rec = record_size(key, value);

    if let Some(idx) = find_slot(buf, fp, key) {
        let (_, old_off) = slot(buf, idx);
        let old_size = read_record(buf, old_off as usize)
            .map(|(k, v)| record_size(k, v))
            .unwrap_or(0);
        let count = read_u16(buf, HDR_OFF_COUNT) as usize;
        let tail = read_u16(buf, HDR_OFF_TAIL) as usize;
        let slots_end = SLOTTED_HDR + count * SLOT_SIZE;
        if tail < rec || tail - rec < slots_end {
            if allow_compact {
                // старую версию ключа выкидываем до перепаковки
                mark_dead(buf, idx, old_size);
                slotted_compact(buf);
                return try_set_inner(buf, key, value, false);
            }
            return false;
        }
        let off = tail - rec;
        buf[off] = key.len() as u8;
        buf[off + 1..off + 1 + key.len()].copy_from_slice(key);
        write_u16(buf, off + 1 + key.len(), value.len() as u16);
        buf[off + 1 + key.len() + 2..off + rec].copy_from_slice(value);
        write_slot(buf, idx, fp, off as u16);
        write_u16(buf, HDR_OFF_TAIL, off as u16);
        let dead = read_u16(buf, HDR_OFF_DEAD) as usize + old_size;
        write_u16(buf, HDR_OFF_DEAD, dead.min(u16::MAX as usize) as u16);
        return true;
    }

    if raw_insert(buf, key, value) {
        return true;
    }
    if allow_compact && read_u16(buf, HDR_OFF_DEAD) != 0 {
        slotted_compact(buf);
        return try_set_inner(buf, key, value, false);
    }
    false
}

/// Вставка/обновление. false — не помещается даже после компактации.
pub fn slotted_set(buf: &mut [u8], key: &[u8], value: &[u8]) -> bool {
    debug_assert!(key.len() <= u8::MAX as usize);
    try_set_inner(buf, key, value, true)
}

#[inline]
fn mark_dead(buf: &mut [u8], idx: usize, rec_size: usize) {
    let o = SLOTTED_HDR + idx * SLOT_SIZE;
    write_u16(buf, o + 2, TOMBSTONE);
    let dead = read_u16(buf, HDR_OFF_DEAD) as usize + rec_size;
    write_u16(buf, HDR_OFF_DEAD, dead.min(u16::MAX as usize) as u16);
}

/// Удаление (tombstone). false — ключа не было.
pub fn slotted_delete(buf: &mut [u8], key: &[u8]) -> bool {
    match find_slot(buf, fingerprint(key), key) {
        Some(idx) => {
            let (_, off) = slot(buf, idx);
            let size = read_record(buf, off as usize)
                .map(|(k, v)| record_size(k, v))
                .unwrap_or(0);
            mark_dead(buf, idx, size);
            true
        }
        None => false,
    }
}

/// Tombstone всем записям, чей путь начинается с prefix. Возвращает число удалённых.
pub fn slotted_delete_by_prefix(buf: &mut [u8], prefix: &NibblePath<'_>) -> usize {
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    let mut removed = 0usize;
    for i in 0..count {
        let (_, off) = slot(buf, i);
        if off == TOMBSTONE {
            continue;
        }
        let matched = match read_record(buf, off as usize) {
            Some((k, v)) => match NibblePath::from_encoded(k) {
                Ok(path) => path.starts_with(prefix).then(|| record_size(k, v)),
                Err(_) => None,
            },
            None => None,
        };
        if let Some(size) = matched {
            mark_dead(buf, i, size);
            removed += 1;
        }
    }
    removed
}

/// Все живые пары (ключ — кодированный нибловый путь). Порядок не специфицирован,
/// но стабилен до следующей мутации.
pub fn slotted_enumerate(buf: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let (_, off) = slot(buf, i);
        if off == TOMBSTONE {
            continue;
        }
        if let Some((k, v)) = read_record(buf, off as usize) {
            out.push((k.to_vec(), v.to_vec()));
        }
    }
    out
}

/// Живой payload по первым ниблам ключей (записи с пустым путём не участвуют).
pub fn slotted_bucket_sizes(buf: &[u8]) -> [usize; 16] {
    let mut sizes = [0usize; 16];
    let count = read_u16(buf, HDR_OFF_COUNT) as usize;
    for i in 0..count {
        let (_, off) = slot(buf, i);
        if off == TOMBSTONE {
            continue;
        }
        if let Some((k, v)) = read_record(buf, off as usize) {
            if let Ok(path) = NibblePath::from_encoded(k) {
                if !path.is_empty() {
                    sizes[path.first_nibble() as usize] += record_size(k, v);
                }
            }
        }
    }
    sizes
}

/// Выселить самый тяжёлый нибл-бакет в target (ключи укорачиваются на нибл).
/// Возвращает выбранный нибл. При равенстве выигрывает младший нибл.
pub fn slotted_push_down_biggest_bucket(buf: &mut [u8], target: &mut [u8]) -> Result<u8> {
    let sizes = slotted_bucket_sizes(buf);
    let (nibble, size) = sizes
        .iter()
        .enumerate()
        .max_by_key(|(i, s)| (**s, 15 - *i))
        .map(|(i, s)| (i as u8, *s))
        .unwrap_or((0, 0));
    if size == 0 {
        return Err(anyhow!("push down: no bucketed entries in page map"));
    }

    for (k, v) in slotted_enumerate(buf) {
        let path = NibblePath::from_encoded(&k)?;
        if path.is_empty() || path.first_nibble() != nibble {
            continue;
        }
        let short = path.slice_from(1).encode();
        if !slotted_set(target, &short, &v) {
            return Err(anyhow!("push down: target map overflow"));
        }
        slotted_delete(buf, &k);
    }
    slotted_compact(buf);
    Ok(nibble)
}

//! cache — бюджетированный кэш merkle-записей на время батча.
//!
//! Прочитанные и перезаписанные узлы трие запрашиваются повторно на каждом
//! проходе pre-commit; кэш амортизирует эти обходы. Политика простая:
//! пока байтовый бюджет не исчерпан — принимаем записи, дальше новые ключи
//! не кэшируются (уже принятые продолжают обновляться). Живёт один батч.

use std::collections::HashMap;

use crate::metrics::{record_cache_hit, record_cache_miss};

/// Значение None = достоверно отсутствующий ключ.
pub struct CacheBudget {
    map: HashMap<Vec<u8>, Option<Vec<u8>>>,
    used: usize,
    budget: usize,
}

impl CacheBudget {
    pub fn new(budget_bytes: usize) -> CacheBudget {
        CacheBudget { map: HashMap::new(), used: 0, budget: budget_bytes }
    }

    /// Some(...) — кэш знает ответ (в т.ч. "ключа нет"); None — промах.
    pub fn get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
        match self.map.get(key) {
            Some(v) => {
                record_cache_hit();
                Some(v.clone())
            }
            None => {
                record_cache_miss();
                None
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: Option<&[u8]>) {
        let add = key.len() + value.map(|v| v.len()).unwrap_or(0);
        if let Some(slot) = self.map.get_mut(key) {
            self.used = self.used.saturating_sub(slot.as_ref().map(|v| v.len()).unwrap_or(0));
            self.used += value.map(|v| v.len()).unwrap_or(0);
            *slot = value.map(|v| v.to_vec());
            return;
        }
        if self.budget == 0 || self.used + add > self.budget {
            return;
        }
        self.used += add;
        self.map.insert(key.to_vec(), value.map(|v| v.to_vec()));
    }

    pub fn invalidate(&mut self, key: &[u8]) {
        if let Some(v) = self.map.remove(key) {
            self.used = self.used.saturating_sub(key.len() + v.map(|v| v.len()).unwrap_or(0));
        }
    }

    /// Выкинуть все ключи с данным префиксом (очистка storage-поддерева).
    pub fn invalidate_prefix(&mut self, prefix: &[u8]) {
        let mut freed = 0usize;
        self.map.retain(|k, v| {
            if k.starts_with(prefix) {
                freed += k.len() + v.as_ref().map(|v| v.len()).unwrap_or(0);
                false
            } else {
                true
            }
        });
        self.used = self.used.saturating_sub(freed);
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used
    }
}

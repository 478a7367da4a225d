//! error — классификация ошибок хранилища.
//!
//! Всё поднимается через anyhow; логические (восстановимые) виды ошибок
//! оборачиваются в StoreError, чтобы вызывающий код мог распознать их
//! через downcast_ref. Коррупция и I/O-ошибки идут обычными anyhow-
//! ошибками и должны останавливать запись.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// next_free_page упёрся в max_page, а пул переиспользования пуст
    /// или ещё в карантине истории.
    OutOfSpace,
    /// Чтение за пределами арены: признак коррупции.
    InvalidAddress(u32),
    /// begin_batch при уже активном батче записи; восстановимо.
    ConcurrentWriter,
    /// reorganize_back_to не нашёл корень в окне истории; восстановимо.
    SnapshotMissing,
    /// Использование батча после освобождения; ошибка программирования.
    UseAfterDispose,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::OutOfSpace => write!(f, "page arena exhausted and reuse pool is empty"),
            StoreError::InvalidAddress(a) => write!(f, "page address {} is outside the arena", a),
            StoreError::ConcurrentWriter => write!(f, "another write batch is already active"),
            StoreError::SnapshotMissing => {
                write!(f, "requested state root is not within the retained history")
            }
            StoreError::UseAfterDispose => write!(f, "batch used after dispose"),
        }
    }
}

impl std::error::Error for StoreError {}

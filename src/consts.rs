// Страницы
pub const PAGE_SIZE: usize = 4096;

// Заголовок страницы (первые 8 байт каждой страницы, LE):
// [page_type u8][level u8][metadata u16][batch_id u32]
pub const PAGE_HDR_SIZE: usize = 8;

pub const OFF_TYPE: usize = 0;
pub const OFF_LEVEL: usize = 1;
pub const OFF_METADATA: usize = 2;
pub const OFF_BATCH_ID: usize = 4;

// Типы страниц (0 = свободная/неинициализированная)
pub const PAGE_TYPE_FREE: u8 = 0;
pub const PAGE_TYPE_ROOT: u8 = 1;
pub const PAGE_TYPE_ABANDONED: u8 = 2;
pub const PAGE_TYPE_DATA: u8 = 3;
pub const PAGE_TYPE_BOTTOM: u8 = 4;
pub const PAGE_TYPE_STATE_ROOT: u8 = 5;
pub const PAGE_TYPE_FAN_OUT: u8 = 6;
pub const PAGE_TYPE_LEAF: u8 = 7;

// Адрес NULL: страница 0 всегда занята корневой страницей кольца,
// поэтому 0 никогда не является валидной целью ссылки.
pub const NULL_ADDRESS: u32 = 0;

// Корневая страница (смещения после заголовка):
// [block_number u32][history_depth u32][state_root 32B]
// [next_free_page u32][data_page u32][merkle_page u32][crc32c u32]
// [abandoned u32 x ROOT_ABANDONED_SLOTS][reserved ...]
pub const ROOT_OFF_BLOCK_NUMBER: usize = 8;
pub const ROOT_OFF_HISTORY_DEPTH: usize = 12;
pub const ROOT_OFF_STATE_ROOT: usize = 16;
pub const ROOT_OFF_NEXT_FREE: usize = 48;
pub const ROOT_OFF_DATA_PAGE: usize = 52;
pub const ROOT_OFF_MERKLE_PAGE: usize = 56;
pub const ROOT_OFF_CRC: usize = 60;
pub const ROOT_OFF_ABANDONED: usize = 64;
pub const ROOT_ABANDONED_SLOTS: usize = 32;

// Страница abandoned-очереди:
// [abandoned_at_batch u32][next u32][count u16][pad u16][entries u32 x CAP]
pub const ABND_OFF_BATCH: usize = 8;
pub const ABND_OFF_NEXT: usize = 12;
pub const ABND_OFF_COUNT: usize = 16;
pub const ABND_OFF_ENTRIES: usize = 20;
pub const ABANDONED_CAPACITY: usize = (PAGE_SIZE - ABND_OFF_ENTRIES) / 4;

// DataPage: 16 бакетов по первому ниблу + slotted-карта в остатке.
pub const DATA_BUCKETS: usize = 16;
pub const DATA_OFF_BUCKETS: usize = PAGE_HDR_SIZE;
pub const DATA_OFF_MAP: usize = DATA_OFF_BUCKETS + DATA_BUCKETS * 4;

// BottomPage: только slotted-карта.
pub const BOTTOM_OFF_MAP: usize = PAGE_HDR_SIZE;

// StateRootPage: фан-аут 256 (по двум первым ниблам) + карта коротких путей.
pub const STATE_ROOT_FANOUT: usize = 256;
pub const STATE_ROOT_OFF_FANOUT: usize = PAGE_HDR_SIZE;
pub const STATE_ROOT_OFF_MAP: usize = STATE_ROOT_OFF_FANOUT + STATE_ROOT_FANOUT * 4;

// FanOutPage: 16 бакетов + сквозной slotted-кэш.
pub const FAN_OUT_BUCKETS: usize = 16;
pub const FAN_OUT_OFF_BUCKETS: usize = PAGE_HDR_SIZE;
pub const FAN_OUT_OFF_MAP: usize = FAN_OUT_OFF_BUCKETS + FAN_OUT_BUCKETS * 4;

// LeafPage: только slotted-карта.
pub const LEAF_OFF_MAP: usize = PAGE_HDR_SIZE;

// Ключи: 256-битный keccak = 64 нибла.
pub const NIBBLES_PER_KECCAK: usize = 64;

// Глубина истории корней: кольцо в первых history_depth страницах файла.
// Верхняя граница связана с числом abandoned-слотов корневой страницы.
pub const MIN_HISTORY_DEPTH: u32 = 2;
pub const MAX_HISTORY_DEPTH: u32 = ROOT_ABANDONED_SLOTS as u32;

// Верхние уровни state-трие пересчитываются всегда — мемоизация пропускается.
pub const MERKLE_MEMO_SKIP_LEVELS: usize = 2;

// Коалесцирование msync-диапазонов при записи данных (страниц подряд).
pub const WRITE_COALESCE_PAGES: u32 = 64;

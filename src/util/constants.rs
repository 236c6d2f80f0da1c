/// log2 of the number of bytes in a byte
pub const LOG_BYTES_IN_BYTE: u8 = 0;
/// The number of bytes in a byte
pub const BYTES_IN_BYTE: usize = 1;
/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a gigabyte
pub const LOG_BYTES_IN_GBYTE: u8 = 30;
/// The number of bytes in a gigabyte
pub const BYTES_IN_GBYTE: usize = 1 << LOG_BYTES_IN_GBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;
/// log2 of the number of bits in an address
pub const LOG_BITS_IN_ADDRESS: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_ADDRESS as usize;
/// The number of bits in an address
pub const BITS_IN_ADDRESS: usize = 1 << LOG_BITS_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: u8 = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;
/// log2 of the number of bits in a page
pub const LOG_BITS_IN_PAGE: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_PAGE as usize;
/// The number of bits in a page
pub const BITS_IN_PAGE: usize = 1 << LOG_BITS_IN_PAGE;

/// log2 of the number of bytes in the address space
pub const LOG_BYTES_IN_ADDRESS_SPACE: u8 = BITS_IN_ADDRESS as u8;

/// Minimum granularity of a data-item allocation, in bytes. Every offset
/// returned by the allocator is a multiple of this value, and every
/// allocation request is rounded up to it.
pub const MIN_OBJ_SIZE: usize = 128;
/// log2 of `MIN_OBJ_SIZE`.
pub const LOG_MIN_OBJ_SIZE: u8 = 7;

/// Minimum size of a region (pool) backing heap, in bytes. `create_region`
/// rounds requested sizes up to this granularity.
pub const MIN_REGION_SIZE: usize = 1 << 20;

/// Reserved pool id for the cluster-wide ATL ring buffers. Created lazily on
/// first boot and persists across restarts.
pub const ATOMIC_REGION_ID: u16 = 0;

/// Upper bound on the number of concurrently running ATL workers.
pub const MAX_ATOMIC_THREADS: usize = 256;

/// Size of the fixed CAS lock table used to serialize client-level CAS
/// emulation on the cold-path atomics. The lock for a given offset is
/// `(offset >> LOG_MIN_OBJ_SIZE) mod CAS_LOCK_TABLE_SIZE`.
pub const CAS_LOCK_TABLE_SIZE: usize = 128;

/// Largest ATL message payload that is inlined in the message slot rather
/// than staged by the client via RDMA before the push completes.
pub const MAX_DATA_IN_MSG: usize = 2048;

/// Number of bits reserved for the region id within a packed access key.
pub const REGION_KEY_BITS: u32 = 16;
/// Number of bits reserved for the item id within a packed access key.
pub const ITEM_KEY_BITS: u32 = 47;

/// Shift of the region-id field within a packed access key. The low bit of
/// the key is the access-mode bit, so the item-id field starts at bit 1.
pub const ITEM_SHIFT: u32 = 1;
/// Shift of the region-id field within a packed access key.
pub const REGION_SHIFT: u32 = ITEM_SHIFT + ITEM_KEY_BITS;
/// Mask (pre-shift) for the item-id field of a packed access key.
pub const ITEM_MASK: u64 = (1u64 << ITEM_KEY_BITS) - 1;
/// Mask (pre-shift) for the region-id field of a packed access key.
pub const REGION_MASK: u64 = (1u64 << REGION_KEY_BITS) - 1;

/// Polling interval for the delayed-free worker's idle sleep, in
/// milliseconds.
pub const DELAYED_FREE_SLEEP_MS: u64 = 1;

static_assertions::const_assert!(MIN_OBJ_SIZE.is_power_of_two());
static_assertions::const_assert_eq!(1 << LOG_MIN_OBJ_SIZE, MIN_OBJ_SIZE);
static_assertions::const_assert!(MIN_REGION_SIZE % MIN_OBJ_SIZE == 0);
static_assertions::const_assert!(REGION_KEY_BITS as u64 + ITEM_KEY_BITS as u64 + 1 == 64);

use std::{env, str::FromStr};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

const DEFAULT_QUANTUM: u64 = 100_000;
const DEFAULT_MAX_THREADS: usize = 64;
const DEFAULT_TT_SECTORS: usize = 8;
const DEFAULT_SECTOR_WORDS: u32 = 1 << 20;
const DEFAULT_SECTOR_SLOTS: u32 = 1 << 14;
const DEFAULT_FAST_CACHE_BITS: u32 = 15;
const DEFAULT_MAX_INSNS: u32 = 50;
const DEFAULT_POLL_INTERVAL: u64 = 1 << 20;
const DEFAULT_SANITY_LEVEL: u8 = 1;
const DEFAULT_STACK_TOP: u64 = 0x7fff_0000;
const DEFAULT_STACK_SIZE: u64 = 1 << 20;
const DEFAULT_MMAP_BASE: u64 = 0x4000_0000;
const DEFAULT_MAX_MAP_LEN: u64 = 1 << 30;

const TEST_QUANTUM: u64 = 1_000;
const TEST_MAX_THREADS: usize = 8;
const TEST_TT_SECTORS: usize = 4;
const TEST_SECTOR_WORDS: u32 = 1 << 12;
const TEST_SECTOR_SLOTS: u32 = 64;
const TEST_FAST_CACHE_BITS: u32 = 8;
const TEST_MAX_INSNS: u32 = 16;
const TEST_POLL_INTERVAL: u64 = 256;
const TEST_STACK_SIZE: u64 = 1 << 16;
const TEST_MAX_MAP_LEN: u64 = 1 << 24;

/// How translations guard against the guest rewriting its own code.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SmcCheck {
    /// Only explicit `icinv` requests and unmapping invalidate code.
    #[default]
    None,
    /// Every translation re-hashes its guest bytes on entry.
    All,
}

/// Options for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOpts {
    /// Blocks a thread may run before it must yield the big lock.
    pub quantum: u64,
    /// Number of guest thread slots (thread ids are `1..=max_threads`).
    pub max_threads: usize,
    /// Number of translation-table sectors.
    pub tt_sectors: usize,
    /// Host code words per sector.
    pub sector_words: u32,
    /// Translation records per sector.
    pub sector_slots: u32,
    /// log2 of the fast cache size.
    pub fast_cache_bits: u32,
    /// Upper bound on guest instructions in one translation.
    pub max_insns_per_block: u32,
    /// Whether block exits are emitted as patchable chain sites.
    pub chaining: bool,
    /// Allow forward direct jumps to enter their target past its event check.
    pub fast_entry: bool,
    pub smc_check: SmcCheck,
    /// Blocks between housekeeping polls.
    pub poll_interval: u64,
    /// 0: none, 1: cheap checks, 2: full cache sanity check at every poll.
    pub sanity_level: u8,
    pub stack_top: u64,
    pub stack_size: u64,
    /// Lowest address handed out by `mmap` when the guest passes no hint.
    pub mmap_base: u64,
    /// Largest single `mmap` the guest may ask for.
    pub max_map_len: u64,
    /// Log engine statistics when the process exits.
    pub print_stats: bool,
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key).map_or(default, |s| s.parse::<T>().unwrap_or(default))
}

impl Default for EngineOpts {
    fn default() -> Self {
        Self {
            quantum: env_or("SHUNT_QUANTUM", DEFAULT_QUANTUM),
            max_threads: env_or("SHUNT_MAX_THREADS", DEFAULT_MAX_THREADS),
            tt_sectors: env_or("SHUNT_TT_SECTORS", DEFAULT_TT_SECTORS),
            sector_words: env_or("SHUNT_SECTOR_WORDS", DEFAULT_SECTOR_WORDS),
            sector_slots: env_or("SHUNT_SECTOR_SLOTS", DEFAULT_SECTOR_SLOTS),
            fast_cache_bits: env_or("SHUNT_FAST_CACHE_BITS", DEFAULT_FAST_CACHE_BITS),
            max_insns_per_block: env_or("SHUNT_MAX_INSNS", DEFAULT_MAX_INSNS),
            chaining: env_or("SHUNT_CHAINING", true),
            fast_entry: env_or("SHUNT_FAST_ENTRY", true),
            smc_check: env_or("SHUNT_SMC_CHECK", SmcCheck::None),
            poll_interval: env_or("SHUNT_POLL_INTERVAL", DEFAULT_POLL_INTERVAL),
            sanity_level: env_or("SHUNT_SANITY_LEVEL", DEFAULT_SANITY_LEVEL),
            stack_top: DEFAULT_STACK_TOP,
            stack_size: env_or("SHUNT_STACK_SIZE", DEFAULT_STACK_SIZE),
            mmap_base: DEFAULT_MMAP_BASE,
            max_map_len: env_or("SHUNT_MAX_MAP_LEN", DEFAULT_MAX_MAP_LEN),
            print_stats: env_or("SHUNT_PRINT_STATS", false),
        }
    }
}

impl EngineOpts {
    pub fn test_opts() -> Self {
        Self {
            quantum: TEST_QUANTUM,
            max_threads: TEST_MAX_THREADS,
            tt_sectors: TEST_TT_SECTORS,
            sector_words: TEST_SECTOR_WORDS,
            sector_slots: TEST_SECTOR_SLOTS,
            fast_cache_bits: TEST_FAST_CACHE_BITS,
            max_insns_per_block: TEST_MAX_INSNS,
            chaining: true,
            fast_entry: true,
            smc_check: SmcCheck::None,
            poll_interval: TEST_POLL_INTERVAL,
            sanity_level: 2,
            stack_top: DEFAULT_STACK_TOP,
            stack_size: TEST_STACK_SIZE,
            mmap_base: DEFAULT_MMAP_BASE,
            max_map_len: TEST_MAX_MAP_LEN,
            print_stats: false,
        }
    }
}

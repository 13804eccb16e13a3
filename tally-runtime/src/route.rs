const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a. Stable across processes, so key ownership survives restarts.
pub fn key_hash(key: &str) -> u64 {
    key.as_bytes().iter().fold(FNV_OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Index of the worker that owns `key`.
pub fn route(key: &str, workers: usize) -> usize {
    (key_hash(key) % workers.max(1) as u64) as usize
}

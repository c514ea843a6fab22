//! Chunk-size selection.

/// Base chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Adaptive sizing grows chunks until a file needs at most this many.
pub const DEFAULT_MAX_CHUNKS: u64 = 16;

/// Largest chunk adaptive sizing will pick: 100 MiB.
pub const MAX_CHUNK_SIZE_CAP: u64 = 100 * 1024 * 1024;

/// Pick a chunk size for a file of `file_size` bytes.
///
/// Starts at `base`, doubles while the file would need more than
/// `max_chunks` chunks, then halves while above `cap`. A large file may
/// therefore still produce more than `max_chunks` chunks.
pub fn choose_chunk_size(file_size: u64, base: u64, max_chunks: u64, cap: u64) -> u64 {
    let mut size = base.max(1);
    let max_chunks = max_chunks.max(1);
    while file_size / size > max_chunks && size <= cap {
        match size.checked_mul(2) {
            Some(next) => size = next,
            None => break,
        }
    }
    while size > cap && size > 1 {
        size /= 2;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn small_files_keep_base() {
        assert_eq!(
            choose_chunk_size(10 * MIB, MIB, DEFAULT_MAX_CHUNKS, MAX_CHUNK_SIZE_CAP),
            MIB
        );
    }

    #[test]
    fn large_files_grow_chunks() {
        // 100 MiB / 16 => needs at least 8 MiB chunks (100/8 = 12)
        let size = choose_chunk_size(100 * MIB, MIB, DEFAULT_MAX_CHUNKS, MAX_CHUNK_SIZE_CAP);
        assert_eq!(size, 8 * MIB);
    }

    #[test]
    fn huge_files_are_capped() {
        let size = choose_chunk_size(100_000 * MIB, MIB, DEFAULT_MAX_CHUNKS, MAX_CHUNK_SIZE_CAP);
        assert!(size <= MAX_CHUNK_SIZE_CAP);
        assert_eq!(size, 64 * MIB);
    }

    #[test]
    fn extreme_sizes_stay_in_range() {
        assert_eq!(choose_chunk_size(u64::MAX, 1, 1, u64::MAX), 1 << 63);
        assert_eq!(choose_chunk_size(u64::MAX, u64::MAX, 1, u64::MAX), u64::MAX);
        let odd = choose_chunk_size(u64::MAX, 3, 1, u64::MAX);
        assert_eq!(odd, 3 << 62);
        assert!(choose_chunk_size(u64::MAX, 3, 1, 1 << 40) <= 1 << 40);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(choose_chunk_size(0, 0, 0, 1), 1);
        assert_eq!(choose_chunk_size(5, MIB, 16, MIB), MIB);
    }
}

//! Single-range `Range: bytes=...` handling.

/// Inclusive byte range within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; never zero.
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Whether `[offset, offset + size)` overlaps this range.
    pub fn overlaps(&self, offset: u64, size: u64) -> bool {
        size > 0 && offset <= self.end && offset + size > self.start
    }

    /// `Content-Range` header value.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// The range cannot be served for a file of this size (HTTP 416).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsatisfiable;

/// Resolve a `Range` header against a file of `size` bytes.
///
/// Returns `Ok(None)` when the header should be ignored and the whole file
/// served: unknown units, multiple ranges, or syntax errors.
pub fn parse_range(header: &str, size: u64) -> Result<Option<ByteRange>, Unsatisfiable> {
    let Some(set) = header.trim().strip_prefix("bytes=") else {
        return Ok(None);
    };
    if set.contains(',') {
        return Ok(None);
    }
    let Some((first, last)) = set.trim().split_once('-') else {
        return Ok(None);
    };

    let range = match (first.trim(), last.trim()) {
        ("", "") => return Ok(None),
        // Suffix: the last N bytes
        ("", n) => {
            let Ok(n) = n.parse::<u64>() else {
                return Ok(None);
            };
            if n == 0 || size == 0 {
                return Err(Unsatisfiable);
            }
            ByteRange {
                start: size.saturating_sub(n),
                end: size - 1,
            }
        }
        (a, b) => {
            let Ok(start) = a.parse::<u64>() else {
                return Ok(None);
            };
            let end = if b.is_empty() {
                u64::MAX
            } else {
                match b.parse::<u64>() {
                    Ok(end) if end >= start => end,
                    _ => return Ok(None),
                }
            };
            if start >= size {
                return Err(Unsatisfiable);
            }
            ByteRange {
                start,
                end: end.min(size - 1),
            }
        }
    };
    Ok(Some(range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_range() {
        assert_eq!(
            parse_range("bytes=10-19", 100),
            Ok(Some(ByteRange { start: 10, end: 19 }))
        );
    }

    #[test]
    fn test_open_range_is_clamped() {
        assert_eq!(
            parse_range("bytes=90-", 100),
            Ok(Some(ByteRange { start: 90, end: 99 }))
        );
        assert_eq!(
            parse_range("bytes=90-500", 100),
            Ok(Some(ByteRange { start: 90, end: 99 }))
        );
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(
            parse_range("bytes=-10", 100),
            Ok(Some(ByteRange { start: 90, end: 99 }))
        );
        assert_eq!(
            parse_range("bytes=-500", 100),
            Ok(Some(ByteRange { start: 0, end: 99 }))
        );
    }

    #[test]
    fn test_unsatisfiable() {
        assert_eq!(parse_range("bytes=100-", 100), Err(Unsatisfiable));
        assert_eq!(parse_range("bytes=-0", 100), Err(Unsatisfiable));
    }

    #[test]
    fn test_ignored_headers() {
        assert_eq!(parse_range("items=0-1", 100), Ok(None));
        assert_eq!(parse_range("bytes=0-1,5-6", 100), Ok(None));
        assert_eq!(parse_range("bytes=9-2", 100), Ok(None));
        assert_eq!(parse_range("bytes=x-2", 100), Ok(None));
    }

    #[test]
    fn test_overlap() {
        let r = ByteRange { start: 10, end: 19 };
        assert!(r.overlaps(0, 11));
        assert!(!r.overlaps(0, 10));
        assert!(r.overlaps(19, 5));
        assert!(!r.overlaps(20, 5));
        assert_eq!(r.byte_len(), 10);
        assert_eq!(r.content_range(100), "bytes 10-19/100");
    }
}

//! Single-range `Range` header parsing for the download endpoint.

/// An inclusive byte range resolved against a known total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn content_range_header(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parse a `Range` header value against `total_size`. Only a single
/// `bytes=start-end` range is supported; anything else (multi-range,
/// unsatisfiable bounds, a non-`bytes` unit) returns `None` and the caller
/// falls back to serving the full body.
pub fn parse_range(header: &str, total_size: u64) -> Option<ByteRange> {
    let spec = header.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    let (start_str, end_str) = spec.split_once('-')?;

    if start_str.is_empty() {
        // Suffix range: last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 || total_size == 0 {
            return None;
        }
        let start = total_size.saturating_sub(suffix_len);
        return Some(ByteRange {
            start,
            end: total_size - 1,
        });
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        total_size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };

    if start > end || end >= total_size {
        return None;
    }

    Some(ByteRange { start, end })
}

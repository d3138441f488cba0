use alloy::transports::{RpcError, TransportError};

/// Classified RPC failure. Upstream error semantics are opaque and vary per
/// node vendor, so the recognizer is a substring table; unclassified messages
/// are logged by the caller for offline analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// The server rejected the block span, optionally naming its limit.
    RangeTooWide { max_blocks: Option<u64> },
    /// The server suggested a narrower span in the error data.
    SuggestedRange { blocks: u64 },
    InvalidParams,
    ResponseTooLarge,
    RateLimited,
    /// Timeouts and transport-level failures, retried by splitting.
    Timeout,
    Other,
}

impl RpcErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            RpcErrorKind::RangeTooWide { .. } => "range_too_wide",
            RpcErrorKind::SuggestedRange { .. } => "suggested_range",
            RpcErrorKind::InvalidParams => "invalid_params",
            RpcErrorKind::ResponseTooLarge => "response_too_large",
            RpcErrorKind::RateLimited => "rate_limited",
            RpcErrorKind::Timeout => "timeout",
            RpcErrorKind::Other => "other",
        }
    }
}

pub fn classify(err: &TransportError) -> RpcErrorKind {
    match err {
        RpcError::ErrorResp(payload) => {
            let data = payload
                .data
                .as_ref()
                .map(|d| d.get().to_string())
                .unwrap_or_default();
            classify_parts(&payload.message, &data)
        }
        other => classify_parts(&other.to_string(), ""),
    }
}

pub fn classify_parts(message: &str, data: &str) -> RpcErrorKind {
    let msg = message.to_lowercase();

    if msg.contains("block range is too wide") || msg.contains("range is too large") {
        return RpcErrorKind::RangeTooWide {
            max_blocks: numeric_hint(&msg),
        };
    }
    if msg.contains("response size should not greater than") || msg.contains("response size exceed")
    {
        return RpcErrorKind::ResponseTooLarge;
    }
    if msg.contains("invalid params") {
        if let Some(blocks) = suggested_range(data) {
            return RpcErrorKind::SuggestedRange { blocks };
        }
        return RpcErrorKind::InvalidParams;
    }
    if msg.contains("rate limit exceeded") || msg.contains("too many requests") || msg.contains("429")
    {
        return RpcErrorKind::RateLimited;
    }
    if is_transient(&msg) {
        return RpcErrorKind::Timeout;
    }
    RpcErrorKind::Other
}

fn is_transient(msg: &str) -> bool {
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("deadline")
        || msg.contains("bad gateway")
        || msg.contains("service unavailable")
        || msg.contains("temporarily unavailable")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
        || msg.contains("connection reset")
        || msg.contains("connection closed")
        || msg.contains("connection refused")
        || msg.contains("broken pipe")
}

/// First numeric word in the message, accepting a `k` suffix as ×1000
/// ("max 5000", "limited to 10k blocks").
fn numeric_hint(msg: &str) -> Option<u64> {
    for word in msg.split_whitespace() {
        if !word.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let expanded = word.replace('k', "000");
        let digits: String = expanded.chars().take_while(char::is_ascii_digit).collect();
        if let Ok(value) = digits.parse::<u64>() {
            if value >= 1 {
                return Some(value);
            }
        }
    }
    None
}

/// Parses the `"Try with this block range [0xa, 0xb]"` hint some servers put
/// in the error data; returns the suggested span length.
fn suggested_range(data: &str) -> Option<u64> {
    if !data.contains("Try with this block range") {
        return None;
    }
    let open = data.find('[')?;
    let close = data[open..].find(']')? + open;
    let mut parts = data[open + 1..close].split(',');
    let start = parse_hex(parts.next()?)?;
    let end = parse_hex(parts.next()?)?;
    if end > start { Some(end - start) } else { None }
}

fn parse_hex(word: &str) -> Option<u64> {
    let trimmed = word.trim().trim_matches('"');
    let hex = trimmed.strip_prefix("0x")?;
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_too_wide_with_plain_hint() {
        assert_eq!(
            classify_parts("block range is too wide; max 5000 blocks", ""),
            RpcErrorKind::RangeTooWide {
                max_blocks: Some(5000)
            }
        );
    }

    #[test]
    fn range_too_wide_with_k_suffix() {
        assert_eq!(
            classify_parts("query range is too large, limited to 10k", ""),
            RpcErrorKind::RangeTooWide {
                max_blocks: Some(10_000)
            }
        );
    }

    #[test]
    fn range_too_wide_without_hint() {
        assert_eq!(
            classify_parts("block range is too wide", ""),
            RpcErrorKind::RangeTooWide { max_blocks: None }
        );
    }

    #[test]
    fn invalid_params_with_suggested_range() {
        assert_eq!(
            classify_parts(
                "invalid params",
                "\"Try with this block range [0x64, 0x3e8]\""
            ),
            RpcErrorKind::SuggestedRange {
                blocks: 0x3e8 - 0x64
            }
        );
    }

    #[test]
    fn invalid_params_without_hint() {
        assert_eq!(
            classify_parts("invalid params", ""),
            RpcErrorKind::InvalidParams
        );
        assert_eq!(
            classify_parts("invalid params", "\"no hint here\""),
            RpcErrorKind::InvalidParams
        );
    }

    #[test]
    fn response_size_variants() {
        assert_eq!(
            classify_parts("response size should not greater than 150mb", ""),
            RpcErrorKind::ResponseTooLarge
        );
        assert_eq!(
            classify_parts("response size exceeded limit", ""),
            RpcErrorKind::ResponseTooLarge
        );
    }

    #[test]
    fn rate_limit_variants() {
        assert_eq!(
            classify_parts("rate limit exceeded", ""),
            RpcErrorKind::RateLimited
        );
        assert_eq!(
            classify_parts("HTTP 429 Too Many Requests", ""),
            RpcErrorKind::RateLimited
        );
    }

    #[test]
    fn transport_failures_are_timeouts() {
        for msg in [
            "request timed out",
            "deadline exceeded",
            "connection reset by peer",
            "502 Bad Gateway",
        ] {
            assert_eq!(classify_parts(msg, ""), RpcErrorKind::Timeout, "{msg}");
        }
    }

    #[test]
    fn unknown_messages_fall_through() {
        assert_eq!(
            classify_parts("execution aborted (requestId 123)", ""),
            RpcErrorKind::Other
        );
    }
}

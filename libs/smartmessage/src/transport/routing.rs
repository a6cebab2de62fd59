//! Routing keys and subscription pattern matching
//!
//! Queue routing keys take the form `<exchange>.<class>.<from>.<to>` with
//! every component lowercased and sanitised to `[a-z0-9_-]`. A nil sender
//! becomes the literal `anonymous`, a nil recipient the literal
//! `broadcast`. Subscription patterns match segment-wise: `*` consumes
//! exactly one segment, `#` zero or more.

use crate::header::MessageHeader;

/// Literal recipient segment for broadcasts.
pub const BROADCAST_SEGMENT: &str = "broadcast";

/// Literal sender segment for anonymous messages.
pub const ANONYMOUS_SEGMENT: &str = "anonymous";

/// Lowercase a routing-key component, replacing anything outside
/// `[a-z0-9_-]` with `_`.
pub fn sanitize_segment(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build a routing key from its four components.
pub fn routing_key(
    exchange: &str,
    message_class: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> String {
    let from = match from {
        Some(from) if !from.trim().is_empty() => sanitize_segment(from),
        _ => ANONYMOUS_SEGMENT.to_string(),
    };
    let to = match to {
        Some(to) => sanitize_segment(to),
        None => BROADCAST_SEGMENT.to_string(),
    };

    format!(
        "{}.{}.{}.{}",
        sanitize_segment(exchange),
        sanitize_segment(message_class),
        from,
        to
    )
}

/// Routing key for an envelope header.
pub fn routing_key_for(exchange: &str, header: &MessageHeader) -> String {
    let from = if header.from().trim().is_empty() {
        None
    } else {
        Some(header.from())
    };
    routing_key(exchange, header.message_class(), from, header.to())
}

/// Segment-wise wildcard match: `*` is one segment, `#` is zero or more.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    match_segments(&pattern, &key)
}

fn match_segments(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_segments(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_segments(rest, &key[1..]),
        Some((literal, rest)) => {
            !key.is_empty() && key[0] == *literal && match_segments(rest, &key[1..])
        }
    }
}

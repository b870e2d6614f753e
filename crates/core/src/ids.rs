use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(String);

impl TraceId {
    /// Lowercases and left-pads hex ids to 32 characters so that 64-bit
    /// Jaeger ids and 128-bit OTLP ids of the same trace compare equal.
    /// Non-hex ids are kept verbatim (trimmed). Empty and all-zero ids are
    /// rejected.
    pub fn normalize(input: &str) -> Option<Self> {
        normalize_hex(input, 32).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl SpanId {
    pub fn normalize(input: &str) -> Option<Self> {
        normalize_hex(input, 16).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn normalize_hex(input: &str, width: usize) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(trimmed.to_string());
    }
    if trimmed.chars().all(|c| c == '0') {
        return None;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.len() >= width {
        Some(lower)
    } else {
        Some(format!("{lower:0>width$}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ids() {
        let trace = TraceId::normalize("4BF92F3577B34DA6A3CE929D0E0E4736").unwrap();
        let span = SpanId::normalize("00f067aa0ba902b7").unwrap();
        assert_eq!(trace.as_str(), "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(span.as_str(), "00f067aa0ba902b7");
    }

    #[test]
    fn pads_short_hex_ids() {
        let trace = TraceId::normalize("a3ce929d0e0e4736").unwrap();
        assert_eq!(trace.as_str(), "0000000000000000a3ce929d0e0e4736");
        assert_eq!(SpanId::normalize("abc").unwrap().as_str(), "0000000000000abc");
    }

    #[test]
    fn rejects_empty_and_zero_ids() {
        assert!(TraceId::normalize("  ").is_none());
        assert!(SpanId::normalize("0000000000000000").is_none());
    }

    #[test]
    fn keeps_non_hex_ids() {
        assert_eq!(SpanId::normalize(" root ").unwrap().as_str(), "root");
    }
}

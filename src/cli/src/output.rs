//! Table formatting helpers for CLI output.

use comfy_table::{ContentArrangement, Table};

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a chrono timestamp as a relative "ago" string.
pub fn format_ago(dt: &chrono::DateTime<chrono::Utc>) -> String {
    let secs = chrono::Utc::now().signed_duration_since(*dt).num_seconds();
    if secs < 0 {
        return "just now".to_string();
    }

    match secs {
        0..=59 => format!("{secs} seconds ago"),
        60..=3599 => format!("{} minutes ago", secs / 60),
        3600..=86_399 => format!("{} hours ago", secs / 3600),
        _ => {
            let days = secs / 86_400;
            if days < 30 {
                format!("{days} days ago")
            } else if days < 365 {
                format!("{} months ago", days / 30)
            } else {
                format!("{} years ago", days / 365)
            }
        }
    }
}

/// "sha256:" plus the first 12 hex characters.
pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    let truncated = hex.get(..12).unwrap_or(hex);
    if digest.starts_with("sha256:") {
        format!("sha256:{truncated}")
    } else {
        truncated.to_string()
    }
}

/// Parse a size string like "500m", "10g", "1t" into bytes.
///
/// Supported suffixes (case-insensitive): `b`, `k`/`kb`, `m`/`mb`, `g`/`gb`, `t`/`tb`.
/// No suffix assumes bytes.
pub fn parse_size_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    const TB: u64 = 1024 * GB;

    let units: [(&str, u64); 9] = [
        ("tb", TB),
        ("t", TB),
        ("gb", GB),
        ("g", GB),
        ("mb", MB),
        ("m", MB),
        ("kb", KB),
        ("k", KB),
        ("b", 1),
    ];
    let (num_str, multiplier) = units
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((s.as_str(), 1));

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid size value: {s}"))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size value too large: {s}"))
}

//! Money is carried as integer pence. Floating point only appears at the
//! edges (gateway metadata, client JSON) and is converted once.

pub type Pence = i64;

/// Convert a decimal pound amount (`"49.99"`, `49.99`) into pence, rounding
/// half away from zero.
pub fn pounds_to_pence(pounds: f64) -> Pence {
    (pounds * 100.0).round() as Pence
}

/// Parse a pound amount as it arrives in string-only gateway metadata.
pub fn parse_pounds(raw: &str) -> Option<Pence> {
    let cleaned = raw.trim().trim_start_matches('£');
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite()).map(pounds_to_pence)
}

pub fn format_pounds(pence: Pence) -> String {
    let sign = if pence < 0 { "-" } else { "" };
    let abs = pence.unsigned_abs();
    format!("{}£{}.{:02}", sign, abs / 100, abs % 100)
}

//! Due-time resolution for free-form timing text ("in 5 minutes", "asap", ...).
//!
//! `resolve` is the only place timing text is interpreted. It is total: any
//! input, including garbage or absurd magnitudes, resolves to a timestamp.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

/// Offset used for "now"/"asap"-style requests.
pub const IMMEDIATE_OFFSET_MINUTES: i64 = 5;

/// Offset used when nothing in the text is recognized.
pub const FALLBACK_OFFSET_HOURS: i64 = 2;

const IMMEDIACY_PHRASES: &[&str] = &["now", "immediate", "immediately", "asap", "right away", "soon"];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Unit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Unit {
    /// Precedence order when several units appear in the same text.
    const ORDERED: [Unit; 5] = [Unit::Minute, Unit::Hour, Unit::Day, Unit::Week, Unit::Month];

    fn matches(&self, token: &str) -> bool {
        match self {
            Unit::Minute => token.starts_with("minute") || matches!(token, "min" | "mins"),
            Unit::Hour => token.starts_with("hour") || matches!(token, "h" | "hr" | "hrs"),
            Unit::Day => token.starts_with("day") || token == "tomorrow",
            Unit::Week => token.starts_with("week") || matches!(token, "wk" | "wks"),
            Unit::Month => token.starts_with("month"),
        }
    }

    fn default_magnitude(&self) -> i64 {
        match self {
            Unit::Minute => 5,
            Unit::Hour => 1,
            Unit::Day => 2,
            Unit::Week => 1,
            Unit::Month => 1,
        }
    }

    fn duration(&self, magnitude: i64) -> Option<Duration> {
        match self {
            Unit::Minute => Duration::try_minutes(magnitude),
            Unit::Hour => Duration::try_hours(magnitude),
            Unit::Day => Duration::try_days(magnitude),
            Unit::Week => Duration::try_weeks(magnitude),
            Unit::Month => magnitude.checked_mul(30).and_then(Duration::try_days),
        }
    }
}

/// Resolve a timing expression relative to `now`.
pub fn resolve(expression: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let fallback = now + Duration::hours(FALLBACK_OFFSET_HOURS);

    if let Some(at) = parse_timestamp(expression) {
        return at;
    }

    let tokens = tokenize(expression);
    if tokens.is_empty() {
        return fallback;
    }

    let padded = format!(" {} ", tokens.join(" "));
    if IMMEDIACY_PHRASES
        .iter()
        .any(|phrase| padded.contains(&format!(" {phrase} ")))
    {
        return now + Duration::minutes(IMMEDIATE_OFFSET_MINUTES);
    }

    let Some(unit) = Unit::ORDERED
        .into_iter()
        .find(|unit| tokens.iter().any(|t| unit.matches(t)))
    else {
        return fallback;
    };

    let magnitude = match first_integer(&tokens) {
        Some(n) => n,
        // "tomorrow" names its own magnitude.
        None if unit == Unit::Day && tokens.iter().any(|t| t == "tomorrow") => 1,
        None => unit.default_magnitude(),
    };

    unit.duration(magnitude)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(fallback)
}

fn parse_timestamp(expression: &str) -> Option<DateTime<Utc>> {
    let trimmed = expression.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Lowercase words, with digit runs split from letter runs ("5min" -> "5", "min").
fn tokenize(expression: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_digit = false;

    for ch in expression.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            let is_digit = ch.is_ascii_digit();
            if !current.is_empty() && is_digit != current_is_digit {
                tokens.push(std::mem::take(&mut current));
            }
            current_is_digit = is_digit;
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn first_integer(tokens: &[String]) -> Option<i64> {
    tokens
        .iter()
        .find(|t| t.chars().all(|c| c.is_ascii_digit()))
        .map(|t| t.parse::<i64>().unwrap_or(i64::MAX))
}

//! Input validators for dialog steps. Each returns the parsed value or a
//! message explaining what to send instead.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;

/// Wire format of deadlines.
pub const DEADLINE_FORMAT: &str = "%Y-%m-%d";

static ALIAS_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{1,31}$").unwrap());

static DEADLINE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

pub fn description(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("The description cannot be empty. Please describe the task.".into());
    }
    Ok(trimmed.to_string())
}

/// A calendar date written as `YYYY-MM-DD`. Past dates are accepted.
pub fn deadline(raw: &str) -> Result<NaiveDate, String> {
    let trimmed = raw.trim();
    let invalid = || format!("'{trimmed}' is not a valid date. Use YYYY-MM-DD, e.g. 2025-07-15.");
    if !DEADLINE_PATTERN.is_match(trimmed) {
        return Err(invalid());
    }
    NaiveDate::parse_from_str(trimmed, DEADLINE_FORMAT).map_err(|_| invalid())
}

/// A single token of 2–32 letters, digits, `_`, `.` or `-`, starting with a
/// letter or digit. A leading `@` is dropped.
pub fn alias(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    let candidate = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if !ALIAS_PATTERN.is_match(candidate) {
        return Err(format!(
            "'{trimmed}' is not a valid alias. Use 2-32 letters, digits, '_', '.' or '-'."
        ));
    }
    Ok(candidate.to_string())
}

/// Free-form division name. Empty or `-` means none.
pub fn division(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed == "-" {
        String::new()
    } else {
        trimmed.to_string()
    }
}

/// `true` or `false`, case-insensitive.
pub fn permission(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err("Please answer true or false.".into()),
    }
}

/// `<new_alias> [division...]`. Division is `None` when omitted.
pub fn alias_and_division(raw: &str) -> Result<(String, Option<String>), String> {
    let trimmed = raw.trim();
    let (head, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, Some(rest.trim())),
        None => (trimmed, None),
    };
    if head.is_empty() {
        return Err("Send the new alias, optionally followed by a division.".into());
    }
    let alias = alias(head)?;
    let division = rest.filter(|r| !r.is_empty()).map(division);
    Ok((alias, division))
}

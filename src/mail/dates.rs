use chrono::{DateTime, NaiveDateTime, Utc};
use log::warn;
use regex::Regex;
use std::sync::OnceLock;

const FALLBACK_FORMAT: &str = "%a, %d %b %Y %H:%M:%S";

/// Everything up to the first `HH:MM:SS`; whatever zone token follows is dropped.
fn wall_clock_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?\d{1,2}:\d{2}:\d{2})(?:\D.*)?$").expect("wall clock pattern"))
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\([^)]*\)").expect("comment pattern"))
}

/// Parse a `Date` header, or `None` if neither the mail grammar nor the
/// fixed-format fallback accepts it.
pub fn parse_mail_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    parse_rfc2822(raw).or_else(|| fallback_parse(raw))
}

/// Like [`parse_mail_date`] but never fails: an unusable date becomes `now`.
pub fn normalize_date(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    parse_mail_date(raw).unwrap_or_else(|| {
        warn!("unparseable Date header {raw:?}, using processing time");
        now
    })
}

fn parse_rfc2822(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // trailing "(CST)"-style comments trip some parsers
    let stripped = comment_re().replace_all(raw, "");
    let stripped = stripped.trim();
    if stripped != raw {
        if let Ok(dt) = DateTime::parse_from_rfc2822(stripped) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    None
}

/// Drop the zone token, whatever it is, and read the rest as a UTC wall-clock time.
fn fallback_parse(raw: &str) -> Option<DateTime<Utc>> {
    let without_comments = comment_re().replace_all(raw, "");
    let collapsed = without_comments.split_whitespace().collect::<Vec<_>>().join(" ");
    let caps = wall_clock_re().captures(&collapsed)?;
    match NaiveDateTime::parse_from_str(caps[1].trim(), FALLBACK_FORMAT) {
        Ok(naive) => {
            warn!("Date header {raw:?} parsed without its zone, assuming UTC");
            Some(naive.and_utc())
        }
        Err(_) => None,
    }
}

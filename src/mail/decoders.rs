use base64::Engine as _;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use encoding_rs::Encoding;
use log::warn;
use quoted_printable::ParseMode;
use regex::Regex;
use std::sync::OnceLock;

/// Base64 as found in mail: padding optional, stray trailing bits tolerated.
pub(crate) const MAIL_BASE64: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

fn encoded_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"=\?([^?\s]+)\?([bBqQ])\?([^?\s]*)\?=").expect("encoded-word pattern")
    })
}

/// Decode `bytes` as text in the named charset.
///
/// Unknown or missing labels fall back to UTF-8. Invalid sequences are
/// replaced, never reported.
pub fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
    let Some(label) = charset.map(str::trim).filter(|l| !l.is_empty()) else {
        return String::from_utf8_lossy(bytes).into_owned();
    };
    match Encoding::for_label(label.as_bytes()) {
        Some(enc) => enc.decode_without_bom_handling(bytes).0.into_owned(),
        None => {
            warn!("unknown charset {label:?}, decoding as UTF-8");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

/// Join folded header lines back into one line.
pub fn unfold(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(line);
    }
    out
}

enum Segment {
    Literal(String),
    Words(Vec<(String, Vec<u8>)>),
}

/// Decode a header value that may contain RFC 2047 encoded words.
///
/// Literal text and decoded runs are trimmed and joined with one space.
/// Adjacent encoded words (only whitespace between them) form a single run.
pub fn decode_header_value(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    if !raw.contains("=?") {
        return raw.to_string();
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut last = 0;
    for caps in encoded_word_re().captures_iter(raw) {
        let Some(whole) = caps.get(0) else { continue };
        let between = &raw[last..whole.start()];
        last = whole.end();

        let charset = caps[1].split('*').next().unwrap_or_default().to_string();
        let Some(bytes) = decode_word_payload(&caps[2], &caps[3]) else {
            // malformed payload: keep the word as literal text
            segments.push(Segment::Literal(format!("{between}{}", whole.as_str())));
            continue;
        };

        let joins_run = between.trim().is_empty();
        match segments.last_mut() {
            Some(Segment::Words(words)) if joins_run => words.push((charset, bytes)),
            _ => {
                if !between.trim().is_empty() {
                    segments.push(Segment::Literal(between.to_string()));
                }
                segments.push(Segment::Words(vec![(charset, bytes)]));
            }
        }
    }
    if last < raw.len() {
        segments.push(Segment::Literal(raw[last..].to_string()));
    }

    let parts: Vec<String> = segments
        .into_iter()
        .map(|seg| match seg {
            Segment::Literal(text) => text.trim().to_string(),
            Segment::Words(words) => decode_run(words),
        })
        .filter(|s| !s.is_empty())
        .collect();
    parts.join(" ")
}

/// Decode consecutive words, merging bytes that share a charset so that
/// multi-byte characters split across words come out whole.
fn decode_run(words: Vec<(String, Vec<u8>)>) -> String {
    let mut out = String::new();
    let mut pending: Option<(String, Vec<u8>)> = None;
    for (charset, bytes) in words {
        match pending.as_mut() {
            Some((cs, buf)) if cs.eq_ignore_ascii_case(&charset) => buf.extend(bytes),
            _ => {
                if let Some((cs, buf)) = pending.take() {
                    out.push_str(&decode_charset(&buf, Some(&cs)));
                }
                pending = Some((charset, bytes));
            }
        }
    }
    if let Some((cs, buf)) = pending {
        out.push_str(&decode_charset(&buf, Some(&cs)));
    }
    out.trim().to_string()
}

fn decode_word_payload(encoding: &str, payload: &str) -> Option<Vec<u8>> {
    if encoding.eq_ignore_ascii_case("b") {
        MAIL_BASE64.decode(payload).ok()
    } else {
        Some(decode_q(payload))
    }
}

/// The `Q` flavour of quoted-printable used inside encoded words.
fn decode_q(payload: &str) -> Vec<u8> {
    let spaced = payload.replace('_', " ");
    quoted_printable::decode(spaced.as_bytes(), ParseMode::Robust)
        .unwrap_or_else(|_| spaced.into_bytes())
}

//! Turns a message's MIME tree into the single `content` string.
//!
//! Attachments never contribute bytes. Text parts are transfer-decoded and
//! charset-decoded; HTML is kept as markup behind [`HTML_MARKER`]. Every
//! other leaf becomes a placeholder naming its type. A part that fails to
//! decode is replaced by [`DECODE_FAILED`] without affecting its siblings.

use base64::Engine as _;
use log::warn;
use quoted_printable::ParseMode;

use crate::error::DecodeError;
use crate::mail::decoders::{MAIL_BASE64, decode_charset};
use crate::mail::mime::MimePart;

pub const HTML_MARKER: &str = "[HTML内容]";
pub const DECODE_FAILED: &str = "[内容解码失败]";
pub const NO_CONTENT: &str = "[无内容]";

pub fn non_text_placeholder(content_type: &str) -> String {
    format!("[非文本内容: {content_type}]")
}

pub fn decode_body(root: &MimePart) -> String {
    let blocks: Vec<String> = root
        .leaves()
        .into_iter()
        .filter(|part| !part.is_attachment)
        .map(render_part)
        .filter(|block| !block.is_empty())
        .collect();

    if blocks.is_empty() {
        NO_CONTENT.to_string()
    } else {
        blocks.join("\n\n")
    }
}

fn render_part(part: &MimePart) -> String {
    if !part.is_text() {
        return non_text_placeholder(&part.content_type);
    }
    match decode_text(part) {
        Ok(text) if text.is_empty() => text,
        Ok(text) if part.content_type == "text/html" => format!("{HTML_MARKER}\n{text}"),
        Ok(text) => text,
        Err(e) => {
            warn!("failed to decode {} part: {e}", part.content_type);
            DECODE_FAILED.to_string()
        }
    }
}

fn decode_text(part: &MimePart) -> Result<String, DecodeError> {
    let payload = part.payload().unwrap_or_default();
    let bytes = decode_transfer(payload, part.transfer_encoding.as_deref())?;
    let text = decode_charset(&bytes, part.charset.as_deref());
    Ok(text.trim_end_matches(['\r', '\n']).to_string())
}

/// Undo a `Content-Transfer-Encoding`. Unknown tags pass the bytes through.
pub fn decode_transfer(payload: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, DecodeError> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("quoted-printable") => Ok(quoted_printable::decode(payload, ParseMode::Robust)?),
        Some("base64") => {
            let cleaned: Vec<u8> = payload
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            Ok(MAIL_BASE64.decode(cleaned)?)
        }
        _ => Ok(payload.to_vec()),
    }
}

use chrono::{DateTime, Utc};
use log::{debug, warn};
use mailparse::{MailHeaderMap, ParsedMail};

use crate::domain::email::{MessageToken, NormalizedEmailRecord, RawMessage};
use crate::mail::body::{DECODE_FAILED, decode_body};
use crate::mail::dates::normalize_date;
use crate::mail::decoders::{decode_header_value, unfold};
use crate::mail::mime::MimePart;

/// Decode one fetched message into its stored form.
///
/// Never fails: anything that cannot be decoded degrades to a placeholder,
/// and `now` stands in for a missing or unusable date.
pub fn normalize_message(raw: RawMessage, now: DateTime<Utc>) -> NormalizedEmailRecord {
    let parsed = match mailparse::parse_mail(&raw.bytes) {
        Ok(p) => p,
        Err(e) => {
            warn!("message {} could not be parsed: {e}", raw.token);
            return undecodable_record(raw.token, now);
        }
    };

    let message_id = raw_header(&parsed, "Message-ID")
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| raw.token.fallback_message_id());

    let decoded = |name: &str| {
        raw_header(&parsed, name)
            .map(|v| decode_header_value(&v))
            .unwrap_or_default()
    };

    let date = raw_header(&parsed, "Date").unwrap_or_default();
    let content = decode_body(&MimePart::from_parsed(&parsed));
    debug!("message {message_id}: {} chars of content", content.chars().count());

    NormalizedEmailRecord {
        subject: decoded("Subject"),
        sender: decoded("From"),
        recipients: decoded("To"),
        cc: decoded("Cc"),
        bcc: decoded("Bcc"),
        content,
        received_at: normalize_date(&date, now),
        message_id,
    }
}

fn raw_header(parsed: &ParsedMail, name: &str) -> Option<String> {
    parsed
        .headers
        .get_first_header(name)
        .map(|h| unfold(h.get_value_raw()))
}

fn undecodable_record(token: MessageToken, now: DateTime<Utc>) -> NormalizedEmailRecord {
    NormalizedEmailRecord {
        message_id: token.fallback_message_id(),
        subject: String::new(),
        sender: String::new(),
        recipients: String::new(),
        cc: String::new(),
        bcc: String::new(),
        content: DECODE_FAILED.to_string(),
        received_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()
    }

    fn raw(token: u32, text: &str) -> RawMessage {
        RawMessage {
            token: MessageToken(token),
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn builds_record_from_encoded_headers() {
        let msg = concat!(
            "Message-ID: <bill-1@bank.example>\r\n",
            "Subject: =?UTF-8?B?5L2g5aW9?=\r\n",
            "From: =?utf-8?B?5byg5LiJ?= <zhang@example.com>\r\n",
            "To: a@example.com,\r\n",
            " b@example.com\r\n",
            "Cc: c@example.com\r\n",
            "Date: Wed, 06 Mar 2024 09:00:00 +0800\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Total due: 10\r\n",
        );
        let rec = normalize_message(raw(1, msg), now());
        assert_eq!(rec.message_id, "<bill-1@bank.example>");
        assert_eq!(rec.subject, "你好");
        assert_eq!(rec.sender, "张三 <zhang@example.com>");
        assert_eq!(rec.recipients, "a@example.com, b@example.com");
        assert_eq!(rec.cc, "c@example.com");
        assert_eq!(rec.bcc, "");
        assert_eq!(rec.content, "Total due: 10");
        assert_eq!(
            rec.received_at,
            Utc.with_ymd_and_hms(2024, 3, 6, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn missing_message_id_uses_token() {
        let msg = "Subject: hi\r\n\r\nbody";
        let first = normalize_message(raw(7, msg), now());
        let again = normalize_message(raw(7, msg), now());
        assert_eq!(first.message_id, "NO_ID_7");
        assert_eq!(again.message_id, first.message_id);
    }

    #[test]
    fn bad_date_uses_processing_time() {
        let msg = "Message-ID: <x@y>\r\nDate: not a date\r\n\r\nbody";
        assert_eq!(normalize_message(raw(1, msg), now()).received_at, now());

        let no_date = "Message-ID: <x@y>\r\n\r\nbody";
        assert_eq!(normalize_message(raw(1, no_date), now()).received_at, now());
    }

    #[test]
    fn undecodable_message_still_gets_a_record() {
        let rec = undecodable_record(MessageToken(9), now());
        assert_eq!(rec.message_id, "NO_ID_9");
        assert_eq!(rec.content, DECODE_FAILED);
        assert_eq!(rec.received_at, now());
    }
}

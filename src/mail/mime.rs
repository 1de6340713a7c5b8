use mailparse::body::Body;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

use crate::error::DecodeError;

/// Read-only view of one node in a message's content tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    /// Lowercased `type/subtype`.
    pub content_type: String,
    /// Charset as declared; `None` when the part does not name one.
    pub charset: Option<String>,
    /// Lowercased `Content-Transfer-Encoding`.
    pub transfer_encoding: Option<String>,
    pub is_attachment: bool,
    pub body: PartBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartBody {
    /// Still transfer-encoded.
    Payload(Vec<u8>),
    Children(Vec<MimePart>),
}

impl MimePart {
    pub fn parse(raw: &[u8]) -> Result<Self, DecodeError> {
        let parsed = mailparse::parse_mail(raw)?;
        Ok(Self::from_parsed(&parsed))
    }

    pub fn from_parsed(p: &ParsedMail) -> Self {
        let content_type = p.ctype.mimetype.trim().to_ascii_lowercase();
        let charset = p.ctype.params.get("charset").map(|c| c.trim().to_string());
        let transfer_encoding = p
            .headers
            .get_first_value("Content-Transfer-Encoding")
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let is_attachment = matches!(
            p.get_content_disposition().disposition,
            DispositionType::Attachment
        );

        let body = if !p.subparts.is_empty() || content_type.starts_with("multipart/") {
            PartBody::Children(p.subparts.iter().map(MimePart::from_parsed).collect())
        } else {
            PartBody::Payload(raw_payload(p))
        };

        Self {
            content_type,
            charset,
            transfer_encoding,
            is_attachment,
            body,
        }
    }

    /// Leaf parts in depth-first order.
    pub fn leaves(&self) -> Vec<&MimePart> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a MimePart>) {
        match &self.body {
            PartBody::Payload(_) => out.push(self),
            PartBody::Children(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match &self.body {
            PartBody::Payload(bytes) => Some(bytes.as_slice()),
            PartBody::Children(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self.content_type.as_str(), "text/plain" | "text/html")
    }
}

fn raw_payload(p: &ParsedMail) -> Vec<u8> {
    match p.get_body_encoded() {
        Body::Base64(b) | Body::QuotedPrintable(b) => b.get_raw().to_vec(),
        Body::SevenBit(b) | Body::EightBit(b) => b.get_raw().to_vec(),
        Body::Binary(b) => b.get_raw().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NESTED: &str = concat!(
        "Subject: nested\r\n",
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/plain; charset=\"GBK\"\r\n",
        "Content-Transfer-Encoding: Base64\r\n",
        "\r\n",
        "1cu1pQ==\r\n",
        "--inner\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>bill</p>\r\n",
        "--inner--\r\n",
        "--outer\r\n",
        "Content-Type: application/pdf\r\n",
        "Content-Disposition: attachment; filename=\"bill.pdf\"\r\n",
        "\r\n",
        "%PDF\r\n",
        "--outer--\r\n",
    );

    #[test]
    fn builds_tree_with_leaf_metadata() {
        let root = MimePart::parse(NESTED.as_bytes()).unwrap();
        assert_eq!(root.content_type, "multipart/mixed");
        assert!(root.payload().is_none());

        let leaves = root.leaves();
        let types: Vec<&str> = leaves.iter().map(|p| p.content_type.as_str()).collect();
        assert_eq!(types, ["text/plain", "text/html", "application/pdf"]);

        assert_eq!(leaves[0].charset.as_deref(), Some("GBK"));
        assert_eq!(leaves[0].transfer_encoding.as_deref(), Some("base64"));
        assert!(leaves[0].payload().unwrap().starts_with(b"1cu1pQ=="));
        assert_eq!(leaves[1].charset, None);
        assert!(leaves[2].is_attachment);
        assert!(!leaves[0].is_attachment);
    }

    #[test]
    fn single_part_message_is_one_leaf() {
        let raw = b"Subject: hi\r\n\r\nplain body";
        let root = MimePart::parse(raw).unwrap();
        assert_eq!(root.content_type, "text/plain");
        assert_eq!(root.leaves().len(), 1);
        assert_eq!(root.payload(), Some(&b"plain body"[..]));
        assert!(root.is_text());
    }
}

//! MIME message composition.

use crate::content_type::ContentType;
use crate::encoding::{encode_base64_lines, encode_quoted_printable, encode_rfc2047};
use crate::error::{Error, Result};
use crate::header::Headers;
use chrono::{DateTime, FixedOffset};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static BOUNDARY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Transfer encoding types used for generated parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7-bit ASCII.
    SevenBit,
    /// Base64 encoding.
    Base64,
    /// Quoted-Printable encoding.
    QuotedPrintable,
}

impl fmt::Display for TransferEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SevenBit => write!(f, "7bit"),
            Self::Base64 => write!(f, "base64"),
            Self::QuotedPrintable => write!(f, "quoted-printable"),
        }
    }
}

/// A file attached to a message.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// File name presented to the recipient.
    pub filename: String,
    /// Content type of the data.
    pub content_type: ContentType,
    /// Raw file contents.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates an attachment, guessing the content type from the file name.
    #[must_use]
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        Self {
            content_type: ContentType::for_file_name(&filename),
            filename,
            data,
        }
    }

    fn write_part(&self, out: &mut String) -> Result<()> {
        let name = quoted_param(&self.filename);
        let mut headers = Headers::new();
        headers.add(
            "Content-Type",
            format!("{}; name={name}", self.content_type),
        )?;
        headers.add("Content-Transfer-Encoding", TransferEncoding::Base64.to_string())?;
        headers.add("Content-Disposition", format!("attachment; filename={name}"))?;

        out.push_str(&headers.to_string());
        out.push_str("\r\n");
        out.push_str(&encode_base64_lines(&self.data));
        Ok(())
    }
}

/// A fully composed message ready for SMTP `DATA`.
#[derive(Debug, Clone)]
pub struct Message {
    /// Top-level headers.
    pub headers: Headers,
    /// Encoded body (everything after the blank line).
    pub body: String,
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients.
    pub recipients: Vec<String>,
}

impl Message {
    /// Gets the Subject header as written (possibly RFC 2047 encoded).
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.headers.get("subject")
    }

    /// Serializes the message with CRLF line endings.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n{}", self.headers, self.body)
    }
}

/// Builder for outgoing messages.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    subject: String,
    date: Option<DateTime<FixedOffset>>,
    message_id: Option<String>,
    text_body: Option<String>,
    html_body: Option<String>,
    attachments: Vec<Attachment>,
    boundary: Option<String>,
}

impl MessageBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sender.
    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    /// Sets the subject. Non-ASCII text is RFC 2047 encoded on build.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Sets the Date header.
    #[must_use]
    pub fn date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.date = Some(date);
        self
    }

    /// Sets the Message-ID (without angle brackets).
    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    /// Sets the plain text body.
    #[must_use]
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    /// Sets the HTML body.
    #[must_use]
    pub fn html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    /// Adds an attachment.
    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Fixes the multipart boundary prefix (mainly for reproducible output).
    #[must_use]
    pub fn boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    /// Builds the message.
    ///
    /// # Errors
    ///
    /// Returns an error if From/To or the body are missing, or if any header
    /// value would break the header block.
    pub fn build(self) -> Result<Message> {
        let from = self
            .from
            .clone()
            .ok_or_else(|| Error::MissingHeader("From".into()))?;
        if self.to.is_empty() {
            return Err(Error::MissingHeader("To".into()));
        }

        let mut headers = Headers::new();
        headers.add("From", from.clone())?;
        headers.add("To", self.to.join(", "))?;
        headers.add("Subject", encode_rfc2047(&self.subject))?;
        if let Some(date) = self.date {
            headers.add("Date", date.to_rfc2822())?;
        }
        if let Some(id) = &self.message_id {
            headers.add("Message-ID", format!("<{id}>"))?;
        }
        headers.add("MIME-Version", "1.0")?;

        let base = self.boundary.clone().unwrap_or_else(generate_boundary);
        let mut body = String::new();

        if self.attachments.is_empty() {
            let (content_type, encoding) = self.write_content(&base, &mut body)?;
            headers.add("Content-Type", content_type.to_string())?;
            if let Some(encoding) = encoding {
                headers.add("Content-Transfer-Encoding", encoding.to_string())?;
            }
        } else {
            let mixed = format!("{base}_mixed");
            headers.add("Content-Type", ContentType::multipart_mixed(&mixed).to_string())?;
            body.push_str("This is a multi-part message in MIME format.\r\n");

            body.push_str(&format!("\r\n--{mixed}\r\n"));
            let mut content = String::new();
            let (content_type, encoding) = self.write_content(&base, &mut content)?;
            body.push_str(&format!("Content-Type: {content_type}\r\n"));
            if let Some(encoding) = encoding {
                body.push_str(&format!("Content-Transfer-Encoding: {encoding}\r\n"));
            }
            body.push_str("\r\n");
            body.push_str(&content);

            for attachment in &self.attachments {
                body.push_str(&format!("\r\n--{mixed}\r\n"));
                attachment.write_part(&mut body)?;
            }
            body.push_str(&format!("\r\n--{mixed}--\r\n"));
        }

        Ok(Message {
            headers,
            body,
            from,
            recipients: self.to,
        })
    }

    /// Writes the text/HTML content into `out` and returns its content type
    /// and transfer encoding (`None` for multipart containers).
    fn write_content(
        &self,
        base: &str,
        out: &mut String,
    ) -> Result<(ContentType, Option<TransferEncoding>)> {
        match (&self.text_body, &self.html_body) {
            (Some(text), Some(html)) => {
                let alternative = format!("{base}_alt");
                for (content_type, content) in [
                    (ContentType::text_plain(), text),
                    (ContentType::text_html(), html),
                ] {
                    out.push_str(&format!("--{alternative}\r\n"));
                    out.push_str(&format!("Content-Type: {content_type}\r\n"));
                    out.push_str("Content-Transfer-Encoding: quoted-printable\r\n\r\n");
                    out.push_str(&encode_quoted_printable(content));
                    out.push_str("\r\n");
                }
                out.push_str(&format!("--{alternative}--\r\n"));
                Ok((ContentType::multipart_alternative(alternative), None))
            }
            (Some(text), None) => {
                out.push_str(&encode_quoted_printable(text));
                out.push_str("\r\n");
                Ok((ContentType::text_plain(), Some(TransferEncoding::QuotedPrintable)))
            }
            (None, Some(html)) => {
                out.push_str(&encode_quoted_printable(html));
                out.push_str("\r\n");
                Ok((ContentType::text_html(), Some(TransferEncoding::QuotedPrintable)))
            }
            (None, None) => Err(Error::MissingBody),
        }
    }
}

/// Boundaries start with `=_`, which can never occur in Base64 or
/// Quoted-Printable output.
fn generate_boundary() -> String {
    let seq = BOUNDARY_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("=_tc_{nanos:x}_{seq:x}")
}

/// Quotes a parameter value, encoding non-ASCII names as an RFC 2047 word.
fn quoted_param(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    format!("\"{}\"", encode_rfc2047(&cleaned).replace("\r\n ", ""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn builder() -> MessageBuilder {
        MessageBuilder::new()
            .from("capsules@example.com")
            .to("a@b.com")
            .subject("Hello")
            .boundary("=_test")
    }

    #[test]
    fn test_html_only_single_part() {
        let message = builder().html_body("<p>hi</p>").build().unwrap();
        let raw = message.to_string();

        assert!(raw.starts_with("From: capsules@example.com\r\nTo: a@b.com\r\nSubject: Hello\r\n"));
        assert!(raw.contains("Content-Type: text/html; charset=utf-8\r\n"));
        assert!(raw.contains("Content-Transfer-Encoding: quoted-printable\r\n"));
        assert!(raw.contains("\r\n\r\n<p>hi</p>\r\n"));
        assert!(!raw.contains("multipart/mixed"));
        assert!(!raw.contains("Content-Disposition"));
    }

    #[test]
    fn test_attachments_make_multipart_mixed() {
        let message = builder()
            .html_body("<p>hi</p>")
            .attach(Attachment::new("notes.txt", b"hello".to_vec()))
            .attach(Attachment::new("photo.png", vec![0, 1, 2]))
            .build()
            .unwrap();
        let raw = message.to_string();

        assert!(raw.contains("Content-Type: multipart/mixed; boundary=\"=_test_mixed\"\r\n"));
        assert_eq!(raw.matches("\r\n--=_test_mixed\r\n").count(), 3);
        assert!(raw.ends_with("\r\n--=_test_mixed--\r\n"));
        assert!(raw.contains("Content-Disposition: attachment; filename=\"notes.txt\"\r\n"));
        assert!(raw.contains("Content-Type: image/png; name=\"photo.png\"\r\n"));
        assert!(raw.contains("aGVsbG8=\r\n"));
    }

    #[test]
    fn test_text_and_html_make_alternative() {
        let message = builder()
            .text_body("hi")
            .html_body("<p>hi</p>")
            .build()
            .unwrap();
        let raw = message.to_string();
        assert!(raw.contains("multipart/alternative; boundary=\"=_test_alt\""));
        assert!(raw.contains("--=_test_alt--\r\n"));
    }

    #[test]
    fn test_missing_fields_are_errors() {
        assert!(matches!(
            MessageBuilder::new().to("a@b.com").html_body("x").build(),
            Err(Error::MissingHeader(_))
        ));
        assert!(matches!(
            MessageBuilder::new().from("a@b.com").html_body("x").build(),
            Err(Error::MissingHeader(_))
        ));
        assert!(matches!(
            MessageBuilder::new().from("a@b.com").to("c@d.com").build(),
            Err(Error::MissingBody)
        ));
    }

    #[test]
    fn test_recipient_injection_rejected() {
        let result = MessageBuilder::new()
            .from("a@b.com")
            .to("c@d.com\r\nBcc: x@y.com")
            .html_body("x")
            .build();
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }

    #[test]
    fn test_non_ascii_filename_is_encoded() {
        let message = builder()
            .html_body("x")
            .attach(Attachment::new("résumé.pdf", vec![1]))
            .build()
            .unwrap();
        assert!(message.to_string().contains("filename=\"=?utf-8?B?"));
    }

    #[test]
    fn test_envelope_fields() {
        let message = builder().html_body("x").build().unwrap();
        assert_eq!(message.from, "capsules@example.com");
        assert_eq!(message.recipients, vec!["a@b.com"]);
        assert_eq!(message.subject(), Some("Hello"));
    }
}

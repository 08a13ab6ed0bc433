//! Email composition for unlocked capsules.

use std::path::PathBuf;

use chrono::Utc;
use timecapsule_mime::{Attachment, MessageBuilder};

use super::transport::{DeliveryError, OutboundMessage};
use crate::capsule::Capsule;
use crate::uploads;

/// A composed message plus the attachment files that made it in.
#[derive(Debug, Clone)]
pub struct Composed {
    /// Message ready for the transport.
    pub message: OutboundMessage,
    /// Files actually attached; only these are deleted after delivery.
    pub attached: Vec<PathBuf>,
}

/// Subject line for a capsule, rendered in its zone.
#[must_use]
pub fn subject(capsule: &Capsule) -> String {
    let local = capsule.unlock_local();
    format!(
        "🎁 Time Capsule - Unlocked on {} at {}",
        local.format("%Y-%m-%d"),
        local.format("%H:%M")
    )
}

/// HTML body. The message text is escaped and shown verbatim.
#[must_use]
pub fn html_body(capsule: &Capsule) -> String {
    let local = capsule.unlock_local();
    format!(
        r#"<html>
<body style="font-family: Arial, sans-serif; padding: 20px;">
    <h2 style="color: #4CAF50;">⏰ Your Time Capsule Has Been Unlocked!</h2>
    <p><strong>Scheduled Unlock Date:</strong> {date}</p>
    <p><strong>Scheduled Unlock Time:</strong> {time}</p>
    <hr style="border: 1px solid #ddd;">
    <div style="margin-top: 20px; padding: 15px; background-color: #f9f9f9; border-left: 4px solid #4CAF50;">
        <p style="white-space: pre-wrap;">{message}</p>
    </div>
    <hr style="border: 1px solid #ddd; margin-top: 20px;">
    <p style="color: #666; font-size: 12px;">This is an automated message from Time Capsule</p>
</body>
</html>
"#,
        date = local.format("%Y-%m-%d"),
        time = local.format("%H:%M"),
        message = escape_html(&capsule.message),
    )
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Builds the email for `capsule`, sent from `sender`.
///
/// Attachments that are missing or unreadable are skipped with a warning.
///
/// # Errors
///
/// Returns [`DeliveryError::Compose`] if the MIME message cannot be built
/// (for example, a recipient that would break the header block).
pub async fn compose(capsule: &Capsule, sender: &str) -> Result<Composed, DeliveryError> {
    let now = Utc::now().with_timezone(&capsule.zone).fixed_offset();
    let domain = sender.rsplit_once('@').map_or("localhost", |(_, d)| d);

    let mut builder = MessageBuilder::new()
        .from(sender)
        .to(capsule.recipient.as_str())
        .subject(subject(capsule))
        .date(now)
        .message_id(format!("{}@{domain}", capsule.job_id.as_str().replace('@', ".")))
        .text_body(capsule.message.as_str())
        .html_body(html_body(capsule));

    let mut attached = Vec::new();
    for path in &capsule.attachments {
        match tokio::fs::read(path).await {
            Ok(data) => {
                builder = builder.attach(Attachment::new(uploads::original_name(path), data));
                attached.push(path.clone());
                tracing::debug!(job_id = %capsule.job_id, path = %path.display(), "file attached");
            }
            Err(e) => {
                tracing::warn!(
                    job_id = %capsule.job_id,
                    path = %path.display(),
                    error = %e,
                    "attachment skipped"
                );
            }
        }
    }

    let message = builder
        .build()
        .map_err(|e| DeliveryError::Compose(e.to_string()))?;

    Ok(Composed {
        message: OutboundMessage {
            from: message.from.clone(),
            recipients: message.recipients.clone(),
            bytes: message.to_bytes(),
        },
        attached,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::capsule::JobId;
    use chrono::TimeZone;

    fn capsule(message: &str, attachments: Vec<PathBuf>) -> Capsule {
        Capsule::new(
            JobId::parse("capsule_1_0_a@b.com").unwrap(),
            "a@b.com",
            message,
            Utc.with_ymd_and_hms(2030, 1, 2, 3, 30, 0).unwrap(),
            chrono_tz::Asia::Kolkata,
            attachments,
        )
    }

    #[test]
    fn test_subject_uses_capsule_zone() {
        assert_eq!(
            subject(&capsule("m", Vec::new())),
            "🎁 Time Capsule - Unlocked on 2030-01-02 at 09:00"
        );
    }

    #[test]
    fn test_html_body_escapes_message() {
        let html = html_body(&capsule("<script>alert('x')</script> & more", Vec::new()));
        assert!(html.contains("&lt;script&gt;alert(&#x27;x&#x27;)&lt;/script&gt; &amp; more"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("white-space: pre-wrap"));
        assert!(html.contains("2030-01-02"));
    }

    #[tokio::test]
    async fn test_compose_attaches_existing_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("20250101_000000_000000_photo.png");
        std::fs::write(&present, [0x89, b'P', b'N', b'G']).unwrap();
        let missing = dir.path().join("gone.txt");

        let composed = compose(&capsule("hello", vec![present.clone(), missing]), "me@x.com")
            .await
            .unwrap();
        assert_eq!(composed.attached, vec![present]);
        assert_eq!(composed.message.from, "me@x.com");
        assert_eq!(composed.message.recipients, vec!["a@b.com"]);

        let text = String::from_utf8(composed.message.bytes).unwrap();
        assert!(text.contains("filename=\"photo.png\""));
        assert!(text.contains("image/png"));
        assert!(!text.contains("gone.txt"));
        assert!(text.contains("Message-ID: <capsule_1_0_a.b.com@x.com>"));
        assert!(text.contains("Subject: =?utf-8?B?"));
    }

    #[tokio::test]
    async fn test_compose_without_attachments_has_no_attachment_section() {
        let composed = compose(&capsule("just words", Vec::new()), "me@x.com")
            .await
            .unwrap();
        assert!(composed.attached.is_empty());

        let text = String::from_utf8(composed.message.bytes).unwrap();
        assert!(!text.contains("multipart/mixed"));
        assert!(!text.contains("Content-Disposition: attachment"));
        assert!(text.contains("multipart/alternative"));
        assert!(text.contains("text/html"));
    }

    #[tokio::test]
    async fn test_compose_rejects_header_injection() {
        let mut c = capsule("m", Vec::new());
        c.recipient = "a@b.com\r\nBcc: evil@x.com".into();
        assert!(matches!(
            compose(&c, "me@x.com").await,
            Err(DeliveryError::Compose(_))
        ));
    }
}

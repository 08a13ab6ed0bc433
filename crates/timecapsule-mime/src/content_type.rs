//! MIME content type handling.

use std::collections::BTreeMap;
use std::fmt;

/// MIME content type with parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Main type (e.g., "text", "image", "multipart").
    pub main_type: String,
    /// Subtype (e.g., "plain", "html", "jpeg").
    pub sub_type: String,
    /// Parameters (e.g., charset=utf-8, boundary=xxx), written in key order.
    pub parameters: BTreeMap<String, String>,
}

impl ContentType {
    /// Creates a new content type.
    #[must_use]
    pub fn new(main_type: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            main_type: main_type.into(),
            sub_type: sub_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Creates a text/plain content type.
    #[must_use]
    pub fn text_plain() -> Self {
        Self::new("text", "plain").with_parameter("charset", "utf-8")
    }

    /// Creates a text/html content type.
    #[must_use]
    pub fn text_html() -> Self {
        Self::new("text", "html").with_parameter("charset", "utf-8")
    }

    /// Creates a multipart/mixed content type with boundary.
    #[must_use]
    pub fn multipart_mixed(boundary: impl Into<String>) -> Self {
        Self::new("multipart", "mixed").with_parameter("boundary", boundary)
    }

    /// Creates a multipart/alternative content type with boundary.
    #[must_use]
    pub fn multipart_alternative(boundary: impl Into<String>) -> Self {
        Self::new("multipart", "alternative").with_parameter("boundary", boundary)
    }

    /// Creates an application/octet-stream content type.
    #[must_use]
    pub fn octet_stream() -> Self {
        Self::new("application", "octet-stream")
    }

    /// Guesses a content type from a file name's extension.
    ///
    /// Unknown extensions fall back to `application/octet-stream`.
    #[must_use]
    pub fn for_file_name(name: &str) -> Self {
        let extension = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "txt" => Self::text_plain(),
            "html" | "htm" => Self::text_html(),
            "pdf" => Self::new("application", "pdf"),
            "zip" => Self::new("application", "zip"),
            "doc" => Self::new("application", "msword"),
            "docx" => Self::new(
                "application",
                "vnd.openxmlformats-officedocument.wordprocessingml.document",
            ),
            "png" => Self::new("image", "png"),
            "jpg" | "jpeg" => Self::new("image", "jpeg"),
            "gif" => Self::new("image", "gif"),
            "mp4" => Self::new("video", "mp4"),
            "mov" => Self::new("video", "quicktime"),
            _ => Self::octet_stream(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Returns the boundary parameter if present.
    #[must_use]
    pub fn boundary(&self) -> Option<&str> {
        self.parameters.get("boundary").map(String::as_str)
    }

    /// Checks if this is a multipart content type.
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.main_type.eq_ignore_ascii_case("multipart")
    }

    /// Checks if this is a text content type.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.main_type.eq_ignore_ascii_case("text")
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main_type, self.sub_type)?;

        for (key, value) in &self.parameters {
            // Quote value if it contains tspecials (RFC 2045 §5.1)
            if value.contains(|c: char| c.is_whitespace() || "()<>@,;:\\\"/[]?=".contains(c)) {
                write!(f, "; {key}=\"{value}\"")?;
            } else {
                write!(f, "; {key}={value}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_html_display() {
        assert_eq!(ContentType::text_html().to_string(), "text/html; charset=utf-8");
    }

    #[test]
    fn test_multipart_boundary_is_quoted() {
        let ct = ContentType::multipart_mixed("=_tc_1");
        assert!(ct.is_multipart());
        assert_eq!(ct.boundary(), Some("=_tc_1"));
        assert_eq!(ct.to_string(), "multipart/mixed; boundary=\"=_tc_1\"");
    }

    #[test]
    fn test_for_file_name_known_extensions() {
        assert_eq!(ContentType::for_file_name("scan.PDF").to_string(), "application/pdf");
        assert_eq!(ContentType::for_file_name("a.b.jpeg").to_string(), "image/jpeg");
        assert_eq!(ContentType::for_file_name("clip.mov").to_string(), "video/quicktime");
        assert!(ContentType::for_file_name("notes.txt").is_text());
    }

    #[test]
    fn test_for_file_name_unknown_falls_back() {
        assert_eq!(ContentType::for_file_name("README"), ContentType::octet_stream());
        assert_eq!(ContentType::for_file_name("x.bin"), ContentType::octet_stream());
    }
}

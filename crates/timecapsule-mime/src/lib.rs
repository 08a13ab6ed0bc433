//! # timecapsule-mime
//!
//! MIME message generation for time capsule deliveries.
//!
//! ## Features
//!
//! - **Ordered headers**: Headers are written in insertion order and reject
//!   CR/LF in values, so user-supplied addresses cannot inject headers
//! - **RFC 2047 words**: Non-ASCII subjects and file names are encoded
//! - **Transfer encodings**: Base64 (wrapped at 76 columns) for attachments,
//!   Quoted-Printable for text bodies
//! - **Multipart**: `multipart/mixed` when attachments exist,
//!   `multipart/alternative` when both text and HTML bodies are given
//!
//! ## Quick Start
//!
//! ```ignore
//! use timecapsule_mime::{Attachment, MessageBuilder};
//!
//! let message = MessageBuilder::new()
//!     .from("capsules@example.com")
//!     .to("friend@example.com")
//!     .subject("🎁 Time Capsule")
//!     .html_body("<p>Hello from the past</p>")
//!     .attach(Attachment::new("photo.png", png_bytes))
//!     .build()?;
//!
//! let raw: Vec<u8> = message.to_bytes();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod content_type;
mod error;
mod header;
mod message;

pub mod encoding;

pub use content_type::ContentType;
pub use error::{Error, Result};
pub use header::Headers;
pub use message::{Attachment, Message, MessageBuilder, TransferEncoding};

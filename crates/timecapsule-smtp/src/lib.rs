//! # timecapsule-smtp
//!
//! A small SMTP submission client implementing the parts of RFC 5321 needed
//! to hand a finished message to a relay.
//!
//! ## Features
//!
//! - **Generic sessions**: [`Session`] runs over any buffered tokio stream,
//!   so the protocol logic is tested against scripted mocks
//! - **TLS support**: Both implicit TLS (port 465) and STARTTLS
//! - **Authentication**: PLAIN and LOGIN, with credential failures reported
//!   separately from transport failures
//! - **Deadlines**: [`SmtpTransport::send`] bounds the whole exchange
//!
//! ## Quick Start
//!
//! ```ignore
//! use timecapsule_smtp::{Address, Credentials, Security, SmtpTransport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> timecapsule_smtp::Result<()> {
//!     let transport = SmtpTransport::new(TransportConfig {
//!         host: "smtp.example.com".into(),
//!         port: 587,
//!         security: Security::StartTls,
//!         credentials: Some(Credentials::new("me@example.com", "app-password")),
//!         ..TransportConfig::default()
//!     });
//!
//!     let from = Address::new("me@example.com")?;
//!     let to = Address::new("you@example.com")?;
//!     transport
//!         .send(&from, &[to], b"Subject: Test\r\n\r\nHello, World!\r\n")
//!         .await
//! }
//! ```
//!
//! ## Session flow
//!
//! ```text
//! greet ─→ ehlo ─→ [starttls ─→ resume ─→ ehlo] ─→ [authenticate] ─→ send_mail ─→ quit
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod capabilities;
mod error;
pub mod reply;
mod session;
mod stream;
mod transport;

pub use capabilities::{Address, AuthMechanism, Capabilities, Extension};
pub use error::{Error, Result};
pub use reply::{Reply, ReplyCode};
pub use session::{Session, dot_stuff};
pub use stream::{SmtpStream, connect, connect_tls};
pub use transport::{Credentials, Security, SmtpTransport, TransportConfig};

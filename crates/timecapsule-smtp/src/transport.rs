//! One-shot message submission over a fresh connection.

use crate::capabilities::Address;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::stream::{SmtpStream, connect, connect_tls};
use std::fmt;
use std::time::Duration;

/// How long to wait for the reply to QUIT once the message is accepted.
const QUIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection security.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// Plain TCP. Only sensible for local relays and tests.
    None,
    /// Implicit TLS (usually port 465).
    Tls,
    /// Plain TCP upgraded with STARTTLS (usually port 587).
    #[default]
    StartTls,
}

/// Login credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username, usually the sender address.
    pub username: String,
    /// Password or app password.
    pub password: String,
}

impl Credentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where and how to submit mail.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Connection security.
    pub security: Security,
    /// Credentials; `None` skips AUTH.
    pub credentials: Option<Credentials>,
    /// Name sent with EHLO.
    pub hello_name: String,
    /// Deadline for the exchange up to the reply to the message data.
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".into(),
            port: 587,
            security: Security::StartTls,
            credentials: None,
            hello_name: "localhost".into(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Submits messages, opening one connection per message.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: TransportConfig,
}

impl SmtpTransport {
    /// Creates a transport.
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Connects, authenticates and submits `message` to `recipients`.
    ///
    /// The configured deadline covers everything up to the server's reply
    /// to the message data. Once the message is accepted, QUIT gets its own
    /// short deadline and its outcome is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the exchange exceeds the configured
    /// deadline, [`Error::AuthenticationFailed`] if the server rejects the
    /// credentials, and other variants for connection or protocol failures.
    pub async fn send(&self, from: &Address, recipients: &[Address], message: &[u8]) -> Result<()> {
        let deadline = self.config.timeout;
        let session = tokio::time::timeout(deadline, self.submit(from, recipients, message))
            .await
            .map_err(|_| Error::Timeout(deadline))??;

        match tokio::time::timeout(QUIT_TIMEOUT, session.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "QUIT failed after successful submission"),
            Err(_) => tracing::debug!("QUIT timed out after successful submission"),
        }
        Ok(())
    }

    async fn submit(
        &self,
        from: &Address,
        recipients: &[Address],
        message: &[u8],
    ) -> Result<Session<SmtpStream>> {
        let config = &self.config;
        tracing::debug!(host = %config.host, port = config.port, security = ?config.security, "connecting");

        let stream = match config.security {
            Security::Tls => connect_tls(&config.host, config.port).await?,
            Security::None | Security::StartTls => connect(&config.host, config.port).await?,
        };

        let mut session = Session::greet(stream).await?;
        session.ehlo(&config.hello_name).await?;

        if config.security == Security::StartTls {
            let stream: SmtpStream = session.starttls().await?;
            let stream = stream.upgrade_to_tls(&config.host).await?;
            session = Session::resume(stream);
            session.ehlo(&config.hello_name).await?;
        }

        if let Some(size) = session.capabilities().max_message_size()
            && size > 0
            && message.len() > size
        {
            return Err(Error::smtp_error(
                552,
                format!("message is {} bytes, server limit is {size}", message.len()),
            ));
        }

        if let Some(credentials) = &config.credentials {
            session
                .authenticate(&credentials.username, &credentials.password)
                .await?;
        }

        session.send_mail(from, recipients, message).await?;
        Ok(session)
    }
}

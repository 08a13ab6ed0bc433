//! Outbound delivery seam.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use timecapsule_smtp::{Address, Credentials, Security, TransportConfig};

use crate::config::{SmtpConfig, SmtpSecurity};

/// A finished message and its envelope.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Envelope sender.
    pub from: String,
    /// Envelope recipients.
    pub recipients: Vec<String>,
    /// Complete RFC 5322 message.
    pub bytes: Vec<u8>,
}

/// Why a delivery did not happen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The relay rejected the sender credentials.
    #[error("Email authentication failed. Check sender credentials. ({0})")]
    Auth(String),
    /// Connection, TLS or protocol failure.
    #[error("SMTP error: {0}")]
    Transport(String),
    /// The message could not be built.
    #[error("Could not compose message: {0}")]
    Compose(String),
}

/// Something that can hand a message to the outside world.
pub trait Transport: Send + Sync + 'static {
    /// Delivers one message.
    fn send(
        &self,
        message: &OutboundMessage,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// [`Transport`] over an SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    inner: timecapsule_smtp::SmtpTransport,
}

impl SmtpTransport {
    /// Builds a transport from configuration.
    #[must_use]
    pub fn from_config(config: &SmtpConfig) -> Self {
        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user.clone(), pass.clone())),
            _ => None,
        };
        let security = match config.security {
            SmtpSecurity::None => Security::None,
            SmtpSecurity::Tls => Security::Tls,
            SmtpSecurity::StartTls => Security::StartTls,
        };
        Self {
            inner: timecapsule_smtp::SmtpTransport::new(TransportConfig {
                host: config.host.clone(),
                port: config.port,
                security,
                credentials,
                hello_name: config.hello_name.clone(),
                timeout: Duration::from_secs(config.timeout_secs),
            }),
        }
    }
}

impl Transport for SmtpTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let from =
            Address::new(message.from.as_str()).map_err(|e| DeliveryError::Compose(e.to_string()))?;
        let recipients = message
            .recipients
            .iter()
            .map(|r| Address::new(r.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| DeliveryError::Compose(e.to_string()))?;

        self.inner
            .send(&from, &recipients, &message.bytes)
            .await
            .map_err(classify)
    }
}

fn classify(err: timecapsule_smtp::Error) -> DeliveryError {
    if err.is_auth_failure() {
        DeliveryError::Auth(err.to_string())
    } else {
        DeliveryError::Transport(err.to_string())
    }
}

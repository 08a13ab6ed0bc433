//! SMTP command/reply session.

use crate::capabilities::{Address, AuthMechanism, Capabilities};
use crate::error::{Error, Result};
use crate::reply::{Reply, ReplyCode, is_last_reply_line, parse_reply};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the number of lines in one reply.
const MAX_REPLY_LINES: usize = 128;

/// An SMTP session over any buffered duplex stream.
///
/// The session owns the stream; [`Session::starttls`] hands it back so the
/// caller can wrap it in TLS and continue with [`Session::resume`].
#[derive(Debug)]
pub struct Session<S> {
    stream: S,
    capabilities: Capabilities,
}

impl<S> Session<S>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    /// Reads the server greeting and starts a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the greeting cannot be read or is not a 220.
    pub async fn greet(stream: S) -> Result<Self> {
        let mut session = Self::resume(stream);
        let greeting = session.read_reply().await?;
        if greeting.code != ReplyCode::SERVICE_READY {
            return Err(greeting.into_error());
        }
        tracing::debug!(greeting = %greeting.message_text(), "SMTP server ready");
        Ok(session)
    }

    /// Continues a session on a stream whose greeting was already consumed,
    /// such as one just upgraded by STARTTLS.
    #[must_use]
    pub fn resume(stream: S) -> Self {
        Self {
            stream,
            capabilities: Capabilities::default(),
        }
    }

    /// Capabilities from the last EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Sends EHLO and records the advertised capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects EHLO.
    pub async fn ehlo(&mut self, client_hostname: &str) -> Result<()> {
        let reply = self.command(&format!("EHLO {client_hostname}")).await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }
        self.capabilities = Capabilities::from_ehlo(&reply.message);
        Ok(())
    }

    /// Issues STARTTLS and returns the raw stream for the TLS handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS is not advertised or the server refuses it.
    pub async fn starttls(mut self) -> Result<S> {
        if !self.capabilities.supports_starttls() {
            return Err(Error::NotSupported("STARTTLS".into()));
        }
        let reply = self.command("STARTTLS").await?;
        if reply.code != ReplyCode::SERVICE_READY {
            return Err(reply.into_error());
        }
        Ok(self.stream)
    }

    /// Authenticates with the best mechanism the server advertises.
    ///
    /// PLAIN is preferred over LOGIN. A server that advertises no AUTH line
    /// at all gets PLAIN.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if the server rejects the
    /// credentials and [`Error::NotSupported`] if no usable mechanism exists.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let mechanisms = self.capabilities.auth_mechanisms();
        let mechanism = if mechanisms.is_empty() || mechanisms.contains(&AuthMechanism::Plain) {
            AuthMechanism::Plain
        } else if mechanisms.contains(&AuthMechanism::Login) {
            AuthMechanism::Login
        } else {
            return Err(Error::NotSupported("AUTH PLAIN or LOGIN".into()));
        };

        match mechanism {
            AuthMechanism::Plain => self.auth_plain(username, password).await,
            AuthMechanism::Login => self.auth_login(username, password).await,
        }
    }

    /// Authenticates using the PLAIN mechanism.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<()> {
        let credentials = STANDARD.encode(format!("\0{username}\0{password}"));
        tracing::debug!(mechanism = "PLAIN", "authenticating");
        let reply = self
            .command_quiet(&format!("AUTH PLAIN {credentials}"))
            .await?;
        expect_auth_success(reply)
    }

    /// Authenticates using the LOGIN mechanism.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<()> {
        tracing::debug!(mechanism = "LOGIN", "authenticating");
        let reply = self.command("AUTH LOGIN").await?;
        if reply.code != ReplyCode::AUTH_CONTINUE {
            return expect_auth_success(reply);
        }

        let reply = self.command_quiet(&STANDARD.encode(username)).await?;
        if reply.code != ReplyCode::AUTH_CONTINUE {
            return expect_auth_success(reply);
        }

        let reply = self.command_quiet(&STANDARD.encode(password)).await?;
        expect_auth_success(reply)
    }

    /// Runs one mail transaction: MAIL FROM, RCPT TO for every recipient,
    /// then DATA with the dot-stuffed message.
    ///
    /// # Errors
    ///
    /// Returns an error if any step is rejected. A 530 in reply to MAIL FROM
    /// is reported as [`Error::AuthenticationFailed`].
    pub async fn send_mail(
        &mut self,
        from: &Address,
        recipients: &[Address],
        message: &[u8],
    ) -> Result<Reply> {
        if recipients.is_empty() {
            return Err(Error::InvalidAddress("No recipients".into()));
        }

        let reply = self.command(&format!("MAIL FROM:<{from}>")).await?;
        if !reply.is_success() {
            return Err(classify_auth(reply));
        }

        for to in recipients {
            let reply = self.command(&format!("RCPT TO:<{to}>")).await?;
            if !reply.is_success() {
                return Err(reply.into_error());
            }
        }

        let reply = self.command("DATA").await?;
        if reply.code != ReplyCode::START_DATA {
            return Err(reply.into_error());
        }

        self.stream.write_all(&dot_stuff(message)).await?;
        self.stream.flush().await?;

        let reply = self.read_reply().await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }
        tracing::debug!(reply = %reply.message_text(), "message accepted");
        Ok(reply)
    }

    /// Sends QUIT and closes the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the server does not answer QUIT.
    pub async fn quit(mut self) -> Result<()> {
        let reply = self.command("QUIT").await?;
        if reply.code != ReplyCode::CLOSING {
            return Err(reply.into_error());
        }
        Ok(())
    }

    /// Returns the underlying stream.
    #[must_use]
    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        tracing::trace!(command = line, "C:");
        self.command_quiet(line).await
    }

    /// Sends a command without tracing it (used for credentials).
    async fn command_quiet(&mut self, line: &str) -> Result<Reply> {
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.stream.read_line(&mut line).await? == 0 {
                return Err(Error::Protocol("Connection closed by server".into()));
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            tracing::trace!(line = %line, "S:");
            let last = is_last_reply_line(&line);
            lines.push(line);
            if last {
                break;
            }
            if lines.len() >= MAX_REPLY_LINES {
                return Err(Error::Protocol("Reply too long".into()));
            }
        }
        parse_reply(&lines)
    }
}

fn expect_auth_success(reply: Reply) -> Result<()> {
    if reply.code == ReplyCode::AUTH_SUCCESS {
        return Ok(());
    }
    if reply.code.as_u16() >= 500 {
        return Err(Error::AuthenticationFailed {
            code: reply.code.as_u16(),
            message: reply.message_text(),
        });
    }
    Err(reply.into_error())
}

/// 530 (authentication required), 534 (mechanism too weak) and 535 (bad
/// credentials) are credential problems.
fn classify_auth(reply: Reply) -> Error {
    match reply.code.as_u16() {
        530 | 534 | 535 => Error::AuthenticationFailed {
            code: reply.code.as_u16(),
            message: reply.message_text(),
        },
        _ => reply.into_error(),
    }
}

/// Applies RFC 5321 transparency: a leading `.` on any line is doubled,
/// and the payload is terminated with `CRLF . CRLF`.
#[must_use]
pub fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 16);
    let mut at_line_start = true;
    for &byte in message {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
    }
    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    fn addr(s: &str) -> Address {
        Address::new(s).unwrap()
    }

    #[test]
    fn test_dot_stuff() {
        assert_eq!(dot_stuff(b"a\r\n.b\r\n"), b"a\r\n..b\r\n.\r\n");
        assert_eq!(dot_stuff(b".first"), b"..first\r\n.\r\n");
        assert_eq!(dot_stuff(b"mid.dle\r\n"), b"mid.dle\r\n.\r\n");
        assert_eq!(dot_stuff(b""), b".\r\n");
    }

    #[tokio::test]
    async fn test_full_exchange_with_plain_auth() {
        let mock = Builder::new()
            .read(b"220 mx.example.com ESMTP ready\r\n")
            .write(b"EHLO client.local\r\n")
            .read(b"250-mx.example.com\r\n250-SIZE 1000\r\n250 AUTH LOGIN PLAIN\r\n")
            .write(b"AUTH PLAIN AHVzZXIAcGFzcw==\r\n")
            .read(b"235 2.7.0 Accepted\r\n")
            .write(b"MAIL FROM:<me@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<you@example.com>\r\n")
            .read(b"250 OK\r\n")
            .write(b"DATA\r\n")
            .read(b"354 Go ahead\r\n")
            .write(b"Subject: hi\r\n\r\n..dot\r\n.\r\n")
            .read(b"250 2.0.0 queued\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        session.ehlo("client.local").await.unwrap();
        assert_eq!(session.capabilities().max_message_size(), Some(1000));
        session.authenticate("user", "pass").await.unwrap();
        let reply = session
            .send_mail(
                &addr("me@example.com"),
                &[addr("you@example.com")],
                b"Subject: hi\r\n\r\n.dot\r\n",
            )
            .await
            .unwrap();
        assert_eq!(reply.message_text(), "2.0.0 queued");
        session.quit().await.unwrap();
    }

    #[tokio::test]
    async fn test_login_used_when_plain_missing() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"EHLO c\r\n")
            .read(b"250-srv\r\n250 AUTH LOGIN\r\n")
            .write(b"AUTH LOGIN\r\n")
            .read(b"334 VXNlcm5hbWU6\r\n")
            .write(b"dXNlcg==\r\n")
            .read(b"334 UGFzc3dvcmQ6\r\n")
            .write(b"cGFzcw==\r\n")
            .read(b"235 ok\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        session.ehlo("c").await.unwrap();
        session.authenticate("user", "pass").await.unwrap();
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_failure() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"EHLO c\r\n")
            .read(b"250-srv\r\n250 AUTH PLAIN\r\n")
            .write(b"AUTH PLAIN AHUAcA==\r\n")
            .read(b"535 5.7.8 Username and Password not accepted\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        session.ehlo("c").await.unwrap();
        let err = session.authenticate("u", "p").await.unwrap_err();
        assert!(err.is_auth_failure());
    }

    #[tokio::test]
    async fn test_mail_from_530_is_auth_failure() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"MAIL FROM:<a@b.c>\r\n")
            .read(b"530 5.7.0 Authentication Required\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        let err = session
            .send_mail(&addr("a@b.c"), &[addr("d@e.f")], b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed { code: 530, .. }));
    }

    #[tokio::test]
    async fn test_rejected_recipient() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"MAIL FROM:<a@b.c>\r\n")
            .read(b"250 OK\r\n")
            .write(b"RCPT TO:<d@e.f>\r\n")
            .read(b"550 5.1.1 No such user\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        let err = session
            .send_mail(&addr("a@b.c"), &[addr("d@e.f")], b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SmtpError { code: 550, .. }));
    }

    #[tokio::test]
    async fn test_starttls_requires_capability() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"EHLO c\r\n")
            .read(b"250 srv\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        session.ehlo("c").await.unwrap();
        assert!(matches!(
            session.starttls().await,
            Err(Error::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_starttls_returns_stream() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"EHLO c\r\n")
            .read(b"250-srv\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"220 2.0.0 Ready to start TLS\r\n")
            .build();

        let mut session = Session::greet(BufReader::new(mock)).await.unwrap();
        session.ehlo("c").await.unwrap();
        let _stream = session.starttls().await.unwrap();
    }

    #[tokio::test]
    async fn test_greeting_error_and_eof() {
        let mock = Builder::new().read(b"554 go away\r\n").build();
        assert!(matches!(
            Session::greet(BufReader::new(mock)).await,
            Err(Error::SmtpError { code: 554, .. })
        ));

        let mock = Builder::new().build();
        assert!(matches!(
            Session::greet(BufReader::new(mock)).await,
            Err(Error::Protocol(_))
        ));
    }
}

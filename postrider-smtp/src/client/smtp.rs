//! The SMTP client proper: plain or TLS-wrapped connection plus commands.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use super::error::{ClientError, Result};
use super::response::Response;

/// Initial read buffer size for replies.
const BUFFER_SIZE: usize = 8192;

/// Hard cap on reply size to bound a misbehaving server.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade(self, connector: &TlsConnector, server_name: &str) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let name = ServerName::try_from(server_name.to_string())
                    .map_err(|e| ClientError::Tls(format!("invalid server name: {e}")))?;
                let tls = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
                Ok(Self::Tls(Box::new(tls)))
            }
            Self::Tls(_) => Err(ClientError::Tls("connection is already TLS".to_string())),
        }
    }
}

/// An SMTP client session against one remote MTA.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    filled: usize,
    server_name: String,
}

impl SmtpClient {
    /// Connect to `addr` and wrap the stream.
    ///
    /// `server_name` is used for SNI on a later STARTTLS upgrade; pass the
    /// identity the remote cluster presents, not necessarily the MX host.
    ///
    /// # Errors
    ///
    /// Returns an error when the TCP connection fails.
    pub async fn connect(addr: &str, server_name: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_stream(stream, server_name))
    }

    /// Wrap an already-established stream, e.g. one dialed from a specific
    /// local source address.
    #[must_use]
    pub fn from_stream(stream: TcpStream, server_name: String) -> Self {
        Self {
            connection: Some(ClientConnection::Plain(stream)),
            buffer: vec![0u8; BUFFER_SIZE],
            filled: 0,
            server_name,
        }
    }

    /// Whether the connection has been upgraded to TLS.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Read the initial 220 greeting.
    ///
    /// # Errors
    ///
    /// Returns an error when reading or parsing fails.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Send one command line and read the reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        let data = format!("{command}\r\n");
        self.connection_mut()?.send(data.as_bytes()).await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Stream the message body after an accepted DATA, dot-stuffed and
    /// terminated with the final dot, then read the reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn send_data(&mut self, body: &str) -> Result<Response> {
        let payload = dot_stuff(body);
        let connection = self.connection_mut()?;
        connection.send(&payload).await?;
        connection.send(b".\r\n").await?;
        self.read_response().await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// # Errors
    ///
    /// Returns an error when the exchange fails at the transport level.
    pub async fn quit(&mut self) -> Result<Response> {
        self.command("QUIT").await
    }

    /// Issue STARTTLS and, on a 220, upgrade the stream with the given
    /// connector (carrying the sender's client certificate and CA pool).
    ///
    /// # Errors
    ///
    /// Returns an error when the command or the TLS handshake fails.
    pub async fn starttls(&mut self, connector: &TlsConnector) -> Result<Response> {
        let response = self.command("STARTTLS").await?;
        if response.is_success() {
            let connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            let server_name = self.server_name.clone();
            self.connection = Some(connection.upgrade(connector, &server_name).await?);
        }
        Ok(response)
    }

    fn connection_mut(&mut self) -> Result<&mut ClientConnection> {
        self.connection.as_mut().ok_or(ClientError::ConnectionClosed)
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) = Response::parse(&self.buffer[..self.filled])? {
                self.buffer.copy_within(consumed..self.filled, 0);
                self.filled -= consumed;
                return Ok(response);
            }

            if self.filled == self.buffer.len() {
                let grown = self.buffer.len() * 2;
                if grown > MAX_BUFFER_SIZE {
                    return Err(ClientError::Parse(format!(
                        "reply exceeds {MAX_BUFFER_SIZE} bytes"
                    )));
                }
                self.buffer.resize(grown, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.filled..]).await?;
            self.filled += n;
        }
    }
}

/// Escape leading dots per RFC 5321 §4.5.2 and normalise the final line
/// ending so the terminating dot sits on its own line.
fn dot_stuff(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 2);
    for line in body.split_inclusive('\n') {
        if line.starts_with('.') {
            out.push(b'.');
        }
        let text = line.strip_suffix('\n').map_or(line, |l| l.trim_end_matches('\r'));
        out.extend_from_slice(text.as_bytes());
        if line.ends_with('\n') {
            out.extend_from_slice(b"\r\n");
        }
    }
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}

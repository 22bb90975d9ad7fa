//! Outbound SMTP for relaying queued envelopes to a remote exchange
//!
//! One connection per message, no authentication, no retry. The message text
//! is sent exactly as it was received.

use crate::error::{RelayError, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Timeout for connecting and for each server response
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hands one message to one mail exchanger
#[async_trait::async_trait]
pub trait MailRelay: Send + Sync {
    async fn relay(&self, exchange: &str, from: &str, to: &str, data: &str) -> Result<()>;
}

/// Plain SMTP client speaking to `<exchange>:<port>`
///
/// # Examples
/// ```no_run
/// use relay_rs::smtp::{MailRelay, SmtpClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = SmtpClient::new("relay.example.com".to_string(), 25);
/// let body = "Subject: Test\r\n\r\nHello!\r\n";
/// client
///     .relay("mx.example.org", "sender@example.com", "rcpt@example.org", body)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SmtpClient {
    helo_name: String,
    port: u16,
}

impl SmtpClient {
    /// `helo_name` is announced in EHLO; empty means the machine's hostname
    pub fn new(helo_name: String, port: u16) -> Self {
        let helo_name = if helo_name.is_empty() {
            gethostname::gethostname().to_string_lossy().to_string()
        } else {
            helo_name
        };
        Self { helo_name, port }
    }

    async fn read_line<R>(&self, reader: &mut BufReader<R>) -> Result<String>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut line = String::new();
        let n = timeout(RESPONSE_TIMEOUT, reader.read_line(&mut line))
            .await
            .map_err(|_| RelayError::RelayDelivery("timed out waiting for server".to_string()))??;

        if n == 0 {
            return Err(RelayError::RelayDelivery("connection closed by server".to_string()));
        }
        Ok(line)
    }

    /// Read a possibly multi-line response and check its code
    async fn read_response<R>(&self, reader: &mut BufReader<R>, expected: &str) -> Result<String>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut full_response = String::new();

        loop {
            let line = self.read_line(reader).await?;
            debug!("< {}", line.trim());
            full_response.push_str(&line);

            // Last line has a space after the code
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                break;
            }
        }

        if !full_response.starts_with(expected) {
            error!("Unexpected response: {}", full_response.trim());
            return Err(RelayError::RelayDelivery(format!(
                "Expected {}, got: {}",
                expected,
                full_response.trim()
            )));
        }

        Ok(full_response)
    }

    async fn write_line<W>(&self, writer: &mut W, line: &str) -> Result<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        debug!("> {}", line);
        writer.write_all(format!("{}\r\n", line).as_bytes()).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl MailRelay for SmtpClient {
    async fn relay(&self, exchange: &str, from: &str, to: &str, data: &str) -> Result<()> {
        let server_addr = format!("{}:{}", exchange, self.port);
        info!("Relaying mail from {} to {} via {}", from, to, server_addr);

        let stream = timeout(RESPONSE_TIMEOUT, TcpStream::connect(&server_addr))
            .await
            .map_err(|_| {
                RelayError::RelayDelivery(format!("connect to {} timed out", server_addr))
            })??;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        self.read_response(&mut reader, "220").await?;

        self.write_line(&mut writer, &format!("EHLO {}", self.helo_name)).await?;
        self.read_response(&mut reader, "250").await?;

        self.write_line(&mut writer, &format!("MAIL FROM:<{}>", from)).await?;
        self.read_response(&mut reader, "250").await?;

        self.write_line(&mut writer, &format!("RCPT TO:<{}>", to)).await?;
        self.read_response(&mut reader, "250").await?;

        self.write_line(&mut writer, "DATA").await?;
        self.read_response(&mut reader, "354").await?;

        writer.write_all(data.as_bytes()).await?;
        if !data.is_empty() && !data.ends_with("\r\n") {
            writer.write_all(b"\r\n").await?;
        }
        writer.write_all(b".\r\n").await?;
        self.read_response(&mut reader, "250").await?;

        self.write_line(&mut writer, "QUIT").await?;
        // Some servers close without answering QUIT
        let _ = self.read_line(&mut reader).await;

        info!("Mail relayed to {} via {}", to, exchange);
        Ok(())
    }
}

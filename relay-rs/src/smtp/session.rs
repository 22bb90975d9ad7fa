use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::queue::{content_hash, EnqueueHandle, Envelope};
use crate::security::{Authenticator, TlsConfig};
use crate::smtp::commands::{trim_input, SmtpCommand};
use crate::utils::decode_header;
use chrono::Local;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive unrecognized commands tolerated before the session is dropped
const MAX_UNRECOGNIZED: usize = 3;

/// Plain or TLS transport, switchable mid-session by STARTTLS
enum SmtpStream<S> {
    Plain(S),
    Tls(TlsStream<S>),
    /// Placeholder while the handshake owns the plain stream
    Upgrading,
}

fn upgrading_error() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "stream is being upgraded to TLS",
    )
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SmtpStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SmtpStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

type SessionReader<S> = BufReader<SmtpStream<S>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greeting,
    Command,
    AwaitingUsername,
    AwaitingPassword,
    Data,
    TlsUpgrade,
}

/// What one bounded line read produced
enum LineRead {
    Line(String),
    Eof,
    TooLong,
}

/// Everything sessions share, built once by the server
pub struct SessionContext {
    pub config: Arc<Config>,
    pub tls: Option<TlsConfig>,
    pub authenticator: Authenticator,
    pub enqueue: EnqueueHandle,
    pub limiter: Arc<Semaphore>,
}

impl SessionContext {
    /// Sessions currently holding a slot
    fn active_sessions(&self) -> usize {
        self.config
            .smtp
            .max_sessions
            .saturating_sub(self.limiter.available_permits())
    }
}

/// Picks the `Subject:` header out of the DATA lines, folded lines included
#[derive(Debug, Default)]
struct SubjectScanner {
    subject: Option<String>,
    done: bool,
}

impl SubjectScanner {
    fn feed(&mut self, line: &str) {
        if self.done {
            return;
        }

        let content = line.trim_end_matches(|c| c == '\r' || c == '\n');
        if content.is_empty() {
            // End of headers
            self.done = true;
            return;
        }

        match self.subject.as_mut() {
            None => {
                let is_subject = content
                    .get(..9)
                    .map_or(false, |prefix| prefix.eq_ignore_ascii_case("SUBJECT: "));
                if is_subject {
                    self.subject = Some(content[9..].to_string());
                }
            }
            Some(subject) => {
                if content.starts_with(' ') || content.starts_with('\t') {
                    subject.push_str(&content[1..]);
                } else {
                    self.done = true;
                }
            }
        }
    }

    fn finish(self) -> String {
        self.subject.unwrap_or_default()
    }
}

/// One client connection, driven from greeting to close
pub struct SmtpSession {
    ctx: Arc<SessionContext>,
    client_id: u64,
    client_addr: String,
    state: SessionState,
    helo: String,
    mail_from: String,
    rcpt_to: String,
    data: String,
    subject: String,
    content_hash: String,
    username: String,
    password: String,
    authenticated: bool,
    consecutive_errors: usize,
    encrypted: bool,
    kill: CancellationToken,
}

impl SmtpSession {
    pub fn new(
        ctx: Arc<SessionContext>,
        client_id: u64,
        client_addr: String,
        kill: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            client_id,
            client_addr,
            state: SessionState::Greeting,
            helo: String::new(),
            mail_from: String::new(),
            rcpt_to: String::new(),
            data: String::new(),
            subject: String::new(),
            content_hash: String::new(),
            username: String::new(),
            password: String::new(),
            authenticated: false,
            consecutive_errors: 0,
            encrypted: false,
            kill,
        }
    }

    /// Run the session until QUIT, kill, timeout, EOF or a fatal error
    pub async fn handle<S>(mut self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut reader = BufReader::new(SmtpStream::Plain(stream));
        let result = self.process(&mut reader).await;

        // The peer may already be gone
        let _ = reader.get_mut().shutdown().await;
        debug!("Session {} closed", self.client_id);
        result
    }

    async fn process<S>(&mut self, reader: &mut SessionReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if self.kill.is_cancelled() {
                return Ok(());
            }

            match self.state {
                SessionState::Greeting => {
                    let greeting = self.greeting();
                    self.reply(reader, &greeting).await?;
                    self.state = SessionState::Command;
                }
                SessionState::Command => {
                    let limit = self.ctx.config.smtp.max_message_size;
                    let line = match self.read_line(reader, limit).await? {
                        LineRead::Line(line) => line,
                        LineRead::Eof => return Ok(()),
                        LineRead::TooLong => return self.size_exceeded(reader).await,
                    };
                    let input = trim_input(&line);
                    debug!("Session {} C: {}", self.client_id, input);

                    let response = self.handle_command(input)?;
                    self.reply(reader, &response).await?;
                }
                SessionState::AwaitingUsername => {
                    let Some(input) = self.read_credential(reader).await? else {
                        return Ok(());
                    };
                    self.username = Authenticator::decode_login_credential(&input)?;
                    self.state = SessionState::AwaitingPassword;
                    self.reply(reader, "334 UGFzc3dvcmQ6").await?;
                }
                SessionState::AwaitingPassword => {
                    let Some(input) = self.read_credential(reader).await? else {
                        return Ok(());
                    };
                    self.password = Authenticator::decode_login_credential(&input)?;
                    self.authenticated = self
                        .ctx
                        .authenticator
                        .authenticate(&self.username, &self.password)
                        .await;
                    self.password.clear();
                    self.state = SessionState::Command;

                    let response = if self.authenticated {
                        "235 Authentication succeeded"
                    } else {
                        "535 Authentication failed"
                    };
                    self.reply(reader, response).await?;
                }
                SessionState::Data => {
                    if !self.receive_data(reader).await? {
                        return Ok(());
                    }
                    let response = self.queue_message().await;
                    self.state = SessionState::Command;
                    self.reply(reader, &response).await?;
                }
                SessionState::TlsUpgrade => {
                    self.upgrade_tls(reader).await?;
                    self.state = SessionState::Command;
                }
            }
        }
    }

    fn greeting(&self) -> String {
        let server = &self.ctx.config.server;
        format!(
            "220 {} SMTP {} #{} ({}) {}",
            server.hostname,
            server.product,
            self.client_id,
            self.ctx.active_sessions(),
            Local::now().format("%a, %d %b %Y %H:%M:%S %z")
        )
    }

    fn starttls_available(&self) -> bool {
        self.ctx.tls.is_some() && !self.encrypted
    }

    /// Apply one command line and return the response to send
    ///
    /// Fails only when an AUTH LOGIN initial response is not valid base64.
    fn handle_command(&mut self, input: &str) -> Result<String> {
        let command = match SmtpCommand::parse(input) {
            SmtpCommand::StartTls if !self.starttls_available() => {
                SmtpCommand::Unknown(input.to_string())
            }
            command => command,
        };

        if !matches!(command, SmtpCommand::Unknown(_)) {
            self.consecutive_errors = 0;
        }

        let hostname = &self.ctx.config.server.hostname;
        let response = match command {
            SmtpCommand::Helo(domain) => {
                if let Some(domain) = domain {
                    self.helo = domain;
                }
                format!("250 {} Hello ", hostname)
            }
            SmtpCommand::Ehlo(domain) => {
                if let Some(domain) = domain {
                    self.helo = domain;
                }
                let mut lines = vec![
                    format!("250-{} Hello {}[{}]", hostname, self.helo, self.client_addr),
                    format!("250-SIZE {}", self.ctx.config.smtp.max_message_size),
                ];
                if self.starttls_available() {
                    lines.push("250-STARTTLS".to_string());
                }
                lines.push("250-AUTH LOGIN".to_string());
                lines.push("250 HELP".to_string());
                lines.join("\r\n")
            }
            SmtpCommand::MailFrom(from) => {
                self.mail_from = from;
                self.rcpt_to.clear();
                "250 Ok".to_string()
            }
            SmtpCommand::RcptTo(to) => {
                self.rcpt_to = to;
                "250 Accepted".to_string()
            }
            SmtpCommand::Xclient(addr) => {
                if let Some(addr) = addr {
                    debug!("Session {} client address is {}", self.client_id, addr);
                    self.client_addr = addr;
                }
                "250 OK".to_string()
            }
            SmtpCommand::Noop => "250 OK".to_string(),
            SmtpCommand::Rset => {
                self.mail_from.clear();
                self.rcpt_to.clear();
                "250 OK".to_string()
            }
            SmtpCommand::Data => {
                self.state = SessionState::Data;
                "354 Enter message, ending with \".\" on a line by itself".to_string()
            }
            SmtpCommand::StartTls => {
                self.state = SessionState::TlsUpgrade;
                "220 Ready to start TLS".to_string()
            }
            SmtpCommand::AuthLogin(Some(initial)) => {
                self.username = Authenticator::decode_login_credential(&initial)?;
                self.state = SessionState::AwaitingPassword;
                "334 UGFzc3dvcmQ6".to_string()
            }
            SmtpCommand::AuthLogin(None) => {
                self.state = SessionState::AwaitingUsername;
                "334 VXNlcm5hbWU6".to_string()
            }
            SmtpCommand::Quit => {
                self.kill.cancel();
                "221 Bye".to_string()
            }
            SmtpCommand::Unknown(_) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors > MAX_UNRECOGNIZED {
                    warn!(
                        "Session {}: too many unrecognized commands, closing",
                        self.client_id
                    );
                    self.kill.cancel();
                    "500 Too many unrecognized commands".to_string()
                } else {
                    "500 unrecognized command".to_string()
                }
            }
        };

        Ok(response)
    }

    /// Read lines up to the lone `.` terminator
    ///
    /// Returns false if the client went away first.
    async fn receive_data<S>(&mut self, reader: &mut SessionReader<S>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let max_size = self.ctx.config.smtp.max_message_size;
        let mut scanner = SubjectScanner::default();
        let mut received = 0usize;
        self.data.clear();

        loop {
            let remaining = max_size.saturating_sub(received);
            if remaining == 0 {
                self.size_exceeded(reader).await?;
            }

            let line = match self.read_line(reader, remaining).await? {
                LineRead::Line(line) => line,
                LineRead::Eof => return Ok(false),
                LineRead::TooLong => {
                    self.size_exceeded(reader).await?;
                    return Ok(false);
                }
            };
            received += line.len();

            if line == ".\r\n" || line == ".\n" {
                break;
            }
            scanner.feed(&line);
            self.data.push_str(&line);
        }

        self.subject = decode_header(&scanner.finish());
        debug!(
            "Session {} received {} bytes, subject {:?}",
            self.client_id,
            self.data.len(),
            self.subject
        );
        Ok(true)
    }

    /// Hand the finished transaction to the enqueue pool and wait for the outcome
    async fn queue_message(&mut self) -> String {
        self.content_hash = content_hash(&self.rcpt_to, &self.mail_from, &self.subject);

        let envelope = Envelope {
            from: self.mail_from.clone(),
            to: self.rcpt_to.clone(),
            data: std::mem::take(&mut self.data),
            subject: std::mem::take(&mut self.subject),
            username: self.username.clone(),
            authenticated: self.authenticated,
        };

        match self.ctx.enqueue.submit(envelope).await {
            Ok(()) => {
                info!("Session {} queued {}", self.client_id, self.content_hash);
                format!("250 OK : queued as {}", self.content_hash)
            }
            Err(e) => {
                warn!("Session {} transaction failed: {}", self.client_id, e);
                "554 Error: transaction failed, blame it on the weather".to_string()
            }
        }
    }

    async fn upgrade_tls<S>(&mut self, reader: &mut SessionReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let Some(tls) = self.ctx.tls.clone() else {
            return Ok(());
        };

        // Anything the client pipelined before the handshake is discarded
        let stream = std::mem::replace(reader, BufReader::new(SmtpStream::Upgrading)).into_inner();
        let plain = match stream {
            SmtpStream::Plain(plain) => plain,
            other => {
                *reader = BufReader::new(other);
                return Ok(());
            }
        };

        let handshake = tls.acceptor().accept(plain).into_fallible();
        match timeout(self.ctx.config.smtp.idle_timeout(), handshake).await {
            Ok(Ok(tls_stream)) => {
                *reader = BufReader::new(SmtpStream::Tls(tls_stream));
                self.encrypted = true;
                info!("Session {}: STARTTLS upgrade completed", self.client_id);
                Ok(())
            }
            Ok(Err((e, plain))) => {
                warn!(
                    "Session {}: TLS handshake failed, continuing unencrypted: {}",
                    self.client_id, e
                );
                *reader = BufReader::new(SmtpStream::Plain(plain));
                Ok(())
            }
            Err(_) => Err(RelayError::IdleTimeout),
        }
    }

    /// Read a credential line for AUTH LOGIN; `None` on EOF
    async fn read_credential<S>(&mut self, reader: &mut SessionReader<S>) -> Result<Option<String>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match self.read_line(reader, self.ctx.config.smtp.max_message_size).await? {
            LineRead::Line(line) => Ok(Some(trim_input(&line).to_string())),
            LineRead::Eof => Ok(None),
            LineRead::TooLong => {
                self.size_exceeded(reader).await?;
                Ok(None)
            }
        }
    }

    /// One line of at most `limit` bytes, bounded by the idle timeout
    async fn read_line<S>(&self, reader: &mut SessionReader<S>, limit: usize) -> Result<LineRead>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut buf = Vec::new();
        let mut limited = (&mut *reader).take(limit as u64);
        let read = limited.read_until(b'\n', &mut buf);

        let n = tokio::select! {
            _ = self.kill.cancelled() => return Ok(LineRead::Eof),
            result = timeout(self.ctx.config.smtp.idle_timeout(), read) => match result {
                Ok(n) => n?,
                Err(_) => {
                    debug!("Session {} idle timeout", self.client_id);
                    return Err(RelayError::IdleTimeout);
                }
            },
        };

        if n == 0 {
            return Ok(LineRead::Eof);
        }
        if buf.last() != Some(&b'\n') {
            // Either the cap was hit or the peer closed mid-line
            return Ok(if n >= limit { LineRead::TooLong } else { LineRead::Eof });
        }

        Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()))
    }

    async fn size_exceeded<S>(&self, reader: &mut SessionReader<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let max_size = self.ctx.config.smtp.max_message_size;
        warn!("Session {}: input exceeded {} bytes", self.client_id, max_size);
        self.reply(reader, "552 Error: maximum message size exceeded").await?;
        Err(RelayError::SizeLimitExceeded(max_size))
    }

    async fn reply<S>(&self, reader: &mut SessionReader<S>, response: &str) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        debug!("Session {} S: {}", self.client_id, response);

        let write = async {
            let stream = reader.get_mut();
            stream.write_all(response.as_bytes()).await?;
            stream.write_all(b"\r\n").await?;
            stream.flush().await
        };

        match timeout(self.ctx.config.smtp.idle_timeout(), write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RelayError::IdleTimeout),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }
}

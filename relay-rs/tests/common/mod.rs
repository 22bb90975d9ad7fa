//! Shared helpers: an in-process server on an ephemeral port and a raw line client

#![allow(dead_code)]

use relay_rs::config::Config;
use relay_rs::directory::{hash_password, Group, MemoryDirectory};
use relay_rs::error::{RelayError, Result};
use relay_rs::queue::{Envelope, MemoryQueue};
use relay_rs::security::TlsConfig;
use relay_rs::smtp::{MailRelay, SmtpServer};
use relay_rs::utils::{MxRecord, MxResolver};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const ALICE: &str = "alice@example.com";
pub const ALICE_PASSWORD: &str = "wonderland";

/// Resolves every domain to `mx.<domain>`
pub struct StubResolver;

#[async_trait::async_trait]
impl MxResolver for StubResolver {
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        if domain.ends_with(".invalid") {
            return Err(RelayError::RelayLookup(domain.to_string()));
        }
        Ok(vec![MxRecord {
            preference: 10,
            exchange: format!("mx.{}", domain),
        }])
    }
}

/// Records relayed messages as (exchange, from, to)
#[derive(Default)]
pub struct RecordingRelay {
    pub sent: Mutex<Vec<(String, String, String)>>,
}

#[async_trait::async_trait]
impl MailRelay for RecordingRelay {
    async fn relay(&self, exchange: &str, from: &str, to: &str, _data: &str) -> Result<()> {
        self.sent
            .lock()
            .await
            .push((exchange.to_string(), from.to_string(), to.to_string()));
        Ok(())
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub queue: Arc<MemoryQueue>,
    pub relay: Arc<RecordingRelay>,
    pub shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<Result<()>>,
}

impl TestServer {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }

    pub async fn queued(&self) -> Vec<Envelope> {
        self.queue
            .snapshot()
            .await
            .iter()
            .map(|payload| Envelope::from_json(payload).unwrap())
            .collect()
    }
}

/// Defaults tuned for tests: delivery effectively paused, short idle timeout
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.smtp.listen_addr = "127.0.0.1:0".to_string();
    config.smtp.idle_timeout_secs = 5;
    config.delivery.poll_interval_secs = 3600;
    config
}

pub fn test_directory() -> MemoryDirectory {
    let hash = hash_password(None, ALICE_PASSWORD).unwrap();
    let team = Group {
        manager: ALICE.to_string(),
        members: BTreeSet::from([ALICE.to_string(), "bob@example.com".to_string()]),
    };

    MemoryDirectory::new()
        .with_user(ALICE, "alice@inbox.example.net", Some(hash))
        .with_user("bob@example.com", "bob@mail.example.org", None)
        .with_group("team@example.com", team)
}

pub async fn start_server(config: Config) -> TestServer {
    start_server_with_tls(config, None).await
}

pub async fn start_server_with_tls(config: Config, tls: Option<TlsConfig>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let queue = Arc::new(MemoryQueue::new());
    let relay = Arc::new(RecordingRelay::default());

    let mut server = SmtpServer::new(config, Arc::new(test_directory()), queue.clone())
        .with_delivery(Arc::new(StubResolver), relay.clone());
    if let Some(tls) = tls {
        server = server.with_tls(tls);
    }

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { server.serve(listener, token).await });

    TestServer {
        addr,
        queue,
        relay,
        shutdown,
        handle,
    }
}

/// Line-oriented SMTP client that does not interpret replies
pub struct SmtpTestClient {
    stream: BufReader<TcpStream>,
}

impl SmtpTestClient {
    /// Hand the socket over, e.g. for a TLS handshake after STARTTLS
    pub fn into_stream(self) -> TcpStream {
        self.stream.into_inner()
    }

    /// Connect and return the client together with the greeting line
    pub async fn connect(addr: SocketAddr) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Self {
            stream: BufReader::new(stream),
        };
        let greeting = client.read_line().await;
        (client, greeting)
    }

    /// Connect without waiting for the greeting
    pub async fn connect_raw(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream: BufReader::new(stream),
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        let stream = self.stream.get_mut();
        stream.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// One reply line without its CRLF; empty string on EOF
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(10), self.stream.read_line(&mut line))
            .await
            .expect("server did not answer in time")
            .unwrap();
        line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()
    }

    /// Like `read_line`, but gives up after `wait`
    pub async fn try_read_line(&mut self, wait: Duration) -> Option<String> {
        let mut line = String::new();
        match tokio::time::timeout(wait, self.stream.read_line(&mut line)).await {
            Ok(Ok(_)) => Some(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()),
            _ => None,
        }
    }

    /// Read raw bytes until `needle` has been seen
    pub async fn read_until_contains(&mut self, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        while !seen.windows(needle.len()).any(|w| w == needle) {
            let mut chunk = Vec::new();
            let read = self.stream.read_until(b'\n', &mut chunk);
            let n = tokio::time::timeout(Duration::from_secs(10), read)
                .await
                .expect("server did not answer in time")
                .unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&chunk);
        }
        seen
    }

    pub async fn command(&mut self, line: &str) -> String {
        self.send_line(line).await;
        self.read_line().await
    }

    /// Read a multi-line reply (`250-...` continued until `250 ...`)
    pub async fn multiline(&mut self, line: &str) -> Vec<String> {
        self.send_line(line).await;
        let mut lines = Vec::new();
        loop {
            let reply = self.read_line().await;
            let last = reply.len() < 4 || reply.as_bytes()[3] == b' ';
            lines.push(reply);
            if last {
                return lines;
            }
        }
    }

    /// DATA, the message lines, the terminator; returns the final reply
    pub async fn data(&mut self, message: &str) -> String {
        let reply = self.command("DATA").await;
        assert!(reply.starts_with("354"), "DATA refused: {}", reply);
        for line in message.split("\r\n") {
            self.send_line(line).await;
        }
        self.command(".").await
    }
}

//! STARTTLS: advertisement, handshake failure, and a real client

mod common;

use common::{start_server_with_tls, test_config, SmtpTestClient, ALICE, ALICE_PASSWORD};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use relay_rs::security::TlsConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

fn tls() -> Option<TlsConfig> {
    Some(TlsConfig::self_signed("localhost").unwrap())
}

#[tokio::test]
async fn test_ehlo_advertises_starttls() {
    let server = start_server_with_tls(test_config(), tls()).await;
    let (mut client, _) = SmtpTestClient::connect(server.addr).await;

    let ehlo = client.multiline("EHLO client.test").await;
    assert!(ehlo.contains(&"250-STARTTLS".to_string()), "{:?}", ehlo);

    server.stop().await;
}

#[tokio::test]
async fn test_failed_handshake_falls_back_to_plaintext() {
    let server = start_server_with_tls(test_config(), tls()).await;
    let (mut client, _) = SmtpTestClient::connect(server.addr).await;

    assert_eq!(client.command("STARTTLS").await, "220 Ready to start TLS");
    client.send_line("hello there, this is not a ClientHello").await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The server may have written a TLS alert before going back to plaintext
    client.send_line("NOOP").await;
    let seen = client.read_until_contains(b"250 OK").await;
    assert!(seen.windows(6).any(|w| w == b"250 OK"));

    server.stop().await;
}

#[tokio::test]
async fn test_lettre_sends_over_starttls_with_auth() {
    let server = start_server_with_tls(test_config(), tls()).await;

    let parameters = TlsParameters::builder("localhost".to_string())
        .dangerous_accept_invalid_certs(true)
        .build()
        .unwrap();
    let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("127.0.0.1")
        .port(server.addr.port())
        .tls(Tls::Required(parameters))
        .credentials(Credentials::new(ALICE.to_string(), ALICE_PASSWORD.to_string()))
        .authentication(vec![Mechanism::Login])
        .timeout(Some(Duration::from_secs(10)))
        .build();

    let email = Message::builder()
        .from(ALICE.parse().unwrap())
        .to("friend@remote.org".parse().unwrap())
        .subject("Over TLS")
        .body("Sent through STARTTLS".to_string())
        .unwrap();

    let response = mailer.send(email).await.unwrap();
    assert!(response.is_positive());

    let queued = server.queued().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].from, format!("<{}>", ALICE));
    assert_eq!(queued[0].to, "<friend@remote.org>");
    assert_eq!(queued[0].subject, "Over TLS");
    assert!(queued[0].authenticated);
    assert_eq!(queued[0].username, ALICE);

    server.stop().await;
}

#[tokio::test]
async fn test_ehlo_after_upgrade_omits_starttls() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
    std::fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
    let tls = TlsConfig::from_pem_files(&cert_path, &key_path).unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(&rustls::Certificate(cert.serialize_der().unwrap()))
        .unwrap();
    let client_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let server = start_server_with_tls(test_config(), Some(tls)).await;
    let (mut client, _) = SmtpTestClient::connect(server.addr).await;
    client.multiline("EHLO client.test").await;
    assert_eq!(client.command("STARTTLS").await, "220 Ready to start TLS");

    let server_name = rustls::ServerName::try_from("localhost").unwrap();
    let stream = connector
        .connect(server_name, client.into_stream())
        .await
        .unwrap();
    let mut stream = BufReader::new(stream);

    stream.write_all(b"EHLO client.test\r\n").await.unwrap();
    stream.flush().await.unwrap();
    let mut ehlo = Vec::new();
    loop {
        let mut line = String::new();
        stream.read_line(&mut line).await.unwrap();
        let line = line.trim_end().to_string();
        let last = line.as_bytes().get(3) != Some(&b'-');
        ehlo.push(line);
        if last {
            break;
        }
    }
    assert!(!ehlo.contains(&"250-STARTTLS".to_string()), "{:?}", ehlo);
    assert!(ehlo.contains(&"250-AUTH LOGIN".to_string()), "{:?}", ehlo);

    // A second upgrade is not offered
    stream.write_all(b"STARTTLS\r\n").await.unwrap();
    stream.flush().await.unwrap();
    let mut reply = String::new();
    stream.read_line(&mut reply).await.unwrap();
    assert_eq!(reply.trim_end(), "500 unrecognized command");

    server.stop().await;
}

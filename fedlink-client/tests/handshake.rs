//! End-to-end handshake tests against a scripted TLS peer on localhost.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fedlink_client::{CloseReason, Session, SessionError, SessionOptions, TrustMaterial};
use fedlink_core::{
    FailureReason, FramingError, HandshakeState, LocalIdentity, Message, PeerEndpoint,
};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;
use zeroize::Zeroizing;

type PeerLines = Lines<BufReader<ReadHalf<TlsStream<TcpStream>>>>;
type PeerWriter = WriteHalf<TlsStream<TcpStream>>;

struct Fixture {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    peer: PeerEndpoint,
    trust: TrustMaterial,
    node_key: RsaPrivateKey,
    identity: LocalIdentity,
}

fn tls_identity() -> (String, Arc<ServerConfig>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![certified.cert.der().clone()], key)
    .unwrap();
    (certified.cert.pem(), Arc::new(config))
}

async fn fixture() -> Fixture {
    let (anchor_pem, server_config) = tls_identity();
    let node_key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
    let key_pem = node_key.to_pkcs1_pem(LineEnding::LF).unwrap();
    let trust = TrustMaterial::from_pem(
        anchor_pem.as_bytes(),
        Zeroizing::new(key_pem.as_bytes().to_vec()),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut peer = PeerEndpoint::new("127.0.0.1", port);
    peer.server_name = Some("localhost".to_string());

    Fixture {
        listener,
        acceptor: TlsAcceptor::from(server_config),
        peer,
        trust,
        node_key,
        identity: LocalIdentity::new(Uuid::new_v4()),
    }
}

async fn accept(listener: &TcpListener, acceptor: &TlsAcceptor) -> (PeerLines, PeerWriter) {
    let (tcp, _) = listener.accept().await.unwrap();
    let tls = acceptor.accept(tcp).await.unwrap();
    let (r, w) = tokio::io::split(tls);
    (BufReader::new(r).lines(), w)
}

fn encrypt_nonce(key: &RsaPrivateKey, nonce: &str) -> String {
    let public = RsaPublicKey::from(key);
    let block = public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha1>(), nonce.as_bytes())
        .unwrap();
    BASE64.encode(block)
}

/// Reads IAM, issues a challenge, reads the answer. Returns the two client lines.
async fn challenge_exchange(
    lines: &mut PeerLines,
    writer: &mut PeerWriter,
    key: &RsaPrivateKey,
    nonce: &str,
) -> Vec<String> {
    let iam = lines.next_line().await.unwrap().unwrap();
    writer
        .write_all(format!("CHALLENGE:{}\n", encrypt_nonce(key, nonce)).as_bytes())
        .await
        .unwrap();
    let answer = lines.next_line().await.unwrap().unwrap();
    vec![iam, answer]
}

fn options(timeout: Duration) -> SessionOptions {
    SessionOptions {
        handshake_timeout: timeout,
        ..SessionOptions::default()
    }
}

#[tokio::test]
async fn accepted_handshake_writes_iam_then_answer() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    let server = tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        let mut seen = challenge_exchange(&mut lines, &mut writer, &key, "7d3f0a9b").await;
        writer.write_all(b"AUTH:ACCEPTED\nSYNC:hello\n").await.unwrap();
        seen.push(lines.next_line().await.unwrap().unwrap());
        seen
    });

    let session = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(session.is_open());

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on_message(move |msg| {
        let _ = tx.send(msg.clone());
    });
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, Message::new("SYNC", "hello"));

    session.send("PING", "1").unwrap();
    let seen = server.await.unwrap();
    assert_eq!(
        seen,
        vec![
            format!("IAM:{}", f.identity),
            "CHALLENGE:7d3f0a9b".to_string(),
            "PING:1".to_string(),
        ]
    );
}

#[tokio::test]
async fn rejection_fails_and_closes_connection() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    let server = tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        challenge_exchange(&mut lines, &mut writer, &key, "nonce").await;
        writer.write_all(b"AUTH:REJECTED\n").await.unwrap();
        // The client must hang up on its own.
        match lines.next_line().await {
            Ok(None) | Err(_) => true,
            Ok(Some(_)) => false,
        }
    });

    let err = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(10)))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Handshake {
            reason: FailureReason::Rejected,
            ..
        }
    ));
    let closed = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn peer_hangup_after_iam_fails_with_closed() {
    let f = fixture().await;
    let (listener, acceptor) = (f.listener, f.acceptor);
    tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        lines.next_line().await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(4))),
    )
    .await
    .unwrap();
    assert!(matches!(
        result.err().unwrap(),
        SessionError::Handshake {
            reason: FailureReason::Closed,
            ..
        }
    ));
}

#[tokio::test]
async fn silent_peer_times_out() {
    let f = fixture().await;
    let (listener, acceptor) = (f.listener, f.acceptor);
    tokio::spawn(async move {
        let (mut lines, _writer) = accept(&listener, &acceptor).await;
        lines.next_line().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let err = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_millis(500)))
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Timeout {
            state: HandshakeState::AwaitingChallenge
        }
    ));
}

#[tokio::test]
async fn untrusted_certificate_is_transport_error() {
    let f = fixture().await;
    let (_, other_server) = tls_identity();
    let listener = f.listener;
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let _ = TlsAcceptor::from(other_server).accept(tcp).await;
    });

    let err = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(5)))
        .await
        .err()
        .unwrap();
    match err {
        SessionError::Handshake { reason, source } => {
            assert_eq!(reason, FailureReason::TransportError);
            assert!(source.is_some());
        }
        other => panic!("expected transport failure, got {:?}", other),
    }
}

#[tokio::test]
async fn post_auth_traffic_and_close() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    let server = tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        challenge_exchange(&mut lines, &mut writer, &key, "nonce").await;
        writer.write_all(b"AUTH:ACCEPTED\n").await.unwrap();
        writer.write_all(b"no delimiter\nSYNC:a\nSY").await.unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.write_all(b"NC:b\n").await.unwrap();
        writer.shutdown().await.unwrap();
    });

    let session = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(10)))
        .await
        .unwrap();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    session.on_error(move |err| {
        let _ = err_tx.send(err.to_string());
    });
    session.on_message(move |msg| {
        let _ = msg_tx.send(msg.clone());
    });

    let reason = tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Remote);
    server.await.unwrap();

    let mut messages = Vec::new();
    while let Ok(m) = msg_rx.try_recv() {
        messages.push(m);
    }
    assert_eq!(
        messages,
        vec![Message::new("SYNC", "a"), Message::new("SYNC", "b")]
    );
    assert!(!session.is_open());
    assert!(matches!(
        session.send("PING", "1"),
        Err(SessionError::State { .. })
    ));

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    session.on_closed(move |reason| {
        let _ = closed_tx.send(reason);
    });
    assert_eq!(closed_rx.try_recv().unwrap(), CloseReason::Remote);

    let mut errors = Vec::new();
    while let Ok(e) = err_rx.try_recv() {
        errors.push(e);
    }
    assert_eq!(errors, vec![FramingError::MissingDelimiter.to_string()]);
}

#[tokio::test]
async fn errors_in_accepting_chunk_reach_late_observer() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        challenge_exchange(&mut lines, &mut writer, &key, "nonce").await;
        writer
            .write_all(b"AUTH:ACCEPTED\nbroken\nSYNC:a\n")
            .await
            .unwrap();
        writer.shutdown().await.unwrap();
    });

    let session = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(10)))
        .await
        .unwrap();
    let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    session.on_error(move |err| {
        let _ = err_tx.send(matches!(
            err,
            SessionError::Framing(FramingError::MissingDelimiter)
        ));
    });
    session.on_message(move |msg| {
        let _ = msg_tx.send(msg.clone());
    });
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();

    assert_eq!(msg_rx.try_recv().unwrap(), Message::new("SYNC", "a"));
    assert!(msg_rx.try_recv().is_err());
    assert!(err_rx.try_recv().unwrap());
    assert!(err_rx.try_recv().is_err());
}

#[tokio::test]
async fn oversized_line_after_auth_closes_with_error() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        challenge_exchange(&mut lines, &mut writer, &key, "nonce").await;
        writer.write_all(b"AUTH:ACCEPTED\n").await.unwrap();
        let mut long = format!("SYNC:{}", "x".repeat(600)).into_bytes();
        long.push(b'\n');
        writer.write_all(&long).await.unwrap();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let opts = SessionOptions {
        max_line_len: 512,
        ..options(Duration::from_secs(10))
    };
    let session = Session::connect(&f.peer, &f.trust, f.identity, &opts)
        .await
        .unwrap();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    session.on_error(move |err| {
        let _ = err_tx.send(matches!(
            err,
            SessionError::Framing(FramingError::LineTooLong { .. })
        ));
    });
    let reason = tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Error);
    assert!(err_rx.try_recv().unwrap());
}

#[tokio::test]
async fn unrepresentable_timeout_does_not_panic() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        challenge_exchange(&mut lines, &mut writer, &key, "nonce").await;
        writer.write_all(b"AUTH:REJECTED\n").await.unwrap();
    });

    let forever = options(Duration::from_secs(u64::MAX));
    let err = Session::connect(&f.peer, &f.trust, f.identity, &forever)
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        SessionError::Handshake {
            reason: FailureReason::Rejected,
            ..
        }
    ));
}

#[tokio::test]
async fn send_after_local_close_is_state_error() {
    let f = fixture().await;
    let key = f.node_key.clone();
    let (listener, acceptor) = (f.listener, f.acceptor);
    tokio::spawn(async move {
        let (mut lines, mut writer) = accept(&listener, &acceptor).await;
        challenge_exchange(&mut lines, &mut writer, &key, "nonce").await;
        writer.write_all(b"AUTH:ACCEPTED\n").await.unwrap();
        while let Ok(Some(_)) = lines.next_line().await {}
    });

    let session = Session::connect(&f.peer, &f.trust, f.identity, &options(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(matches!(
        session.send("BAD:HEADER", "x"),
        Err(SessionError::Encode(_))
    ));
    session.close();
    assert!(matches!(
        session.send("PING", "1"),
        Err(SessionError::State { .. })
    ));
    let reason = tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Local);
}

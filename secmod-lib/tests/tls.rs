#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Client and server sockets talking over loopback.

mod common;

use common::*;
use secmod_lib::tls::{self, PeerAuth};
use secmod_lib::*;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

/// What the server side saw of one connection.
struct ServerOutcome {
    line: String,
    peer: Option<Certificate>,
    negotiated_host: Option<String>,
    handshakes: usize,
}

/// Listening server socket on an ephemeral loopback port.
fn listening_server(
    pki: &TestPki,
    db: CertDb,
    request: bool,
    require: bool,
) -> (SslSocket, SocketAddr) {
    tls::config_server_session_id_cache(64).unwrap();

    let mut server = SslSocket::new();
    server.set_certdb(db).unwrap();
    server.set_option(SslOption::RequestCertificate, request).unwrap();
    server.set_option(SslOption::RequireCertificate, require).unwrap();
    server
        .config_secure_server(&pki.server.cert, &pki.server.key)
        .unwrap();
    server.bind("127.0.0.1:0").unwrap();
    server.listen().unwrap();
    assert_eq!(server.state(), SocketState::Listening);
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Serve exactly one client in a background thread: complete the
/// handshake, read a line, answer `{line}`.
fn spawn_echo_server(
    pki: &TestPki,
    db: CertDb,
    request: bool,
    require: bool,
) -> (SocketAddr, JoinHandle<Result<ServerOutcome, SecmodError>>) {
    let (mut server, addr) = listening_server(pki, db, request, require);

    let handle = thread::spawn(move || {
        let mut child = server.accept(Some(TIMEOUT))?;
        let handshakes = Arc::new(AtomicUsize::new(0));
        let seen = handshakes.clone();
        child.set_handshake_callback(move |_sock| {
            seen.fetch_add(1, Ordering::SeqCst);
        })?;
        let result = child.force_handshake().and_then(|()| serve_one(&mut child));
        let _ = child.close();
        server.close()?;
        let (line, peer, negotiated_host) = result?;
        Ok(ServerOutcome {
            line,
            peer,
            negotiated_host,
            handshakes: handshakes.load(Ordering::SeqCst),
        })
    });
    (addr, handle)
}

fn serve_one(
    child: &mut SslSocket,
) -> Result<(String, Option<Certificate>, Option<String>), SecmodError> {
    let line = child.readline()?;
    let reply = format!("{{{}}}\n", line.trim_end());
    child.send(reply.as_bytes())?;
    child.shutdown()?;
    Ok((line, child.peer_certificate(), child.negotiated_host()))
}

fn client_socket(pki: &TestPki, hostname: &str) -> (SslSocket, Arc<AtomicUsize>) {
    let db = client_db(pki);
    let mut client = SslSocket::new();
    client.set_hostname(hostname).unwrap();
    client.set_certdb(db.clone()).unwrap();
    client
        .set_auth_certificate_callback(tls::auth_certificate_callback(db))
        .unwrap();
    let handshakes = Arc::new(AtomicUsize::new(0));
    let seen = handshakes.clone();
    client
        .set_handshake_callback(move |sock| {
            assert_eq!(sock.state(), SocketState::Established);
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    (client, handshakes)
}

// ---------------------------------------------------------------------------
// Successful exchanges
// ---------------------------------------------------------------------------

#[test]
fn echo_without_client_certificate() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), false, false);
    let (mut client, handshakes) = client_socket(&pki, "localhost");

    client.connect(addr, Some(TIMEOUT)).unwrap();
    assert_eq!(client.state(), SocketState::Established);
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(client.peer_certificate(), Some(pki.server.cert.clone()));
    assert_eq!(client.peer_name(), Some(addr));
    assert!(client.connection_info().is_some());

    assert_eq!(client.send(b"foo\n").unwrap(), 4);
    assert_eq!(client.readline().unwrap(), "{foo}\n");
    client.shutdown().unwrap();
    assert_eq!(client.state(), SocketState::ShuttingDown);
    client.close().unwrap();
    assert!(matches!(client.close(), Err(SecmodError::InvalidState(_))));

    // The handshake callback does not fire again after the handshake.
    assert_eq!(handshakes.load(Ordering::SeqCst), 1);

    let outcome = server.join().unwrap().unwrap();
    assert_eq!(outcome.line, "foo\n");
    assert_eq!(outcome.peer, None);
    assert_eq!(outcome.negotiated_host.as_deref(), Some("localhost"));
    assert_eq!(outcome.handshakes, 1);
    tls::clear_session_cache();
}

#[test]
fn mutual_authentication_with_named_certificate() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), true, true);
    let (mut client, _) = client_socket(&pki, "localhost");
    let db = client_db(&pki);
    client
        .set_client_auth_data_callback(tls::client_auth_data_callback(
            db,
            Some(CLIENT_NICKNAME.to_string()),
            None,
        ))
        .unwrap();

    client.connect(addr, Some(TIMEOUT)).unwrap();
    client.send(b"foo\n").unwrap();
    assert_eq!(client.readline().unwrap(), "{foo}\n");
    client.close().unwrap();

    let outcome = server.join().unwrap().unwrap();
    assert_eq!(outcome.peer, Some(pki.client.cert.clone()));
}

#[test]
fn mutual_authentication_selects_certificate_by_ca_name() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), true, true);
    let (mut client, _) = client_socket(&pki, "localhost");
    client
        .set_client_auth_data_callback(tls::client_auth_data_callback(client_db(&pki), None, None))
        .unwrap();

    client.connect(addr, Some(TIMEOUT)).unwrap();
    client.send(b"bar\n").unwrap();
    assert_eq!(client.readline().unwrap(), "{bar}\n");
    client.close().unwrap();

    let outcome = server.join().unwrap().unwrap();
    assert_eq!(outcome.peer, Some(pki.client.cert.clone()));
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

#[test]
fn client_certificate_from_unaccepted_ca_is_not_offered() {
    let pki = generate_pki();
    let other = generate_pki_named("secmod Other CA");
    let select = tls::client_auth_data_callback(client_db(&pki), None, None);

    let (cert, _) = select(&[pki.ca.cert.subject().clone()], None)
        .unwrap()
        .unwrap();
    assert_eq!(cert, pki.client.cert);
    assert!(select(&[other.ca.cert.subject().clone()], None)
        .unwrap()
        .is_none());

    let (addr, server) =
        spawn_echo_server(&pki, server_db_trusting(&pki, &other.ca.cert), true, true);
    let (mut client, _) = client_socket(&pki, "localhost");
    client.set_client_auth_data_callback(select).unwrap();

    let exchanged = client
        .connect(addr, Some(TIMEOUT))
        .and_then(|()| client.send(b"foo\n"))
        .and_then(|_| client.readline());
    if let Ok(line) = exchanged {
        assert_eq!(line, "");
    }
    // Declining to send a certificate is an answer, not a callback failure.
    assert_eq!(client.last_callback_error(), None);
    client.close().unwrap();

    let err = server.join().unwrap().err().unwrap();
    assert_eq!(err.code(), Some(errcode::SSL_ERROR_NO_CERTIFICATE));
}

#[test]
fn expired_client_certificate_is_skipped() {
    let pki = generate_pki();
    let db = CertDb::in_memory().unwrap();
    db.add_cert(&pki.ca.cert, Some(CA_NICKNAME), CertTrust::trusted_ca())
        .unwrap();
    db.add_cert(&pki.expired_client.cert, Some(EXPIRED_NICKNAME), CertTrust::default())
        .unwrap();
    db.add_key(&pki.expired_client.cert, &pki.expired_client.key, None)
        .unwrap();
    let ca_names = [pki.ca.cert.subject().clone()];
    let select = tls::client_auth_data_callback(db.clone(), None, None);

    assert!(pki.expired_client.cert.check_valid_times().is_err());
    assert!(select(&ca_names, None).unwrap().is_none());

    db.add_cert(&pki.client.cert, Some(CLIENT_NICKNAME), CertTrust::default())
        .unwrap();
    db.add_key(&pki.client.cert, &pki.client.key, None).unwrap();
    let (cert, key) = select(&ca_names, None).unwrap().unwrap();
    assert_eq!(cert, pki.client.cert);
    assert_eq!(key.der(), pki.client.key.der());
}

#[test]
fn no_ca_names_accepts_any_valid_certificate() {
    let pki = generate_pki();
    let select = tls::client_auth_data_callback(client_db(&pki), None, None);
    let (cert, _) = select(&[], None).unwrap().unwrap();
    assert_eq!(cert, pki.client.cert);
}

#[test]
fn hostname_mismatch_fails_the_handshake() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), false, false);
    let (mut client, handshakes) = client_socket(&pki, "not-localhost.example");

    let err = client.connect(addr, Some(TIMEOUT)).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SSL_ERROR_BAD_CERTIFICATE));
    assert_eq!(handshakes.load(Ordering::SeqCst), 0);
    // A plain rejection is not a callback failure.
    assert_eq!(client.last_callback_error(), None);
    client.close().unwrap();

    assert!(server.join().unwrap().is_err());
}

#[test]
fn server_requires_a_client_certificate() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), true, true);
    let (mut client, _) = client_socket(&pki, "localhost");

    // Under TLS 1.3 the client may only learn of the rejection once it reads.
    let exchanged = client
        .connect(addr, Some(TIMEOUT))
        .and_then(|()| client.send(b"foo\n"))
        .and_then(|_| client.readline());
    if let Ok(line) = exchanged {
        assert_eq!(line, "");
    }
    client.close().unwrap();

    let err = server.join().unwrap().err().unwrap();
    assert_eq!(err.code(), Some(errcode::SSL_ERROR_NO_CERTIFICATE));
}

#[test]
fn failing_auth_callback_is_recorded() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), false, false);
    let (mut client, _) = client_socket(&pki, "localhost");
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .set_auth_certificate_callback(Arc::new(
            move |peer: &PeerAuth<'_>, _check_sig: bool, is_server: bool| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert!(!is_server);
                assert_eq!(peer.hostname, Some("localhost"));
                Err(SecmodError::native_detail(
                    errcode::SEC_ERROR_UNTRUSTED_CERT,
                    "revoked by test",
                ))
            },
        ))
        .unwrap();

    let err = client.connect(addr, Some(TIMEOUT)).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SSL_ERROR_BAD_CERTIFICATE));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let recorded = client.last_callback_error().unwrap();
    assert!(recorded.contains("revoked by test"), "{}", recorded);
    client.close().unwrap();
    let _ = server.join().unwrap();
}

#[test]
fn panicking_auth_callback_rejects_the_peer() {
    let pki = generate_pki();
    let (addr, server) = spawn_echo_server(&pki, server_db(&pki), false, false);
    let (mut client, _) = client_socket(&pki, "localhost");
    client
        .set_auth_certificate_callback(Arc::new(|_: &PeerAuth<'_>, _: bool, _: bool| {
            panic!("callback blew up")
        }))
        .unwrap();

    let err = client.connect(addr, Some(TIMEOUT)).unwrap_err();
    assert_eq!(err.code(), Some(errcode::SSL_ERROR_BAD_CERTIFICATE));
    assert!(client.last_callback_error().is_some());
    client.close().unwrap();
    let _ = server.join().unwrap();
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Serve one client by sending `payload` and closing the connection.
fn spawn_sending_server(
    pki: &TestPki,
    payload: Vec<u8>,
) -> (SocketAddr, JoinHandle<Result<(), SecmodError>>) {
    let (mut server, addr) = listening_server(pki, server_db(pki), false, false);
    let handle = thread::spawn(move || {
        let mut child = server.accept(Some(TIMEOUT))?;
        child.force_handshake()?;
        child.send(&payload)?;
        child.shutdown()?;
        // Hold the transport open until the client hangs up.
        let _ = child.recv(1);
        child.close()?;
        server.close()
    });
    (addr, handle)
}

#[test]
fn oversized_line_is_an_error() {
    let pki = generate_pki();
    let payload = vec![b'x'; 70 * 1024];
    let (addr, server) = spawn_sending_server(&pki, payload.clone());
    let (mut client, _) = client_socket(&pki, "localhost");
    client.connect(addr, Some(TIMEOUT)).unwrap();

    let err = client.readline().unwrap_err();
    assert_eq!(err.code(), Some(errcode::PR_BUFFER_OVERFLOW_ERROR));

    // The buffered bytes are still there for recv.
    let mut received = Vec::new();
    loop {
        let chunk = client.recv(16 * 1024).unwrap();
        if chunk.is_empty() {
            break;
        }
        received.extend(chunk);
    }
    assert_eq!(received.len(), payload.len());
    assert_eq!(received, payload);
    client.close().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn records_are_split_on_newlines() {
    let pki = generate_pki();
    let payload = b"first\n\xff\xfe\nsecond\ntail".to_vec();
    let (addr, server) = spawn_sending_server(&pki, payload);
    let (mut client, _) = client_socket(&pki, "localhost");
    client.connect(addr, Some(TIMEOUT)).unwrap();

    assert_eq!(client.readline().unwrap(), "first\n");
    let err = client.readline().unwrap_err();
    assert_eq!(err.code(), Some(errcode::SEC_ERROR_BAD_DATA));
    assert_eq!(client.readline().unwrap(), "second\n");
    // Only the end of the stream yields a record without its terminator.
    assert_eq!(client.readline().unwrap(), "tail");
    assert_eq!(client.readline().unwrap(), "");
    client.close().unwrap();
    server.join().unwrap().unwrap();
}

#[test]
fn refused_connection_leaves_socket_connecting() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut client = SslSocket::new();
    client.set_hostname("localhost").unwrap();
    let err = client.connect(addr, Some(TIMEOUT)).unwrap_err();
    assert!(matches!(err, SecmodError::ConnectionFailed(_)), "{:?}", err);
    assert_eq!(client.state(), SocketState::Connecting);
    client.close().unwrap();
    assert_eq!(client.state(), SocketState::Closed);
}

#[test]
fn accept_times_out_without_a_client() {
    let pki = generate_pki();
    tls::config_server_session_id_cache(8).unwrap();
    let mut server = SslSocket::new();
    server
        .config_secure_server(&pki.server.cert, &pki.server.key)
        .unwrap();
    server.bind("127.0.0.1:0").unwrap();
    server.listen().unwrap();
    let err = server.accept(Some(Duration::from_millis(50))).unwrap_err();
    assert_eq!(err.code(), Some(errcode::PR_IO_TIMEOUT_ERROR));
    server.close().unwrap();
}

//! Callback-driven TLS sockets.
//!
//! An [`SslSocket`] owns one TCP transport and one rustls connection. The
//! handshake is driven synchronously on the calling thread; peer
//! certificate checks and client certificate selection are delegated to
//! the registered callbacks (see [`callbacks`]).
//!
//! ```text
//! Created -> Configured -> Connecting -> Handshaking -> Established
//!                       \-> Listening --accept--> (child) Handshaking
//! Established -> ShuttingDown -> Closed
//! ```
//!
//! Application data is framed by newlines when read with
//! [`SslSocket::readline`]; an empty or unterminated line means the peer
//! went away.

pub mod callbacks;
mod session;

pub use callbacks::{
    auth_certificate_callback, client_auth_data_callback, AuthCertificateCallback,
    ClientAuthDataCallback, HandshakeCallback, PeerAuth,
};
pub use session::{
    clear_session_cache, config_server_session_id_cache, shutdown_server_session_id_cache,
};

use crate::cert::{CertUsage, Certificate, PrivateKey};
use crate::certdb::CertDb;
use crate::context::{self, PinArg};
use crate::errcode::{
    self, NativeError, PR_BUFFER_OVERFLOW_ERROR, PR_INVALID_STATE_ERROR, PR_IO_TIMEOUT_ERROR,
    SEC_ERROR_BAD_DATA, SEC_ERROR_INVALID_ARGS, SEC_ERROR_LIBRARY_FAILURE, SSL_ERROR_BAD_CERTIFICATE, SSL_ERROR_BAD_CERT_ALERT,
    SSL_ERROR_HANDSHAKE_FAILURE_ALERT, SSL_ERROR_NO_CERTIFICATE, SSL_ERROR_NO_CYPHER_OVERLAP,
    SSL_ERROR_RX_MALFORMED_HANDSHAKE,
};
use crate::SecmodError;
use callbacks::{
    private_key_der, CallbackClientResolver, CallbackClientVerifier, CallbackServerVerifier,
    CallbackSlots,
};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use rustls::{AlertDescription, ClientConfig, ClientConnection, Connection, DistinguishedName};
use rustls::{ServerConfig, ServerConnection};
use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 16 * 1024;
const MAX_LINE: usize = 64 * 1024;

/// Lifecycle state of an [`SslSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocketState {
    Created,
    Configured,
    Connecting,
    Listening,
    Handshaking,
    Established,
    ShuttingDown,
    Closed,
}

/// Boolean socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslOption {
    HandshakeAsClient,
    HandshakeAsServer,
    /// Ask connecting clients for a certificate.
    RequestCertificate,
    /// Fail the handshake when a client presents no certificate.
    RequireCertificate,
}

#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub handshake_as_client: bool,
    pub handshake_as_server: bool,
    pub request_certificate: bool,
    pub require_certificate: bool,
    /// Applied to connect, accept and every blocking read or write.
    pub timeout: Option<Duration>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions {
            handshake_as_client: true,
            handshake_as_server: false,
            request_certificate: false,
            require_certificate: false,
            timeout: None,
        }
    }
}

/// Negotiated parameters of an established connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub protocol_version: String,
    pub cipher_suite: String,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol_version, self.cipher_suite)
    }
}

/// A TLS socket with pluggable trust callbacks.
pub struct SslSocket {
    state: SocketState,
    options: TlsOptions,
    slots: Arc<CallbackSlots>,
    handshake_callback: Option<HandshakeCallback>,
    server_identity: Option<(Certificate, PrivateKey)>,
    listener: Option<TcpListener>,
    stream: Option<TcpStream>,
    conn: Option<Connection>,
    peer_addr: Option<SocketAddr>,
    read_buf: Vec<u8>,
    handshake_reported: bool,
}

impl fmt::Debug for SslSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslSocket")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Default for SslSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl SslSocket {
    /// A fresh socket. The library's default certificate database, if
    /// initialised, backs the reference callbacks.
    pub fn new() -> Self {
        let slots = CallbackSlots::default();
        *slots.certdb.lock() = context::default_certdb().ok();
        SslSocket {
            state: SocketState::Created,
            options: TlsOptions::default(),
            slots: Arc::new(slots),
            handshake_callback: None,
            server_identity: None,
            listener: None,
            stream: None,
            conn: None,
            peer_addr: None,
            read_buf: Vec::new(),
            handshake_reported: false,
        }
    }

    // ── Configuration ───────────────────────────────────────────────────

    fn configure(&mut self) -> Result<(), SecmodError> {
        match self.state {
            SocketState::Created => {
                self.state = SocketState::Configured;
                Ok(())
            }
            SocketState::Closed => Err(invalid_state("socket is closed")),
            _ => Ok(()),
        }
    }

    pub fn set_option(&mut self, option: SslOption, on: bool) -> Result<(), SecmodError> {
        self.configure()?;
        match option {
            SslOption::HandshakeAsClient => self.options.handshake_as_client = on,
            SslOption::HandshakeAsServer => self.options.handshake_as_server = on,
            SslOption::RequestCertificate => self.options.request_certificate = on,
            SslOption::RequireCertificate => self.options.require_certificate = on,
        }
        Ok(())
    }

    pub fn options(&self) -> &TlsOptions {
        &self.options
    }

    /// Name the client expects in the server certificate; also sent as SNI.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<(), SecmodError> {
        self.configure()?;
        *self.slots.hostname.lock() = Some(hostname.to_string());
        Ok(())
    }

    pub fn hostname(&self) -> Option<String> {
        self.slots.hostname.lock().clone()
    }

    /// Opaque argument handed to password and auth callbacks.
    pub fn set_pkcs11_pin_arg(&mut self, pin_arg: PinArg) -> Result<(), SecmodError> {
        self.configure()?;
        *self.slots.pin_arg.lock() = Some(pin_arg);
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<(), SecmodError> {
        self.configure()?;
        self.options.timeout = timeout;
        if let Some(stream) = &self.stream {
            apply_timeout(stream, timeout)?;
        }
        Ok(())
    }

    /// Database consulted when no auth callback is registered and used to
    /// build CA hints and certificate chains.
    pub fn set_certdb(&mut self, certdb: CertDb) -> Result<(), SecmodError> {
        self.configure()?;
        *self.slots.certdb.lock() = Some(certdb);
        Ok(())
    }

    pub fn set_handshake_callback(
        &mut self,
        callback: impl FnMut(&SslSocket) + Send + 'static,
    ) -> Result<(), SecmodError> {
        self.configure()?;
        self.handshake_callback = Some(Box::new(callback));
        Ok(())
    }

    /// Register the peer certificate check. Without one, the check of
    /// [`auth_certificate_callback`] against the socket's database applies.
    pub fn set_auth_certificate_callback(
        &mut self,
        callback: AuthCertificateCallback,
    ) -> Result<(), SecmodError> {
        self.configure()?;
        *self.slots.auth_certificate.lock() = Some(callback);
        Ok(())
    }

    /// Register client certificate selection. Without one, the client
    /// never offers a certificate.
    pub fn set_client_auth_data_callback(
        &mut self,
        callback: ClientAuthDataCallback,
    ) -> Result<(), SecmodError> {
        self.configure()?;
        *self.slots.client_auth_data.lock() = Some(callback);
        Ok(())
    }

    /// Install the server certificate and key. The server session cache
    /// must already be configured.
    pub fn config_secure_server(
        &mut self,
        cert: &Certificate,
        key: &PrivateKey,
    ) -> Result<(), SecmodError> {
        self.configure()?;
        if session::server_cache().is_none() {
            return Err(invalid_state(
                "server session cache must be configured before a secure server",
            ));
        }
        rustls::crypto::ring::sign::any_supported_type(&private_key_der(key))
            .map_err(tls_error)?;
        self.server_identity = Some((cert.clone(), key.clone()));
        self.options.handshake_as_server = true;
        tracing::debug!(subject = %cert.subject(), "secure server configured");
        Ok(())
    }

    // ── Client side ─────────────────────────────────────────────────────

    /// Connect and complete the handshake. Transport failures leave the
    /// socket in `Connecting`; the caller still has to `close` it.
    pub fn connect(
        &mut self,
        addr: impl ToSocketAddrs,
        timeout: Option<Duration>,
    ) -> Result<(), SecmodError> {
        match self.state {
            SocketState::Created | SocketState::Configured | SocketState::Connecting => {}
            other => return Err(invalid_state(format!("cannot connect in state {:?}", other))),
        }
        if !self.options.handshake_as_client {
            return Err(invalid_state("socket is not set to handshake as client"));
        }
        self.state = SocketState::Connecting;
        let timeout = timeout.or(self.options.timeout);

        let addrs: Vec<SocketAddr> = addr
            .to_socket_addrs()
            .map_err(connect_failed)?
            .collect();
        let mut last_err = io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to");
        let mut connected = None;
        for candidate in addrs {
            let attempt = match timeout {
                Some(t) => TcpStream::connect_timeout(&candidate, t),
                None => TcpStream::connect(candidate),
            };
            match attempt {
                Ok(stream) => {
                    connected = Some((stream, candidate));
                    break;
                }
                Err(e) => {
                    tracing::debug!(addr = %candidate, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }
        let Some((stream, peer)) = connected else {
            return Err(connect_failed(last_err));
        };
        apply_timeout(&stream, self.options.timeout.or(timeout))?;

        let server_name = match self.hostname() {
            Some(host) => ServerName::try_from(host.clone()).map_err(|_| {
                SecmodError::native_detail(SEC_ERROR_INVALID_ARGS, format!("invalid hostname {}", host))
            })?,
            None => ServerName::IpAddress(peer.ip().into()),
        };
        let config = self.client_config()?;
        let conn = ClientConnection::new(Arc::new(config), server_name).map_err(tls_error)?;

        tracing::debug!(%peer, "connected; starting handshake");
        self.stream = Some(stream);
        self.peer_addr = Some(peer);
        self.conn = Some(Connection::Client(conn));
        self.state = SocketState::Handshaking;
        self.force_handshake()
    }

    fn client_config(&self) -> Result<ClientConfig, SecmodError> {
        let provider = provider();
        let mut config = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CallbackServerVerifier {
                slots: self.slots.clone(),
                provider,
            }))
            .with_client_cert_resolver(Arc::new(CallbackClientResolver {
                slots: self.slots.clone(),
            }));
        config.resumption = Resumption::store(session::client_cache());
        Ok(config)
    }

    // ── Server side ─────────────────────────────────────────────────────

    /// Bind the listening address. `listen` then starts accepting.
    pub fn bind(&mut self, addr: impl ToSocketAddrs) -> Result<(), SecmodError> {
        self.configure()?;
        if self.listener.is_some() {
            return Err(invalid_state("socket is already bound"));
        }
        let listener = TcpListener::bind(addr).map_err(connect_failed)?;
        tracing::debug!(addr = ?listener.local_addr().ok(), "bound");
        self.listener = Some(listener);
        Ok(())
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, SecmodError> {
        match (&self.listener, &self.stream) {
            (Some(listener), _) => Ok(listener.local_addr()?),
            (None, Some(stream)) => Ok(stream.local_addr()?),
            (None, None) => Err(invalid_state("socket is not bound or connected")),
        }
    }

    pub fn listen(&mut self) -> Result<(), SecmodError> {
        if self.listener.is_none() {
            return Err(invalid_state("listen before bind"));
        }
        if self.server_identity.is_none() {
            return Err(invalid_state("listen without a configured server certificate"));
        }
        self.state = SocketState::Listening;
        Ok(())
    }

    /// Accept one client. The child socket is in `Handshaking` and finishes
    /// the handshake on its first read or write (or `force_handshake`).
    pub fn accept(&mut self, timeout: Option<Duration>) -> Result<SslSocket, SecmodError> {
        if self.state != SocketState::Listening {
            return Err(invalid_state(format!("cannot accept in state {:?}", self.state)));
        }
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| invalid_state("socket is not bound"))?;
        let (stream, peer) = match timeout.or(self.options.timeout) {
            None => listener.accept().map_err(connect_failed)?,
            Some(t) => accept_within(listener, t)?,
        };
        apply_timeout(&stream, self.options.timeout)?;

        let slots = Arc::new(CallbackSlots::inherit(&self.slots));
        let config = self.server_config(&slots)?;
        let conn = ServerConnection::new(Arc::new(config)).map_err(tls_error)?;
        tracing::debug!(%peer, "accepted connection");

        Ok(SslSocket {
            state: SocketState::Handshaking,
            options: TlsOptions {
                handshake_as_client: false,
                handshake_as_server: true,
                ..self.options.clone()
            },
            slots,
            handshake_callback: None,
            server_identity: self.server_identity.clone(),
            listener: None,
            stream: Some(stream),
            conn: Some(Connection::Server(conn)),
            peer_addr: Some(peer),
            read_buf: Vec::new(),
            handshake_reported: false,
        })
    }

    fn server_config(&self, slots: &Arc<CallbackSlots>) -> Result<ServerConfig, SecmodError> {
        let (cert, key) = self
            .server_identity
            .as_ref()
            .ok_or_else(|| invalid_state("no server certificate configured"))?;
        let cache = session::server_cache()
            .ok_or_else(|| invalid_state("server session cache is not configured"))?;
        let provider = provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?;
        let builder = if self.options.request_certificate || self.options.require_certificate {
            let hints = slots
                .certdb
                .lock()
                .as_ref()
                .map(|db| {
                    db.trusted_cas(CertUsage::SSL_CLIENT)
                        .iter()
                        .map(|ca| DistinguishedName::from(ca.subject_raw().to_vec()))
                        .collect()
                })
                .unwrap_or_default();
            builder.with_client_cert_verifier(Arc::new(CallbackClientVerifier {
                slots: slots.clone(),
                provider,
                mandatory: self.options.require_certificate,
                hints,
            }))
        } else {
            builder.with_no_client_auth()
        };
        let mut config = builder
            .with_single_cert(slots.chain_for(cert), private_key_der(key))
            .map_err(tls_error)?;
        config.session_storage = cache;
        Ok(config)
    }

    // ── Handshake ───────────────────────────────────────────────────────

    /// Complete a pending handshake now. A no-op once established.
    pub fn force_handshake(&mut self) -> Result<(), SecmodError> {
        match self.state {
            SocketState::Handshaking => {}
            SocketState::Established => return Ok(()),
            other => return Err(invalid_state(format!("no handshake in state {:?}", other))),
        }
        let (conn, stream) = self.io_parts()?;
        if let Err(e) = drive_handshake(conn, stream) {
            tracing::warn!(error = %e, peer = ?self.peer_addr, "handshake failed");
            return Err(e);
        }
        self.state = SocketState::Established;
        tracing::debug!(
            peer = ?self.peer_addr,
            info = ?self.connection_info(),
            "handshake complete"
        );
        if !self.handshake_reported {
            self.handshake_reported = true;
            if let Some(mut callback) = self.handshake_callback.take() {
                callback(self);
                self.handshake_callback = Some(callback);
            }
        }
        Ok(())
    }

    fn io_parts(&mut self) -> Result<(&mut Connection, &mut TcpStream), SecmodError> {
        match (self.conn.as_mut(), self.stream.as_mut()) {
            (Some(conn), Some(stream)) => Ok((conn, stream)),
            _ => Err(invalid_state("socket has no connection")),
        }
    }

    fn ensure_established(&mut self) -> Result<(), SecmodError> {
        match self.state {
            SocketState::Established | SocketState::ShuttingDown => Ok(()),
            SocketState::Handshaking => self.force_handshake(),
            other => Err(invalid_state(format!("no connection in state {:?}", other))),
        }
    }

    // ── Data ────────────────────────────────────────────────────────────

    /// Send `data`, completing the handshake first if needed.
    pub fn send(&mut self, data: &[u8]) -> Result<usize, SecmodError> {
        self.ensure_established()?;
        let (conn, stream) = self.io_parts()?;
        conn.writer().write_all(data)?;
        flush_tls(conn, stream)?;
        Ok(data.len())
    }

    /// Up to `max` bytes of application data. An empty result means the
    /// peer closed the connection.
    pub fn recv(&mut self, max: usize) -> Result<Vec<u8>, SecmodError> {
        self.ensure_established()?;
        if self.read_buf.is_empty() {
            self.fill_read_buf()?;
        }
        let take = max.min(self.read_buf.len());
        Ok(self.read_buf.drain(..take).collect())
    }

    /// One newline-terminated record, terminator included. A result that is
    /// empty or lacks the terminator means the connection was lost.
    ///
    /// A record longer than 64 KiB fails with `PR_BUFFER_OVERFLOW_ERROR` and
    /// leaves the buffered bytes for `recv`. A record that is not UTF-8 is
    /// consumed and fails with `SEC_ERROR_BAD_DATA`.
    pub fn readline(&mut self) -> Result<String, SecmodError> {
        self.ensure_established()?;
        loop {
            if let Some(pos) = self.read_buf.iter().take(MAX_LINE).position(|b| *b == b'\n') {
                let line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                return line_to_string(line);
            }
            if self.read_buf.len() >= MAX_LINE {
                return Err(SecmodError::native_detail(
                    PR_BUFFER_OVERFLOW_ERROR,
                    format!("line exceeds {} bytes", MAX_LINE),
                ));
            }
            if self.fill_read_buf()? == 0 {
                let rest = std::mem::take(&mut self.read_buf);
                if !rest.is_empty() {
                    tracing::debug!(len = rest.len(), "returning unterminated line at end of stream");
                }
                return line_to_string(rest);
            }
        }
    }

    /// Read more plaintext into the buffer. Returns 0 at end of stream.
    fn fill_read_buf(&mut self) -> Result<usize, SecmodError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let (Some(conn), Some(stream)) = (self.conn.as_mut(), self.stream.as_mut()) else {
            return Err(invalid_state("socket has no connection"));
        };
        loop {
            match conn.reader().read(&mut chunk) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    let data = chunk.get(..n).unwrap_or_default();
                    self.read_buf.extend_from_slice(data);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("peer closed without close_notify");
                    return Ok(0);
                }
                Err(e) => return Err(e.into()),
            }
            let n = match conn.read_tls(stream) {
                Ok(n) => n,
                Err(e) if is_disconnect(&e) => return Ok(0),
                Err(e) => return Err(io_error(e)),
            };
            if n == 0 {
                return Ok(0);
            }
            if let Err(e) = conn.process_new_packets() {
                let _ = flush_tls(conn, stream);
                return Err(tls_error(e));
            }
            flush_tls(conn, stream)?;
        }
    }

    /// Send close_notify and stop writing. Reads still drain what the peer
    /// sent.
    pub fn shutdown(&mut self) -> Result<(), SecmodError> {
        match self.state {
            SocketState::Established | SocketState::Handshaking => {}
            other => return Err(invalid_state(format!("cannot shut down in state {:?}", other))),
        }
        let (conn, stream) = self.io_parts()?;
        conn.send_close_notify();
        flush_tls(conn, stream)?;
        if let Err(e) = stream.shutdown(Shutdown::Write) {
            tracing::debug!(error = %e, "transport shutdown");
        }
        self.state = SocketState::ShuttingDown;
        Ok(())
    }

    /// Release the socket. Closing twice fails with `InvalidState`.
    pub fn close(&mut self) -> Result<(), SecmodError> {
        if self.state == SocketState::Closed {
            return Err(invalid_state("socket is already closed"));
        }
        if self.state == SocketState::Established {
            if let Ok((conn, stream)) = self.io_parts() {
                conn.send_close_notify();
                if let Err(e) = flush_tls(conn, stream) {
                    tracing::debug!(error = %e, "close_notify not delivered");
                }
            }
        }
        self.conn = None;
        self.stream = None;
        self.listener = None;
        self.read_buf.clear();
        self.state = SocketState::Closed;
        tracing::debug!(peer = ?self.peer_addr, "socket closed");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// The certificate the peer presented, if any.
    pub fn peer_certificate(&self) -> Option<Certificate> {
        let from_conn = self
            .conn
            .as_ref()
            .and_then(|c| c.peer_certificates())
            .and_then(|chain| chain.first())
            .and_then(|der| Certificate::from_der(der.as_ref()).ok());
        from_conn.or_else(|| self.slots.peer_chain.lock().first().cloned())
    }

    /// Transport address of the peer.
    pub fn peer_name(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Server side: the SNI name the client asked for. Client side: the
    /// configured hostname.
    pub fn negotiated_host(&self) -> Option<String> {
        match &self.conn {
            Some(Connection::Server(s)) => s.server_name().map(str::to_string),
            _ => self.hostname(),
        }
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        let conn = self.conn.as_ref()?;
        let protocol_version = conn.protocol_version()?;
        let suite = conn.negotiated_cipher_suite()?;
        Some(ConnectionInfo {
            protocol_version: format!("{:?}", protocol_version),
            cipher_suite: format!("{:?}", suite.suite()),
        })
    }

    /// Message of the most recent callback failure on this socket.
    pub fn last_callback_error(&self) -> Option<String> {
        self.slots.last_error.lock().clone()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn invalid_state(detail: impl Into<String>) -> SecmodError {
    let detail = detail.into();
    tracing::debug!(code = PR_INVALID_STATE_ERROR, %detail, "invalid socket state");
    SecmodError::InvalidState(detail)
}

fn line_to_string(line: Vec<u8>) -> Result<String, SecmodError> {
    String::from_utf8(line).map_err(|e| {
        SecmodError::native_detail(SEC_ERROR_BAD_DATA, format!("record is not UTF-8: {}", e.utf8_error()))
    })
}

fn connect_failed(e: io::Error) -> SecmodError {
    SecmodError::ConnectionFailed(
        NativeError::new(errcode::from_io_kind(e.kind())).with_detail(e.to_string()),
    )
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

fn io_error(e: io::Error) -> SecmodError {
    if is_disconnect(&e) {
        SecmodError::LostConnection(e.to_string())
    } else {
        SecmodError::Native(NativeError::new(errcode::from_io_kind(e.kind())).with_detail(e.to_string()))
    }
}

/// Map a rustls failure onto the closest `SSL_ERROR_*` code.
fn tls_error(e: rustls::Error) -> SecmodError {
    let code = match &e {
        rustls::Error::InvalidCertificate(_) => SSL_ERROR_BAD_CERTIFICATE,
        rustls::Error::AlertReceived(AlertDescription::BadCertificate)
        | rustls::Error::AlertReceived(AlertDescription::CertificateRequired)
        | rustls::Error::AlertReceived(AlertDescription::UnknownCA) => SSL_ERROR_BAD_CERT_ALERT,
        rustls::Error::AlertReceived(AlertDescription::HandshakeFailure) => {
            SSL_ERROR_HANDSHAKE_FAILURE_ALERT
        }
        rustls::Error::NoCertificatesPresented => SSL_ERROR_NO_CERTIFICATE,
        rustls::Error::PeerIncompatible(_) => SSL_ERROR_NO_CYPHER_OVERLAP,
        rustls::Error::InvalidMessage(_) => SSL_ERROR_RX_MALFORMED_HANDSHAKE,
        _ => SEC_ERROR_LIBRARY_FAILURE,
    };
    SecmodError::native_detail(code, e.to_string())
}

fn apply_timeout(stream: &TcpStream, timeout: Option<Duration>) -> Result<(), SecmodError> {
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)?;
    Ok(())
}

fn accept_within(
    listener: &TcpListener,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), SecmodError> {
    let deadline = Instant::now() + timeout;
    listener.set_nonblocking(true)?;
    let accepted = loop {
        match listener.accept() {
            Ok(pair) => break Ok(pair),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    break Err(SecmodError::ConnectionFailed(
                        NativeError::new(PR_IO_TIMEOUT_ERROR).with_detail("accept timed out"),
                    ));
                }
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => break Err(connect_failed(e)),
        }
    };
    listener.set_nonblocking(false)?;
    let (stream, peer) = accepted?;
    stream.set_nonblocking(false)?;
    Ok((stream, peer))
}

fn flush_tls(conn: &mut Connection, stream: &mut TcpStream) -> Result<(), SecmodError> {
    while conn.wants_write() {
        conn.write_tls(stream).map_err(io_error)?;
    }
    stream.flush().map_err(io_error)
}

/// Exchange records until the handshake is done. Alerts we generate are
/// flushed before the error is returned.
fn drive_handshake(conn: &mut Connection, stream: &mut TcpStream) -> Result<(), SecmodError> {
    while conn.is_handshaking() {
        flush_tls(conn, stream)?;
        if !conn.is_handshaking() {
            break;
        }
        let n = conn.read_tls(stream).map_err(io_error)?;
        if n == 0 {
            return Err(SecmodError::LostConnection(
                "peer closed the connection during the handshake".into(),
            ));
        }
        if let Err(e) = conn.process_new_packets() {
            let _ = flush_tls(conn, stream);
            return Err(tls_error(e));
        }
    }
    flush_tls(conn, stream)
}

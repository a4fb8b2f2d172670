// Copyright (C) 2025 Panelhost, Inc.
// SPDX-License-Identifier: Apache-2.0
//! QUIC client for the console service.
//!
//! The channel is mutual-TLS: the client presents the account keypair and the
//! account identity is carried by the client certificate, so server
//! certificates are not verified. TLS is pinned to 1.3 with P-384 key
//! exchange and AES-256-GCM.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quinn::{ClientConfig, Connection, Endpoint, TransportConfig};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::frame::{FrameError, FrameKind, FrameReader, FrameWriter, Inbound};
use crate::wire::{RequestMessage, RpcRequest, RpcResponse};

/// Errors that can occur in the QUIC client
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("write error: {0}")]
    Write(#[from] quinn::WriteError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed: {0}")]
    ClosedStream(#[from] quinn::ClosedStream),

    #[error("no connection established")]
    NotConnected,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("cannot resolve console address: {0}")]
    Resolve(String),

    #[error("connection timed out after {0}ms")]
    Timeout(u64),

    #[error("console fault: [{code}] {message}")]
    ErrorFrame { code: String, message: String },

    #[error("stream closed by console")]
    StreamClosed,
}

/// Coarse channel state used by the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No connection and no attempt in flight.
    Idle,
    /// A dial is in progress.
    Connecting,
    /// A live connection exists.
    Ready,
    /// The last dial failed; a retry may succeed.
    TransientFailure,
    /// The endpoint was closed; no further dials will be made.
    Shutdown,
}

/// Configuration for the QUIC client
#[derive(Debug, Clone)]
pub struct ConsoleClientConfig {
    /// Console host (DNS name or IP)
    pub server_host: String,
    /// Console port
    pub server_port: u16,
    /// Client certificate chain (PEM)
    pub cert_pem: Vec<u8>,
    /// Client private key (PEM)
    pub key_pem: Vec<u8>,
    /// Keep-alive ping interval in milliseconds (0 to disable)
    pub keep_alive_interval_ms: u64,
    /// Grace period after a ping before the connection is considered dead.
    /// The QUIC idle timeout is the ping interval plus this value.
    pub keep_alive_timeout_ms: u64,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for ConsoleClientConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 7632,
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            keep_alive_interval_ms: 10_000,
            keep_alive_timeout_ms: 5_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ConsoleClientConfig {
    /// Effective QUIC idle timeout: a peer that misses one ping by the
    /// grace period is dead.
    fn idle_timeout_ms(&self) -> u64 {
        self.keep_alive_interval_ms + self.keep_alive_timeout_ms
    }
}

/// QUIC client for communicating with the console service
pub struct ConsoleClient {
    endpoint: Endpoint,
    connection: Mutex<Option<Connection>>,
    config: ConsoleClientConfig,
    closed: AtomicBool,
    connecting: AtomicBool,
    dial_failed: AtomicBool,
}

impl ConsoleClient {
    /// Create a new client with the given configuration
    pub fn new(config: ConsoleClientConfig) -> Result<Self, ClientError> {
        let mut endpoint = Endpoint::client("0.0.0.0:0".parse().unwrap())?;

        let client_config = Self::build_client_config(&config)?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            connection: Mutex::new(None),
            config,
            closed: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            dial_failed: AtomicBool::new(false),
        })
    }

    fn build_client_config(config: &ConsoleClientConfig) -> Result<ClientConfig, ClientError> {
        let cert_chain = rustls_pemfile::certs(&mut config.cert_pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Tls(format!("failed to parse client certificate: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(ClientError::Tls("no client certificate found".to_string()));
        }
        let key = rustls_pemfile::private_key(&mut config.key_pem.as_slice())
            .map_err(|e| ClientError::Tls(format!("failed to parse private key: {}", e)))?
            .ok_or_else(|| ClientError::Tls("no private key found".to_string()))?;

        // TLS 1.3 only, P-384 key exchange, AES-256-GCM
        let mut provider = rustls::crypto::ring::default_provider();
        provider.cipher_suites =
            vec![rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384];
        provider.kx_groups = vec![rustls::crypto::ring::kx_group::SECP384R1];

        let crypto = rustls::ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| ClientError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_client_auth_cert(cert_chain, key)
            .map_err(|e| ClientError::Tls(e.to_string()))?;

        let mut transport = TransportConfig::default();
        if config.keep_alive_interval_ms > 0 {
            transport.keep_alive_interval(Some(Duration::from_millis(
                config.keep_alive_interval_ms,
            )));
        }
        transport.max_idle_timeout(Some(
            Duration::from_millis(config.idle_timeout_ms())
                .try_into()
                .map_err(|_| ClientError::Tls("idle timeout out of range".to_string()))?,
        ));

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| ClientError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(transport));

        Ok(client_config)
    }

    async fn resolve_addr(&self) -> Result<SocketAddr, ClientError> {
        let target = format!("{}:{}", self.config.server_host, self.config.server_port);
        let mut addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| ClientError::Resolve(format!("{}: {}", target, e)))?;
        addrs
            .next()
            .ok_or_else(|| ClientError::Resolve(format!("{}: no addresses", target)))
    }

    /// Connect to the console service. Reuses a live connection.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        let mut conn_guard = self.connection.lock().await;

        if let Some(ref conn) = *conn_guard {
            if conn.close_reason().is_none() {
                debug!("reusing existing connection");
                return Ok(());
            }
        }

        info!(host = %self.config.server_host, port = self.config.server_port, "connecting to console service");

        self.connecting.store(true, Ordering::SeqCst);
        let result = self.dial().await;
        self.connecting.store(false, Ordering::SeqCst);

        match result {
            Ok(connection) => {
                self.dial_failed.store(false, Ordering::SeqCst);
                info!("connected to console service");
                *conn_guard = Some(connection);
                Ok(())
            }
            Err(e) => {
                self.dial_failed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<Connection, ClientError> {
        let addr = self.resolve_addr().await?;
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connecting = self.endpoint.connect(addr, &self.config.server_host)?;
        let connection = tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout(self.config.connect_timeout_ms))??;
        Ok(connection)
    }

    /// Get the current connection, connecting if necessary
    async fn get_connection(&self) -> Result<Connection, ClientError> {
        self.connect().await?;
        let conn_guard = self.connection.lock().await;
        conn_guard.clone().ok_or(ClientError::NotConnected)
    }

    /// Current channel state, for the reconnect loop.
    pub async fn state(&self) -> ChannelState {
        if self.closed.load(Ordering::SeqCst) {
            return ChannelState::Shutdown;
        }
        if self.connecting.load(Ordering::SeqCst) {
            return ChannelState::Connecting;
        }
        let conn_guard = self.connection.lock().await;
        match *conn_guard {
            Some(ref conn) if conn.close_reason().is_none() => ChannelState::Ready,
            _ => {
                if self.dial_failed.load(Ordering::SeqCst) {
                    ChannelState::TransientFailure
                } else {
                    ChannelState::Idle
                }
            }
        }
    }

    /// Open a fresh stream for one call and ship the request envelope.
    async fn send_rpc(
        &self,
        request: &RpcRequest,
    ) -> Result<FrameReader<quinn::RecvStream>, ClientError> {
        let conn = self.get_connection().await?;
        let (send, recv) = conn.open_bi().await?;

        let mut writer = FrameWriter::new(send);
        writer.write(FrameKind::Rpc, request).await?;
        writer.into_inner().finish()?;

        Ok(FrameReader::new(recv))
    }

    /// Send one request envelope and read one reply envelope. Console
    /// faults surface as [`ClientError::ErrorFrame`].
    #[instrument(skip(self, request))]
    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, ClientError> {
        let mut reader = self.send_rpc(request).await?;
        match reader.read::<RpcResponse>(FrameKind::Reply).await? {
            Inbound::Message(response) => Ok(response),
            Inbound::Fault(status) => Err(ClientError::ErrorFrame {
                code: status.err_code,
                message: status.err,
            }),
            Inbound::Closed => Err(ClientError::StreamClosed),
        }
    }

    /// Open the server-streaming request channel: send one request envelope
    /// and return the stream of pushed request frames.
    #[instrument(skip(self, request))]
    pub async fn open_request_stream(
        &self,
        request: &RpcRequest,
    ) -> Result<ServerStream, ClientError> {
        let reader = self.send_rpc(request).await?;
        Ok(ServerStream { reader })
    }

    /// Close the connection and the endpoint. The client cannot be reused.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut conn_guard = self.connection.lock().await;
        if let Some(conn) = conn_guard.take() {
            conn.close(0u32.into(), b"client closing");
        }
        self.endpoint.close(0u32.into(), b"client closing");
    }

    /// Check if the client currently holds a live connection
    pub async fn is_connected(&self) -> bool {
        let conn_guard = self.connection.lock().await;
        match *conn_guard {
            Some(ref conn) => conn.close_reason().is_none(),
            None => false,
        }
    }
}

impl Drop for ConsoleClient {
    fn drop(&mut self) {
        // best effort close, non-async
        if let Ok(mut guard) = self.connection.try_lock() {
            if let Some(conn) = guard.take() {
                conn.close(0u32.into(), b"client dropped");
            }
        }
    }
}

/// Inbound side of the long-lived request stream.
pub struct ServerStream {
    reader: FrameReader<quinn::RecvStream>,
}

impl ServerStream {
    /// Read the next pushed request. Returns `Ok(None)` when the console
    /// closes the stream; faults surface as [`ClientError::ErrorFrame`].
    pub async fn next_request(&mut self) -> Result<Option<RequestMessage>, ClientError> {
        match self.reader.read::<RequestMessage>(FrameKind::Push).await? {
            Inbound::Message(msg) => Ok(Some(msg)),
            Inbound::Fault(status) => Err(ClientError::ErrorFrame {
                code: status.err_code,
                message: status.err,
            }),
            Inbound::Closed => Ok(None),
        }
    }
}

/// Certificate verifier that skips all verification. The account identity is
/// established by the client certificate, not the server's.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_keypair() -> (Vec<u8>, Vec<u8>) {
        let cert = rcgen::generate_simple_self_signed(vec!["acc-test".to_string()]).unwrap();
        (
            cert.cert.pem().into_bytes(),
            cert.key_pair.serialize_pem().into_bytes(),
        )
    }

    fn test_config() -> ConsoleClientConfig {
        let (cert_pem, key_pem) = test_keypair();
        ConsoleClientConfig {
            cert_pem,
            key_pem,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ConsoleClientConfig::default();
        assert_eq!(config.keep_alive_interval_ms, 10_000);
        assert_eq!(config.keep_alive_timeout_ms, 5_000);
        // a peer that misses the 10s ping by the 5s grace period is dead
        assert_eq!(config.idle_timeout_ms(), 15_000);
        assert_eq!(config.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_build_client_config_requires_keypair() {
        let config = ConsoleClientConfig::default();
        assert!(ConsoleClient::build_client_config(&config).is_err());
    }

    #[test]
    fn test_build_client_config_with_keypair() {
        let config = test_config();
        assert!(ConsoleClient::build_client_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_client_creation() {
        // May fail if the UDP socket cannot be bound (sandboxed environments)
        if let Ok(client) = ConsoleClient::new(test_config()) {
            assert!(!client.is_connected().await);
            assert_eq!(client.state().await, ChannelState::Idle);
        }
    }

    #[tokio::test]
    async fn test_client_connect_timeout() {
        let mut config = test_config();
        config.server_host = "127.0.0.1".to_string();
        config.server_port = 59998; // unlikely to have a server
        config.connect_timeout_ms = 100;
        let client = match ConsoleClient::new(config) {
            Ok(c) => c,
            Err(_) => return,
        };
        let result = client.connect().await;
        assert!(result.is_err());
        assert_eq!(client.state().await, ChannelState::TransientFailure);
    }

    #[tokio::test]
    async fn test_client_close_without_connection() {
        let client = match ConsoleClient::new(test_config()) {
            Ok(c) => c,
            Err(_) => return,
        };
        client.close().await;
        assert!(!client.is_connected().await);
        assert_eq!(client.state().await, ChannelState::Shutdown);
    }

    #[tokio::test]
    async fn test_call_after_close_fails() {
        let client = match ConsoleClient::new(test_config()) {
            Ok(c) => c,
            Err(_) => return,
        };
        client.close().await;
        let result = client.call(&RpcRequest::default()).await;
        assert!(result.is_err());
    }
}

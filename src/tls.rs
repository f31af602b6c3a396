//! Builds `rustls` client/server configuration from the cert/key/CA paths
//! named on the CLI, and hides role-specific socket setup behind two
//! entry points that both hand the session a boxed duplex stream.
//!
//! The control connection needs independent read and write paths (the
//! supervisor blocks on reads while stream workers and the keep-alive
//! ticker write concurrently), so the raw TLS session is driven through
//! `rust-tls-duplex-stream`'s background pump rather than the plain
//! `rustls::StreamOwned` a single-threaded caller would use.
use crate::error::{PolicyError, TunnelError, TunnelResult};
use crate::info_log;
use crate::util::unwrap_poison;
use rust_tls_duplex_stream::RustTlsDuplexStream;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConnectionData;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::ServerConnectionData;
use rustls::{
  ClientConfig, ClientConnection, DigitallySignedStruct, ServerConfig, ServerConnection,
  SignatureScheme,
};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use unowned_buf::{UnownedReadBuffer, UnownedWriteBuffer};

/// Size of the per-direction buffer `unowned-buf` keeps around the duplex
/// stream; large enough that a typical `Data` frame round-trips in one call.
const BUF_SIZE: usize = 0x4000;

fn default_provider() -> &'static Arc<CryptoProvider> {
  CryptoProvider::get_default().expect("a default rustls crypto provider was installed at startup")
}

/// Object-safe duplex stream handed to the control connection. Hides
/// whether the session is holding the listener or dialer side of the
/// handshake, and whether reads/writes are backed by a real socket or (in
/// tests) an in-memory pipe.
pub trait ReadWrite: Send + Sync {
  /// `io::Read::read`, but through a shared reference: multiple threads may
  /// hold a `&dyn ReadWrite` at once (one reading, several writing).
  fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
  /// `io::Write::write`, but through a shared reference.
  fn write(&self, buf: &[u8]) -> io::Result<usize>;
  /// Forcibly unblocks any in-flight read/write and fails future calls.
  fn shutdown(&self);
}

#[derive(Clone)]
struct RawHalf(Arc<TcpStream>);

impl Read for RawHalf {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    (&*self.0).read(buf)
  }
}

impl Write for RawHalf {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    (&*self.0).write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    (&*self.0).flush()
  }
}

/// Pairs a `RustTlsDuplexStream` with the read/write buffers that let its
/// two directions serialize independently instead of contending on a single
/// lock the way a plain `StreamOwned` would.
struct DuplexStream<C, D> {
  tcp: Arc<TcpStream>,
  tls: RustTlsDuplexStream<C, D>,
  read: Mutex<UnownedReadBuffer<BUF_SIZE>>,
  write: Mutex<UnownedWriteBuffer<BUF_SIZE>>,
}

impl<C, D> DuplexStream<C, D> {
  fn new(tcp: Arc<TcpStream>, tls: RustTlsDuplexStream<C, D>) -> Self {
    DuplexStream {
      tcp,
      tls,
      read: Mutex::new(UnownedReadBuffer::new()),
      write: Mutex::new(UnownedWriteBuffer::new()),
    }
  }
}

impl<C, D> ReadWrite for DuplexStream<C, D>
where
  C: Send + Sync + 'static,
  D: Send + Sync + 'static,
  for<'a> &'a RustTlsDuplexStream<C, D>: Read + Write,
{
  fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
    unwrap_poison(self.read.lock())?.read(&mut &self.tls, buf)
  }

  fn write(&self, buf: &[u8]) -> io::Result<usize> {
    unwrap_poison(self.write.lock())?.write(&mut &self.tls, buf)
  }

  fn shutdown(&self) {
    let _ = self.tcp.shutdown(Shutdown::Both);
  }
}

fn spawn_pump(task: Box<dyn FnOnce() + Send>) -> io::Result<()> {
  thread::Builder::new()
    .name("cidtun-tls-pump".to_string())
    .spawn(task)
    .map(|_| ())
    .map_err(io::Error::from)
}

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
  let mut reader = BufReader::new(File::open(path)?);
  certs(&mut reader).collect::<Result<Vec<_>, _>>()
}

fn load_private_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
  let mut reader = BufReader::new(File::open(path)?);
  private_key(&mut reader)?
    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found in key file"))
}

/// Accepts incoming TLS connections, presenting the configured certificate chain.
pub struct Listener {
  listener: TcpListener,
  config: Arc<ServerConfig>,
}

impl Listener {
  /// Binds `("0.0.0.0", port)` and builds a server TLS config from the PEM
  /// files at `cert_path`/`key_path`. A collision with something already
  /// bound to `port` is reported as a typed [`PolicyError::BindCollision`]
  /// rather than a bare `io::Error`.
  pub fn bind(port: u16, cert_path: &str, key_path: &str) -> TunnelResult<Listener> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let listener = TcpListener::bind(("0.0.0.0", port)).map_err(|e| {
      if e.kind() == io::ErrorKind::AddrInUse {
        TunnelError::Policy(PolicyError::BindCollision(port))
      } else {
        TunnelError::Network(e)
      }
    })?;
    info_log!("cidtun: tls listener bound on port {port}");
    Ok(Listener { listener, config: Arc::new(config) })
  }

  /// Blocks for the next incoming connection, completes the TLS handshake,
  /// and hands back a duplex stream the control connection can read and
  /// write independently.
  pub fn accept(&self) -> io::Result<Box<dyn ReadWrite>> {
    let (stream, addr) = self.listener.accept()?;
    let tcp = Arc::new(stream);
    let conn = ServerConnection::new(self.config.clone())
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tls = RustTlsDuplexStream::new(
      conn,
      RawHalf(tcp.clone()),
      RawHalf(tcp.clone()),
      spawn_pump,
    )?;
    info_log!("cidtun: accepted control connection from {addr}");
    Ok(Box::new(DuplexStream::<ServerConnection, ServerConnectionData>::new(tcp, tls)))
  }
}

/// Dials a peer and wraps the resulting socket in a TLS client stream.
pub struct Dialer {
  host: String,
  port: u16,
  config: Arc<ClientConfig>,
}

impl Dialer {
  /// Builds a client TLS config trusting only the certificates found at
  /// `ca_path`, with hostname verification disabled (the CA bundle is the
  /// trust anchor, not the hostname).
  pub fn new(host: String, port: u16, ca_path: &str) -> io::Result<Dialer> {
    let trusted = load_certs(ca_path)?;
    if trusted.is_empty() {
      return Err(io::Error::new(io::ErrorKind::InvalidData, "CA bundle contains no certificates"));
    }
    let config = ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(PinnedCaVerifier { trusted }))
      .with_no_client_auth();
    Ok(Dialer { host, port, config: Arc::new(config) })
  }

  /// Dials `host:port`, completes the TLS client handshake, and hands back
  /// a duplex stream the control connection can read and write
  /// independently.
  pub fn connect(&self) -> io::Result<Box<dyn ReadWrite>> {
    let stream = TcpStream::connect((self.host.as_str(), self.port))?;
    let tcp = Arc::new(stream);
    let server_name = ServerName::try_from(self.host.clone())
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let conn = ClientConnection::new(self.config.clone(), server_name)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let tls = RustTlsDuplexStream::new(
      conn,
      RawHalf(tcp.clone()),
      RawHalf(tcp.clone()),
      spawn_pump,
    )?;
    info_log!("cidtun: dialed control connection to {}:{}", self.host, self.port);
    Ok(Box::new(DuplexStream::<ClientConnection, ClientConnectionData>::new(tcp, tls)))
  }
}

/// A `ServerCertVerifier` that accepts a presented chain iff the leaf or any
/// intermediate is byte-identical to a certificate in the configured CA
/// bundle. Deliberately skips the hostname-matches-certificate check: the
/// bundle itself is the trust anchor, and peers are commonly addressed by an
/// IP or a name the certificate was never issued for.
#[derive(Debug)]
struct PinnedCaVerifier {
  trusted: Vec<CertificateDer<'static>>,
}

impl ServerCertVerifier for PinnedCaVerifier {
  fn verify_server_cert(
    &self,
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> Result<ServerCertVerified, rustls::Error> {
    let presented = std::iter::once(end_entity).chain(intermediates.iter());
    let trusted = presented.into_iter().any(|cert| self.trusted.iter().any(|t| t == cert));
    if trusted {
      Ok(ServerCertVerified::assertion())
    } else {
      Err(rustls::Error::General(
        "peer certificate chain not found in configured CA bundle".to_string(),
      ))
    }
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls12_signature(message, cert, dss, &default_provider().signature_verification_algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    verify_tls13_signature(message, cert, dss, &default_provider().signature_verification_algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    default_provider().signature_verification_algorithms.supported_schemes()
  }
}

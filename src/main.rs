//! CLI entry point: parses argv, validates it into a [`cidtun::Config`],
//! installs the process-wide rustls crypto provider, and hands off to
//! [`cidtun::Session::run`].
use cidtun::config::Role;
use cidtun::{error_log, Config, Session};
use clap::{Parser, Subcommand};

/// A multiplexing TLS tunnel daemon.
#[derive(Parser)]
#[command(name = "cidtun")]
#[command(version)]
#[command(about = "Multiplexes TCP byte-streams between two peers over a single TLS connection")]
struct Cli {
  #[command(subcommand)]
  role: RoleArgs,

  /// Host locally-dialed outbound connections are made against.
  #[arg(long, global = true, default_value = "localhost")]
  target: String,

  /// Advertised forward port. May be repeated.
  #[arg(long = "forward", global = true)]
  forward: Vec<u16>,

  /// Advertised port -> local bind port remap, as `advertised:local`. May be repeated.
  #[arg(long = "mapping", global = true)]
  mapping: Vec<String>,

  /// Seconds a dialer waits between reconnect attempts.
  #[arg(long, global = true, default_value_t = 60)]
  reconnect: u64,

  /// Seconds between keep-alive frames.
  #[arg(long, global = true, default_value_t = 60)]
  keepalive: u64,

  /// Path to the PEM certificate chain. In the server role this is the
  /// presented certificate; in the client role it is the trusted CA bundle.
  #[arg(long, global = true)]
  cert: String,

  /// Path to the PEM private key. Required for the server role, ignored
  /// for the client role.
  #[arg(long, global = true)]
  key: Option<String>,
}

#[derive(Subcommand)]
enum RoleArgs {
  /// Listens for a peer's control connection.
  Server {
    /// Local TCP port to accept the control connection on.
    port: u16,
  },
  /// Dials a peer's control connection.
  Client {
    /// Peer host to dial.
    host: String,
    /// Peer port to dial.
    port: u16,
  },
}

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
fn install_crypto_provider() {
  // Installed once at startup; every TLS config built afterward looks it up
  // via `CryptoProvider::get_default()`.
  let _ = rustls_graviola::default_provider().install_default();
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("cidtun requires an x86_64 or aarch64 target: no rustls crypto provider is configured for this architecture");

fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  install_crypto_provider();

  let cli = Cli::parse();
  let role = match cli.role {
    RoleArgs::Server { port } => Role::Server { port },
    RoleArgs::Client { host, port } => Role::Client { host, port },
  };

  let config = match Config::new(
    role,
    cli.target,
    cli.forward,
    &cli.mapping,
    cli.reconnect,
    cli.keepalive,
    cli.cert,
    cli.key,
  ) {
    Ok(config) => config,
    Err(e) => {
      error_log!("cidtun: invalid configuration: {e}");
      std::process::exit(1);
    }
  };

  Session::new(config).run();
}

// CLI entry point for the Flipped spectate relay.
//
// Starts a standalone relay that players, controllers and spectators connect
// to, and runs until the relay shuts down (after a session failure under the
// default policy) or the process is killed. See `server.rs` for the
// networking architecture.
//
// Logging goes through `env_logger`; `RUST_LOG` overrides the default `info`
// filter.

use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use flipped_relay::server::{DEFAULT_PORT, RelayConfig, SessionErrorPolicy, start_relay};

/// Relay server for Flipped spectate sessions.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Ask connecting clients for a password (not verified)
    #[arg(long)]
    password: Option<String>,
    /// What a transport error on one session does
    #[arg(long, value_enum, default_value_t = OnSessionError::ShutdownServer)]
    on_session_error: OnSessionError,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnSessionError {
    /// Close the whole relay
    ShutdownServer,
    /// Close only the failing session
    DropSession,
}

impl From<OnSessionError> for SessionErrorPolicy {
    fn from(value: OnSessionError) -> Self {
        match value {
            OnSessionError::ShutdownServer => SessionErrorPolicy::ShutdownServer,
            OnSessionError::DropSession => SessionErrorPolicy::DropSession,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = RelayConfig {
        bind_address: args.host,
        port: args.port,
        password: args.password,
        version: Some(env!("CARGO_PKG_VERSION").into()),
        on_session_error: args.on_session_error.into(),
    };

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            log::error!("failed to start relay: {e}");
            std::process::exit(1);
        }
    };
    log::info!("relay listening on {addr}; press Ctrl+C to stop");

    // The process exits on SIGINT/SIGTERM by default; the relay threads are
    // torn down with it.
    while !handle.is_shut_down() {
        thread::sleep(Duration::from_millis(200));
    }
    handle.stop();
    log::info!("relay stopped");
}

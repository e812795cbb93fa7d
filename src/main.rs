//! multiplex-time-server: a single-threaded TCP time server
//!
//! One readiness loop multiplexes every client connection:
//! - `QUERY TIME ORDER` (any casing) is answered with the current UTC time
//! - anything else is answered with `BAD ORDER`
//!
//! Configuration via CLI arguments or TOML file. Ctrl-C or SIGTERM stops
//! the loop within one poll timeout.

mod clock;
mod config;
mod protocols;
mod runtime;

use config::Config;
use runtime::Reactor;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        max_connections = config.max_connections,
        "Starting multiplex-time-server"
    );

    let reactor = Reactor::bind(&config)?;

    let stop = reactor.stop_handle();
    ctrlc::set_handler(move || {
        info!("Shutdown requested");
        stop.stop();
    })?;

    reactor.run();
    Ok(())
}

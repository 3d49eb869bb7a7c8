//! Sockpool Echo Server
//!
//! Demo server di atas library: setiap byte yang diterima dikirim balik
//! lewat output queue koneksi.
//!
//! Usage:
//!   cargo run --release --bin sockpool_echo -- [OPTIONS]

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sockpool::{Connection, Server, ServerConfig, ServerStatsSnapshot};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Konfigurasi binary
struct EchoConfig {
    server: ServerConfig,
    verbose: bool,
    run_for: Option<Duration>,
    stats_interval: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            verbose: false,
            run_for: None,
            stats_interval: Duration::from_secs(5),
        }
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn print_stats(stats: &ServerStatsSnapshot, uptime: Duration) {
    let secs = uptime.as_secs_f64().max(f64::EPSILON);
    info!(
        uptime_secs = uptime.as_secs(),
        active = stats.connections_active,
        accepted = stats.connections_accepted,
        rejected = stats.connections_rejected,
        evicted = stats.evictions,
        idle_evicted = stats.idle_evictions,
        kb_in = stats.bytes_received / 1024,
        kb_out = stats.bytes_sent / 1024,
        bytes_in_per_sec = stats.bytes_received as f64 / secs,
        "server stats"
    );
}

fn run(config: EchoConfig) -> sockpool::Result<()> {
    let server = Server::bind(config.server, |conn: &mut Connection| {
        let data = conn.take_input();
        conn.write(&data);
    })?
    .with_on_disconnect(|conn: &mut Connection| {
        info!(
            conn_id = conn.id().0,
            peer = conn.remote_address().unwrap_or("-"),
            reason = ?conn.evict_reason(),
            "client disconnected"
        );
    });
    let server = Arc::new(server);

    let handle = server.spawn()?;
    let start_time = Instant::now();
    let mut last_stats_print = Instant::now();

    while !handle.is_finished() {
        thread::sleep(Duration::from_millis(100));

        if last_stats_print.elapsed() >= config.stats_interval {
            print_stats(&server.stats(), start_time.elapsed());
            last_stats_print = Instant::now();
        }

        if let Some(limit) = config.run_for {
            if start_time.elapsed() >= limit {
                server.stop();
                break;
            }
        }
    }

    let result = handle.join().unwrap_or_else(|_| {
        error!("acceptor thread panicked");
        Ok(())
    });
    print_stats(&server.stats(), start_time.elapsed());
    result
}

fn print_help() {
    println!("Sockpool Echo Server\n");
    println!("Usage: sockpool_echo [OPTIONS]\n");
    println!("Options:");
    println!("  -b, --bind <ADDR>        Bind address (default: 0.0.0.0:9999)");
    println!("  -w, --workers <N>        IO worker threads (default: 1)");
    println!("      --chunk <BYTES>      Max bytes read per connection per cycle (default: 1024)");
    println!("      --idle-ms <MS>       Idle timeout in milliseconds (default: 30000)");
    println!("      --run-for-secs <S>   Stop automatically after S seconds");
    println!("  -v, --verbose            Verbose output");
    println!("  -h, --help               Show this help");
}

fn parse_args() -> EchoConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = EchoConfig::default();

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--bind" | "-b" => {
                if let Some(addr) = value.and_then(|v| v.parse::<SocketAddr>().ok()) {
                    config.server.bind_addr = addr;
                    i += 1;
                }
            }
            "--workers" | "-w" => {
                if let Some(v) = value {
                    config.server.workers = v.parse().unwrap_or(1);
                    i += 1;
                }
            }
            "--chunk" => {
                if let Some(v) = value {
                    config.server.io_chunk_size = v.parse().unwrap_or(1024);
                    i += 1;
                }
            }
            "--idle-ms" => {
                if let Some(v) = value {
                    config.server.idle_timeout = Duration::from_millis(v.parse().unwrap_or(30_000));
                    i += 1;
                }
            }
            "--run-for-secs" => {
                if let Some(v) = value {
                    config.run_for = v.parse().ok().map(Duration::from_secs);
                    i += 1;
                }
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

fn main() {
    let config = parse_args();
    setup_logging(config.verbose);

    if let Err(e) = run(config) {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}

//! Transport stream relay
//!
//! Run with: cargo run --example ts_relay -- [options] [target,...]
//!
//! Reads a transport stream from stdin and fans it out to every target
//! given on the command line, plus any HTTP client that connects to the
//! listener.
//!
//! ```text
//!   stdin ──► Output ──┬──► udp://239.0.0.1:1234
//!                      ├──► file:///tmp/capture.ts   (capture.ts_0)
//!                      └──► HTTP clients on :62080
//! ```
//!
//! Try it:
//!
//! ```text
//! cat capture.ts | cargo run --example ts_relay -- udp://127.0.0.1:5000
//! curl http://localhost:62080/ > copy.ts
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use ts_fanout::packet::{PidMap, TS_PACKET_SIZE};
use ts_fanout::server::DEFAULT_HTTP_PORT;
use ts_fanout::{ListenerConfig, Output, OutputConfig};

/// Units read from stdin per push
const READ_PACKETS: usize = 21;

fn print_usage() {
    eprintln!("Usage: ts_relay [--listen ADDR] [--pids PID,...] [TARGET[,TARGET...]]");
    eprintln!();
    eprintln!("Targets:");
    eprintln!("  udp://host[:port]   UDP datagrams (port defaults to 1234)");
    eprintln!("  tcp://host[:port]   outbound TCP connection");
    eprintln!("  file://path         local file");
    eprintln!("  -                   stdout");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --listen ADDR       HTTP listen address (default 0.0.0.0:{})", DEFAULT_HTTP_PORT);
    eprintln!("  --pids PID,...      only forward these PIDs (the PAT always passes)");
}

struct Args {
    listen: SocketAddr,
    pids: PidMap,
    targets: Vec<String>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HTTP_PORT)),
        pids: PidMap::new(),
        targets: Vec::new(),
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--listen" => {
                let value = iter.next().ok_or("--listen needs an address")?;
                args.listen = value
                    .parse()
                    .map_err(|_| format!("Invalid listen address: {}", value))?;
            }
            "--pids" => {
                let value = iter.next().ok_or("--pids needs a list")?;
                for pid in value.split(',') {
                    let pid = parse_pid(pid.trim())?;
                    args.pids.insert(pid, 0);
                }
            }
            _ => args.targets.push(arg),
        }
    }

    Ok(args)
}

fn parse_pid(value: &str) -> Result<u16, String> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed
        .ok()
        .filter(|pid| *pid <= 0x1FFF)
        .ok_or_else(|| format!("Invalid PID: {}", value))
}

/// Feed stdin into the multiplexer until EOF
async fn ingest(output: Arc<Output>) -> std::io::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; TS_PACKET_SIZE * READ_PACKETS];
    let mut filled = 0;

    loop {
        let n = stdin.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(());
        }
        filled += n;

        let whole = filled - filled % TS_PACKET_SIZE;
        if whole > 0 {
            output.push(&buf[..whole]);
            buf.copy_within(whole..filled, 0);
            filled -= whole;
        }
    }
}

/// Periodic health check; dead targets are reclaimed
async fn monitor(output: Arc<Output>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        output.check();
        let stats = output.stats();
        tracing::info!(
            targets = stats.active_targets,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            "Relay status"
        );
    }
}

/// Shutdown goes through the output the relay owns; there is no global state
async fn shutdown(output: &Output, drain: bool) {
    if drain && !output.drain().await {
        tracing::warn!("Some targets stopped before draining");
    }
    output.stop().await;
    let stats = output.stats();
    tracing::info!(bytes_in = stats.bytes_in, bytes_out = stats.bytes_out, "Relay stopped");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::args().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    // Logs go to stderr so stdout stays usable as a target
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ts_fanout=info".parse()?)
                .add_directive("ts_relay=info".parse()?),
        )
        .init();

    let config = OutputConfig::default().client_pids(args.pids.clone());
    let output = Arc::new(Output::with_config(config));

    for target in &args.targets {
        let id = output.add(target, &args.pids)?;
        tracing::info!(id = id, dest = %target, "Target configured");
    }
    let server = output.add_http_server(ListenerConfig::with_addr(args.listen))?;
    output.start()?;

    // Buffered data is flushed out only when the input ends on its own
    let drain = tokio::select! {
        result = ingest(Arc::clone(&output)) => {
            match result {
                Ok(()) => tracing::info!("End of input"),
                Err(e) => tracing::error!(error = %e, "Input failed"),
            }
            true
        }
        _ = monitor(Arc::clone(&output)) => false,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            false
        }
    };

    server.abort();
    shutdown(&output, drain).await;
    Ok(())
}

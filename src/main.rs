//! nsnet: run a command with user-space networking
//!
//! The command gets a packet transport at fd 3. Whatever sets up its network
//! namespace (a tun device fed from fd 3, address 10.0.0.2/24, default route
//! via 10.0.0.1) runs inside the command; every TCP and UDP flow it opens is
//! re-originated from this process's sockets.
//!
//! # Usage
//!
//! ```bash
//! # Run a command with default options
//! nsnet -- sandbox-init /bin/sh
//!
//! # Custom configuration and statistics
//! nsnet -c /etc/nsnet/config.json --stats -- sandbox-init curl example.com
//!
//! # Environment overrides
//! NSNET_LOG_LEVEL=debug nsnet -- sandbox-init /bin/sh
//! ```

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use nsnet::config::{create_default_config, load_config_with_env, Config};
use nsnet::HostNetwork;

/// Command-line arguments
struct Args {
    /// Configuration file path; defaults are used without one
    config_path: Option<PathBuf>,
    /// Force statistics on
    stats: bool,
    /// Write the default configuration to the config path and exit
    generate_config: bool,
    /// Validate the configuration and exit
    check_config: bool,
    /// Command to run, program first
    command: Vec<String>,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = None;
        let mut stats = false;
        let mut generate_config = false;
        let mut check_config = false;
        let mut command = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = Some(PathBuf::from(path));
                    }
                }
                "--stats" => {
                    stats = true;
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("nsnet v{}", nsnet::VERSION);
                    std::process::exit(0);
                }
                "--" => {
                    command.extend(args.by_ref());
                }
                _ if !arg.starts_with('-') => {
                    command.push(arg);
                    command.extend(args.by_ref());
                }
                _ => {
                    eprintln!("Unknown argument: {}", arg);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            stats,
            generate_config,
            check_config,
            command,
        }
    }
}

fn print_help() {
    println!(
        r#"nsnet v{}

Run a command with user-space networking bridged through fd 3.

USAGE:
    nsnet [OPTIONS] -- COMMAND [ARGS...]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: built-in defaults]
    --stats                 Collect and log forwarding statistics
    -g, --generate-config   Write the default configuration to --config and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    NSNET_LOG_LEVEL         Override log level (trace, debug, info, warn, error)
    NSNET_UDP_THREADS       Override UDP worker count
    NSNET_UDP_QUEUE_SIZE    Override UDP queue capacity
    NSNET_TCP_MAX_CONNS     Override maximum TCP flows
    NSNET_STATS             Enable statistics (1, true)

PEER CONTRACT:
    The command finds a SOCK_SEQPACKET socket at fd 3 carrying raw IP
    datagrams. It should configure a tun device with 10.0.0.2/24 and a
    default route via 10.0.0.1, then pump datagrams between the two.
"#,
        nsnet::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "smoltcp=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.log.target)
        .with_writer(std::io::stderr);

    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(1)
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        let Some(path) = &args.config_path else {
            bail!("--generate-config needs --config <PATH>");
        };
        create_default_config(path)?;
        println!("Generated default configuration at {:?}", path);
        return Ok(());
    }

    let mut config = load_config_with_env(args.config_path.as_deref())
        .with_context(|| format!("Failed to load configuration from {:?}", args.config_path))?;
    if args.stats {
        config.options = config.options.with_stats(true);
    }

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    let Some((program, program_args)) = args.command.split_first() else {
        print_help();
        std::process::exit(1);
    };

    init_logging(&config);
    info!("nsnet v{}", nsnet::VERSION);

    let mut host = HostNetwork::new(config.options.clone()).context("Failed to create host network")?;

    let mut command = Command::new(program);
    command.args(program_args);
    host.attach_to_command(&mut command)?;
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn {program}"))?;
    // The child holds the only other copy now; its exit ends the transport
    host.release_peer_fd();

    info!(
        "Started {} (pid {:?}) in {:.2}ms",
        program,
        child.id(),
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let status = loop {
        tokio::select! {
            result = child.wait() => break result.context("Failed to wait for child")?,
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, stopping child...");
            }
            () = wait_for_sigterm() => {
                info!("Received SIGTERM, stopping child...");
            }
        }
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill child: {}", e);
        }
    };

    info!("Child exited with {}", status);

    if let Some(stats) = host.tcp_stats() {
        info!(
            "TCP stats: {} connections, {} bytes sent, {} bytes received",
            stats.conns, stats.sent_bytes, stats.recv_bytes
        );
    }
    if let Some(stats) = host.udp_stats() {
        info!(
            "UDP stats: {} packets / {} bytes sent, {} packets / {} bytes received, {} dropped",
            stats.sent_packets, stats.sent_bytes, stats.recv_packets, stats.recv_bytes, stats.dropped_packets
        );
    }

    if let Err(e) = host.close() {
        error!("Shutdown error: {}", e);
    }

    std::process::exit(exit_code(status));
}

/// Wait for SIGTERM signal
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

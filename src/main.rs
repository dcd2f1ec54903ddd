use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use fftp::config::{
    ClientConfig, RetryPolicy, ServerConfig, DEFAULT_BURST, DEFAULT_CLIENT_BUFFER_SIZE,
    DEFAULT_MAX_RETRIES, DEFAULT_REASSEMBLY_WINDOW, DEFAULT_RETRANSMIT_TIMEOUT,
    DEFAULT_SERVER_CHUNK,
};
use fftp::error::TransferError;
use fftp::event_loop::EventLoop;
use fftp::message::Request;
use fftp::protocol::RequestTag;
use fftp::resource::FsRoot;
use fftp::shutdown_mgr::ShutdownManager;
use fftp::sink::{Listing, WriteSink};
use fftp::stun;

/// File retrieval over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Fetch listings or files from a daemon.
    Client {
        #[arg(value_enum)]
        mode: ClientMode,

        /// Daemon host name or address.
        addr: String,

        /// Paths to list or fetch, relative to the daemon's root.
        paths: Vec<String>,

        #[arg(short, long, env = "FFD_PORT", default_value_t = 8080)]
        port: u16,

        /// Directory fetched files are written to.
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[arg(long, default_value_t = DEFAULT_RETRANSMIT_TIMEOUT.as_millis() as u64)]
        timeout_ms: u64,

        #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
        retries: u32,

        /// Largest chunk asked of the daemon, 0 for its default.
        #[arg(short, long, default_value_t = DEFAULT_CLIENT_BUFFER_SIZE)]
        buffer_size: u32,
    },
    /// Serve a directory.
    Server {
        /// Directory to serve.
        root: PathBuf,

        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,

        #[arg(short, long, env = "FFD_PORT", default_value_t = 8080)]
        port: u16,

        /// Chunk size for requests that leave it to the daemon.
        #[arg(short, long, default_value_t = DEFAULT_SERVER_CHUNK)]
        buffer_size: usize,

        #[arg(long, default_value_t = DEFAULT_BURST)]
        burst: usize,

        /// STUN server (host:port) to ask for our public address.
        #[arg(long)]
        stun: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ClientMode {
    Ls,
    Get,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();

    let cli = Cli::parse();

    let shutdown = ShutdownManager::new();
    shutdown.on_ctrl_c();

    match cli.mode {
        Mode::Client {
            mode,
            addr,
            paths,
            port,
            output,
            timeout_ms,
            retries,
            buffer_size,
        } => {
            let config = ClientConfig {
                retry: RetryPolicy {
                    timeout: Duration::from_millis(timeout_ms),
                    max_retries: retries,
                },
                buffer_size,
                reassembly_window: DEFAULT_REASSEMBLY_WINDOW,
            };
            let server = tokio::net::lookup_host((addr.as_str(), port))
                .await
                .with_context(|| format!("cannot resolve {addr}"))?
                .next()
                .ok_or_else(|| anyhow!("{addr} has no address"))?;
            run_client(mode, server, paths, &output, &config, shutdown).await
        }
        Mode::Server {
            root,
            bind,
            port,
            buffer_size,
            burst,
            stun,
        } => {
            let root = FsRoot::new(&root)?;
            let mut config = ServerConfig::new(SocketAddr::new(bind, port), root.path());
            config.default_chunk = buffer_size;
            config.burst = burst;

            let mut event_loop = EventLoop::bind(config.bind, shutdown).await?;
            if let Some(stun_server) = stun {
                match stun::public_address(event_loop.socket(), &stun_server).await {
                    Ok(public) => info!(
                        "private address is {}, public address is {public}",
                        event_loop.local_addr()
                    ),
                    Err(e) => warn!("{e}"),
                }
            }
            event_loop.serve(&root, &config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_client(
    mode: ClientMode,
    server: SocketAddr,
    mut paths: Vec<String>,
    output: &Path,
    config: &ClientConfig,
    shutdown: ShutdownManager,
) -> anyhow::Result<ExitCode> {
    if paths.is_empty() {
        match mode {
            ClientMode::Ls => paths.push(String::new()),
            ClientMode::Get => return Err(anyhow!("get needs at least one path")),
        }
    }

    let mut failed = 0;
    let mut request_id: u8 = 0;
    for path in &paths {
        let mut event_loop = EventLoop::ephemeral_for(server, shutdown.clone()).await?;
        let outcome = match mode {
            ClientMode::Ls => {
                let request = Request::new(RequestTag::Ls, request_id, config.buffer_size, path.as_str());
                let mut listing = Listing::for_tag(RequestTag::Ls);
                let outcome = event_loop.fetch(server, request, config, &mut listing).await?;
                if outcome.is_ok() {
                    if paths.len() > 1 {
                        println!("{path}:");
                    }
                    for name in listing.names() {
                        println!("{name}");
                    }
                }
                outcome
            }
            ClientMode::Get => {
                let request = Request::new(RequestTag::Get, request_id, config.buffer_size, path.as_str());
                fetch_file(&mut event_loop, server, request, output, config).await?
            }
        };

        if let Err(e) = outcome {
            error!("{path}: {e}");
            failed += 1;
        }
        request_id = request_id.wrapping_add(1);
    }

    if failed > 0 {
        error!("{failed} of {} transfers failed", paths.len());
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

// A failed download leaves nothing behind.
async fn fetch_file(
    event_loop: &mut EventLoop,
    server: SocketAddr,
    request: Request,
    output: &Path,
    config: &ClientConfig,
) -> anyhow::Result<Result<(), TransferError>> {
    let Some(name) = Path::new(&request.path).file_name() else {
        return Ok(Err(TransferError::NotAFile));
    };
    let target = output.join(name);
    let file = File::create(&target).with_context(|| format!("cannot create {}", target.display()))?;

    let mut sink = WriteSink::new(BufWriter::new(file));
    let outcome = event_loop.fetch(server, request, config, &mut sink).await;
    let written = sink.written();
    let mut writer = sink.into_inner();
    let outcome = match outcome {
        Ok(Ok(())) => Ok(writer.flush().map_err(TransferError::from)),
        other => other,
    };
    drop(writer);

    match outcome {
        Ok(Ok(())) => {
            info!("wrote {written} bytes to {}", target.display());
            Ok(Ok(()))
        }
        other => {
            if let Err(e) = fs::remove_file(&target) {
                warn!("cannot remove partial {}: {e}", target.display());
            }
            Ok(other?)
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use build_supervisor::config::Config;
use build_supervisor::logging::{init_logging, LogFormat, LogLevel};
use build_supervisor::server::{self, ServerOptions};
use build_supervisor::{client, Error};

#[derive(Parser)]
#[command(name = "build-supervisor", version)]
#[command(about = "Runs builds requested over a socket or pipe and streams their output back")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise builds for the peer at SOCKET
    Serve {
        /// Unix socket, FIFO or device to talk over
        socket: PathBuf,

        /// Working directory for builds
        build_dir: PathBuf,

        /// Bind SOCKET and wait for peers instead of connecting to it
        #[arg(long)]
        listen: bool,

        /// Build tool to run (overrides the config file; default: make)
        #[arg(long)]
        build_tool: Option<String>,

        /// JSON config file (default: <config dir>/build-supervisor/config.json)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Append logs to this file instead of stderr
        #[arg(short = 'l', long)]
        logfile: Option<PathBuf>,

        #[arg(long, value_enum)]
        log_format: Option<LogFormat>,

        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,
    },

    /// Send a build request to a listening supervisor and stream its output
    Run {
        /// Socket the supervisor is listening on
        socket: PathBuf,

        /// Arguments for the build tool
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command {
        Commands::Serve {
            socket,
            build_dir,
            listen,
            build_tool,
            config,
            logfile,
            log_format,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(tool) = build_tool {
                config.build_tool = tool;
            }
            init_logging(
                log_format.unwrap_or(config.log_format),
                log_level.unwrap_or(config.log_level),
                logfile.as_deref(),
            )?;

            let options = ServerOptions {
                socket,
                build_dir,
                command: config.build_command(),
                listen,
            };
            let result = runtime.block_on(serve(options));
            // A read blocked on a device handle must not hold up exit.
            runtime.shutdown_timeout(Duration::from_secs(1));
            result
        }
        Commands::Run { socket, args } => {
            init_logging(LogFormat::Text, LogLevel::Warn, None)?;
            let code = runtime.block_on(client::run_build(&socket, &args))?;
            std::process::exit(code);
        }
    }
}

async fn serve(options: ServerOptions) -> Result<()> {
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                shutdown.cancel();
            }
        }
    });

    info!(
        socket = %options.socket.display(),
        build_dir = %options.build_dir.display(),
        build_tool = %options.command.program,
        "starting build supervisor"
    );

    match server::run(options, shutdown).await {
        Ok(()) => Ok(()),
        Err(Error::StreamClosed) => {
            info!("peer closed the connection");
            Ok(())
        }
        Err(err) => Err(err).context("build supervisor failed"),
    }
}

//! `shadowlinkd` — fd-mirroring forwarding proxy for a local display
//! protocol.
//!
//! A single `server` subcommand covers both session modes: `--oneshot`
//! hands one forked application a socketpair fd directly, while
//! `--display <name>` binds a listening socket any number of applications
//! can connect to over the supervisor's lifetime.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand};

use shadowlink::config::RawServerArgs;
use shadowlink::SessionConfig;

#[derive(Parser)]
#[command(name = "shadowlinkd", version, about = "Fd-mirroring display-protocol forwarding proxy")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs one proxy session: forks an application, connects a channel,
    /// and mirrors its fd-backed resources for the session's lifetime.
    Server {
        /// Hand the application one end of a socketpair directly (single
        /// connection, no listening socket). Mutually exclusive with
        /// `--display`.
        #[arg(long)]
        oneshot: bool,

        /// Bind a listening socket under this display name and accept any
        /// number of application connections over the session's lifetime.
        #[arg(long)]
        display: Option<String>,

        /// Filesystem path of the channel endpoint to connect to (spec
        /// §4.B).
        #[arg(long)]
        socket: PathBuf,

        /// Control FIFO path for reconnection support. Omit to
        /// disable reconnection.
        #[arg(long)]
        control: Option<PathBuf>,

        /// When falling back to `$SHELL` (no app argv given), run it as a
        /// login shell.
        #[arg(long)]
        login_shell: bool,

        /// Bulk-transfer compression: `none`, `lz4`, or `zstd`.
        #[arg(long, default_value = "lz4")]
        codec: String,

        /// Compression level override for the selected codec.
        #[arg(long)]
        codec_level: Option<i32>,

        /// Worker threads for compression/transfer work.
        /// Defaults to available parallelism.
        #[arg(long)]
        threads: Option<usize>,

        /// Application to launch and its arguments. Empty falls back to
        /// `$SHELL`.
        #[arg(trailing_var_arg = true)]
        app_argv: Vec<String>,
    },
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_: i32) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> Result<()> {
    use nix::sys::signal::{sigaction, SigAction, SigHandler, SigSet, Signal};
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        nix::sys::signal::SaFlags::empty(),
        SigSet::empty(),
    );
    // Safety: installed once at startup before any other thread exists;
    // the handler only stores to an atomic.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn init_logging(log_file: Option<PathBuf>, level: &str) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(level);
    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file, &cli.log_level)?;
    install_signal_handlers()?;

    let code = match cli.command {
        Commands::Server {
            oneshot,
            display,
            socket,
            control,
            login_shell,
            codec,
            codec_level,
            threads,
            app_argv,
        } => {
            let raw = RawServerArgs {
                oneshot,
                display,
                socket,
                control,
                login_shell,
                codec,
                codec_level,
                threads,
                app_argv,
            };
            let config = SessionConfig::try_from(raw)?;
            shadowlink::run_server(config, &SHUTDOWN)?
        }
    };

    std::process::exit(code);
}

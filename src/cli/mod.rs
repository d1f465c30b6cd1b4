//! The CLI surface: argument parsing and dispatch. Thin by design — all
//! real behavior lives in the components this module wires together.

pub mod logs;
pub mod run;
pub mod sessions;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::auth::TokenProvider;
use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::history::HistoryStore;
use crate::runtime_manager::RuntimeManager;
use crate::session_manager::SessionManager;

/// Drives a remote Colab GPU/TPU runtime as a Jupyter kernel over WebSocket.
#[derive(Parser, Debug)]
#[command(name = "colabctl", version, about)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,

    /// Target a specific session by id or unique prefix, instead of the
    /// active one.
    #[arg(long, global = true)]
    pub session: Option<String>,

    /// Force a fresh OAuth login before proceeding. The OAuth flow itself
    /// is out of scope for this core; this flag is logged and otherwise
    /// has no effect here.
    #[arg(long, global = true)]
    pub force_login: bool,

    /// Path to `config.json`, overriding the per-user config directory.
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub json: bool,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute code on a runtime and print the result.
    Run(run::RunArgs),
    /// Open an interactive REPL or PTY against a runtime.
    Connect(run::ConnectArgs),
    /// Show authentication, runtime, and session status.
    Status(status::StatusArgs),
    /// Session lifecycle: list, switch, close, clean.
    Sessions {
        /// The session operation to perform.
        #[command(subcommand)]
        action: sessions::SessionsCommand,
    },
    /// Query the Execution History.
    Logs(logs::LogsArgs),
}

/// The wired-together components every subcommand dispatches against.
pub struct AppContext {
    /// Resolves and persists durable Session Records.
    pub session_manager: SessionManager,
    /// Assigns and refreshes runtime assignments directly, for commands
    /// that need a Runtime without going through a Session Record.
    pub runtime_manager: RuntimeManager,
    /// Live Connections, keyed by session id.
    pub pool: Arc<ConnectionPool>,
    /// The append-only Execution History store.
    pub history: HistoryStore,
    /// Supplies the authenticated account for `status`.
    pub account: Arc<dyn TokenProvider>,
    /// Whether to emit JSON instead of human-readable text.
    pub json: bool,
}

/// Dispatch a parsed CLI invocation. Returns the process exit code.
pub async fn dispatch(cli: Cli, ctx: AppContext) -> Result<i32, Error> {
    if cli.force_login {
        warn!("--force-login was requested; the OAuth flow is handled outside this core and was not re-run");
    }

    match cli.command {
        Command::Run(args) => run::execute(&ctx, cli.session.as_deref(), args).await,
        Command::Connect(_) => {
            eprintln!("connect is not implemented in this build; use `run` for one-shot execution");
            Ok(1)
        }
        Command::Status(args) => status::execute(&ctx, args).await,
        Command::Sessions { action } => sessions::execute(&ctx, action).await,
        Command::Logs(args) => logs::execute(&ctx, args),
    }
}

//! `run` and `connect`: submit code to a runtime and report the result.

use std::sync::Arc;

use clap::ValueEnum;

use crate::cli::AppContext;
use crate::colab::Variant;
use crate::connection::Connection;
use crate::error::Error;
use crate::error_handler::categorize_transport;
use crate::history::{HistoryEntry, Mode as HistoryMode};
use crate::kernel_client::{ExecutionError, ExecutionResult, ExecutionStatus, Timing};
use crate::output;
use crate::runtime_manager::AssignRequest;

/// `run -m kernel|terminal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Execute through the Kernel Client over WebSocket.
    Kernel,
    /// Execute through the PTY-style interactive terminal (out of scope).
    Terminal,
}

/// Arguments for `run`.
#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Execution mode.
    #[arg(short = 'm', long, value_enum, default_value = "kernel")]
    pub mode: Mode,
    /// Always request a brand-new runtime assignment instead of reusing one.
    #[arg(long)]
    pub new_runtime: bool,
    /// Request a TPU runtime.
    #[arg(long)]
    pub tpu: bool,
    /// Request a CPU-only (default variant) runtime.
    #[arg(long)]
    pub cpu: bool,
    /// The code to execute, joined with spaces.
    #[arg(trailing_var_arg = true, required = true)]
    pub code: Vec<String>,
}

/// Arguments for `connect`. The interactive REPL/PTY itself is an external
/// collaborator (§1 Out of scope); this struct only exists so the CLI
/// surface is complete and produces a clear "not implemented" message.
#[derive(clap::Args, Debug)]
pub struct ConnectArgs {
    /// Execution mode.
    #[arg(short = 'm', long, value_enum, default_value = "kernel")]
    pub mode: Mode,
    /// Always request a brand-new runtime assignment instead of reusing one.
    #[arg(long)]
    pub new_runtime: bool,
    /// Request a TPU runtime.
    #[arg(long)]
    pub tpu: bool,
    /// Request a CPU-only (default variant) runtime.
    #[arg(long)]
    pub cpu: bool,
}

fn requested_variant(tpu: bool, cpu: bool) -> Variant {
    if tpu {
        Variant::Tpu
    } else if cpu {
        Variant::Default
    } else {
        Variant::Gpu
    }
}

/// Run `args.code` on the resolved session's kernel and print the result.
/// Returns the process exit code (0 on success, 1 otherwise).
pub async fn execute(ctx: &AppContext, session: Option<&str>, args: RunArgs) -> Result<i32, Error> {
    if args.mode == Mode::Terminal {
        eprintln!("terminal mode is handled by an external PTY bridge and is not implemented in this core");
        return Ok(1);
    }

    let variant = requested_variant(args.tpu, args.cpu);
    let request = AssignRequest {
        variant,
        force_new: args.new_runtime,
        accelerator: None,
    };

    let record = ctx
        .session_manager
        .get_or_create_session(session, request)
        .await?;

    let connection = match ctx.pool.get(&record.id.to_string()) {
        Some(conn) => conn,
        None => {
            let runtime = ctx
                .runtime_manager
                .runtime_for_endpoint(&record.runtime_endpoint)
                .await?;
            let conn = Arc::new(ctx.runtime_manager.create_kernel_connection(&runtime).await?);
            ctx.pool.put(record.id.to_string(), conn.clone());
            conn
        }
    };

    let code = args.code.join(" ");
    let result = run_with_reconnect(&connection, &code).await;

    let (runtime_label, runtime_accelerator) = (record.label.clone(), record.accelerator.clone());
    let output = output::format_execution(result);

    let history_entry = HistoryEntry::new(
        code,
        HistoryMode::Kernel,
        &status_from_output(&output.status),
        output.error_code,
        output.error.as_ref().map(|e| e.category.clone()),
        runtime_label,
        runtime_accelerator,
    );
    ctx.history.append(&history_entry)?;

    let exit_code = if output.status == "ok" { 0 } else { 1 };

    if ctx.json {
        println!("{}", serde_json::to_string(&output).expect("ExecutionOutput serializes"));
    } else {
        print_human(&output);
    }

    Ok(exit_code)
}

async fn run_with_reconnect(connection: &Connection, code: &str) -> ExecutionResult {
    match connection.execute_code(code, None).await {
        Ok(result) => result,
        // The WebSocket dropped while this call was in flight: the call
        // itself resolves as ABORT with the output already captured, never
        // by re-submitting `code`, which may have already run. Reconnect
        // so the *next* call on this session has a healthy connection.
        Err(Error::ExecutionAborted(partial)) => {
            let _ = connection.handle_disconnect().await;
            *partial
        }
        Err(Error::KernelDisconnect | Error::ConnectionFailed(_)) => {
            if connection.handle_disconnect().await.is_ok() {
                match connection.execute_code(code, None).await {
                    Ok(result) => result,
                    Err(Error::ExecutionAborted(partial)) => *partial,
                    Err(err) => transport_failure_result(&err),
                }
            } else {
                transport_failure_result(&Error::ConnectionFailed("connection unstable".into()))
            }
        }
        Err(err) => transport_failure_result(&err),
    }
}

fn transport_failure_result(err: &Error) -> ExecutionResult {
    let classified = categorize_transport(err.to_string(), false);
    let now = time::OffsetDateTime::now_utc();
    ExecutionResult {
        status: ExecutionStatus::Error,
        stdout: String::new(),
        stderr: String::new(),
        display_data: vec![],
        error: Some(ExecutionError {
            ename: "ConnectionError".to_string(),
            evalue: classified.description,
            traceback: vec![],
        }),
        execution_count: None,
        timing: Timing {
            started: now,
            completed: now,
            duration_ms: 0,
        },
    }
}

fn status_from_output(status: &str) -> ExecutionStatus {
    match status {
        "ok" => ExecutionStatus::Ok,
        "abort" => ExecutionStatus::Abort,
        _ => ExecutionStatus::Error,
    }
}

fn print_human(output: &output::ExecutionOutput) {
    if !output.stdout.is_empty() {
        print!("{}", output.stdout);
    }
    if !output.stderr.is_empty() {
        eprint!("{}", output.stderr);
    }
    if let Some(error) = &output.error {
        eprintln!("{}: {}", error.name, error.message);
        if !error.suggestion.is_empty() {
            eprintln!("suggestion: {}", error.suggestion);
        }
    }
}

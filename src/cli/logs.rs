//! `logs`: query and maintain the Execution History.

use crate::cli::AppContext;
use crate::error::Error;
use crate::history::{Mode as HistoryMode, QueryFilters};

const DEFAULT_LIMIT: usize = 20;

/// Arguments for `logs`.
#[derive(clap::Args, Debug)]
pub struct LogsArgs {
    /// Maximum number of entries to show.
    #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
    pub limit: usize,
    /// Filter by outcome.
    #[arg(long, value_parser = ["ok", "error", "abort"])]
    pub status: Option<String>,
    /// Filter by error category.
    #[arg(long)]
    pub category: Option<String>,
    /// Filter by ISO-8601 timestamp or a relative `<N>[smhd]` window.
    #[arg(long)]
    pub since: Option<String>,
    /// Filter by execution mode.
    #[arg(long, value_enum)]
    pub mode: Option<LogsMode>,
    /// Print aggregate statistics instead of individual entries.
    #[arg(long)]
    pub stats: bool,
    /// Truncate the history log to empty.
    #[arg(long)]
    pub clear: bool,
}

/// `--mode` values for `logs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogsMode {
    /// Entries recorded via the Kernel Client.
    Kernel,
    /// Entries recorded via the PTY-style terminal.
    Terminal,
}

impl From<LogsMode> for HistoryMode {
    fn from(mode: LogsMode) -> Self {
        match mode {
            LogsMode::Kernel => HistoryMode::Kernel,
            LogsMode::Terminal => HistoryMode::Terminal,
        }
    }
}

/// Dispatch a `logs` invocation.
pub fn execute(ctx: &AppContext, args: LogsArgs) -> Result<i32, Error> {
    if args.clear {
        ctx.history.clear()?;
        if ctx.json {
            println!("{}", serde_json::json!({"cleared": true}));
        } else {
            println!("history cleared");
        }
        return Ok(0);
    }

    if args.stats {
        let stats = ctx.history.get_stats()?;
        if ctx.json {
            println!("{}", serde_json::to_string(&stats).expect("HistoryStats serializes"));
        } else {
            println!(
                "{} entries, {:.0}% success rate",
                stats.total,
                stats.success_rate * 100.0
            );
            for (mode, count) in &stats.by_mode {
                println!("  {mode}: {count}");
            }
            for (category, count) in &stats.by_category {
                println!("  {category}: {count}");
            }
        }
        return Ok(0);
    }

    let filters = QueryFilters {
        status: args.status,
        category: args.category,
        mode: args.mode.map(HistoryMode::from),
        since: args.since,
        limit: args.limit,
    };
    let entries = ctx.history.query(&filters)?;

    if ctx.json {
        println!("{}", serde_json::to_string(&entries).expect("history entries serialize"));
    } else if entries.is_empty() {
        println!("no matching history entries");
    } else {
        for entry in &entries {
            println!(
                "[{}] {} {} ({})",
                entry.timestamp, entry.status, entry.command, entry.runtime_label
            );
        }
    }

    Ok(0)
}

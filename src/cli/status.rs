//! `status`: authentication, runtime, and session summary in one shot.

use serde::Serialize;

use crate::cli::AppContext;
use crate::error::Error;

/// Arguments for `status`.
#[derive(clap::Args, Debug)]
pub struct StatusArgs {}

#[derive(Debug, Serialize)]
struct StatusReport {
    authenticated: bool,
    account: Option<String>,
    tier: Option<String>,
    sessions: crate::session_manager::SessionStats,
}

/// Report authentication state, the detected tier, and session counts.
pub async fn execute(ctx: &AppContext, _args: StatusArgs) -> Result<i32, Error> {
    let account = ctx.account.account().await.ok().map(|a| a.label);
    let authenticated = account.is_some();
    let stats = ctx.session_manager.get_stats().await?;

    let report = StatusReport {
        authenticated,
        account,
        tier: Some(stats.tier.to_string()),
        sessions: stats,
    };

    if ctx.json {
        println!("{}", serde_json::to_string(&report).expect("StatusReport serializes"));
    } else {
        print_human(&report);
    }

    Ok(0)
}

fn print_human(report: &StatusReport) {
    match (&report.authenticated, &report.account) {
        (true, Some(account)) => println!("logged in as {account} ({} tier)", report.tier.as_deref().unwrap_or("unknown")),
        _ => println!("not logged in; run with --force-login"),
    }
    let stats = &report.sessions;
    println!(
        "sessions: {}/{} ({} active, {} connected, {} stale)",
        stats.total, stats.max, stats.active, stats.connected, stats.stale
    );
}

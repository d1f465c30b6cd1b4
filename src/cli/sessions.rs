//! `sessions {list,switch,close,clean}`: Session Record lifecycle.

use clap::Subcommand;

use crate::cli::AppContext;
use crate::error::Error;

/// Session lifecycle operations.
#[derive(Subcommand, Debug)]
pub enum SessionsCommand {
    /// List every durable Session Record, enriched with live state.
    List,
    /// Make a session the active one.
    Switch {
        /// Session id or unique prefix (≥4 characters).
        id: String,
    },
    /// Delete a session, shutting down its Connection first.
    Close {
        /// Session id or unique prefix (≥4 characters).
        id: String,
    },
    /// Delete every session whose runtime no longer appears in the
    /// account's live assignments.
    Clean,
}

/// Dispatch a `sessions` subcommand.
pub async fn execute(ctx: &AppContext, action: SessionsCommand) -> Result<i32, Error> {
    match action {
        SessionsCommand::List => list(ctx).await,
        SessionsCommand::Switch { id } => switch(ctx, &id).await,
        SessionsCommand::Close { id } => close(ctx, &id).await,
        SessionsCommand::Clean => clean(ctx).await,
    }
}

async fn list(ctx: &AppContext) -> Result<i32, Error> {
    let summaries = ctx.session_manager.list_sessions().await?;
    let stats = ctx.session_manager.get_stats().await?;

    if ctx.json {
        let payload = serde_json::json!({
            "tier": stats.tier.to_string(),
            "max": stats.max,
            "total": stats.total,
            "active": stats.active,
            "connected": stats.connected,
            "stale": stats.stale,
            "sessions": summaries,
        });
        println!("{}", serde_json::to_string(&payload).expect("session list serializes"));
        return Ok(0);
    }

    if summaries.is_empty() {
        println!("no sessions");
        return Ok(0);
    }
    for summary in &summaries {
        let marker = if summary.record.is_active { "*" } else { " " };
        let status = match (summary.connected, summary.stale) {
            (_, true) => "stale",
            (true, false) => "connected",
            (false, false) => "idle",
        };
        println!(
            "{marker} {} {} [{status}]",
            summary.record.id, summary.record.label
        );
    }
    Ok(0)
}

async fn switch(ctx: &AppContext, id: &str) -> Result<i32, Error> {
    let record = ctx.session_manager.switch_session(id).await?;
    if ctx.json {
        println!("{}", serde_json::to_string(&record).expect("SessionRecord serializes"));
    } else {
        println!("switched to {} ({})", record.id, record.label);
    }
    Ok(0)
}

async fn close(ctx: &AppContext, id: &str) -> Result<i32, Error> {
    ctx.session_manager.delete_session(id).await?;
    if ctx.json {
        println!("{}", serde_json::json!({"closed": id}));
    } else {
        println!("closed session {id}");
    }
    Ok(0)
}

async fn clean(ctx: &AppContext) -> Result<i32, Error> {
    let removed = ctx.session_manager.clean_stale_sessions().await?;
    if ctx.json {
        println!(
            "{}",
            serde_json::json!({"removed": removed.iter().map(|id| id.to_string()).collect::<Vec<_>>()})
        );
    } else if removed.is_empty() {
        println!("no stale sessions");
    } else {
        println!("removed {} stale session(s)", removed.len());
    }
    Ok(0)
}

use anyhow::{Result, bail};

use heft_core::{HeftService, SyncOutcome};

use super::helpers::fmt_optional;

fn describe(outcome: &SyncOutcome) -> String {
    match outcome {
        SyncOutcome::Coalesced => "Sync already running; request folded into it".to_string(),
        SyncOutcome::Disabled => "Sync is off. Use `heft sync enable` first.".to_string(),
        SyncOutcome::UpToDate => "Already up to date".to_string(),
        SyncOutcome::Completed {
            cycles,
            pushed,
            pulled,
        } => format!("Synced: pushed {pushed}, pulled {pulled} ({cycles} cycle(s))"),
        SyncOutcome::Failed { message } => format!("Sync failed: {message}"),
    }
}

pub(crate) fn cmd_sync_enable(svc: &HeftService, enabled: bool, json: bool) -> Result<()> {
    svc.set_sync_enabled(enabled)?;
    if json {
        println!("{}", serde_json::json!({ "sync_enabled": enabled }));
    } else if enabled {
        println!("Sync enabled");
    } else {
        println!("Sync disabled");
    }
    Ok(())
}

pub(crate) async fn cmd_sync_now(svc: &HeftService, force: bool, json: bool) -> Result<()> {
    let outcome = svc.request_sync(force).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", describe(&outcome));
    }
    if let SyncOutcome::Failed { message } = outcome {
        bail!("sync failed: {message}");
    }
    Ok(())
}

pub(crate) fn cmd_sync_status(svc: &HeftService, json: bool) -> Result<()> {
    let status = svc.state().sync;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Sync:      {}", if status.enabled { "on" } else { "off" });
        println!("Last sync: {}", fmt_optional(status.last_sync_at.as_ref()));
        if let Some(ref e) = status.last_error {
            println!("Last error: {e}");
        }
    }
    Ok(())
}

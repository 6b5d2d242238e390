use std::path::Path;

use anyhow::{Context, Result, bail};

use heft_core::{BackupOutcome, HeftService, SkipReason};

use super::helpers::fmt_optional;

fn describe(outcome: &BackupOutcome) -> String {
    match outcome {
        BackupOutcome::Completed { path } => format!("Backup written to {}", path.display()),
        BackupOutcome::Skipped(SkipReason::Disabled) => {
            "Backups are off. Use `heft backup configure --enable`.".to_string()
        }
        BackupOutcome::Skipped(SkipReason::NoFolder) => {
            "No backup folder set. Use `heft backup configure --folder <DIR>`.".to_string()
        }
        BackupOutcome::Skipped(SkipReason::NotDue) => "Already backed up today".to_string(),
        BackupOutcome::AlreadyRunning => "A backup is already running".to_string(),
    }
}

pub(crate) fn cmd_backup_configure(
    svc: &HeftService,
    folder: Option<&Path>,
    enable: bool,
    disable: bool,
    json: bool,
) -> Result<()> {
    if enable && disable {
        bail!("Pass only one of --enable and --disable");
    }
    if folder.is_none() && !enable && !disable {
        bail!("Nothing to change. Pass --folder, --enable or --disable");
    }
    if let Some(dir) = folder {
        svc.set_backup_folder(dir)
            .with_context(|| format!("Cannot use backup folder {}", dir.display()))?;
    }
    if enable || disable {
        svc.set_backup_enabled(enable)?;
    }
    cmd_backup_status(svc, json)
}

pub(crate) async fn cmd_backup_run(svc: &HeftService, only_if_due: bool, json: bool) -> Result<()> {
    let outcome = if only_if_due {
        svc.backup_if_due().await?
    } else {
        svc.backup_now().await?
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", describe(&outcome));
    }
    Ok(())
}

pub(crate) fn cmd_backup_status(svc: &HeftService, json: bool) -> Result<()> {
    let state = svc.backup_state()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("Backups:     {}", if state.enabled { "on" } else { "off" });
        println!(
            "Folder:      {}",
            state.folder.as_ref().map_or("-", |f| f.label.as_str())
        );
        println!("Last backup: {}", fmt_optional(state.last_backup_at.as_ref()));
        if let Some(ref e) = state.last_backup_error {
            println!("Last error:  {e}");
        }
    }
    Ok(())
}

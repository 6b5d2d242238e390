use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};

use heft_core::HeftService;

fn open_input(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    Ok(BufReader::new(file))
}

/// Write to `path`, or to stdout when no path is given.
fn with_output<T>(path: Option<&Path>, f: impl FnOnce(&mut dyn Write) -> Result<T>) -> Result<T> {
    if let Some(path) = path {
        let file = File::create(path)
            .with_context(|| format!("Failed to create file: {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let value = f(&mut out)?;
        out.flush()?;
        Ok(value)
    } else {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let value = f(&mut out)?;
        out.flush()?;
        Ok(value)
    }
}

pub(crate) fn cmd_export_snapshot(svc: &HeftService, path: &Path, json: bool) -> Result<()> {
    svc.export_snapshot_to(path)
        .with_context(|| format!("Failed to write snapshot to {}", path.display()))?;
    if json {
        println!("{}", serde_json::json!({ "snapshot": path }));
    } else {
        println!("Snapshot written to {}", path.display());
    }
    Ok(())
}

pub(crate) fn cmd_export_json(svc: &HeftService, path: Option<&Path>) -> Result<()> {
    with_output(path, |out| Ok(svc.export_json(out)?))?;
    if let Some(p) = path {
        eprintln!("Exported JSON to {}", p.display());
    }
    Ok(())
}

pub(crate) fn cmd_export_csv(svc: &HeftService, path: Option<&Path>) -> Result<()> {
    let count = with_output(path, |out| Ok(svc.export_csv(out)?))?;
    if let Some(p) = path {
        eprintln!("Exported {count} entries to {}", p.display());
    }
    Ok(())
}

pub(crate) fn cmd_import_merge(svc: &HeftService, path: &Path, json: bool) -> Result<()> {
    let summary = svc
        .merge_import(path)
        .with_context(|| format!("Failed to merge {}", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if summary.total() == 0 {
        println!("Nothing new to merge.");
    } else {
        println!("Merge complete.\n");
        println!("  Weight entries: {}", summary.weight_entries);
        println!("  Notes:          {}", summary.notes);
        println!("  Settings:       {}", summary.settings);
        println!("  Profile:        {}", summary.profile);
    }
    Ok(())
}

pub(crate) fn cmd_import_json(svc: &HeftService, path: &Path, json: bool) -> Result<()> {
    let summary = svc.import_json(open_input(path)?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Import complete.\n");
        println!("  Weight entries: {}", summary.weight_entries_imported);
        println!("  Notes:          {}", summary.notes_imported);
        println!(
            "  Settings:       {}",
            if summary.settings_imported { "yes" } else { "no" }
        );
        println!(
            "  Profile:        {}",
            if summary.profile_imported { "yes" } else { "no" }
        );
    }
    Ok(())
}

pub(crate) fn cmd_import_csv(
    svc: &HeftService,
    path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let summary = svc.import_csv(open_input(path)?, dry_run)?;

    if summary.rows_parsed == 0 {
        if json {
            println!("{}", serde_json::json!({ "error": "No rows found in CSV file" }));
        } else {
            eprintln!("No rows found in CSV file.");
        }
        return Ok(());
    }

    if json {
        let mut value = serde_json::to_value(&summary)?;
        value["dry_run"] = serde_json::Value::Bool(dry_run);
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        if dry_run {
            println!("Dry run, no changes made.\n");
        } else {
            println!("Import complete.\n");
        }
        println!("  Rows parsed:     {}", summary.rows_parsed);
        println!("  Entries created: {}", summary.entries_created);
        println!("  Entries updated: {}", summary.entries_updated);
        println!("  Notes written:   {}", summary.notes_written);
    }
    Ok(())
}

/// Replaces every record on this device.
pub(crate) fn cmd_restore(svc: &HeftService, path: &Path, yes: bool, json: bool) -> Result<()> {
    if !yes {
        bail!("Restoring replaces all local data. Re-run with --yes to confirm");
    }
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    svc.restore_snapshot(&bytes)
        .with_context(|| format!("Failed to restore from {}", path.display()))?;
    if json {
        println!("{}", serde_json::json!({ "restored": path }));
    } else {
        println!("Restored from {}", path.display());
    }
    Ok(())
}

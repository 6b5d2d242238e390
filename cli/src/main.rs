mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use crate::commands::{
    cmd_backup_configure, cmd_backup_run, cmd_backup_status, cmd_export_csv, cmd_export_json,
    cmd_export_snapshot, cmd_import_csv, cmd_import_json, cmd_import_merge, cmd_note_add,
    cmd_note_delete, cmd_note_list, cmd_profile_set, cmd_profile_show, cmd_restore,
    cmd_settings_set, cmd_settings_show, cmd_sync_enable, cmd_sync_now, cmd_sync_status,
    cmd_weight_delete, cmd_weight_list, cmd_weight_log, cmd_weight_update,
};
use crate::config::Config;
use heft_core::{HeftService, LocalDirReplica, PathFolderAccess, SyncOutcome};

#[derive(Parser)]
#[command(
    name = "heft",
    version,
    about = "A local-first weight journal",
    long_about = "Log your weight, keep notes, sync between devices through a shared \
folder, and keep daily backups."
)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Use this directory for the database and state files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Directory shared with other devices for sync (default: <data-dir>/replica)
    #[arg(long, global = true)]
    replica_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record and edit weigh-ins
    Weight {
        #[command(subcommand)]
        command: WeightCommands,
    },
    /// Free-standing journal notes
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },
    /// App preferences
    Settings {
        #[command(subcommand)]
        command: SettingsCommands,
    },
    /// Personal details
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    /// Sync with other devices
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
    /// Daily snapshot backups
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Write data out as a snapshot, JSON or CSV
    Export {
        #[command(subcommand)]
        command: ExportCommands,
    },
    /// Bring data in from a snapshot, JSON or CSV
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
    /// Replace all local data with a snapshot file
    Restore {
        /// Snapshot file to restore
        path: PathBuf,
        /// Confirm replacing all local data
        #[arg(long)]
        yes: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Log a weigh-in
    Log {
        /// Weight value
        value: f64,
        /// Unit: kg or lb (default: preferred unit)
        #[arg(short, long)]
        unit: Option<String>,
        /// Date (YYYY-MM-DD, today, yesterday; default: now)
        #[arg(long)]
        date: Option<String>,
        /// Time of day (HH:MM)
        #[arg(long)]
        time: Option<String>,
        /// Note to attach
        #[arg(short, long)]
        note: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List weigh-ins, newest first
    List {
        /// Show at most this many entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Display unit (default: preferred unit)
        #[arg(short, long)]
        unit: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit a weigh-in
    Update {
        /// Entry ID
        id: String,
        /// New weight value
        #[arg(long)]
        value: Option<f64>,
        /// New unit
        #[arg(short, long)]
        unit: Option<String>,
        /// New date (keeps the time of day unless --time is given)
        #[arg(long)]
        date: Option<String>,
        /// New time of day (HH:MM)
        #[arg(long)]
        time: Option<String>,
        /// New note text (empty string removes the note)
        #[arg(short, long)]
        note: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a weigh-in and its note
    Delete {
        /// Entry ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum NoteCommands {
    /// Write a note
    Add {
        /// Note text
        body: String,
        /// Date (YYYY-MM-DD, today, yesterday; default: now)
        #[arg(long)]
        date: Option<String>,
        /// Time of day (HH:MM)
        #[arg(long)]
        time: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List notes, newest first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a note
    Delete {
        /// Note ID
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show current settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change settings
    Set {
        /// Preferred unit: kg or lb
        #[arg(long)]
        unit: Option<String>,
        /// Daily reminder on or off
        #[arg(long)]
        reminder: Option<bool>,
        /// Reminder time (HH:MM)
        #[arg(long)]
        reminder_time: Option<String>,
        /// Mark onboarding as done or not
        #[arg(long)]
        onboarding_complete: Option<bool>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show the profile
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Change profile fields
    Set {
        /// Birthday (YYYY-MM-DD, or 'none' to clear)
        #[arg(long)]
        birthday: Option<String>,
        /// Gender: female, male, other, unspecified
        #[arg(long)]
        gender: Option<String>,
        /// Height in centimetres
        #[arg(long)]
        height_cm: Option<f64>,
        /// Avatar image path (or 'none' to clear)
        #[arg(long)]
        avatar: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Turn sync on and run a first cycle
    Enable {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Turn sync off
    Disable {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sync right away
    Now {
        /// Run a cycle even when nothing is pending
        #[arg(long)]
        force: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Set the backup folder and turn backups on or off
    Configure {
        /// Folder to write backups into
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Turn daily backups on
        #[arg(long)]
        enable: bool,
        /// Turn daily backups off
        #[arg(long)]
        disable: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Back up now, even if one already ran today
    Now {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Back up only if today's backup has not run yet
    Due {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show backup status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ExportCommands {
    /// Write a full database snapshot
    Snapshot {
        /// Output file
        path: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Export everything as JSON
    Json {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Export weigh-ins as CSV
    Csv {
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ImportCommands {
    /// Merge records from another heft database, keeping local ones
    Merge {
        /// Database file to merge from
        path: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import a JSON export
    Json {
        /// JSON file
        path: PathBuf,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import weigh-ins from CSV (Date,Weight,Unit,Note)
    Csv {
        /// CSV file
        path: PathBuf,
        /// Show what would be imported without writing
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new("warn"),
            1 => EnvFilter::new("info"),
            2 => EnvFilter::new("debug,rusqlite=info"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn open_service(cli: &Cli) -> Result<HeftService> {
    let config = Config::load(cli.data_dir.as_deref(), cli.replica_dir.as_deref())?;
    config.ensure_default_replica_dir()?;
    let remote = Arc::new(LocalDirReplica::new(config.replica_dir.clone()));
    HeftService::open(&config.to_service_config(), remote, Arc::new(PathFolderAccess))
        .with_context(|| format!("Failed to open database: {}", config.db_path.display()))
}

#[allow(clippy::too_many_lines)]
async fn run(cli: Cli) -> Result<()> {
    let svc = open_service(&cli)?;

    match cli.command {
        Commands::Weight { command } => match command {
            WeightCommands::Log {
                value,
                unit,
                date,
                time,
                note,
                json,
            } => cmd_weight_log(&svc, value, unit, date, time, note, json)?,
            WeightCommands::List { limit, unit, json } => cmd_weight_list(&svc, limit, unit, json)?,
            WeightCommands::Update {
                id,
                value,
                unit,
                date,
                time,
                note,
                json,
            } => cmd_weight_update(&svc, &id, value, unit, date, time, note, json)?,
            WeightCommands::Delete { id, json } => cmd_weight_delete(&svc, &id, json)?,
        },
        Commands::Note { command } => match command {
            NoteCommands::Add {
                body,
                date,
                time,
                json,
            } => cmd_note_add(&svc, &body, date, time, json)?,
            NoteCommands::List { json } => cmd_note_list(&svc, json)?,
            NoteCommands::Delete { id, json } => cmd_note_delete(&svc, &id, json)?,
        },
        Commands::Settings { command } => match command {
            SettingsCommands::Show { json } => cmd_settings_show(&svc, json)?,
            SettingsCommands::Set {
                unit,
                reminder,
                reminder_time,
                onboarding_complete,
                json,
            } => cmd_settings_set(&svc, unit, reminder, reminder_time, onboarding_complete, json)?,
        },
        Commands::Profile { command } => match command {
            ProfileCommands::Show { json } => cmd_profile_show(&svc, json)?,
            ProfileCommands::Set {
                birthday,
                gender,
                height_cm,
                avatar,
                json,
            } => cmd_profile_set(&svc, birthday, gender, height_cm, avatar, json)?,
        },
        Commands::Sync { command } => match command {
            SyncCommands::Enable { json } => cmd_sync_enable(&svc, true, json)?,
            SyncCommands::Disable { json } => cmd_sync_enable(&svc, false, json)?,
            SyncCommands::Now { force, json } => cmd_sync_now(&svc, force, json).await?,
            SyncCommands::Status { json } => cmd_sync_status(&svc, json)?,
        },
        Commands::Backup { command } => match command {
            BackupCommands::Configure {
                folder,
                enable,
                disable,
                json,
            } => cmd_backup_configure(&svc, folder.as_deref(), enable, disable, json)?,
            BackupCommands::Now { json } => cmd_backup_run(&svc, false, json).await?,
            BackupCommands::Due { json } => cmd_backup_run(&svc, true, json).await?,
            BackupCommands::Status { json } => cmd_backup_status(&svc, json)?,
        },
        Commands::Export { command } => match command {
            ExportCommands::Snapshot { path, json } => cmd_export_snapshot(&svc, &path, json)?,
            ExportCommands::Json { output } => cmd_export_json(&svc, output.as_deref())?,
            ExportCommands::Csv { output } => cmd_export_csv(&svc, output.as_deref())?,
        },
        Commands::Import { command } => match command {
            ImportCommands::Merge { path, json } => cmd_import_merge(&svc, &path, json)?,
            ImportCommands::Json { path, json } => cmd_import_json(&svc, &path, json)?,
            ImportCommands::Csv {
                path,
                dry_run,
                json,
            } => cmd_import_csv(&svc, &path, dry_run, json)?,
        },
        Commands::Restore { path, yes, json } => cmd_restore(&svc, &path, yes, json)?,
    }

    // Local edits queue background syncs; let them finish before exiting.
    for outcome in svc.settle().await {
        if let SyncOutcome::Failed { message } = outcome {
            tracing::warn!(%message, "background sync failed");
        }
    }
    Ok(())
}

mod backup;
mod helpers;
mod note;
mod settings;
mod sync;
mod transfer;
mod weight;

pub(crate) use backup::{cmd_backup_configure, cmd_backup_run, cmd_backup_status};
pub(crate) use note::{cmd_note_add, cmd_note_delete, cmd_note_list};
pub(crate) use settings::{cmd_profile_set, cmd_profile_show, cmd_settings_set, cmd_settings_show};
pub(crate) use sync::{cmd_sync_enable, cmd_sync_now, cmd_sync_status};
pub(crate) use transfer::{
    cmd_export_csv, cmd_export_json, cmd_export_snapshot, cmd_import_csv, cmd_import_json,
    cmd_import_merge, cmd_restore,
};
pub(crate) use weight::{cmd_weight_delete, cmd_weight_list, cmd_weight_log, cmd_weight_update};

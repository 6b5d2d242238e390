use anyhow::{Result, bail};
use tabled::{Table, Tabled, settings::Style};

use heft_core::HeftService;

use super::helpers::{fmt_local, parse_recorded_at, truncate};

pub(crate) fn cmd_note_add(
    svc: &HeftService,
    body: &str,
    date: Option<String>,
    time: Option<String>,
    json: bool,
) -> Result<()> {
    let recorded_at = parse_recorded_at(date, time)?;
    let note = svc.add_note(body, recorded_at)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&note)?);
    } else {
        println!("Added note {} for {}", note.id, fmt_local(&note.recorded_at));
    }
    Ok(())
}

pub(crate) fn cmd_note_list(svc: &HeftService, json: bool) -> Result<()> {
    let notes = svc.list_notes()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&notes)?);
    } else if notes.is_empty() {
        eprintln!("No notes yet. Use `heft note add` to write one.");
    } else {
        #[derive(Tabled)]
        struct NoteRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Recorded")]
            recorded: String,
            #[tabled(rename = "Note")]
            body: String,
        }

        let rows: Vec<NoteRow> = notes
            .iter()
            .map(|n| NoteRow {
                id: n.id.clone(),
                recorded: fmt_local(&n.recorded_at),
                body: truncate(&n.body, 60),
            })
            .collect();
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }
    Ok(())
}

/// Entries that pointed at the note keep their weight and lose the link.
pub(crate) fn cmd_note_delete(svc: &HeftService, id: &str, json: bool) -> Result<()> {
    if !svc.delete_note(id)? {
        bail!("No note with ID '{id}'");
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted note {id}");
    }
    Ok(())
}

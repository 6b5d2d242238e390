use anyhow::{Result, bail};
use chrono::Local;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use heft_core::HeftService;
use heft_core::models::{EntrySource, EntryView, NewWeightEntry, UpdateWeightEntry, WeightUnit};

use super::helpers::{
    adjust_recorded_at, fmt_local, fmt_weight, parse_recorded_at, parse_unit, truncate,
};

fn print_entry(verb: &str, view: &EntryView, display: WeightUnit) {
    let e = &view.entry;
    let mut line = format!(
        "{verb} {} at {}",
        fmt_weight(e.value, e.unit),
        fmt_local(&e.recorded_at)
    );
    if e.unit != display {
        line.push_str(&format!(" ({})", fmt_weight(e.value_in(display), display)));
    }
    println!("{line}");
    println!("  ID: {}", e.id);
    if let Some(ref n) = view.note {
        println!("  Note: {n}");
    }
}

pub(crate) fn cmd_weight_log(
    svc: &HeftService,
    value: f64,
    unit: Option<String>,
    date: Option<String>,
    time: Option<String>,
    note: Option<String>,
    json: bool,
) -> Result<()> {
    if value <= 0.0 {
        bail!("Weight must be greater than 0");
    }
    let preferred = svc.settings()?.preferred_unit;
    let unit = match unit {
        Some(u) => parse_unit(&u)?,
        None => preferred,
    };
    let backdated = date.is_some();
    let recorded_at = parse_recorded_at(date, time)?;
    let earlier_day = recorded_at.with_timezone(&Local).date_naive() < Local::now().date_naive();
    let source = if backdated && earlier_day {
        EntrySource::Backdated
    } else {
        EntrySource::Manual
    };

    let view = svc.log_weight(&NewWeightEntry {
        value,
        unit,
        recorded_at,
        source,
        note,
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_entry("Logged", &view, preferred);
    }
    Ok(())
}

pub(crate) fn cmd_weight_list(
    svc: &HeftService,
    limit: Option<usize>,
    unit: Option<String>,
    json: bool,
) -> Result<()> {
    let display = match unit {
        Some(u) => parse_unit(&u)?,
        None => svc.settings()?.preferred_unit,
    };
    let mut entries = svc.list_weights()?;
    if let Some(n) = limit {
        entries.truncate(n);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        eprintln!("No weight entries found. Use `heft weight log` to record your weight.");
    } else {
        #[derive(Tabled)]
        struct WeightRow {
            #[tabled(rename = "ID")]
            id: String,
            #[tabled(rename = "Recorded")]
            recorded: String,
            #[tabled(rename = "Logged as")]
            logged: String,
            #[tabled(rename = "Weight")]
            shown: String,
            #[tabled(rename = "Source")]
            source: String,
            #[tabled(rename = "Note")]
            note: String,
        }

        let rows: Vec<WeightRow> = entries
            .iter()
            .map(|v| WeightRow {
                id: v.entry.id.clone(),
                recorded: fmt_local(&v.entry.recorded_at),
                logged: fmt_weight(v.entry.value, v.entry.unit),
                shown: fmt_weight(v.entry.value_in(display), display),
                source: v.entry.source.as_str().to_string(),
                note: v.note.as_deref().map(|n| truncate(n, 40)).unwrap_or_default(),
            })
            .collect();

        let table = Table::new(&rows)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(2..4)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn cmd_weight_update(
    svc: &HeftService,
    id: &str,
    value: Option<f64>,
    unit: Option<String>,
    date: Option<String>,
    time: Option<String>,
    note: Option<String>,
    json: bool,
) -> Result<()> {
    if value.is_some_and(|v| v <= 0.0) {
        bail!("Weight must be greater than 0");
    }
    let Some(current) = svc.get_weight(id)? else {
        bail!("No weight entry with ID '{id}'");
    };
    let edit = UpdateWeightEntry {
        value,
        unit: unit.as_deref().map(parse_unit).transpose()?,
        recorded_at: adjust_recorded_at(current.entry.recorded_at, date, time)?,
        note,
    };

    let Some(view) = svc.update_weight(id, &edit)? else {
        bail!("No weight entry with ID '{id}'");
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_entry("Updated to", &view, svc.settings()?.preferred_unit);
    }
    Ok(())
}

pub(crate) fn cmd_weight_delete(svc: &HeftService, id: &str, json: bool) -> Result<()> {
    if !svc.delete_weight(id)? {
        bail!("No weight entry with ID '{id}'");
    }
    if json {
        println!("{}", serde_json::json!({ "deleted": id }));
    } else {
        println!("Deleted weight entry {id}");
    }
    Ok(())
}

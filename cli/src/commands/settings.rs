use anyhow::{Result, bail};
use chrono::{NaiveDate, Timelike};

use heft_core::HeftService;
use heft_core::models::{Profile, Settings};

use super::helpers::{fmt_optional, parse_gender, parse_time, parse_unit};

fn print_settings(s: &Settings) {
    println!("Preferred unit:  {}", s.preferred_unit.as_str());
    if s.reminder_enabled {
        println!("Reminder:        on at {:02}:{:02}", s.reminder_hour, s.reminder_minute);
    } else {
        println!("Reminder:        off");
    }
    println!("Onboarding done: {}", if s.onboarding_complete { "yes" } else { "no" });
    println!("Sync:            {}", if s.sync_enabled { "on" } else { "off" });
}

pub(crate) fn cmd_settings_show(svc: &HeftService, json: bool) -> Result<()> {
    let settings = svc.settings()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        print_settings(&settings);
    }
    Ok(())
}

pub(crate) fn cmd_settings_set(
    svc: &HeftService,
    unit: Option<String>,
    reminder: Option<bool>,
    reminder_time: Option<String>,
    onboarding_complete: Option<bool>,
    json: bool,
) -> Result<()> {
    let unit = unit.as_deref().map(parse_unit).transpose()?;
    let reminder_time = reminder_time.as_deref().map(parse_time).transpose()?;
    if unit.is_none()
        && reminder.is_none()
        && reminder_time.is_none()
        && onboarding_complete.is_none()
    {
        bail!(
            "Nothing to change. Pass --unit, --reminder, --reminder-time or --onboarding-complete"
        );
    }

    let settings = svc.update_settings(|s| {
        if let Some(unit) = unit {
            s.preferred_unit = unit;
        }
        if let Some(on) = reminder {
            s.reminder_enabled = on;
        }
        if let Some(t) = reminder_time {
            s.reminder_hour = t.hour() as u8;
            s.reminder_minute = t.minute() as u8;
        }
        if let Some(done) = onboarding_complete {
            s.onboarding_complete = done;
        }
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        print_settings(&settings);
    }
    Ok(())
}

fn print_profile(p: &Profile) {
    println!(
        "Birthday: {}",
        p.birthday.map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d").to_string())
    );
    println!("Gender:   {}", p.gender.as_str());
    println!(
        "Height:   {}",
        p.height_cm.map_or_else(|| "-".to_string(), |h| format!("{h:.1} cm"))
    );
    println!("Avatar:   {}", p.avatar_path.as_deref().unwrap_or("-"));
    println!("Updated:  {}", fmt_optional(Some(&p.meta.updated_at)));
}

pub(crate) fn cmd_profile_show(svc: &HeftService, json: bool) -> Result<()> {
    let profile = svc.profile()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        print_profile(&profile);
    }
    Ok(())
}

/// `none` clears a text field.
fn clearable(value: Option<String>) -> Option<Option<String>> {
    value.map(|v| if v.eq_ignore_ascii_case("none") { None } else { Some(v) })
}

pub(crate) fn cmd_profile_set(
    svc: &HeftService,
    birthday: Option<String>,
    gender: Option<String>,
    height_cm: Option<f64>,
    avatar: Option<String>,
    json: bool,
) -> Result<()> {
    let birthday = match clearable(birthday) {
        Some(Some(s)) => Some(Some(NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| {
            anyhow::anyhow!("Invalid birthday '{s}'. Use YYYY-MM-DD or 'none'")
        })?)),
        Some(None) => Some(None),
        None => None,
    };
    let gender = gender.as_deref().map(parse_gender).transpose()?;
    if height_cm.is_some_and(|h| !h.is_finite() || h <= 0.0) {
        bail!("Height must be greater than 0");
    }
    let avatar = clearable(avatar);

    let profile = svc.update_profile(|p| {
        if let Some(b) = birthday {
            p.birthday = b;
        }
        if let Some(g) = gender {
            p.gender = g;
        }
        if let Some(h) = height_cm {
            p.height_cm = Some(h);
        }
        if let Some(a) = avatar {
            p.avatar_path = a;
        }
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        print_profile(&profile);
    }
    Ok(())
}

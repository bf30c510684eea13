use ansi_term::{Colour, Style};
use chrono::Duration;

use crate::{
    settings::Settings,
    status::{resolver::end_millis, SessionStatus, StatusSnapshot},
    store::{duration::Seconds, entities::Record},
    utils::time::local_from_millis,
};

pub fn format_duration(v: Duration) -> String {
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}

pub fn format_seconds(value: u64) -> String {
    format_duration(Seconds::new(value).as_duration())
}

/// Parses `#rrggbb` (or `#rgb`) tag colours from the settings.
pub fn tag_colour(hex: &str) -> Option<Colour> {
    let digits = hex.strip_prefix('#')?;
    let expanded: String = match digits.len() {
        3 => digits.chars().flat_map(|c| [c, c]).collect(),
        6 => digits.to_string(),
        _ => return None,
    };
    let channel = |i: usize| u8::from_str_radix(expanded.get(i..i + 2)?, 16).ok();
    Some(Colour::RGB(channel(0)?, channel(2)?, channel(4)?))
}

fn paint_tags(tags: &[String], settings: &Settings) -> String {
    tags.iter()
        .map(|tag| {
            let style = settings
                .tag(tag)
                .and_then(|t| tag_colour(&t.color))
                .map_or_else(Style::new, |c| c.normal());
            style.paint(tag.as_str()).to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn print_records(records: &[Record], settings: &Settings, now_ms: i64) {
    for record in records {
        let start = local_from_millis(record.id);
        let length = match end_millis(record) {
            Some(_) => format_duration(Seconds::of(record).as_duration()),
            None => Colour::Green
                .bold()
                .paint(format!(
                    "running {}",
                    format_duration(Seconds::elapsed_between(record.id, now_ms).as_duration())
                ))
                .to_string(),
        };
        let focus = if record.is_focus { "*" } else { " " };
        println!(
            "{}\t{}\t{focus}{length}\t{}\t{}",
            record.id,
            start.format("%x %H:%M"),
            paint_tags(&record.tags, settings),
            record.task
        );
    }
}

pub fn print_status(snapshot: &StatusSnapshot) {
    match &snapshot.status {
        SessionStatus::Idle => println!("{}", Style::new().dimmed().paint("idle")),
        SessionStatus::Active {
            activity,
            tag,
            elapsed_seconds,
            remaining_seconds,
            focus,
            ..
        } => {
            let label = tag.as_deref().unwrap_or("untagged");
            let mut line = format!(
                "{} {label} ({activity:?}) for {}",
                Colour::Green.bold().paint("active"),
                format_seconds(*elapsed_seconds)
            );
            if let Some(remaining) = remaining_seconds {
                line.push_str(&format!(", {} left", format_seconds(*remaining)));
            }
            if *focus {
                line.push_str(", focus");
            }
            println!("{line}");
        }
    }
    println!("icon {}", snapshot.icon.display());
}

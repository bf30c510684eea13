pub mod collaborators;
pub mod output;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Local};
use chrono_english::{parse_date_string, Dialect};
use clap::{CommandFactory, Parser, Subcommand};
use collaborators::{LoggedHooks, TerminalBell};
use now::DateTimeNow;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;

use crate::{
    engine::{close_core, open_core, run_engine, Collaborators, Core, EngineConfig},
    events::CoreEvent,
    status::icon::FsAssetProbe,
    store::{
        duration::Seconds,
        entities::{Record, RecordPatch},
    },
    utils::{
        clock::{Clock, DefaultClock},
        dir::create_application_default_path,
        logging::{enable_logging, LOG_PREFIX},
        runtime::single_thread_runtime,
    },
};

/// Longest session the command line accepts, 100 days.
const MAX_MINUTES: u64 = 100 * 24 * 60;

#[derive(Parser, Debug)]
#[command(name = "timepet", version, long_about = None)]
#[command(about = "Time tracking sessions for the desktop pet", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
    )]
    dir: Option<PathBuf>,
    #[arg(long, global = true, help = "Directory with icon assets. Defaults to <dir>/assets")]
    assets: Option<PathBuf>,
    #[arg(long = "log-filter", global = true, help = "Log level, e.g. debug or trace")]
    log: Option<LevelFilter>,
    /// This option is for debugging purposes only.
    #[arg(long = "log-console", global = true)]
    log_console: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "List recorded sessions")]
    Records {
        #[arg(
            long,
            short,
            help = "Only sessions started after this. Examples are \"yesterday\", \"1 hour ago\", \"15/03/2025\""
        )]
        since: Option<String>,
        #[arg(long, conflicts_with = "since", help = "Only sessions started today")]
        today: bool,
        #[arg(long, help = "Print raw records as JSON")]
        json: bool,
    },
    #[command(about = "Start a session. Without --minutes it runs until stopped")]
    Start {
        #[arg(long, short, default_value = "")]
        task: String,
        #[arg(long = "tag", short = 'g')]
        tags: Vec<String>,
        #[arg(long, short, value_parser = clap::value_parser!(u64).range(1..=MAX_MINUTES))]
        minutes: Option<u64>,
        #[arg(long, requires = "minutes", help = "Countdown session that rings when it ends")]
        focus: bool,
        #[arg(long = "screenshot", help = "Image file to attach")]
        screenshots: Vec<PathBuf>,
    },
    #[command(about = "Stop the running session")]
    Stop,
    #[command(about = "Change fields of a recorded session")]
    Update {
        id: i64,
        #[arg(long, short)]
        task: Option<String>,
        #[arg(long, short)]
        desc: Option<String>,
        #[arg(long = "tag", short = 'g', help = "Replaces every tag of the session")]
        tags: Vec<String>,
        #[arg(long, short, value_parser = clap::value_parser!(u64).range(1..=MAX_MINUTES))]
        minutes: Option<u64>,
        #[arg(long)]
        focus: Option<bool>,
    },
    #[command(about = "Delete a recorded session")]
    Delete { id: i64 },
    #[command(about = "Show the current status and icon")]
    Status {
        #[arg(long)]
        json: bool,
    },
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },
    #[command(about = "Store an image as a manual capture and print its reference")]
    Capture { file: PathBuf },
    #[command(about = "Keep the status fresh and print every change until interrupted")]
    Watch,
}

#[derive(Subcommand, Debug)]
enum SettingsCommand {
    Show,
    #[command(about = "Merge a JSON object into the settings, e.g. '{\"autoStart\": true}'")]
    Set { patch: String },
}

pub fn run_cli() -> Result<()> {
    let args = Args::parse();
    let dir = args
        .dir
        .clone()
        .map_or_else(create_application_default_path, Ok)?;
    enable_logging(LOG_PREFIX, &dir, args.log, args.log_console)?;
    single_thread_runtime()?.block_on(execute(args, dir))
}

async fn execute(args: Args, dir: PathBuf) -> Result<()> {
    let config = EngineConfig::new(dir, args.assets);
    let clock: Arc<dyn Clock> = Arc::new(DefaultClock);
    let collaborators = Collaborators {
        hooks: Arc::new(LoggedHooks),
        cue: Arc::new(TerminalBell),
        probe: Box::new(FsAssetProbe),
    };
    let core = Arc::new(open_core(&config, collaborators, clock.clone()).await?);

    let result = run_command(&core, args.commands, clock).await;
    close_core(&core).await;
    result
}

async fn run_command(core: &Arc<Core>, command: Commands, clock: Arc<dyn Clock>) -> Result<()> {
    match command {
        Commands::Records { since, today, json } => {
            let since = parse_since(since, today)?;
            let records: Vec<Record> = core
                .get_records()
                .await
                .into_iter()
                .filter(|r| since.map_or(true, |s| r.id >= s.timestamp_millis()))
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                output::print_records(&records, &core.get_settings(), clock.millis());
            }
        }
        Commands::Start {
            task,
            tags,
            minutes,
            focus,
            screenshots,
        } => {
            let id = clock.millis();
            let mut record = Record::new(id)
                .with_task(task)
                .with_tags(tags)
                .with_focus(focus);
            if let Some(minutes) = minutes {
                record = record.with_duration(Seconds::new(minutes * 60).encode_for(id));
            }
            for file in screenshots {
                record.screenshots.push(data_uri_for(&file).await?);
            }
            let saved = core.save_record(record).await;
            println!("Started {}", saved.id);
        }
        Commands::Stop => match core.stop_current_record().await {
            Some(stopped) => println!(
                "Stopped {} after {}",
                stopped.id,
                output::format_seconds(Seconds::of(&stopped).get())
            ),
            None => println!("Nothing is running"),
        },
        Commands::Update {
            id,
            task,
            desc,
            tags,
            minutes,
            focus,
        } => {
            let patch = RecordPatch {
                task,
                desc,
                tags: (!tags.is_empty()).then_some(tags),
                duration: minutes.map(|m| Seconds::new(m * 60).encode_for(id)),
                is_focus: focus,
                ..RecordPatch::default()
            };
            let updated = core.update_record_parts(id, patch).await?;
            output::print_records(&[updated], &core.get_settings(), clock.millis());
        }
        Commands::Delete { id } => {
            core.delete_record(id).await?;
            println!("Deleted {id}");
        }
        Commands::Status { json } => {
            let snapshot = core.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                output::print_status(&snapshot);
            }
        }
        Commands::Settings { command } => {
            let settings = match command {
                SettingsCommand::Show => core.get_settings(),
                SettingsCommand::Set { patch } => {
                    let patch: Value = serde_json::from_str(&patch)?;
                    core.save_settings(patch)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        Commands::Capture { file } => {
            let reference = core.save_manual_capture(&data_uri_for(&file).await?).await?;
            println!("{reference}");
        }
        Commands::Watch => watch(core.clone(), clock).await?,
    }
    Ok(())
}

async fn watch(core: Arc<Core>, clock: Arc<dyn Clock>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let mut events = core.bus().subscribe();

    let printer = async {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(CoreEvent::IconChanged(snapshot)) => output::print_status(&snapshot),
                    Ok(_) | Err(RecvError::Lagged(_)) => (),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    };

    let (result, _) = tokio::join!(run_engine(core.clone(), clock, shutdown.clone()), printer);
    result
}

fn parse_since(since: Option<String>, today: bool) -> Result<Option<DateTime<Local>>> {
    let now = Local::now();
    if today {
        return Ok(Some(now.beginning_of_day()));
    }
    match since.map(|s| parse_date_string(&s, now, Dialect::Uk)) {
        Some(Ok(v)) => Ok(Some(v)),
        Some(Err(e)) => Err(Args::command()
            .error(
                clap::error::ErrorKind::ValueValidation,
                format!("Failed to validate --since {e}"),
            )
            .into()),
        None => Ok(None),
    }
}

/// Reads an image file into the inline form records carry before materialization.
async fn data_uri_for(file: &Path) -> Result<String> {
    let bytes = tokio::fs::read(file).await?;
    Ok(format!(
        "data:{};base64,{}",
        mime_for(file),
        STANDARD.encode(bytes)
    ))
}

fn mime_for(file: &Path) -> &'static str {
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use clap::Parser;

    use super::{mime_for, parse_since, Args, Commands};

    #[test]
    fn test_focus_requires_minutes() {
        assert!(Args::try_parse_from(["timepet", "start", "--focus"]).is_err());
        let args =
            Args::try_parse_from(["timepet", "start", "--focus", "-m", "25", "-g", "学习"]).unwrap();
        match args.commands {
            Commands::Start {
                focus,
                minutes,
                tags,
                ..
            } => {
                assert!(focus);
                assert_eq!(minutes, Some(25));
                assert_eq!(tags, vec!["学习".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_minutes_out_of_range_are_rejected() {
        for minutes in ["0", "144001", "18446744073709551615"] {
            assert!(Args::try_parse_from(["timepet", "start", "-m", minutes]).is_err());
            assert!(Args::try_parse_from(["timepet", "update", "1", "-m", minutes]).is_err());
        }
        assert!(Args::try_parse_from(["timepet", "start", "-m", "144000"]).is_ok());
    }

    #[test]
    fn test_global_dir_after_subcommand() {
        let args = Args::try_parse_from(["timepet", "status", "--dir", "/tmp/pet"]).unwrap();
        assert_eq!(args.dir.as_deref(), Some(Path::new("/tmp/pet")));
    }

    #[test]
    fn test_parse_since() {
        assert!(parse_since(None, false).unwrap().is_none());
        assert!(parse_since(Some("yesterday".into()), false).unwrap().is_some());
        assert!(parse_since(Some("not a date at all".into()), false).is_err());
    }

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_for(Path::new("shot.JPG")), "image/jpeg");
        assert_eq!(mime_for(Path::new("shot.webp")), "image/webp");
        assert_eq!(mime_for(Path::new("shot")), "image/png");
    }
}

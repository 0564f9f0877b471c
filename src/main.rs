use anyhow::{Context, Result};
use calltrace::cli::{CatArgs, Cli, Command, LogCommand, OutputFormat};
use calltrace::config::Config;
use calltrace::log::LogStatus;
use calltrace::storage::Storage;
use calltrace::symbols::SymbolTable;
use calltrace::types::{LogId, Pc, Time};
use clap::Parser;
use serde::Serialize;
use std::ops::ControlFlow;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Resolve the configuration: file or environment, then CLI overrides
fn load_config(cli: &Cli, read_only: bool) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::from_env_or_default()?,
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    config.read_only = read_only;
    Ok(config)
}

fn parse_id(id: &str) -> Result<LogId> {
    id.parse::<LogId>()
        .with_context(|| format!("invalid log id {:?}", id))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn format_frames(frames: &[Pc], symbols: Option<&SymbolTable>) -> String {
    frames
        .iter()
        .map(|&pc| match symbols {
            Some(table) => format!("{} ({})", table.func_name(pc), table.file_line(pc)),
            None => format!("{:#x}", pc),
        })
        .collect::<Vec<_>>()
        .join(" <- ")
}

#[derive(Serialize)]
struct LogSummary {
    id: LogId,
    status: LogStatus,
    raw_events: Option<u64>,
    segments: Option<usize>,
}

fn cmd_ls(storage: &Storage, format: OutputFormat) -> Result<()> {
    for id in storage.log_ids()? {
        let status = storage.status(id);
        let (raw_events, segments) = match status {
            LogStatus::Created => {
                let log = storage.log(id)?;
                (
                    Some(log.raw_event_count()?),
                    Some(log.index_records()?.len()),
                )
            }
            _ => (None, None),
        };
        let summary = LogSummary {
            id,
            status,
            raw_events,
            segments,
        };
        match format {
            OutputFormat::Json => print_json(&summary)?,
            OutputFormat::Text => println!(
                "{}  {:<11}  {:>10}  {:>4}",
                summary.id,
                summary.status,
                raw_events.map_or("-".to_string(), |n| n.to_string()),
                segments.map_or("-".to_string(), |n| n.to_string()),
            ),
        }
    }
    Ok(())
}

fn cmd_info(storage: &Storage, id: LogId, format: OutputFormat) -> Result<()> {
    let log = storage.log(id)?;
    let info = log.log_info();
    let index = log.index_records()?;
    match format {
        OutputFormat::Json => {
            print_json(&info)?;
            for rec in &index {
                print_json(rec)?;
            }
        }
        OutputFormat::Text => {
            println!("log-id:           {}", info.id);
            println!("version:          {}", info.version);
            println!("timestamp:        {}", info.metadata.timestamp);
            println!("max-segment-size: {}", info.max_segment_size);
            println!("raw events:       {}", log.raw_event_count()?);
            let symbols = log.symbols()?;
            println!(
                "symbols:          {} functions, {} lines, {} files, {} modules",
                symbols.functions_len(),
                symbols.lines_len(),
                symbols.files_len(),
                symbols.modules_len()
            );
            println!("segments:");
            for (i, rec) in index.iter().enumerate() {
                let range = if rec.records > 0 {
                    format!("[{}, {}]", rec.min_timestamp, rec.max_timestamp)
                } else {
                    "empty".to_string()
                };
                println!(
                    "  {:>4}  records={:<8} {}{}",
                    i,
                    rec.records,
                    range,
                    if rec.writing { "  (writing)" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn cmd_cat(storage: &Storage, args: &CatArgs, format: OutputFormat) -> Result<()> {
    let log = storage.log(parse_id(&args.id)?)?;
    let symbols = if args.symbols {
        Some(log.symbols()?)
    } else {
        None
    };
    let symbols = symbols.as_deref();

    if args.goroutines {
        log.walk_goroutines(|g| {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string(g)?),
                OutputFormat::Text => println!(
                    "gid={}  start={}  end={}",
                    g.gid,
                    g.start_time,
                    g.end_time.map_or("-".to_string(), |t| t.to_string())
                ),
            }
            Ok(ControlFlow::Continue(()))
        })?;
        return Ok(());
    }

    if args.calls {
        log.walk_call_records(|c| {
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string(c)?),
                OutputFormat::Text => println!(
                    "#{}  gid={}  parent={}  start={}  end={}  {}",
                    c.id,
                    c.gid,
                    c.parent_id.map_or("-".to_string(), |p| p.to_string()),
                    c.start_time,
                    c.end_time.map_or("-".to_string(), |t| t.to_string()),
                    format_frames(&c.frames, symbols)
                ),
            }
            Ok(ControlFlow::Continue(()))
        })?;
        return Ok(());
    }

    let start = args.start.unwrap_or(Time::MIN);
    let end = args.end.unwrap_or(Time::MAX);
    log.search(start, end, |ev| {
        match format {
            OutputFormat::Json => println!("{}", serde_json::to_string(ev)?),
            OutputFormat::Text => println!(
                "{}  {:<5}  t={}  gid={}  tx={}  {}",
                ev.id,
                ev.tag,
                ev.timestamp,
                ev.gid,
                ev.txid,
                format_frames(&ev.frames, symbols)
            ),
        }
        Ok(ControlFlow::Continue(()))
    })?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let read_only = !matches!(cli.command, Command::Log(LogCommand::Rm { .. }));
    let config = load_config(&cli, read_only)?;
    let storage = Storage::new(config);
    storage
        .init()
        .with_context(|| format!("failed to open trace store {}", storage.config().root.display()))?;

    let result = match &cli.command {
        Command::Log(LogCommand::Ls) => cmd_ls(&storage, cli.format),
        Command::Log(LogCommand::Info { id }) => cmd_info(&storage, parse_id(id)?, cli.format),
        Command::Log(LogCommand::Cat(args)) => cmd_cat(&storage, args, cli.format),
        Command::Log(LogCommand::Rm { id }) => {
            let id = parse_id(id)?;
            storage
                .remove(id)
                .with_context(|| format!("failed to remove log {}", id))?;
            println!("removed {}", id);
            Ok(())
        }
    };

    storage.close()?;
    result
}

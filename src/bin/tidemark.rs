//! Binary entry point for the Tidemark inspection CLI.
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tidemark::catalog::{read_document, CatalogObject};
use tidemark::redo::{RedoLog, RedoOptions};
use tidemark::storage::{codec_by_name, ValueCodec};
use tidemark::{EngineConfig, RedoSync, Value};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "tidemark",
    version,
    about = "Inspect Tidemark redo logs, catalogs and configuration",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the frames and records of a redo log
    RedoDump {
        #[arg(value_name = "REDO")]
        path: PathBuf,

        #[arg(long, default_value_t = 0, help = "Salt the log was created with")]
        salt: u64,

        #[arg(
            long,
            value_name = "FILE",
            help = "Catalog document used to decode keys and values"
        )]
        catalog: Option<PathBuf>,
    },
    /// Print the objects recorded in a catalog document
    CatalogDump {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Validate an engine configuration file and print it normalized
    ConfigCheck {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct FrameReport {
    lsn: u64,
    txn: u64,
    bytes: usize,
    records: Vec<RecordReport>,
}

#[derive(Serialize)]
struct RecordReport {
    map: String,
    bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delete: Option<bool>,
}

#[derive(Serialize)]
struct ObjectReport {
    kind: &'static str,
    id: u32,
    name: String,
    definition: String,
}

type Codecs = HashMap<String, (Arc<dyn ValueCodec>, Arc<dyn ValueCodec>)>;

fn main() {
    install_tracing_subscriber();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn install_tracing_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::RedoDump {
            path,
            salt,
            catalog,
        } => redo_dump(cli.format, path, salt, catalog),
        Command::CatalogDump { path } => catalog_dump(cli.format, path),
        Command::ConfigCheck { path } => config_check(cli.format, path),
    }
}

fn load_codecs(path: Option<PathBuf>) -> Result<Codecs, Box<dyn Error>> {
    let mut codecs = Codecs::new();
    let Some(path) = path else {
        return Ok(codecs);
    };
    for entry in read_document(&path)? {
        if let CatalogObject::Map(def) = entry.object {
            let key = codec_by_name(&def.key_codec)
                .ok_or_else(|| format!("unknown codec '{}'", def.key_codec))?;
            let value = codec_by_name(&def.value_codec)
                .ok_or_else(|| format!("unknown codec '{}'", def.value_codec))?;
            codecs.insert(entry.name, (key, value));
        }
    }
    Ok(codecs)
}

fn redo_dump(
    format: OutputFormat,
    path: PathBuf,
    salt: u64,
    catalog: Option<PathBuf>,
) -> Result<(), Box<dyn Error>> {
    if !path.exists() {
        return Err(format!("{} does not exist", path.display()).into());
    }
    let codecs = load_codecs(catalog)?;
    let log = RedoLog::open_path(&path, RedoOptions::new(salt, RedoSync::Never))?;
    let mut frames = Vec::new();
    for frame in log.iter()? {
        let frame = frame?;
        let mut records = Vec::new();
        for entry in frame.records()? {
            let mut report = RecordReport {
                map: entry.map_name.to_owned(),
                bytes: entry.body.len(),
                key: None,
                value: None,
                delete: None,
            };
            if let Some((key_codec, value_codec)) = codecs.get(entry.map_name) {
                let (key, value) = entry.decode(key_codec.as_ref(), value_codec.as_ref())?;
                report.delete = Some(value.is_none());
                report.key = Some(key);
                report.value = value;
            }
            records.push(report);
        }
        frames.push(FrameReport {
            lsn: frame.lsn.0,
            txn: frame.txn.0,
            bytes: frame.payload.len(),
            records,
        });
    }
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&frames)?),
        OutputFormat::Text => {
            println!(
                "{} frame(s), {} truncated byte(s)",
                frames.len(),
                log.stats().truncated_bytes
            );
            for frame in &frames {
                println!("lsn {} txn_{} ({} bytes)", frame.lsn, frame.txn, frame.bytes);
                for record in &frame.records {
                    match (&record.key, record.delete) {
                        (Some(key), Some(true)) => {
                            println!("  {} DELETE {}", record.map, key)
                        }
                        (Some(key), _) => println!(
                            "  {} PUT {} = {}",
                            record.map,
                            key,
                            record.value.as_ref().unwrap_or(&Value::Null)
                        ),
                        _ => println!("  {} <{} bytes>", record.map, record.bytes),
                    }
                }
            }
        }
    }
    Ok(())
}

fn catalog_dump(format: OutputFormat, path: PathBuf) -> Result<(), Box<dyn Error>> {
    let objects: Vec<ObjectReport> = read_document(&path)?
        .into_iter()
        .map(|entry| match entry.object {
            CatalogObject::Sequence(def) => ObjectReport {
                kind: "sequence",
                id: entry.id.0,
                name: entry.name,
                definition: def.create_sql(),
            },
            CatalogObject::Map(def) => ObjectReport {
                kind: "map",
                id: entry.id.0,
                name: entry.name,
                definition: format!("key {} value {}", def.key_codec, def.value_codec),
            },
        })
        .collect();
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&objects)?),
        OutputFormat::Text => {
            for object in &objects {
                println!("{:<8} {:>6}  {}", object.kind, object.id, object.definition);
            }
        }
    }
    Ok(())
}

fn config_check(format: OutputFormat, path: PathBuf) -> Result<(), Box<dyn Error>> {
    let config = EngineConfig::load(&path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

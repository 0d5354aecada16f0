use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Subcommand};
use dreamlake::{Session, SessionConfig};

use crate::config::Config;
use crate::errors::CliError;

#[derive(Subcommand)]
pub enum Command {
    /// Create (or re-open) a session directory and write its session.json.
    Init(InitArgs),
    /// Append one log line to a session's log.
    Log(LogArgs),
    /// Set or print a session's hyperparameters.
    Params(ParamsArgs),
    /// Append, read, or describe a track.
    Track(TrackArgs),
    /// Upload or list a session's file attachments.
    Files(FilesArgs),
    /// View or persist this machine's default root/remote URL.
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct CommonArgs {
    /// Session prefix, e.g. `my-workspace/my-run`.
    pub prefix: String,
    /// On-disk root; defaults to the configured root or `.dreamlake`.
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Remote session store URL; defaults to the configured URL, if any.
    #[arg(long)]
    pub url: Option<String>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Persist the default on-disk root used when `--root` is omitted.
    SetRoot { root: PathBuf },
    /// Persist the default remote URL used when `--url` is omitted.
    SetUrl { url: String },
}

#[derive(Args)]
pub struct InitArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[arg(long)]
    pub readme: Option<String>,
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,
}

#[derive(Args)]
pub struct LogArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    pub message: String,
    #[arg(long, default_value = "info")]
    pub level: String,
}

#[derive(Subcommand)]
pub enum ParamsAction {
    Set { key_values: Vec<String> },
    Get,
}

#[derive(Args)]
pub struct ParamsArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(subcommand)]
    pub action: ParamsAction,
}

#[derive(Subcommand)]
pub enum TrackAction {
    /// Append `key=value` fields as one sample.
    Append {
        track: String,
        fields: Vec<String>,
        #[arg(long)]
        ts: Option<String>,
    },
    Read {
        track: String,
        #[arg(long, default_value_t = 0)]
        start_index: u64,
        #[arg(long, default_value_t = 100)]
        limit: u64,
    },
    Stats {
        track: String,
    },
    List,
}

#[derive(Args)]
pub struct TrackArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(subcommand)]
    pub action: TrackAction,
}

#[derive(Subcommand)]
pub enum FilesAction {
    Upload {
        local_path: PathBuf,
        #[arg(long, default_value = "/")]
        path: String,
    },
    List {
        #[arg(long)]
        path: Option<String>,
    },
}

#[derive(Args)]
pub struct FilesArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    #[command(subcommand)]
    pub action: FilesAction,
}

fn open(config: &Config, common: &CommonArgs, readme: Option<&str>, tags: &[String]) -> anyhow::Result<Session> {
    let root = common.root.clone().or_else(|| config.default_root.clone());
    let url = common.url.clone().or_else(|| config.default_url.clone());
    Ok(Session::open(SessionConfig {
        prefix: common.prefix.clone(),
        root,
        url,
        readme: readme.map(str::to_string),
        tags: tags.to_vec(),
        ..Default::default()
    })?)
}

fn parse_key_value(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw.split_once('=').with_context(|| format!("expected `key=value`, got `{raw}`"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn exec(config: &mut Config, cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Init(args) => {
            let session = open(config, &args.common, args.readme.as_deref(), &args.tags)?;
            session.set_params(serde_json::Value::Object(Default::default()))?;
            println!("initialized session at {}", args.common.prefix);
            session.close();
        }
        Command::Log(args) => {
            let session = open(config, &args.common, None, &[])?;
            let record = session.log(&args.message, &args.level, None)?;
            println!("#{} [{}] {}", record.sequence_number, record.level, record.message);
            session.close();
        }
        Command::Params(args) => {
            let session = open(config, &args.common, None, &[])?;
            match args.action {
                ParamsAction::Set { key_values } => {
                    let mut tree = serde_json::Map::new();
                    for raw in key_values {
                        let (key, value) = parse_key_value(&raw)?;
                        tree.insert(key, value);
                    }
                    session.set_params(serde_json::Value::Object(tree))?;
                }
                ParamsAction::Get => {
                    let params = session.get_params(true)?;
                    println!("{}", serde_json::to_string_pretty(&params)?);
                }
            }
            session.close();
        }
        Command::Track(args) => {
            let session = open(config, &args.common, None, &[])?;
            match args.action {
                TrackAction::Append { track, fields, ts } => {
                    let mut map = serde_json::Map::new();
                    for raw in fields {
                        let (key, value) = parse_key_value(&raw)?;
                        map.insert(key, value);
                    }
                    if let Some(raw) = ts {
                        let ts: f64 = raw.parse().map_err(|_| CliError::InvalidTimestamp(raw.clone()))?;
                        map.insert("_ts".to_string(), serde_json::Value::from(ts));
                    }
                    session.append(&track, map)?;
                    session.flush_track(&track)?;
                }
                TrackAction::Read { track, start_index, limit } => {
                    require_known_track(&session, &track)?;
                    let result = session.read_track(&track, start_index, limit)?;
                    for point in result.data {
                        println!("{} {}", point.index, serde_json::Value::Object(point.data.into_iter().collect()));
                    }
                }
                TrackAction::Stats { track } => {
                    require_known_track(&session, &track)?;
                    let stats = session.track_stats(&track)?;
                    println!("{}", serde_json::to_string_pretty(&stats_to_json(&stats))?);
                }
                TrackAction::List => {
                    for track in session.list_tracks()? {
                        println!("{}\t{}", track.name, track.total_data_points);
                    }
                }
            }
            session.close();
        }
        Command::Files(args) => {
            let session = open(config, &args.common, None, &[])?;
            match args.action {
                FilesAction::Upload { local_path, path } => {
                    let entry = session.upload_file(&local_path, &path, Default::default())?;
                    println!("uploaded {} ({} bytes, {})", entry.filename, entry.size_bytes, entry.checksum);
                }
                FilesAction::List { path } => {
                    for entry in session.list_files(path.as_deref(), None)? {
                        println!("{}\t{}\t{}", entry.id, entry.path, entry.filename);
                    }
                }
            }
            session.close();
        }
        Command::Config(args) => match args.action {
            ConfigAction::SetRoot { root } => {
                config.set_default_root(&root);
                println!("default root set to {}", root.display());
            }
            ConfigAction::SetUrl { url } => {
                config.set_default_url(&url);
                println!("default remote URL set to {url}");
            }
        },
    }
    Ok(())
}

/// Tracks are created lazily on first write, so a typo'd name would
/// otherwise read back as an empty track rather than erroring. Only
/// enforced when a local track listing exists to check against; a
/// pure-remote session has no such listing (see `Session::list_tracks`).
fn require_known_track(session: &Session, track: &str) -> anyhow::Result<()> {
    if matches!(session.mode(), dreamlake::Mode::Remote) {
        return Ok(());
    }
    if session.list_tracks()?.iter().any(|t| t.name == track) {
        Ok(())
    } else {
        Err(CliError::UnknownTrack(track.to_string()).into())
    }
}

fn stats_to_json(stats: &dreamlake::TrackMetadata) -> serde_json::Value {
    serde_json::json!({
        "name": stats.name,
        "totalDataPoints": stats.total_data_points,
        "createdAt": stats.created_at,
        "updatedAt": stats.updated_at,
    })
}

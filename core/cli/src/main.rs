//! toolcrib: operator CLI for the station daemon.
//!
//! Every subcommand is one request over the daemon socket, except `watch`,
//! which holds a subscription open and prints events as they arrive.

mod daemon_client;
mod render;

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use toolcrib_protocol::{Method, MAX_SCAN_TIMEOUT_SECS};
use tracing_subscriber::EnvFilter;

use daemon_client::{ClientError, StreamItem};

/// Slack on top of the scan window for the daemon to answer.
const SCAN_REPLY_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "toolcrib")]
#[command(about = "Control and inspect a toolcrib lending station")]
#[command(version)]
struct Cli {
    /// Print raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon liveness and connection counters
    Health,

    /// Current scan session
    Status,

    /// Begin polling the reader
    Start,

    /// Pause polling (a pending user is kept)
    Stop,

    /// Clear the pending user and tool
    Reset,

    /// Read one tag without touching the session
    Scan {
        /// Seconds to wait for a tag (1-30)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Read one tag and report what it is registered as
    Check {
        /// Seconds to wait for a tag (1-30)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Register or rename a user tag
    RegisterUser {
        #[arg(value_name = "UID")]
        uid: String,
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Register or rename a tool tag (NAME must be in the catalogue)
    RegisterTool {
        #[arg(value_name = "UID")]
        uid: String,
        #[arg(value_name = "NAME")]
        name: String,
    },

    /// Manage the tool name catalogue
    ToolNames {
        #[command(subcommand)]
        action: ToolNamesAction,
    },

    /// Open loans and recent borrow/return history
    Loans {
        #[arg(long)]
        open_limit: Option<usize>,
        #[arg(long)]
        history_limit: Option<usize>,
    },

    /// Stream scan events until interrupted
    Watch {
        /// Replay retained events after this sequence number first
        #[arg(long)]
        since: Option<u64>,
    },
}

#[derive(Subcommand)]
enum ToolNamesAction {
    List,
    Add {
        #[arg(value_name = "NAME")]
        name: String,
    },
    Delete {
        #[arg(value_name = "NAME")]
        name: String,
    },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "toolcrib command failed");
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<(), ClientError> {
    let json = cli.json;
    match cli.command {
        Commands::Health => {
            let data = daemon_client::call(Method::GetHealth, None)?;
            emit(json, &data, render::health);
        }
        Commands::Status => {
            let data = daemon_client::call(Method::GetStatus, None)?;
            emit_typed(json, data, render::status)?;
        }
        Commands::Start => {
            let data = daemon_client::call(Method::Start, None)?;
            emit(json, &data, render::message);
        }
        Commands::Stop => {
            let data = daemon_client::call(Method::Stop, None)?;
            emit(json, &data, render::message);
        }
        Commands::Reset => {
            let data = daemon_client::call(Method::Reset, None)?;
            emit(json, &data, render::message);
        }
        Commands::Scan { timeout } => {
            let data = scan(Method::ManualScan, timeout)?;
            emit(json, &data, render::scan);
        }
        Commands::Check { timeout } => {
            let data = scan(Method::CheckTag, timeout)?;
            emit(json, &data, render::scan);
        }
        Commands::RegisterUser { uid, name } => {
            let params = json!({ "uid": uid, "name": name });
            let data = daemon_client::call(Method::RegisterUser, Some(params))?;
            emit(json, &data, render::message);
        }
        Commands::RegisterTool { uid, name } => {
            let params = json!({ "uid": uid, "name": name });
            let data = daemon_client::call(Method::RegisterTool, Some(params))?;
            emit(json, &data, render::message);
        }
        Commands::ToolNames { action } => match action {
            ToolNamesAction::List => {
                let data = daemon_client::call(Method::ListToolNames, None)?;
                emit(json, &data, render::tool_names);
            }
            ToolNamesAction::Add { name } => {
                let data =
                    daemon_client::call(Method::AddToolName, Some(json!({ "name": name })))?;
                emit(json, &data, render::message);
            }
            ToolNamesAction::Delete { name } => {
                let data =
                    daemon_client::call(Method::DeleteToolName, Some(json!({ "name": name })))?;
                emit(json, &data, render::message);
            }
        },
        Commands::Loans {
            open_limit,
            history_limit,
        } => {
            let mut params = serde_json::Map::new();
            if let Some(limit) = open_limit {
                params.insert("open_limit".to_string(), json!(limit));
            }
            if let Some(limit) = history_limit {
                params.insert("history_limit".to_string(), json!(limit));
            }
            let params = (!params.is_empty()).then_some(Value::Object(params));
            let data = daemon_client::call(Method::GetLoans, params)?;
            emit_typed(json, data, render::loans)?;
        }
        Commands::Watch { since } => watch(json, since)?,
    }
    Ok(())
}

fn scan(method: Method, timeout: Option<u64>) -> Result<Value, ClientError> {
    let window = Duration::from_secs(timeout.unwrap_or(MAX_SCAN_TIMEOUT_SECS));
    let params = timeout.map(|secs| json!({ "timeout_secs": secs }));
    daemon_client::call_with_timeout(method, params, window + SCAN_REPLY_GRACE)
}

fn watch(json: bool, since: Option<u64>) -> Result<(), ClientError> {
    let mut stream = daemon_client::subscribe(since)?;
    let stdout = std::io::stdout();
    while let Some(item) = stream.next_item()? {
        let mut out = stdout.lock();
        let line = match item {
            StreamItem::Event(event) if json => serde_json::to_string(&event)?,
            StreamItem::Event(event) => render::event(&event),
            StreamItem::Lagged(missed) => {
                eprintln!("warning: missed {} events (subscriber too slow)", missed);
                continue;
            }
        };
        writeln!(out, "{}", line)?;
        out.flush()?;
    }
    tracing::info!("Daemon closed the event stream");
    Ok(())
}

fn emit(json: bool, data: &Value, human: fn(&Value) -> String) {
    if json {
        println!("{}", pretty(data));
    } else {
        print!("{}", human(data));
    }
}

fn emit_typed<T: DeserializeOwned>(
    json: bool,
    data: Value,
    human: fn(&T) -> String,
) -> Result<(), ClientError> {
    if json {
        println!("{}", pretty(&data));
        return Ok(());
    }
    let typed: T = serde_json::from_value(data)?;
    print!("{}", human(&typed));
    Ok(())
}

fn pretty(data: &Value) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string())
}

//! toolcrib station daemon.
//!
//! Single-writer service for one lending station: it owns the tag reader, the
//! loan database and the scan session, and exposes control, registration and
//! an event stream over a local Unix socket.

use fs_err as fs;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

mod backoff;
mod config;
mod db;
mod error;
mod gateway;
mod notify;
mod pcsc_reader;
mod reader;
mod scanner;
mod server;
mod session;
mod tag;
mod timer;

use config::{DaemonConfig, LoggingConfig, Paths, ReaderKind};
use db::Db;
use error::ReaderError;
use notify::NotificationSink;
use reader::{LineTagReader, TagReader};
use scanner::{ScanSettings, Scanner};
use server::ServerContext;

fn main() {
    // Config problems are reported before logging exists, so they go to stderr.
    let config = match config::load_config(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("toolcrib-daemon: {}", err);
            std::process::exit(1);
        }
    };
    let paths = match Paths::resolve(&config) {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("toolcrib-daemon: {}", err);
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.logging, &paths.logs);

    if let Err(err) = prepare_socket_dir(&paths.socket) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&paths.socket) {
        error!(error = %err, path = %paths.socket.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let db = match Db::new(paths.db.clone(), config.station_id.clone()) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };
    info!(path = %db.path().display(), "Loan database ready");

    let reader = match open_reader(&config, &paths) {
        Ok(reader) => reader,
        Err(err) => {
            error!(error = %err, kind = config.reader.kind.as_str(), "Failed to open tag reader");
            std::process::exit(1);
        }
    };

    let sink = NotificationSink::new(config.notify.capacity, config.notify.history);
    let scanner = Arc::new(Scanner::new(
        reader,
        Arc::new(db),
        sink,
        ScanSettings::from_config(&config.scan),
    ));
    if let Err(err) = Scanner::spawn(Arc::clone(&scanner)) {
        error!(error = %err, "Failed to start scan loop");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&paths.socket) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %paths.socket.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %paths.socket.display(),
        data_dir = %paths.data_dir.display(),
        station_id = %config.station_id,
        reader = config.reader.kind.as_str(),
        "toolcrib daemon started"
    );

    let context = Arc::new(ServerContext::new(
        scanner,
        config.station_id.clone(),
        config.scan.manual_scan_timeout_secs,
    ));
    server::serve(listener, context);
}

fn init_logging(logging: &LoggingConfig, log_dir: &Path) -> Option<WorkerGuard> {
    let debug_enabled = logging.debug || config::debug_logging_forced();
    let filter = || {
        if debug_enabled {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    };

    let mut guard = None;
    let file_layer = if logging.file {
        match fs::create_dir_all(log_dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(log_dir, "toolcrib-daemon.log");
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                guard = Some(worker_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_filter(filter()),
                )
            }
            Err(err) => {
                eprintln!("toolcrib-daemon: file logging disabled: {}", err);
                None
            }
        }
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_filter(filter()))
        .init();
    guard
}

fn open_reader(config: &DaemonConfig, paths: &Paths) -> Result<Box<dyn TagReader>, ReaderError> {
    match config.reader.kind {
        ReaderKind::Lines => {
            info!(path = %paths.feed.display(), "Using line feed reader");
            Ok(Box::new(LineTagReader::open(&paths.feed)?))
        }
        ReaderKind::Pcsc => open_pcsc(config.reader.name.clone()),
    }
}

#[cfg(feature = "pcsc")]
fn open_pcsc(name: Option<String>) -> Result<Box<dyn TagReader>, ReaderError> {
    Ok(Box::new(pcsc_reader::PcscReader::new(name)?))
}

#[cfg(not(feature = "pcsc"))]
fn open_pcsc(name: Option<String>) -> Result<Box<dyn TagReader>, ReaderError> {
    if let Some(name) = name {
        warn!(name = %name, "Ignoring reader.name; PC/SC support is not compiled in");
    }
    Err(ReaderError::Unavailable(
        "this build has no PC/SC support (enable the `pcsc` feature)".to_string(),
    ))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

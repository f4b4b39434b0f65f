//! Unix-socket IPC server.
//!
//! One newline-terminated JSON request per connection, one JSON response line
//! back. `subscribe` keeps the connection open and streams events, one JSON
//! object per line, until the client goes away.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use toolcrib_protocol::{
    parse_loans_params, parse_register_tag, parse_scan_params, parse_subscribe_params,
    parse_tool_name, ErrorInfo, LoansSnapshot, Method, Request, Response, TagKind,
    ERROR_INVALID_PARAMS, ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

use crate::db::{Db, Registration};
use crate::error::{ReaderError, StorageError};
use crate::reader::{TagRead, TagReader};
use crate::scanner::Scanner;
use crate::session::ArmOutcome;
use crate::tag::TagId;

pub type StationScanner = Scanner<Box<dyn TagReader>, Db>;

const READ_TIMEOUT_SECS: u64 = 2;
const WRITE_TIMEOUT_SECS: u64 = 5;
const READ_CHUNK_SIZE: usize = 4096;
const SUBSCRIBER_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const MAX_ACTIVE_CONNECTIONS: usize = 64;

pub struct ServerContext {
    scanner: Arc<StationScanner>,
    station_id: String,
    manual_scan_timeout_secs: u64,
    active_connections: AtomicUsize,
    rejected_connections: AtomicU64,
}

impl ServerContext {
    pub fn new(
        scanner: Arc<StationScanner>,
        station_id: impl Into<String>,
        manual_scan_timeout_secs: u64,
    ) -> Self {
        Self {
            scanner,
            station_id: station_id.into(),
            manual_scan_timeout_secs,
            active_connections: AtomicUsize::new(0),
            rejected_connections: AtomicU64::new(0),
        }
    }

    fn db(&self) -> &Db {
        self.scanner.gateway()
    }
}

/// Releases a connection slot when the handler thread finishes.
struct ConnectionSlot {
    context: Arc<ServerContext>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.context.active_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn serve(listener: UnixListener, context: Arc<ServerContext>) {
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let active = context.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
                if active > MAX_ACTIVE_CONNECTIONS {
                    context.active_connections.fetch_sub(1, Ordering::SeqCst);
                    context.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    warn!(active, "Rejecting connection: too many open connections");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "too many open connections",
                    );
                    let _ = write_line(&mut stream, &response);
                    continue;
                }

                let slot = ConnectionSlot {
                    context: Arc::clone(&context),
                };
                let spawned = thread::Builder::new()
                    .name("toolcrib-conn".to_string())
                    .spawn(move || {
                        let context = Arc::clone(&slot.context);
                        handle_connection(stream, &context);
                        drop(slot);
                    });
                if let Err(err) = spawned {
                    warn!(error = %err, "Failed to spawn connection handler");
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, context: &ServerContext) {
    let _ = stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_line(&mut stream, &response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");

    if request.method == Method::Subscribe && request.protocol_version == PROTOCOL_VERSION {
        stream_events(stream, request, context);
        return;
    }

    let response = handle_request(request, context);
    let _ = write_line(&mut stream, &response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    parse_request_bytes(&buffer)
}

fn parse_request_bytes(buffer: &[u8]) -> Result<Request, ErrorInfo> {
    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer,
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

pub fn handle_request(request: Request, context: &ServerContext) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let result = match request.method {
        Method::GetHealth => Ok(health(context)),
        Method::GetStatus => to_data(&context.scanner.status(), "session status"),
        Method::Start => {
            let (outcome, message) = context.scanner.start();
            let status = match outcome {
                ArmOutcome::Fresh => "started",
                ArmOutcome::Resumed => "resumed",
            };
            Ok(json!({ "status": status, "message": message }))
        }
        Method::Stop => {
            let message = context.scanner.stop();
            Ok(json!({ "status": "stopped", "message": message }))
        }
        Method::Reset => {
            context.scanner.reset();
            Ok(json!({ "status": "reset", "message": "session cleared" }))
        }
        Method::ManualScan => manual_scan(request.params, context),
        Method::CheckTag => check_tag(request.params, context),
        Method::RegisterUser => register(request.params, TagKind::User, context),
        Method::RegisterTool => register(request.params, TagKind::Tool, context),
        Method::ListToolNames => context
            .db()
            .list_tool_names()
            .map(|names| json!({ "names": names }))
            .map_err(|err| storage_failure(&err)),
        Method::AddToolName => add_tool_name(request.params, context),
        Method::DeleteToolName => delete_tool_name(request.params, context),
        Method::GetLoans => get_loans(request.params, context),
        Method::Subscribe => Err(ErrorInfo::new(
            ERROR_INVALID_PARAMS,
            "subscribe streams events and must be the only request on its connection",
        )),
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn health(context: &ServerContext) -> Value {
    json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
        "station_id": context.station_id,
        "reader": context.scanner.reader_kind(),
        "subscribers": context.scanner.sink().receiver_count(),
        "security": {
            "active_connections": context.active_connections.load(Ordering::SeqCst),
            "rejected_connections": context.rejected_connections.load(Ordering::Relaxed),
        },
    })
}

fn scan_with_timeout(params: Option<Value>, context: &ServerContext) -> Result<Option<TagId>, ErrorInfo> {
    let timeout_secs = parse_scan_params(params, context.manual_scan_timeout_secs)?;
    match context
        .scanner
        .manual_scan(Duration::from_secs(timeout_secs))
    {
        Ok(TagRead::Tag(tag)) => Ok(Some(tag)),
        Ok(TagRead::Timeout) => Ok(None),
        Err(err) => Err(reader_failure(&err)),
    }
}

fn manual_scan(params: Option<Value>, context: &ServerContext) -> Result<Value, ErrorInfo> {
    Ok(match scan_with_timeout(params, context)? {
        Some(tag) => json!({ "status": "success", "uid": tag }),
        None => json!({ "status": "timeout", "uid": null }),
    })
}

fn check_tag(params: Option<Value>, context: &ServerContext) -> Result<Value, ErrorInfo> {
    let Some(tag) = scan_with_timeout(params, context)? else {
        return Ok(json!({ "status": "timeout", "uid": null }));
    };

    let record = context
        .db()
        .lookup_tag(&tag)
        .map_err(|err| storage_failure(&err))?;
    Ok(match record {
        Some(record) => json!({
            "status": "success",
            "uid": tag,
            "type": record.kind,
            "name": record.display_name,
        }),
        None => json!({
            "status": "success",
            "uid": tag,
            "type": "unregistered",
            "name": null,
        }),
    })
}

fn register(
    params: Option<Value>,
    kind: TagKind,
    context: &ServerContext,
) -> Result<Value, ErrorInfo> {
    let parsed = parse_register_tag(params)?;
    let tag = TagId::parse(&parsed.uid)
        .ok_or_else(|| ErrorInfo::new(ERROR_INVALID_PARAMS, "uid is invalid"))?;

    let registration = context
        .db()
        .register_tag(&tag, kind, &parsed.name)
        .map_err(|err| storage_failure(&err))?;
    info!(
        tag = %tag,
        kind = kind.as_str(),
        name = %parsed.name,
        registration = ?registration,
        "Tag registered"
    );

    let status = match registration {
        Registration::Created => "created",
        Registration::Updated => "updated",
    };
    Ok(json!({
        "status": status,
        "message": format!("{} {} registered as {}", kind.as_str(), tag, parsed.name),
    }))
}

fn add_tool_name(params: Option<Value>, context: &ServerContext) -> Result<Value, ErrorInfo> {
    let name = parse_tool_name(params)?;
    let added = context
        .db()
        .add_tool_name(&name)
        .map_err(|err| storage_failure(&err))?;
    Ok(if added {
        info!(name = %name, "Tool name added");
        json!({ "status": "added", "message": format!("added tool name '{}'", name) })
    } else {
        json!({ "status": "exists", "message": format!("tool name '{}' already exists", name) })
    })
}

fn delete_tool_name(params: Option<Value>, context: &ServerContext) -> Result<Value, ErrorInfo> {
    let name = parse_tool_name(params)?;
    let deleted = context
        .db()
        .delete_tool_name(&name)
        .map_err(|err| storage_failure(&err))?;
    Ok(if deleted {
        info!(name = %name, "Tool name deleted");
        json!({ "status": "deleted", "message": format!("deleted tool name '{}'", name) })
    } else {
        json!({ "status": "not_found", "message": format!("tool name '{}' does not exist", name) })
    })
}

fn get_loans(params: Option<Value>, context: &ServerContext) -> Result<Value, ErrorInfo> {
    let (open_limit, history_limit) = parse_loans_params(params)?;
    let db = context.db();
    let snapshot = LoansSnapshot {
        open_loans: db
            .open_loans(open_limit)
            .map_err(|err| storage_failure(&err))?,
        history: db
            .recent_history(history_limit)
            .map_err(|err| storage_failure(&err))?,
    };
    tracing::debug!(
        open = snapshot.open_loans.len(),
        history = snapshot.history.len(),
        "Loans snapshot"
    );
    to_data(&snapshot, "loans")
}

fn stream_events(mut stream: UnixStream, request: Request, context: &ServerContext) {
    let since = match parse_subscribe_params(request.params) {
        Ok(since) => since,
        Err(err) => {
            let _ = write_line(&mut stream, &Response::error_with_info(request.id, err));
            return;
        }
    };

    let sink = context.scanner.sink();
    let (mut rx, backlog) = match since {
        Some(since) => sink.subscribe_since(since),
        None => (sink.subscribe(), Vec::new()),
    };

    let ack = Response::ok(
        request.id,
        json!({ "subscribed": true, "last_sequence": sink.last_sequence() }),
    );
    if write_line(&mut stream, &ack).is_err() {
        return;
    }
    info!(since = ?since, backlog = backlog.len(), "Subscriber attached");

    let mut last_sent = since.unwrap_or(0);
    for event in backlog {
        last_sent = event.sequence;
        if write_line(&mut stream, &event).is_err() {
            return;
        }
    }

    // Between events the read timeout doubles as the poll interval, so a
    // client that hangs up is noticed even while nothing is published.
    let _ = stream.set_read_timeout(Some(SUBSCRIBER_POLL_INTERVAL));
    loop {
        match rx.try_recv() {
            Ok(event) => {
                if event.sequence <= last_sent {
                    continue;
                }
                last_sent = event.sequence;
                if write_line(&mut stream, &event).is_err() {
                    break;
                }
            }
            Err(TryRecvError::Lagged(missed)) => {
                warn!(missed, "Subscriber lagged; events dropped");
                if write_line(&mut stream, &json!({ "lagged": missed })).is_err() {
                    break;
                }
            }
            Err(TryRecvError::Empty) => {
                if !peer_connected(&mut stream) {
                    break;
                }
            }
            Err(TryRecvError::Closed) => break,
        }
    }
    debug!("Subscriber detached");
}

/// Waits up to the stream's read timeout for the peer to hang up. Stray
/// bytes from the client are discarded.
fn peer_connected(stream: &mut UnixStream) -> bool {
    let mut scratch = [0u8; 64];
    match stream.read(&mut scratch) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        ),
    }
}

fn to_data<T: Serialize>(value: &T, what: &str) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        )
    })
}

fn storage_failure(err: &StorageError) -> ErrorInfo {
    if matches!(err, StorageError::Sqlite { .. } | StorageError::DataDir { .. }) {
        warn!(error = %err, "Storage operation failed");
    }
    err.to_error_info()
}

fn reader_failure(err: &ReaderError) -> ErrorInfo {
    ErrorInfo::new("reader_error", err.to_string())
}

fn write_line<T: Serialize>(stream: &mut UnixStream, value: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, value)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotificationSink;
    use crate::reader::testing::ScriptedReader;
    use crate::scanner::ScanSettings;
    use toolcrib_protocol::{ScanEvent, ScanEventKind, SessionStatus};

    struct Fixture {
        _dir: tempfile::TempDir,
        reader: ScriptedReader,
        context: ServerContext,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Db::new(dir.path().join("toolcrib.db"), "station-test").expect("db");
        let reader = ScriptedReader::new();
        let settings = ScanSettings {
            debounce: Duration::from_secs(2),
            poll_timeout: Duration::from_millis(10),
            reset_delay: Duration::from_secs(3),
            idle_sleep: Duration::from_millis(1),
            inactive_sleep: Duration::from_millis(1),
            fault_backoff: Duration::from_millis(10),
            fault_backoff_max: Duration::from_millis(10),
        };
        let scanner = Scanner::new(
            Box::new(reader.clone()) as Box<dyn TagReader>,
            Arc::new(db),
            NotificationSink::new(8, 8),
            settings,
        );
        Fixture {
            _dir: dir,
            reader,
            context: ServerContext::new(Arc::new(scanner), "station-test", 1),
        }
    }

    fn call(context: &ServerContext, method: Method, params: Option<Value>) -> Response {
        handle_request(
            Request::new(method, Some("test".to_string()), params),
            context,
        )
    }

    fn error_code(response: &Response) -> Option<&str> {
        response.error.as_ref().map(|err| err.code.as_str())
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let f = fixture();
        let mut request = Request::new(Method::GetHealth, None, None);
        request.protocol_version = PROTOCOL_VERSION + 1;
        let response = handle_request(request, &f.context);
        assert_eq!(error_code(&response), Some("protocol_mismatch"));
    }

    #[test]
    fn parses_request_framing() {
        assert_eq!(
            parse_request_bytes(b"").unwrap_err().code,
            "empty_request"
        );
        assert_eq!(
            parse_request_bytes(b"  \n").unwrap_err().code,
            "empty_request"
        );
        assert_eq!(
            parse_request_bytes(b"{nope\n").unwrap_err().code,
            "invalid_json"
        );
        let request =
            parse_request_bytes(b"{\"protocol_version\":1,\"method\":\"get_status\"}\nextra")
                .unwrap();
        assert_eq!(request.method, Method::GetStatus);
    }

    #[test]
    fn health_reports_reader_and_station() {
        let f = fixture();
        let response = call(&f.context, Method::GetHealth, None);
        let data = response.data.expect("data");
        assert_eq!(data["status"], "ok");
        assert_eq!(data["reader"], "scripted");
        assert_eq!(data["station_id"], "station-test");
        assert_eq!(response.id.as_deref(), Some("test"));
    }

    #[test]
    fn start_stop_and_status() {
        let f = fixture();
        let started = call(&f.context, Method::Start, None);
        assert_eq!(started.data.unwrap()["status"], "started");

        let status: SessionStatus =
            serde_json::from_value(call(&f.context, Method::GetStatus, None).data.unwrap())
                .unwrap();
        assert!(status.active);

        let stopped = call(&f.context, Method::Stop, None);
        assert_eq!(stopped.data.unwrap()["status"], "stopped");
        let reset = call(&f.context, Method::Reset, None);
        assert!(reset.ok);
    }

    #[test]
    fn registration_flow() {
        let f = fixture();
        let response = call(
            &f.context,
            Method::RegisterTool,
            Some(json!({"uid": "bbb2", "name": "Drill"})),
        );
        assert_eq!(error_code(&response), Some(ERROR_INVALID_PARAMS));

        assert!(call(&f.context, Method::AddToolName, Some(json!({"name": "Drill"}))).ok);
        let response = call(
            &f.context,
            Method::RegisterTool,
            Some(json!({"uid": "bbb2", "name": "Drill"})),
        );
        assert_eq!(response.data.unwrap()["status"], "created");

        let conflict = call(
            &f.context,
            Method::RegisterUser,
            Some(json!({"uid": "BBB2", "name": "Sato"})),
        );
        assert_eq!(error_code(&conflict), Some("conflict"));

        let delete = call(
            &f.context,
            Method::DeleteToolName,
            Some(json!({"name": "Drill"})),
        );
        assert_eq!(error_code(&delete), Some("conflict"));

        let names = call(&f.context, Method::ListToolNames, None);
        assert_eq!(names.data.unwrap()["names"], json!(["Drill"]));
    }

    #[test]
    fn invalid_params_never_reach_storage() {
        let f = fixture();
        let response = call(
            &f.context,
            Method::RegisterUser,
            Some(json!({"uid": "", "name": "Sato"})),
        );
        assert_eq!(error_code(&response), Some(ERROR_INVALID_PARAMS));
        let response = call(
            &f.context,
            Method::ManualScan,
            Some(json!({"timeout_secs": 99})),
        );
        assert_eq!(error_code(&response), Some(ERROR_INVALID_PARAMS));
        assert!(call(&f.context, Method::GetLoans, Some(json!("x"))).error.is_some());
    }

    #[test]
    fn manual_scan_and_check_tag() {
        let f = fixture();
        f.reader.push_tag("AAA1");
        let response = call(&f.context, Method::ManualScan, None);
        let data = response.data.unwrap();
        assert_eq!(data["status"], "success");
        assert_eq!(data["uid"], "AAA1");

        let response = call(&f.context, Method::CheckTag, None);
        assert_eq!(response.data.unwrap()["status"], "timeout");

        call(
            &f.context,
            Method::RegisterUser,
            Some(json!({"uid": "AAA1", "name": "Sato"})),
        );
        f.reader.push_tag("AAA1");
        let data = call(&f.context, Method::CheckTag, None).data.unwrap();
        assert_eq!(data["type"], "user");
        assert_eq!(data["name"], "Sato");

        f.reader.push_tag("ZZZ9");
        let data = call(&f.context, Method::CheckTag, None).data.unwrap();
        assert_eq!(data["type"], "unregistered");

        f.reader.push_fault("unplugged");
        let response = call(&f.context, Method::ManualScan, None);
        assert_eq!(error_code(&response), Some("reader_error"));
    }

    #[test]
    fn loans_snapshot() {
        let f = fixture();
        let db = f.context.db();
        db.borrow_or_return_at(
            &TagId::parse("AAA1").unwrap(),
            &TagId::parse("BBB2").unwrap(),
            chrono::Utc::now(),
        )
        .unwrap();

        let data = call(&f.context, Method::GetLoans, Some(json!({"history_limit": 5})))
            .data
            .unwrap();
        let snapshot: LoansSnapshot = serde_json::from_value(data).unwrap();
        assert_eq!(snapshot.open_loans.len(), 1);
        assert_eq!(snapshot.history.len(), 1);
    }

    #[test]
    fn subscribe_streams_backlog_then_live_events() {
        let f = fixture();
        let sink = f.context.scanner.sink().clone();
        sink.publish(ScanEvent::new(ScanEventKind::StateReset, "first"));
        sink.publish(ScanEvent::new(ScanEventKind::StateReset, "second"));

        let (client, server) = UnixStream::pair().expect("socket pair");
        let context = Arc::new(f.context);
        let worker = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                let request = Request::new(
                    Method::Subscribe,
                    Some("sub".to_string()),
                    Some(json!({"since_sequence": 1})),
                );
                stream_events(server, request, &context);
            })
        };

        let mut reader = std::io::BufReader::new(client.try_clone().expect("clone"));
        let mut line = String::new();
        use std::io::BufRead;

        reader.read_line(&mut line).unwrap();
        let ack: Response = serde_json::from_str(&line).unwrap();
        assert!(ack.ok);

        line.clear();
        reader.read_line(&mut line).unwrap();
        let backlog: ScanEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(backlog.message, "second");

        // Wait for the worker to attach before publishing live.
        while sink.receiver_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        sink.publish(ScanEvent::new(ScanEventKind::UserScanned, "live"));
        line.clear();
        reader.read_line(&mut line).unwrap();
        let live: ScanEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(live.message, "live");
        assert_eq!(live.sequence, 3);

        drop(reader);
        drop(client);
        sink.publish(ScanEvent::new(ScanEventKind::StateReset, "after close"));
        worker.join().expect("worker");
    }

    #[test]
    fn subscriber_detaches_when_client_hangs_up_without_events() {
        let f = fixture();
        let sink = f.context.scanner.sink().clone();
        let (client, server) = UnixStream::pair().expect("socket pair");
        let context = Arc::new(f.context);
        let worker = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                let request = Request::new(Method::Subscribe, Some("idle".to_string()), None);
                stream_events(server, request, &context);
            })
        };

        let mut reader = std::io::BufReader::new(client.try_clone().expect("clone"));
        let mut ack = String::new();
        std::io::BufRead::read_line(&mut reader, &mut ack).unwrap();
        assert!(serde_json::from_str::<Response>(&ack).unwrap().ok);
        assert_eq!(sink.receiver_count(), 1);

        drop(reader);
        drop(client);

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !worker.is_finished() {
            assert!(
                std::time::Instant::now() < deadline,
                "subscriber thread still attached after client closed"
            );
            thread::sleep(Duration::from_millis(20));
        }
        worker.join().expect("worker");
        assert_eq!(sink.receiver_count(), 0);
        assert_eq!(sink.last_sequence(), 0);
    }
}

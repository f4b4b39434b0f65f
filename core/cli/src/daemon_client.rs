//! Client side of the daemon socket protocol.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use rand::RngCore;
use serde_json::Value;
use toolcrib_protocol::{Method, Request, Response, ScanEvent, MAX_REQUEST_BYTES};

const SOCKET_ENV: &str = "TOOLCRIB_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("home directory not found")]
    HomeNotFound,

    #[error("cannot reach toolcrib daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out waiting for daemon response")]
    Timeout,

    #[error("daemon I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON from daemon: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon response was empty")]
    EmptyResponse,

    #[error("daemon response exceeded maximum size")]
    ResponseTooLarge,

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir().ok_or(ClientError::HomeNotFound)?;
    Ok(home.join(".toolcrib").join(SOCKET_NAME))
}

/// Sends one request and returns the `data` of a successful response.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    call_with_timeout(method, params, DEFAULT_READ_TIMEOUT)
}

pub fn call_with_timeout(
    method: Method,
    params: Option<Value>,
    read_timeout: Duration,
) -> Result<Value, ClientError> {
    let mut stream = connect(read_timeout)?;
    write_request(&mut stream, &Request::new(method, Some(make_request_id()), params))?;
    let response = read_response(&mut stream)?;
    into_data(response)
}

/// Live event stream opened by `subscribe`.
pub struct EventStream {
    reader: BufReader<UnixStream>,
}

#[derive(Debug)]
pub enum StreamItem {
    Event(Box<ScanEvent>),
    Lagged(u64),
}

impl EventStream {
    /// Blocks for the next item. `Ok(None)` means the daemon closed the stream.
    pub fn next_item(&mut self) -> Result<Option<StreamItem>, ClientError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        parse_stream_line(&line).map(Some)
    }
}

pub fn subscribe(since: Option<u64>) -> Result<EventStream, ClientError> {
    let mut stream = connect(DEFAULT_READ_TIMEOUT)?;
    let params = since.map(|since| serde_json::json!({ "since_sequence": since }));
    write_request(
        &mut stream,
        &Request::new(Method::Subscribe, Some(make_request_id()), params),
    )?;

    let mut reader = BufReader::new(stream);
    let mut ack = String::new();
    if reader.read_line(&mut ack)? == 0 {
        return Err(ClientError::EmptyResponse);
    }
    let ack: Response = serde_json::from_str(ack.trim_end())?;
    into_data(ack)?;

    // Events arrive whenever someone taps a tag; wait indefinitely.
    reader.get_ref().set_read_timeout(None)?;
    Ok(EventStream { reader })
}

fn parse_stream_line(line: &str) -> Result<StreamItem, ClientError> {
    let value: Value = serde_json::from_str(line.trim_end())?;
    if let Some(missed) = value.get("lagged").and_then(Value::as_u64) {
        return Ok(StreamItem::Lagged(missed));
    }
    Ok(StreamItem::Event(Box::new(serde_json::from_value(value)?)))
}

fn connect(read_timeout: Duration) -> Result<UnixStream, ClientError> {
    let path = socket_path()?;
    let stream = UnixStream::connect(&path).map_err(|source| ClientError::Connect {
        path: path.clone(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(read_timeout));
    let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
    Ok(stream)
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), ClientError> {
    tracing::debug!(method = ?request.method, id = ?request.id, "Sending daemon request");
    serde_json::to_writer(&mut *stream, request)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::ResponseTooLarge);
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
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let end = buffer
        .iter()
        .position(|b| *b == b'\n')
        .unwrap_or(buffer.len());
    if buffer[..end].iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ClientError::EmptyResponse);
    }
    Ok(serde_json::from_slice(&buffer[..end])?)
}

fn into_data(response: Response) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(err) => ClientError::Daemon {
            code: err.code,
            message: err.message,
        },
        None => ClientError::Daemon {
            code: "unknown".to_string(),
            message: "daemon reported an error without details".to_string(),
        },
    })
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!("cli-{}-{:x}", std::process::id(), random.next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use toolcrib_protocol::{ScanEventKind, PROTOCOL_VERSION};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_request(stream: &mut UnixStream) -> Request {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn reply(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).unwrap();
        payload.push(b'\n');
        stream.write_all(&payload).unwrap();
    }

    #[test]
    fn socket_env_overrides_home() {
        let _lock = env_lock();
        let _guard = EnvGuard::set(SOCKET_ENV, "/tmp/toolcrib-test.sock");
        assert_eq!(
            socket_path().unwrap(),
            PathBuf::from("/tmp/toolcrib-test.sock")
        );
    }

    #[test]
    fn call_returns_data_and_maps_daemon_errors() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("daemon.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let _guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            assert_eq!(request.method, Method::GetStatus);
            assert_eq!(request.protocol_version, PROTOCOL_VERSION);
            assert!(request.id.as_deref().unwrap().starts_with("cli-"));
            reply(&mut stream, &Response::ok(request.id, json!({"phase": "idle"})));

            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream);
            reply(
                &mut stream,
                &Response::error(request.id, "conflict", "already registered"),
            );
        });

        let data = call(Method::GetStatus, None).unwrap();
        assert_eq!(data["phase"], "idle");

        let err = call(Method::RegisterUser, Some(json!({"uid": "A", "name": "B"}))).unwrap_err();
        assert!(matches!(err, ClientError::Daemon { ref code, .. } if code == "conflict"));
        server.join().unwrap();
    }

    #[test]
    fn missing_daemon_is_a_connect_error() {
        let _lock = env_lock();
        let dir = tempfile::tempdir().unwrap();
        let _guard = EnvGuard::set(SOCKET_ENV, dir.path().join("absent.sock").to_str().unwrap());

        let err = call(Method::GetHealth, None).unwrap_err();
        assert!(matches!(err, ClientError::Connect { .. }));
    }

    #[test]
    fn stream_lines_decode_events_and_lag_notices() {
        let event = serde_json::to_string(&toolcrib_protocol::ScanEvent::new(
            ScanEventKind::StateReset,
            "ready",
        ))
        .unwrap();
        assert!(matches!(
            parse_stream_line(&event).unwrap(),
            StreamItem::Event(ref event) if event.kind == ScanEventKind::StateReset
        ));
        assert!(matches!(
            parse_stream_line("{\"lagged\":4}\n").unwrap(),
            StreamItem::Lagged(4)
        ));
        assert!(parse_stream_line("nope").is_err());
    }
}

//! Helpers for driving a real `toolcrib-daemon` over its socket.

#![allow(dead_code)]

use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use toolcrib_protocol::{Method, Request, Response};

/// Kills the daemon when the test ends, pass or fail.
pub struct Station {
    child: Child,
    pub socket: PathBuf,
}

impl Station {
    /// Starts a daemon with `HOME` at `home` and waits until it accepts
    /// connections.
    pub fn launch(home: &Path) -> Self {
        let child = Command::new(env!("CARGO_BIN_EXE_toolcrib-daemon"))
            .env("HOME", home)
            .env_remove("TOOLCRIB_SOCKET")
            .env_remove("TOOLCRIB_CONFIG")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn toolcrib-daemon");
        let station = Self {
            child,
            socket: socket_path(home),
        };
        wait_for_socket(&station.socket, Duration::from_secs(5));
        station
    }

    pub fn call(&self, method: Method, params: Option<Value>) -> Response {
        let mut stream = UnixStream::connect(&self.socket).expect("connect to daemon socket");
        write_request(&mut stream, method, params).expect("write request");
        read_response(&mut stream).expect("read response")
    }

    pub fn try_call(&self, method: Method, params: Option<Value>) -> Option<Response> {
        let mut stream = UnixStream::connect(&self.socket).ok()?;
        write_request(&mut stream, method, params).ok()?;
        read_response(&mut stream)
    }

    pub fn send_raw(&self, payload: &[u8]) -> Response {
        let mut stream = UnixStream::connect(&self.socket).expect("connect to daemon socket");
        stream.write_all(payload).expect("write raw payload");
        stream.flush().expect("flush raw payload");
        read_response(&mut stream).expect("read response")
    }

    /// Polls health until it answers `ok`.
    pub fn healthy_within(&self, timeout: Duration) -> Option<Response> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(response) = self.try_call(Method::GetHealth, None) {
                if response.ok {
                    return Some(response);
                }
            }
            sleep(Duration::from_millis(25));
        }
        None
    }
}

impl Drop for Station {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn data_dir(home: &Path) -> PathBuf {
    home.join(".toolcrib")
}

pub fn socket_path(home: &Path) -> PathBuf {
    data_dir(home).join("daemon.sock")
}

pub fn db_path(home: &Path) -> PathBuf {
    data_dir(home).join("daemon").join("toolcrib.db")
}

pub fn feed_path(home: &Path) -> PathBuf {
    data_dir(home).join("reader.feed")
}

/// A fresh `HOME`, or `None` when the sandbox forbids binding unix sockets.
pub fn socket_home(prefix: &str) -> Option<tempfile::TempDir> {
    let home = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("failed to create temp HOME");
    let bind_check = home.path().join("bind-check.sock");
    match UnixListener::bind(&bind_check) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&bind_check);
            Some(home)
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("Skipping {prefix}: unix socket binding not permitted here.");
            None
        }
        Err(_) => Some(home),
    }
}

pub fn write_request(
    stream: &mut UnixStream,
    method: Method,
    params: Option<Value>,
) -> std::io::Result<()> {
    let request = Request::new(method, Some(format!("it-{:?}", method)), params);
    serde_json::to_writer(&mut *stream, &request)?;
    stream.write_all(b"\n")?;
    stream.flush()
}

/// Reads one response line; `None` if the connection fails or the line is
/// not a response.
pub fn read_response(stream: &mut UnixStream) -> Option<Response> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }
    let end = buffer
        .iter()
        .position(|b| *b == b'\n')
        .unwrap_or(buffer.len());
    serde_json::from_slice(&buffer[..end]).ok()
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

pub fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

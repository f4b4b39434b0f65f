mod common;

use common::{db_path, error_code, read_response, socket_home, Station};
use serde_json::json;
use std::os::unix::net::UnixStream;
use std::thread::sleep;
use std::time::Duration;
use toolcrib_protocol::{Method, ERROR_TOO_MANY_CONNECTIONS, PROTOCOL_VERSION};

const MAX_ACTIVE_CONNECTIONS: usize = 64;

#[test]
fn daemon_connection_limit_rejects_overflow_and_stays_healthy() {
    let Some(home) = socket_home("toolcrib-hardening-limit") else {
        return;
    };
    let station = Station::launch(home.path());
    // The readiness check holds a slot briefly; give it time to close.
    sleep(Duration::from_millis(100));

    let saturated: Vec<UnixStream> = (0..MAX_ACTIVE_CONNECTIONS)
        .map(|_| UnixStream::connect(&station.socket).expect("saturate connection"))
        .collect();

    let mut overflow = UnixStream::connect(&station.socket).expect("connect overflow stream");
    let rejected = read_response(&mut overflow).expect("overflow response");
    assert!(!rejected.ok);
    assert_eq!(error_code(&rejected), Some(ERROR_TOO_MANY_CONNECTIONS));

    // Idle connections hit the read timeout and give their slots back.
    drop(saturated);
    let health = station
        .healthy_within(Duration::from_secs(5))
        .expect("daemon should recover once connections close");
    let rejected_count = health.data.expect("health data")["security"]["rejected_connections"]
        .as_u64()
        .unwrap_or(0);
    assert!(rejected_count >= 1, "rejected_connections = {rejected_count}");
}

#[test]
fn daemon_survives_malformed_payload_flood() {
    let Some(home) = socket_home("toolcrib-hardening-malformed") else {
        return;
    };
    let station = Station::launch(home.path());

    for _ in 0..128 {
        let response = station.send_raw(b"{\"uid\": \"AAA1\"\n");
        assert_eq!(error_code(&response), Some("invalid_json"));
    }

    let unknown = station.send_raw(
        format!(
            "{{\"protocol_version\":{},\"method\":\"drop_loans\"}}\n",
            PROTOCOL_VERSION
        )
        .as_bytes(),
    );
    assert!(!unknown.ok, "unknown method must be rejected");

    assert!(station.call(Method::GetHealth, None).ok);
}

#[test]
fn daemon_answers_silent_client_with_read_timeout() {
    let Some(home) = socket_home("toolcrib-hardening-timeout") else {
        return;
    };
    let station = Station::launch(home.path());

    let mut silent = UnixStream::connect(&station.socket).expect("connect silent stream");
    let response = read_response(&mut silent).expect("timeout response");
    assert_eq!(error_code(&response), Some("read_timeout"));
}

#[test]
fn daemon_restart_keeps_catalogue_and_open_loans() {
    let Some(home) = socket_home("toolcrib-hardening-restart") else {
        return;
    };

    let first = Station::launch(home.path());
    assert!(
        first
            .call(Method::AddToolName, Some(json!({"name": "Torque wrench"})))
            .ok
    );
    drop(first);

    let conn = rusqlite::Connection::open(db_path(home.path())).expect("open daemon db");
    conn.execute(
        "INSERT INTO loans (tool_id, borrower_id, loaned_at) VALUES (?1, ?2, ?3)",
        rusqlite::params!["BBB2", "AAA1", "2026-01-01T00:00:00.000000Z"],
    )
    .expect("insert open loan");
    drop(conn);

    let second = Station::launch(home.path());
    let names = second.call(Method::ListToolNames, None);
    assert_eq!(names.data.expect("names data")["names"], json!(["Torque wrench"]));

    let loans = second.call(Method::GetLoans, None).data.expect("loans data");
    assert_eq!(loans["open_loans"][0]["borrower"], "AAA1");
    assert_eq!(loans["history"][0]["action"], "borrow");
}

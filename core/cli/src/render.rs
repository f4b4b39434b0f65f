//! Human-readable output for daemon responses.

use chrono::Local;
use serde_json::Value;
use toolcrib_protocol::{LoansSnapshot, ScanEvent, ScanEventKind, SessionPhase, SessionStatus};

pub fn status(status: &SessionStatus) -> String {
    let mut out = format!("phase:   {}\n", phase_label(status.phase));
    if let Some(user) = &status.pending_user_id {
        out.push_str(&format!("user:    {}\n", user));
    }
    if let Some(tool) = &status.pending_tool_id {
        out.push_str(&format!("tool:    {}\n", tool));
    }
    if status.transaction_failed {
        out.push_str("last transaction failed; tap a tool to retry\n");
    }
    if !status.message.is_empty() {
        out.push_str(&format!("message: {}\n", status.message));
    }
    out
}

pub fn health(data: &Value) -> String {
    format!(
        "daemon {} (pid {}, protocol {})\nstation: {}\nreader:  {}\nsubscribers: {}\n",
        text(&data["version"]),
        text(&data["pid"]),
        text(&data["protocol_version"]),
        text(&data["station_id"]),
        text(&data["reader"]),
        text(&data["subscribers"]),
    )
}

/// `manual_scan` and `check_tag` share the timeout/uid shape.
pub fn scan(data: &Value) -> String {
    if data["status"] == "timeout" {
        return "no tag presented before timeout\n".to_string();
    }
    let uid = text(&data["uid"]);
    match data.get("type").and_then(Value::as_str) {
        Some("unregistered") => format!("{}: unregistered\n", uid),
        Some(kind) => format!("{}: {} {}\n", uid, kind, text(&data["name"])),
        None => format!("{}\n", uid),
    }
}

pub fn message(data: &Value) -> String {
    match data.get("message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() => format!("{}\n", message),
        _ => format!("{}\n", text(&data["status"])),
    }
}

pub fn tool_names(data: &Value) -> String {
    let names = data["names"].as_array().map(Vec::as_slice).unwrap_or(&[]);
    if names.is_empty() {
        return "no tool names\n".to_string();
    }
    names
        .iter()
        .map(|name| format!("{}\n", text(name)))
        .collect()
}

pub fn loans(snapshot: &LoansSnapshot) -> String {
    let mut out = String::from("Open loans\n");
    if snapshot.open_loans.is_empty() {
        out.push_str("  (none)\n");
    }
    for loan in &snapshot.open_loans {
        out.push_str(&format!(
            "  {:<24} {:<20} since {}\n",
            loan.tool, loan.borrower, loan.loaned_at
        ));
    }

    out.push_str("\nRecent activity\n");
    if snapshot.history.is_empty() {
        out.push_str("  (none)\n");
    }
    for entry in &snapshot.history {
        match (&entry.returned_at, &entry.returner) {
            (Some(at), Some(returner)) => out.push_str(&format!(
                "  {} return {:<24} by {} (borrower {})\n",
                at, entry.tool, returner, entry.borrower
            )),
            _ => out.push_str(&format!(
                "  {} borrow {:<24} by {}\n",
                entry.loaned_at, entry.tool, entry.borrower
            )),
        }
    }
    out
}

pub fn event(event: &ScanEvent) -> String {
    let tag = match event.kind {
        ScanEventKind::UserScanned => "user",
        ScanEventKind::TransactionComplete => "done",
        ScanEventKind::StateReset => "reset",
        ScanEventKind::Error => "error",
    };
    format!(
        "#{:<5} {} {:<5} {}",
        event.sequence,
        event.emitted_at.with_timezone(&Local).format("%H:%M:%S"),
        tag,
        event.message
    )
}

fn phase_label(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Idle => "idle (stopped)",
        SessionPhase::AwaitingUser => "waiting for user tag",
        SessionPhase::AwaitingTool => "waiting for tool tag",
        SessionPhase::Settling => "transaction finished",
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

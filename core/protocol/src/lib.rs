//! IPC protocol types and validation for toolcrib-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests and to decode the event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_TAG_ID_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 100;
pub const MIN_SCAN_TIMEOUT_SECS: u64 = 1;
pub const MAX_SCAN_TIMEOUT_SECS: u64 = 30;
pub const MAX_LIST_LIMIT: usize = 1000;
pub const DEFAULT_OPEN_LOANS_LIMIT: usize = 100;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

pub const ERROR_TOO_MANY_CONNECTIONS: &str = "too_many_connections";
pub const ERROR_INVALID_PARAMS: &str = "invalid_params";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetStatus,
    Start,
    Stop,
    Reset,
    ManualScan,
    CheckTag,
    RegisterUser,
    RegisterTool,
    ListToolNames,
    AddToolName,
    DeleteToolName,
    GetLoans,
    Subscribe,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, id: Option<String>, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(ERROR_INVALID_PARAMS, message)
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tags
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    User,
    Tool,
}

impl TagKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagKind::User => "user",
            TagKind::Tool => "tool",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(TagKind::User),
            "tool" => Some(TagKind::Tool),
            _ => None,
        }
    }
}

/// Normalizes a raw tag identifier: separators (space, `:`, `-`) are dropped
/// and letters upper-cased. Returns `None` when the result is empty, too long
/// or contains anything other than ASCII alphanumerics.
pub fn normalize_tag_id(raw: &str) -> Option<String> {
    let normalized: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | ':' | '-'))
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if normalized.is_empty() || normalized.len() > MAX_TAG_ID_LEN {
        return None;
    }
    if !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(normalized)
}

// ─────────────────────────────────────────────────────────────────────────────
// Event stream
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanEventKind {
    UserScanned,
    TransactionComplete,
    StateReset,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoanAction {
    Borrow,
    Return,
}

impl LoanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanAction::Borrow => "borrow",
            LoanAction::Return => "return",
        }
    }
}

/// One entry of the daemon's event stream.
///
/// `sequence` and `emitted_at` are assigned by the daemon when the event is
/// published; everything else describes the session at decision time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanEvent {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
    pub kind: ScanEventKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<LoanAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_borrower_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_borrower_name: Option<String>,
}

impl ScanEvent {
    pub fn new(kind: ScanEventKind, message: impl Into<String>) -> Self {
        Self {
            sequence: 0,
            emitted_at: Utc::now(),
            kind,
            message: message.into(),
            user_id: None,
            user_name: None,
            tool_id: None,
            tool_name: None,
            action: None,
            prior_borrower_id: None,
            prior_borrower_name: None,
        }
    }

    pub fn with_user(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self.user_name = Some(name.into());
        self
    }

    pub fn with_tool(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.tool_id = Some(id.into());
        self.tool_name = Some(name.into());
        self
    }

    pub fn with_action(mut self, action: LoanAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_prior_borrower(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        self.prior_borrower_id = Some(id.into());
        self.prior_borrower_name = Some(name.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    AwaitingUser,
    AwaitingTool,
    Settling,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_tool_id: Option<String>,
    pub transaction_failed: bool,
    pub message: String,
    pub last_sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenLoan {
    pub loan_id: i64,
    pub tool: String,
    pub borrower: String,
    pub loaned_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoanHistoryEntry {
    pub loan_id: i64,
    pub action: LoanAction,
    pub tool: String,
    pub borrower: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returner: Option<String>,
    pub loaned_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoansSnapshot {
    pub open_loans: Vec<OpenLoan>,
    pub history: Vec<LoanHistoryEntry>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Request parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScanParams {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RegisterTagParams {
    pub uid: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ToolNameParams {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoansParams {
    #[serde(default)]
    pub open_limit: Option<usize>,
    #[serde(default)]
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SubscribeParams {
    #[serde(default)]
    pub since_sequence: Option<u64>,
}

/// Parses optional scan params. Returns the timeout to use, falling back to
/// `default_secs` when the client did not pick one.
pub fn parse_scan_params(params: Option<Value>, default_secs: u64) -> Result<u64, ErrorInfo> {
    let parsed: ScanParams = parse_optional(params)?;
    match parsed.timeout_secs {
        None => Ok(default_secs.clamp(MIN_SCAN_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS)),
        Some(secs) if (MIN_SCAN_TIMEOUT_SECS..=MAX_SCAN_TIMEOUT_SECS).contains(&secs) => Ok(secs),
        Some(_) => Err(ErrorInfo::invalid(format!(
            "timeout_secs must be between {} and {}",
            MIN_SCAN_TIMEOUT_SECS, MAX_SCAN_TIMEOUT_SECS
        ))),
    }
}

/// Parses and validates registration params. The returned uid is normalized
/// and the name trimmed.
pub fn parse_register_tag(params: Option<Value>) -> Result<RegisterTagParams, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::invalid("uid and name are required"))?;
    let parsed: RegisterTagParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::invalid(format!("registration payload is invalid: {}", err))
    })?;

    let uid = normalize_tag_id(&parsed.uid)
        .ok_or_else(|| ErrorInfo::invalid("uid must be 1-64 alphanumeric characters"))?;
    let name = require_name(&parsed.name)?;
    Ok(RegisterTagParams { uid, name })
}

pub fn parse_tool_name(params: Option<Value>) -> Result<String, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::invalid("name is required"))?;
    let parsed: ToolNameParams = serde_json::from_value(params)
        .map_err(|err| ErrorInfo::invalid(format!("tool name payload is invalid: {}", err)))?;
    require_name(&parsed.name)
}

/// Returns `(open_limit, history_limit)` with defaults applied and values
/// capped at [`MAX_LIST_LIMIT`].
pub fn parse_loans_params(params: Option<Value>) -> Result<(usize, usize), ErrorInfo> {
    let parsed: LoansParams = parse_optional(params)?;
    let open = parsed
        .open_limit
        .unwrap_or(DEFAULT_OPEN_LOANS_LIMIT)
        .min(MAX_LIST_LIMIT);
    let history = parsed
        .history_limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_LIST_LIMIT);
    Ok((open, history))
}

pub fn parse_subscribe_params(params: Option<Value>) -> Result<Option<u64>, ErrorInfo> {
    let parsed: SubscribeParams = parse_optional(params)?;
    Ok(parsed.since_sequence)
}

fn parse_optional<T>(params: Option<Value>) -> Result<T, ErrorInfo>
where
    T: Default + serde::de::DeserializeOwned,
{
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) if value.is_object() => serde_json::from_value(value)
            .map_err(|err| ErrorInfo::invalid(format!("params are invalid: {}", err))),
        Some(_) => Err(ErrorInfo::invalid("params must be an object")),
    }
}

fn require_name(value: &str) -> Result<String, ErrorInfo> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ErrorInfo::invalid("name is required"));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ErrorInfo::invalid(format!(
            "name must be {} characters or fewer",
            MAX_NAME_LEN
        )));
    }
    Ok(trimmed.to_string())
}

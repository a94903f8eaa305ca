//! Shared primitives used across PixelDust networking crates.

use core::fmt;

/// Result alias used across the workspace.
pub type BrowserResult<T> = Result<T, BrowserError>;

/// Local API error: configuration, framing, codec and registry misuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserError {
    pub code: &'static str,
    pub message: String,
}

impl BrowserError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BrowserError {}

/// Result alias for protocol-level operations on channels and requests.
pub type NetResult<T> = Result<T, NetError>;

/// Terminal or in-flight status of a channel. `Ok(())` is the success status.
pub type NetStatus = NetResult<()>;

/// Protocol status codes carried by channel messages.
///
/// Every variant has a stable wire code; `0` is reserved for success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetError {
    Failure,
    Unexpected,
    NotAvailable,
    InvalidArg,
    Aborted,
    Redirected,
    MalformedUri,
    Offline,
    PermissionDenied,
    ConnectionRefused,
    NetReset,
    ReadFailed,
    IpcClosed,
}

impl NetError {
    const ALL: [Self; 13] = [
        Self::Failure,
        Self::Unexpected,
        Self::NotAvailable,
        Self::InvalidArg,
        Self::Aborted,
        Self::Redirected,
        Self::MalformedUri,
        Self::Offline,
        Self::PermissionDenied,
        Self::ConnectionRefused,
        Self::NetReset,
        Self::ReadFailed,
        Self::IpcClosed,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::Failure => "net.failure",
            Self::Unexpected => "net.unexpected",
            Self::NotAvailable => "net.not_available",
            Self::InvalidArg => "net.invalid_arg",
            Self::Aborted => "net.binding_aborted",
            Self::Redirected => "net.binding_redirected",
            Self::MalformedUri => "net.malformed_uri",
            Self::Offline => "net.offline",
            Self::PermissionDenied => "net.permission_denied",
            Self::ConnectionRefused => "net.connection_refused",
            Self::NetReset => "net.reset",
            Self::ReadFailed => "net.read_failed",
            Self::IpcClosed => "net.ipc_closed",
        }
    }

    pub fn wire_code(self) -> u32 {
        match self {
            Self::Failure => 1,
            Self::Unexpected => 2,
            Self::NotAvailable => 3,
            Self::InvalidArg => 4,
            Self::Aborted => 5,
            Self::Redirected => 6,
            Self::MalformedUri => 7,
            Self::Offline => 8,
            Self::PermissionDenied => 9,
            Self::ConnectionRefused => 10,
            Self::NetReset => 11,
            Self::ReadFailed => 12,
            Self::IpcClosed => 13,
        }
    }

    pub fn from_wire_code(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|error| error.wire_code() == raw)
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl std::error::Error for NetError {}

impl From<NetError> for BrowserError {
    fn from(error: NetError) -> Self {
        BrowserError::new(error.code(), format!("channel status {error}"))
    }
}

/// Encodes a status as its wire code (`0` for success).
pub fn status_to_wire(status: NetStatus) -> u32 {
    match status {
        Ok(()) => 0,
        Err(error) => error.wire_code(),
    }
}

/// Decodes a wire status code; unknown non-zero codes are rejected.
pub fn status_from_wire(raw: u32) -> BrowserResult<NetStatus> {
    if raw == 0 {
        return Ok(Ok(()));
    }

    NetError::from_wire_code(raw).map(Err).ok_or_else(|| {
        BrowserError::new(
            "net.status_unknown",
            format!("unknown channel status code `{raw}`"),
        )
    })
}

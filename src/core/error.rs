use nix::errno::Errno;
use thiserror::Error;

/// Core error type for rule-table operations
#[derive(Debug, Error)]
pub enum Error {
    /// Named chain, rule or counter does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Chain name is already taken (or is a reserved verdict name)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Chain is still referenced or non-empty
    #[error("In use: {0}")]
    InUse(String),

    /// Bad name, position, policy or handle state
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The kernel table changed between load and commit
    #[error("Commit conflict on table {table}: {reason}")]
    CommitConflict { table: String, reason: String },

    /// A kernel exchange call failed
    #[error("{op} failed ({errno}): {message}")]
    System {
        op: ExchangeOp,
        errno: Errno,
        message: String,
    },

    /// The binary table snapshot is malformed
    #[error("Malformed table snapshot: {0}")]
    Parse(#[from] ParseError),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of [`Error`], stable across message changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InUse,
    InvalidArgument,
    CommitConflict,
    System,
    Parse,
    Io,
    Serialization,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InUse(_) => ErrorKind::InUse,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::CommitConflict { .. } => ErrorKind::CommitConflict,
            Self::System { .. } => ErrorKind::System,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// User-facing explanation with remediation hints.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Self::System { op, errno, .. } => KernelErrorPattern::describe(*op, *errno),
            Self::CommitConflict { table, .. } => {
                ErrorTranslation::new(format!("Table '{table}' was modified by someone else"))
                    .with_suggestion("Reopen the table and apply your changes again")
                    .with_suggestion("Check for other firewall managers running concurrently")
            }
            Self::Parse(_) => ErrorTranslation::new("The kernel returned a table this tool cannot read")
                .with_suggestion("The running kernel may use a different ABI (only x86_64/aarch64 layouts are supported)"),
            other => ErrorTranslation::new(other.to_string()),
        }
    }
}

impl From<ExchangeError> for Error {
    fn from(err: ExchangeError) -> Self {
        let translation = KernelErrorPattern::describe(err.op, err.errno);
        Self::System {
            op: err.op,
            errno: err.errno,
            message: translation.user_message,
        }
    }
}

/// Errors raised while decoding a binary table snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("{what} needs {needed} bytes, buffer has {available}")]
    BufferTooSmall {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("header declares {specified} bytes of entries, got {actual}")]
    SizeMismatch { specified: usize, actual: usize },

    #[error("header declares {specified} entries, found {found}")]
    NumEntriesMismatch { specified: usize, found: usize },

    #[error("entry at offset {offset}: target_offset {target_offset} is too small")]
    TargetOffsetTooSmall { offset: usize, target_offset: usize },

    #[error("entry at offset {offset}: next_offset {next_offset} is out of bounds")]
    InvalidNextOffset { offset: usize, next_offset: usize },

    #[error("entry at offset {offset}: target size {size} is invalid")]
    InvalidTargetSize { offset: usize, size: usize },

    #[error("{what} is not NUL terminated")]
    UnterminatedName { what: &'static str },

    #[error("{what} is not valid UTF-8")]
    InvalidName { what: &'static str },

    #[error("entry at offset {offset}: invalid flags {flags:#04x}")]
    InvalidFlags { offset: usize, flags: u8 },

    #[error("entry at offset {offset}: invalid inverse flags {flags:#04x}")]
    InvalidInverseFlags { offset: usize, flags: u8 },

    #[error("table does not end with an ERROR entry")]
    NoTrailingErrorTarget,

    #[error("entry at offset {offset} does not belong to any chain")]
    RuleBeforeFirstChain { offset: usize },

    #[error("chain {chain} has no policy or return entry")]
    ChainHasNoPolicy { chain: String },

    #[error("entry at offset {offset}: invalid verdict {verdict}")]
    InvalidVerdict { offset: usize, verdict: i32 },

    #[error("entry at offset {offset}: jump to {verdict} does not start a chain")]
    InvalidJumpTarget { offset: usize, verdict: i32 },

    #[error("entry at offset {offset}: policy is not a standard verdict")]
    InvalidPolicy { offset: usize },

    #[error("entry at offset {offset}: unexpected ERROR target {name}")]
    UnexpectedErrorTarget { offset: usize, name: String },

    #[error("hook {hook} points at {offset}, which is not an entry boundary")]
    InvalidHookOffset { hook: usize, offset: u32 },

    #[error("duplicate chain name {0}")]
    DuplicateChain(String),
}

/// Kernel exchange call that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ExchangeOp {
    #[strum(serialize = "socket")]
    Socket,
    #[strum(serialize = "IPT_SO_GET_INFO")]
    GetInfo,
    #[strum(serialize = "IPT_SO_GET_ENTRIES")]
    GetEntries,
    #[strum(serialize = "IPT_SO_SET_REPLACE")]
    Replace,
    #[strum(serialize = "IPT_SO_SET_ADD_COUNTERS")]
    AddCounters,
}

/// Raw failure of one kernel exchange call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{op}: {errno}")]
pub struct ExchangeError {
    pub op: ExchangeOp,
    pub errno: Errno,
}

impl ExchangeError {
    pub fn new(op: ExchangeOp, errno: Errno) -> Self {
        Self { op, errno }
    }

    pub fn last(op: ExchangeOp) -> Self {
        Self::new(op, Errno::last())
    }

    /// Human-readable text for this failure.
    pub fn describe(&self) -> String {
        KernelErrorPattern::describe(self.op, self.errno).user_message
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
    pub help_url: Option<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
            help_url: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_help(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }
}

/// Database of (operation, errno) pairs and their translations
pub struct KernelErrorPattern;

impl KernelErrorPattern {
    /// Maps a failed exchange call to a user-friendly translation.
    pub fn describe(op: ExchangeOp, errno: Errno) -> ErrorTranslation {
        match (op, errno) {
            (_, Errno::EPERM | Errno::EACCES) => {
                ErrorTranslation::new("Permission denied (you must be root)")
                    .with_suggestion("Run as root or grant CAP_NET_ADMIN")
                    .with_help("https://man7.org/linux/man-pages/man7/capabilities.7.html")
            }
            (ExchangeOp::Socket, Errno::EAFNOSUPPORT | Errno::EPROTONOSUPPORT) => {
                ErrorTranslation::new("Raw IPv4 sockets are not available")
                    .with_suggestion("Check that the kernel was built with IPv4 support")
            }
            (ExchangeOp::GetInfo, Errno::ENOPROTOOPT | Errno::EINVAL) => {
                ErrorTranslation::new("iptables kernel support is not loaded")
                    .with_suggestion("Load the module: sudo modprobe ip_tables")
                    .with_suggestion("On nftables-only systems the legacy interface may be disabled")
                    .with_help("https://www.netfilter.org/documentation/")
            }
            (ExchangeOp::GetInfo, Errno::ENOENT) => {
                ErrorTranslation::new("Table does not exist (do you need to insmod?)")
                    .with_suggestion("Load the table module, e.g. sudo modprobe iptable_filter")
                    .with_suggestion("Check the table name for typos")
            }
            (ExchangeOp::GetEntries, Errno::EAGAIN) => {
                ErrorTranslation::new("Table changed while it was being read")
                    .with_suggestion("Try again")
            }
            (ExchangeOp::Replace, Errno::EAGAIN) => {
                ErrorTranslation::new("Table was modified concurrently")
                    .with_suggestion("Reopen the table and reapply your changes")
            }
            (ExchangeOp::Replace, Errno::ELOOP) => {
                ErrorTranslation::new("Loop found in table")
                    .with_suggestion("A chain jumps back into itself through other chains")
            }
            (ExchangeOp::Replace, Errno::ENOENT) => {
                ErrorTranslation::new("No chain/target/match by that name")
                    .with_suggestion("Load the kernel module for the extension the rule uses")
            }
            (ExchangeOp::Replace, Errno::EINVAL) => {
                ErrorTranslation::new("Kernel rejected the table")
                    .with_suggestion("An extension payload may not match the running kernel version")
            }
            (ExchangeOp::AddCounters, Errno::EINVAL) => {
                ErrorTranslation::new("Counter count does not match the new table")
            }
            (_, Errno::ENOMEM) => ErrorTranslation::new("Memory allocation problem"),
            (_, Errno::ENOSYS) => ErrorTranslation::new("Will be implemented real soon. I promise ;)"),
            (op, errno) => ErrorTranslation::new(format!("{op} failed: {}", errno.desc()))
                .with_help("https://www.netfilter.org/documentation/"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

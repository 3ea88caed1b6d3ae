//! ip4tc - transactional editing of legacy iptables tables
//!
//! Loads an IPv4 packet-filter table from the kernel, stages edits against
//! an in-memory copy and commits them back with one atomic replace.
//!
//! # Architecture
//!
//! - [`core`] - Binary table format, working copy, kernel exchange and transaction handle
//! - [`audit`] - Audit logging for commits and counter operations
//! - [`validators`] - Chain, table, target and interface name validation
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Commits are refused when the live table changed since load
//! - Rule counters carried across the replace
//! - Failed commits never leave a half-applied table
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::codec::{AddressMatch, InterfaceMatch};
pub use core::counters::Counters;
pub use core::error::{Error, ErrorKind, Result};
pub use core::handle::{CommitOutcome, Handle, HandleState, RuleCursor};
pub use core::kernel::{KernelExchange, SocketKernel};
pub use core::memory::MemoryKernel;
pub use core::rule::{Extension, MatchFields, MatchMask, ProtocolMatch, RuleEntry, Verdict};
pub use core::table::Policy;

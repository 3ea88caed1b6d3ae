//! Core rule-table logic
//!
//! Everything needed to load a legacy IPv4 packet-filter table, stage edits
//! against an in-memory copy and commit them back atomically:
//!
//! - [`wire`]: kernel binary layout (`ipt_getinfo`, `ipt_entry`, `ipt_replace`)
//! - [`codec`]: address and interface match encoding
//! - [`rule`]: rule entries, verdicts and match masks
//! - [`counters`]: packet/byte counters and the commit-time counter map
//! - [`table`]: the chain-keyed working copy and its compiler
//! - [`kernel`]: the exchange trait and the raw-socket implementation
//! - [`memory`]: an in-memory kernel for unprivileged use and tests
//! - [`handle`]: the load/edit/commit transaction handle
//! - [`dump`]: entry dump, save format and pending-change diff
//! - [`error`]: error types and kernel error translation

pub mod codec;
pub mod counters;
pub mod dump;
pub mod error;
pub mod handle;
pub mod kernel;
pub mod memory;
pub mod rule;
pub mod table;
pub mod wire;

#[cfg(test)]
pub mod test_helpers;

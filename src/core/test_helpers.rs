//! Shared test utilities for core module tests
//!
//! Sample tables and rules used across the unit test suites.
//! This module is only compiled in test mode.

use crate::core::codec::{AddressMatch, InterfaceMatch};
use crate::core::rule::{Extension, RuleEntry, Verdict};
use crate::core::table::{ChainTable, Hook};
use std::net::Ipv4Addr;

/// The `filter` table as a fresh kernel reports it: INPUT, FORWARD and
/// OUTPUT with ACCEPT policies and no rules.
///
/// Parsed back from its own compiled snapshot, so it carries the same
/// baseline entry count (4) a loaded table would.
pub fn filter_table() -> ChainTable {
    let table = ChainTable::with_builtins(
        "filter",
        &[
            (Hook::LocalIn, Verdict::Accept),
            (Hook::Forward, Verdict::Accept),
            (Hook::LocalOut, Verdict::Accept),
        ],
    )
    .unwrap();
    ChainTable::from_snapshot(&table.compile().unwrap().snapshot()).unwrap()
}

/// `-s 10.0.0.0/8 -i eth0 -j LOGDROP`
pub fn logdrop_rule() -> RuleEntry {
    RuleEntry::new("LOGDROP")
        .source(AddressMatch::new(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(255, 0, 0, 0),
            false,
        ))
        .in_interface(InterfaceMatch::new("eth0", false).unwrap())
}

/// A `LOG`-style extension rule with one opaque match record.
pub fn extension_rule() -> RuleEntry {
    // xt_entry_match header (32 bytes) plus 8 bytes of payload
    let mut matches = vec![0u8; 40];
    matches[0..2].copy_from_slice(&40u16.to_ne_bytes());
    matches[2..5].copy_from_slice(b"tcp");
    matches[32..40].copy_from_slice(&[0, 0, 0xff, 0xff, 0, 0x16, 0, 0x16]);
    RuleEntry::new("LOG").extension(Extension {
        matches,
        target_revision: 0,
        target_data: vec![4, 0, 0, 0, b'f', b'w', b':', b' '],
    })
}

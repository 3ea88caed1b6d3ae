//! In-memory kernel honoring the same exchange contract as the socket.
//!
//! Clones share state, so two handles opened on clones of one
//! `MemoryKernel` race exactly like two processes on one host.

use super::counters::Counters;
use super::error::{Error, ExchangeError, ExchangeOp, Result};
use super::kernel::{KernelExchange, ReplaceOutcome};
use super::rule::Verdict;
use super::table::{ChainTable, Hook};
use super::wire::{self, RawSnapshot, ReplaceHeader, TableInfo};
use nix::errno::Errno;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Number of exchange calls served, per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub loads: usize,
    pub replaces: usize,
    pub add_counters: usize,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, RawSnapshot>,
    fail_next: Option<ExchangeError>,
    calls: CallCounts,
}

impl State {
    fn injected(&mut self, op: ExchangeOp) -> Result<()> {
        match self.fail_next {
            Some(err) if err.op == op => {
                self.fail_next = None;
                Err(err.into())
            }
            _ => Ok(()),
        }
    }

    fn table_mut(&mut self, name: &str, op: ExchangeOp) -> Result<&mut RawSnapshot> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| ExchangeError::new(op, Errno::ENOENT).into())
    }
}

/// Shared in-memory kernel.
#[derive(Debug, Clone, Default)]
pub struct MemoryKernel {
    state: Arc<Mutex<State>>,
}

impl MemoryKernel {
    /// Kernel without any table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernel holding a freshly loaded `filter` table: INPUT, FORWARD and
    /// OUTPUT, all with an ACCEPT policy.
    pub fn with_filter_table() -> Result<Self> {
        let kernel = Self::new();
        let table = ChainTable::with_builtins(
            "filter",
            &[
                (Hook::LocalIn, Verdict::Accept),
                (Hook::Forward, Verdict::Accept),
                (Hook::LocalOut, Verdict::Accept),
            ],
        )?;
        kernel.install(table.compile()?.snapshot());
        Ok(kernel)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs (or overwrites) a table as is.
    pub fn install(&self, snapshot: RawSnapshot) {
        self.lock()
            .tables
            .insert(snapshot.info.name.clone(), snapshot);
    }

    pub fn snapshot(&self, table: &str) -> Option<RawSnapshot> {
        self.lock().tables.get(table).cloned()
    }

    /// Live counters of every entry of `table`, in entry order.
    pub fn counters(&self, table: &str) -> Result<Vec<Counters>> {
        let snapshot = self
            .snapshot(table)
            .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
        Ok(wire::parse_entries(&snapshot.entries)?
            .into_iter()
            .map(|e| e.counters)
            .collect())
    }

    /// Simulates traffic hitting entry number `index` (0-based).
    pub fn bump_counters(&self, table: &str, index: usize, delta: Counters) -> Result<()> {
        let mut state = self.lock();
        let snapshot = state.table_mut(table, ExchangeOp::AddCounters)?;
        let mut deltas = vec![Counters::ZERO; snapshot.info.num_entries as usize];
        let slot = deltas
            .get_mut(index)
            .ok_or_else(|| Error::NotFound(format!("entry {index} of table '{table}'")))?;
        *slot = delta;
        add_to_entries(&mut snapshot.entries, &deltas)
    }

    /// Makes the next call of `op` fail with `errno`.
    pub fn fail_next(&self, op: ExchangeOp, errno: Errno) {
        self.lock().fail_next = Some(ExchangeError::new(op, errno));
    }

    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }
}

/// Adds `deltas` to the counters stored inside an entry blob.
fn add_to_entries(entries: &mut [u8], deltas: &[Counters]) -> Result<()> {
    let parsed = wire::parse_entries(entries)?;
    for (entry, delta) in parsed.iter().zip(deltas) {
        let updated = entry.counters.wrapping_add(*delta);
        write_counters(entries, entry.offset, updated);
    }
    Ok(())
}

fn write_counters(entries: &mut [u8], offset: usize, counters: Counters) {
    let at = offset + wire::ENTRY_SIZE - wire::COUNTERS_SIZE;
    entries[at..at + 8].copy_from_slice(&counters.packets.to_ne_bytes());
    entries[at + 8..at + 16].copy_from_slice(&counters.bytes.to_ne_bytes());
}

impl KernelExchange for MemoryKernel {
    fn load_table(&self, table: &str) -> Result<RawSnapshot> {
        let mut state = self.lock();
        state.calls.loads += 1;
        state.injected(ExchangeOp::GetInfo)?;
        let snapshot = state.table_mut(table, ExchangeOp::GetInfo)?.clone();
        Ok(snapshot)
    }

    fn replace_table(&self, blob: &[u8]) -> Result<ReplaceOutcome> {
        let mut state = self.lock();
        state.calls.replaces += 1;
        state.injected(ExchangeOp::Replace)?;

        let (header, entries) = ReplaceHeader::decode(blob)
            .map_err(|_| Error::from(ExchangeError::new(ExchangeOp::Replace, Errno::EINVAL)))?;
        let current = state.table_mut(&header.name, ExchangeOp::Replace)?;
        if header.num_counters != current.info.num_entries {
            debug!(
                table = %header.name,
                expected = current.info.num_entries,
                got = header.num_counters,
                "Replace rejected with EAGAIN"
            );
            return Ok(ReplaceOutcome::Conflict);
        }

        let mut replacement = RawSnapshot {
            info: TableInfo {
                name: header.name.clone(),
                valid_hooks: header.valid_hooks,
                hook_entry: header.hook_entry,
                underflow: header.underflow,
                num_entries: header.num_entries,
                size: header.size,
            },
            entries: entries.to_vec(),
        };
        // The kernel validates the whole table before swapping it in
        let parsed = ChainTable::from_snapshot(&replacement)
            .map_err(|_| Error::from(ExchangeError::new(ExchangeOp::Replace, Errno::EINVAL)))?;
        if parsed.has_jump_loop() {
            debug!(table = %header.name, "Replace rejected with ELOOP");
            return Err(ExchangeError::new(ExchangeOp::Replace, Errno::ELOOP).into());
        }
        for entry in wire::parse_entries(&replacement.entries)? {
            write_counters(&mut replacement.entries, entry.offset, Counters::ZERO);
        }

        let previous = wire::parse_entries(&current.entries)?
            .into_iter()
            .map(|e| e.counters)
            .collect();
        *current = replacement;
        Ok(ReplaceOutcome::Replaced { previous })
    }

    fn add_counters(&self, blob: &[u8]) -> Result<()> {
        let mut state = self.lock();
        state.calls.add_counters += 1;
        state.injected(ExchangeOp::AddCounters)?;

        let (name, counters) = wire::decode_counters_info(blob)
            .map_err(|_| Error::from(ExchangeError::new(ExchangeOp::AddCounters, Errno::EINVAL)))?;
        let current = state.table_mut(&name, ExchangeOp::AddCounters)?;
        if counters.len() != current.info.num_entries as usize {
            return Err(ExchangeError::new(ExchangeOp::AddCounters, Errno::EINVAL).into());
        }
        add_to_entries(&mut current.entries, &counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rule::RuleEntry;

    #[test]
    fn test_filter_table_is_loadable() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let snapshot = kernel.load_table("filter").unwrap();
        assert_eq!(snapshot.info.num_entries, 4);
        assert_eq!(snapshot.info.valid_hooks, 0x0e);
        assert_eq!(kernel.calls().loads, 1);
    }

    #[test]
    fn test_missing_table_is_enoent() {
        let kernel = MemoryKernel::new();
        match kernel.load_table("nat") {
            Err(Error::System { op, errno, .. }) => {
                assert_eq!(op, ExchangeOp::GetInfo);
                assert_eq!(errno, Errno::ENOENT);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_clones_share_state() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let other = kernel.clone();
        other
            .bump_counters("filter", 0, Counters::new(3, 300))
            .unwrap();
        assert_eq!(kernel.counters("filter").unwrap()[0], Counters::new(3, 300));
    }

    #[test]
    fn test_replace_checks_entry_count() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let table = ChainTable::from_snapshot(&kernel.load_table("filter").unwrap()).unwrap();
        let mut compiled = table.compile().unwrap();
        compiled.header.num_counters = 99;
        assert_eq!(
            kernel.replace_table(&compiled.replace_blob().unwrap()).unwrap(),
            ReplaceOutcome::Conflict
        );
    }

    #[test]
    fn test_replace_returns_and_resets_counters() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        kernel
            .bump_counters("filter", 1, Counters::new(2, 120))
            .unwrap();
        let table = ChainTable::from_snapshot(&kernel.load_table("filter").unwrap()).unwrap();
        let blob = table.compile().unwrap().replace_blob().unwrap();
        match kernel.replace_table(&blob).unwrap() {
            ReplaceOutcome::Replaced { previous } => {
                assert_eq!(previous[1], Counters::new(2, 120));
            }
            ReplaceOutcome::Conflict => panic!("unexpected conflict"),
        }
        assert!(kernel.counters("filter").unwrap().iter().all(Counters::is_zero));
    }

    #[test]
    fn test_replace_rejects_jump_loops() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let mut table = ChainTable::from_snapshot(&kernel.load_table("filter").unwrap()).unwrap();
        table.create_chain("spin").unwrap();
        table.append_entry("spin", &RuleEntry::new("spin")).unwrap();
        let blob = table.compile().unwrap().replace_blob().unwrap();
        match kernel.replace_table(&blob) {
            Err(Error::System { op, errno, .. }) => {
                assert_eq!(op, ExchangeOp::Replace);
                assert_eq!(errno, Errno::ELOOP);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(kernel.load_table("filter").unwrap().info.num_entries, 4);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        kernel.fail_next(ExchangeOp::GetInfo, Errno::EPERM);
        assert!(kernel.load_table("filter").is_err());
        assert!(kernel.load_table("filter").is_ok());
    }

    #[test]
    fn test_add_counters_length_must_match() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let blob = wire::encode_counters_info("filter", &[Counters::new(1, 1)]).unwrap();
        assert!(kernel.add_counters(&blob).is_err());
        let blob = wire::encode_counters_info("filter", &[Counters::new(1, 1); 4]).unwrap();
        kernel.add_counters(&blob).unwrap();
        assert_eq!(kernel.counters("filter").unwrap()[3], Counters::new(1, 1));
    }
}

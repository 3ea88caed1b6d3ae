//! Transaction handle: one load/edit/commit cycle over a kernel table.
//!
//! ```text
//! open ──► Open ──commit──► Committed
//!           │  ▲               │
//!           │  └────reopen─────┤
//!           └──failed commit──► Discarded
//! ```
//!
//! Every query and mutation requires the handle to be `Open`. Edits only
//! touch the in-memory working copy until [`Handle::commit`].

use super::counters::Counters;
use super::dump;
use super::error::{Error, Result};
use super::kernel::{KernelExchange, ReplaceOutcome};
use super::rule::{MatchMask, RuleEntry};
use super::table::{ChainId, ChainTable, Compiled, Policy};
use super::wire;
use crate::validators;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum HandleState {
    Open,
    Committed,
    Discarded,
}

/// What a successful commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was staged; the kernel was not contacted
    Unchanged,
    /// The table was replaced with `entries` entries
    Replaced { entries: u32 },
}

/// Position of a rule within a chain, independent of its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleCursor {
    chain: ChainId,
    index: usize,
}

impl RuleCursor {
    /// 1-based rule number
    pub fn number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// Staged edits over one kernel table.
pub struct Handle<K: KernelExchange> {
    kernel: K,
    table_name: String,
    state: HandleState,
    fingerprint: String,
    baseline: ChainTable,
    working: ChainTable,
    chain_cursor: Option<ChainId>,
}

impl<K: KernelExchange> std::fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("table", &self.table_name)
            .field("state", &self.state)
            .field("dirty", &self.working.is_dirty())
            .finish_non_exhaustive()
    }
}

impl<K: KernelExchange> Handle<K> {
    /// Loads `table` from the kernel.
    pub fn open(kernel: K, table: &str) -> Result<Self> {
        validators::validate_table_name(table)
            .map_err(|e| Error::InvalidArgument(format!("{e}: '{table}'")))?;
        let (fingerprint, working) = Self::load(&kernel, table)?;
        info!(
            table,
            chains = working.chains().count(),
            entries = working.baseline_entries(),
            "Opened table"
        );
        Ok(Self {
            kernel,
            table_name: table.to_string(),
            state: HandleState::Open,
            fingerprint,
            baseline: working.clone(),
            working,
            chain_cursor: None,
        })
    }

    fn load(kernel: &K, table: &str) -> Result<(String, ChainTable)> {
        let snapshot = kernel.load_table(table)?;
        let working = ChainTable::from_snapshot(&snapshot)?;
        Ok((snapshot.fingerprint()?, working))
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// True when edits are staged that the kernel has not seen.
    pub fn has_changes(&self) -> bool {
        self.state == HandleState::Open && self.working.is_dirty()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            HandleState::Open => Ok(()),
            state => Err(Error::InvalidArgument(format!(
                "handle for table '{}' is {state}",
                self.table_name
            ))),
        }
    }

    fn table(&self) -> Result<&ChainTable> {
        self.ensure_open()?;
        Ok(&self.working)
    }

    fn table_mut(&mut self) -> Result<&mut ChainTable> {
        self.ensure_open()?;
        Ok(&mut self.working)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════

    /// Over-long names are simply not chains.
    pub fn is_chain(&self, name: &str) -> Result<bool> {
        Ok(self.table()?.is_chain(name))
    }

    pub fn is_builtin(&self, name: &str) -> Result<bool> {
        Ok(self.table()?.is_builtin(name))
    }

    /// Restarts chain iteration; `None` for a table without chains.
    pub fn first_chain(&mut self) -> Result<Option<String>> {
        let table = self.table()?;
        let first = table.first_chain();
        let name = first.and_then(|id| table.chain_name(id)).map(str::to_string);
        self.chain_cursor = first;
        Ok(name)
    }

    /// Next chain in table order; `None` once exhausted.
    ///
    /// # Errors
    ///
    /// `NotFound` if the chain the cursor rests on was deleted.
    pub fn next_chain(&mut self) -> Result<Option<String>> {
        let table = self.table()?;
        let Some(current) = self.chain_cursor else {
            return Ok(None);
        };
        let next = table.chain_after(current)?;
        let name = next.and_then(|id| table.chain_name(id)).map(str::to_string);
        self.chain_cursor = next;
        Ok(name)
    }

    /// All chain names in table order.
    pub fn chains(&self) -> Result<Vec<String>> {
        Ok(self.table()?.chains().map(str::to_string).collect())
    }

    pub fn first_rule(&self, chain: &str) -> Result<Option<RuleCursor>> {
        let table = self.table()?;
        let id = table.lookup(chain)?;
        Ok(table
            .rule_at(id, 0)?
            .map(|_| RuleCursor { chain: id, index: 0 }))
    }

    pub fn next_rule(&self, previous: &RuleCursor) -> Result<Option<RuleCursor>> {
        let index = previous.index + 1;
        Ok(self
            .table()?
            .rule_at(previous.chain, index)?
            .map(|_| RuleCursor {
                chain: previous.chain,
                index,
            }))
    }

    /// The rule a cursor points at.
    pub fn rule(&self, cursor: &RuleCursor) -> Result<RuleEntry> {
        self.table()?
            .rule_at(cursor.chain, cursor.index)?
            .ok_or_else(|| Error::NotFound(format!("rule {}", cursor.number())))
    }

    pub fn rules(&self, chain: &str) -> Result<Vec<RuleEntry>> {
        self.table()?.rules(chain)
    }

    /// Effective target name of a rule; `""` for a fallthrough rule.
    pub fn get_target(&self, cursor: &RuleCursor) -> Result<String> {
        Ok(self.rule(cursor)?.target)
    }

    pub fn get_policy(&self, chain: &str) -> Result<Option<Policy>> {
        self.table()?.get_policy(chain)
    }

    pub fn get_references(&self, chain: &str) -> Result<u32> {
        self.table()?.get_references(chain)
    }

    pub fn check_entry(&self, chain: &str, rule: &RuleEntry, mask: &MatchMask) -> Result<bool> {
        self.table()?.check_entry(chain, rule, mask)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mutations
    // ═══════════════════════════════════════════════════════════════════════

    pub fn insert_entry(&mut self, chain: &str, rule: &RuleEntry, position: u32) -> Result<()> {
        self.table_mut()?.insert_entry(chain, rule, position)
    }

    pub fn append_entry(&mut self, chain: &str, rule: &RuleEntry) -> Result<()> {
        self.table_mut()?.append_entry(chain, rule)
    }

    pub fn replace_entry(&mut self, chain: &str, rule: &RuleEntry, position: u32) -> Result<()> {
        self.table_mut()?.replace_entry(chain, rule, position)
    }

    pub fn delete_entry(&mut self, chain: &str, rule: &RuleEntry, mask: &MatchMask) -> Result<bool> {
        self.table_mut()?.delete_entry(chain, rule, mask)
    }

    pub fn delete_num_entry(&mut self, chain: &str, position: u32) -> Result<()> {
        self.table_mut()?.delete_num_entry(chain, position)
    }

    pub fn flush_entries(&mut self, chain: &str) -> Result<()> {
        self.table_mut()?.flush_entries(chain)
    }

    pub fn zero_entries(&mut self, chain: &str) -> Result<()> {
        self.table_mut()?.zero_entries(chain)
    }

    pub fn create_chain(&mut self, name: &str) -> Result<()> {
        self.table_mut()?.create_chain(name)
    }

    pub fn delete_chain(&mut self, name: &str) -> Result<()> {
        self.table_mut()?.delete_chain(name)
    }

    pub fn rename_chain(&mut self, old: &str, new: &str) -> Result<()> {
        self.table_mut()?.rename_chain(old, new)
    }

    pub fn set_policy(&mut self, chain: &str, policy: &str, counters: Option<Counters>) -> Result<()> {
        self.table_mut()?.set_policy(chain, policy, counters)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Counters
    // ═══════════════════════════════════════════════════════════════════════

    pub fn read_counter(&self, chain: &str, rulenum: u32) -> Result<Counters> {
        self.table()?.read_counter(chain, rulenum)
    }

    pub fn zero_counter(&mut self, chain: &str, rulenum: u32) -> Result<()> {
        self.table_mut()?.zero_counter(chain, rulenum)
    }

    pub fn set_counter(&mut self, chain: &str, rulenum: u32, counters: Counters) -> Result<()> {
        self.table_mut()?.set_counter(chain, rulenum, counters)
    }

    pub fn read_policy_counters(&self, chain: &str) -> Result<Counters> {
        self.table()?.read_policy_counters(chain)
    }

    pub fn zero_policy_counters(&mut self, chain: &str) -> Result<()> {
        self.table_mut()?.zero_policy_counters(chain)
    }

    pub fn set_policy_counters(&mut self, chain: &str, counters: Counters) -> Result<()> {
        self.table_mut()?.set_policy_counters(chain, counters)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════════════════

    /// Entry-level dump of the working copy.
    pub fn dump_entries(&self) -> Result<String> {
        dump::dump_entries(self.table()?)
    }

    /// Working copy in iptables-save form.
    pub fn save_format(&self) -> Result<String> {
        dump::save_format(self.table()?)
    }

    /// Line diff of the loaded table against the working copy; `None`
    /// when nothing is staged.
    pub fn pending_diff(&self) -> Result<Option<String>> {
        let working = self.table()?;
        if !working.is_dirty() {
            return Ok(None);
        }
        dump::pending_diff(&self.baseline, working).map(Some)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Atomically replaces the kernel table with the working copy.
    ///
    /// A failure before the kernel accepted the replace leaves the handle
    /// `Discarded`. Once the replace went through the handle is
    /// `Committed`, even if pushing the carried-over counters fails.
    ///
    /// # Errors
    ///
    /// `CommitConflict` when the table changed since load, `System` when
    /// an exchange call failed.
    pub fn commit(&mut self) -> Result<CommitOutcome> {
        self.ensure_open()?;
        if !self.working.is_dirty() {
            debug!(table = %self.table_name, "Nothing staged, commit is a no-op");
            self.state = HandleState::Committed;
            return Ok(CommitOutcome::Unchanged);
        }

        let compiled = match self.prepare() {
            Ok(compiled) => compiled,
            Err(e) => {
                self.state = HandleState::Discarded;
                return Err(e);
            }
        };

        let previous = match compiled
            .replace_blob()
            .and_then(|blob| self.kernel.replace_table(&blob))
        {
            Ok(ReplaceOutcome::Replaced { previous }) => previous,
            Ok(ReplaceOutcome::Conflict) => {
                self.state = HandleState::Discarded;
                warn!(table = %self.table_name, "Kernel entry count changed since load");
                return Err(Error::CommitConflict {
                    table: self.table_name.clone(),
                    reason: "kernel entry count changed since load".to_string(),
                });
            }
            Err(e) => {
                self.state = HandleState::Discarded;
                error!(table = %self.table_name, "Replace failed: {e}");
                return Err(e);
            }
        };
        self.state = HandleState::Committed;

        let counters = compiled.counters_after(&previous);
        let blob = wire::encode_counters_info(&self.table_name, &counters)?;
        self.kernel.add_counters(&blob).inspect_err(|e| {
            warn!(table = %self.table_name, "Table replaced but counters were not restored: {e}");
        })?;

        info!(
            table = %self.table_name,
            entries = compiled.header.num_entries,
            "Committed table"
        );
        Ok(CommitOutcome::Replaced {
            entries: compiled.header.num_entries,
        })
    }

    /// The entry-count check in the replace alone misses a concurrent commit
    /// that kept the count, so the live layout is compared first.
    fn prepare(&self) -> Result<Compiled> {
        let live = self.kernel.load_table(&self.table_name)?;
        let fingerprint = live.fingerprint()?;
        if fingerprint != self.fingerprint {
            warn!(
                table = %self.table_name,
                expected = %self.fingerprint,
                found = %fingerprint,
                "Table changed since load"
            );
            return Err(Error::CommitConflict {
                table: self.table_name.clone(),
                reason: "table layout changed since load".to_string(),
            });
        }
        self.working.compile()
    }

    /// Drops staged edits and reloads the table; the handle is `Open`
    /// again afterwards.
    pub fn reopen(&mut self) -> Result<()> {
        let (fingerprint, working) = Self::load(&self.kernel, &self.table_name)?;
        self.fingerprint = fingerprint;
        self.baseline = working.clone();
        self.working = working;
        self.chain_cursor = None;
        self.state = HandleState::Open;
        debug!(table = %self.table_name, "Reopened table");
        Ok(())
    }

    /// Releases the handle; staged edits never reach the kernel.
    pub fn close(self) {
        drop(self);
    }
}

impl<K: KernelExchange> Drop for Handle<K> {
    fn drop(&mut self) {
        if self.has_changes() {
            debug!(table = %self.table_name, "Discarding staged changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{ErrorKind, ExchangeOp};
    use crate::core::memory::MemoryKernel;
    use crate::core::rule::Verdict;
    use nix::errno::Errno;

    fn open() -> (MemoryKernel, Handle<MemoryKernel>) {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let handle = Handle::open(kernel.clone(), "filter").unwrap();
        (kernel, handle)
    }

    #[test]
    fn test_open_rejects_long_table_name() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let err = Handle::open(kernel, &"t".repeat(32)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_open_missing_table_is_system_error() {
        let err = Handle::open(MemoryKernel::new(), "nat").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[test]
    fn test_clean_commit_skips_kernel() {
        let (kernel, mut handle) = open();
        assert_eq!(handle.commit().unwrap(), CommitOutcome::Unchanged);
        assert_eq!(handle.state(), HandleState::Committed);
        assert_eq!(kernel.calls().replaces, 0);
    }

    #[test]
    fn test_operations_require_open_handle() {
        let (_kernel, mut handle) = open();
        handle.commit().unwrap();
        assert_eq!(
            handle.is_chain("INPUT").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            handle.create_chain("X").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        handle.reopen().unwrap();
        assert!(handle.is_chain("INPUT").unwrap());
    }

    #[test]
    fn test_overlong_name_is_not_a_chain() {
        let (_kernel, handle) = open();
        assert!(!handle.is_chain(&"x".repeat(100)).unwrap());
        assert!(!handle.is_builtin(&"x".repeat(100)).unwrap());
    }

    #[test]
    fn test_chain_cursor() {
        let (_kernel, mut handle) = open();
        handle.create_chain("A").unwrap();
        assert_eq!(handle.next_chain().unwrap(), None);
        assert_eq!(handle.first_chain().unwrap().as_deref(), Some("INPUT"));
        assert_eq!(handle.next_chain().unwrap().as_deref(), Some("FORWARD"));
        assert_eq!(handle.next_chain().unwrap().as_deref(), Some("OUTPUT"));
        assert_eq!(handle.next_chain().unwrap().as_deref(), Some("A"));
        assert_eq!(handle.next_chain().unwrap(), None);
        // restartable
        assert_eq!(handle.first_chain().unwrap().as_deref(), Some("INPUT"));
    }

    #[test]
    fn test_chain_cursor_on_deleted_chain() {
        let (_kernel, mut handle) = open();
        handle.create_chain("A").unwrap();
        handle.create_chain("B").unwrap();
        handle.first_chain().unwrap();
        for _ in 0..3 {
            handle.next_chain().unwrap();
        }
        handle.delete_chain("A").unwrap();
        assert_eq!(handle.next_chain().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_rule_cursor_handles_duplicates() {
        let (_kernel, mut handle) = open();
        for _ in 0..3 {
            handle.append_entry("INPUT", &RuleEntry::new("ACCEPT")).unwrap();
        }
        let mut numbers = Vec::new();
        let mut cursor = handle.first_rule("INPUT").unwrap();
        while let Some(c) = cursor {
            numbers.push(c.number());
            assert_eq!(handle.get_target(&c).unwrap(), "ACCEPT");
            cursor = handle.next_rule(&c).unwrap();
        }
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(handle.first_rule("FORWARD").unwrap(), None);
        assert_eq!(
            handle.first_rule("missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_commit_persists_edits() {
        let (kernel, mut handle) = open();
        handle.create_chain("X").unwrap();
        handle.append_entry("X", &RuleEntry::new("DROP")).unwrap();
        assert!(handle.pending_diff().unwrap().unwrap().contains("+ :X - [0:0]"));
        assert!(matches!(
            handle.commit().unwrap(),
            CommitOutcome::Replaced { entries: 7 }
        ));
        assert_eq!(kernel.calls().add_counters, 1);

        let reloaded = Handle::open(kernel, "filter").unwrap();
        assert_eq!(reloaded.rules("X").unwrap()[0].target, "DROP");
    }

    #[test]
    fn test_failed_replace_discards() {
        let (kernel, mut handle) = open();
        handle.create_chain("X").unwrap();
        kernel.fail_next(ExchangeOp::Replace, Errno::ENOMEM);
        assert_eq!(handle.commit().unwrap_err().kind(), ErrorKind::System);
        assert_eq!(handle.state(), HandleState::Discarded);
    }

    #[test]
    fn test_failed_counter_push_still_committed() {
        let (kernel, mut handle) = open();
        handle.create_chain("X").unwrap();
        kernel.fail_next(ExchangeOp::AddCounters, Errno::EINVAL);
        assert_eq!(handle.commit().unwrap_err().kind(), ErrorKind::System);
        assert_eq!(handle.state(), HandleState::Committed);
        assert!(Handle::open(kernel, "filter").unwrap().is_chain("X").unwrap());
    }

    #[test]
    fn test_concurrent_chain_creation_is_conflict() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let mut first = Handle::open(kernel.clone(), "filter").unwrap();
        let mut second = Handle::open(kernel.clone(), "filter").unwrap();
        first.create_chain("A").unwrap();
        first.commit().unwrap();
        second.create_chain("B").unwrap();
        assert_eq!(
            second.commit().unwrap_err().kind(),
            ErrorKind::CommitConflict
        );
        assert_eq!(second.state(), HandleState::Discarded);
        assert!(!Handle::open(kernel, "filter").unwrap().is_chain("B").unwrap());
    }

    #[test]
    fn test_concurrent_policy_change_is_conflict() {
        let kernel = MemoryKernel::with_filter_table().unwrap();
        let mut first = Handle::open(kernel.clone(), "filter").unwrap();
        let mut second = Handle::open(kernel.clone(), "filter").unwrap();
        first.set_policy("FORWARD", "DROP", None).unwrap();
        first.commit().unwrap();

        // Same entry count as the kernel's table, only the layout moved.
        second.set_policy("OUTPUT", "DROP", None).unwrap();
        assert_eq!(
            second.commit().unwrap_err().kind(),
            ErrorKind::CommitConflict
        );

        let reloaded = Handle::open(kernel, "filter").unwrap();
        assert_eq!(
            reloaded.get_policy("FORWARD").unwrap().map(|p| p.verdict),
            Some(Verdict::Drop)
        );
        assert_eq!(
            reloaded.get_policy("OUTPUT").unwrap().map(|p| p.verdict),
            Some(Verdict::Accept)
        );
    }
}

//! In-memory working copy of one rule table.
//!
//! A [`ChainTable`] is parsed from a kernel snapshot, edited through
//! chain-name keyed operations and compiled back into an `ipt_replace`
//! blob. Rules are owned by their chain; jumps hold a [`ChainId`] and are
//! translated to byte offsets only when compiling.
//!
//! Layout of a compiled table:
//!
//! ```text
//! built-in chain:  rule* policy
//! user chain:      ERROR(name) rule* RETURN
//! end of table:    ERROR("ERROR")
//! ```

use super::counters::{CounterMap, Counters};
use super::error::{Error, ParseError, Result};
use super::rule::{Entry, MatchMask, RuleEntry, Target, Verdict};
use super::wire::{
    self, IpHeader, RawEntry, RawSnapshot, RawTarget, ReplaceHeader, TableInfo, NUM_HOOKS,
};
use crate::validators;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::debug;

/// Stable identity of a chain within one working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(u32);

/// Netfilter hook points, in kernel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
pub enum Hook {
    #[strum(serialize = "PREROUTING")]
    PreRouting,
    #[strum(serialize = "INPUT")]
    LocalIn,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "OUTPUT")]
    LocalOut,
    #[strum(serialize = "POSTROUTING")]
    PostRouting,
}

impl Hook {
    pub const fn index(self) -> usize {
        match self {
            Self::PreRouting => 0,
            Self::LocalIn => 1,
            Self::Forward => 2,
            Self::LocalOut => 3,
            Self::PostRouting => 4,
        }
    }

    pub const fn chain_name(self) -> &'static str {
        match self {
            Self::PreRouting => "PREROUTING",
            Self::LocalIn => "INPUT",
            Self::Forward => "FORWARD",
            Self::LocalOut => "OUTPUT",
            Self::PostRouting => "POSTROUTING",
        }
    }

    /// Bit of this hook in `valid_hooks`
    pub const fn mask(self) -> u32 {
        1 << self.index()
    }
}

/// Policy of a built-in chain as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub verdict: Verdict,
    pub counters: Counters,
}

#[derive(Debug, Clone)]
struct StagedRule {
    entry: Entry,
    map: CounterMap,
}

#[derive(Debug, Clone)]
struct StagedPolicy {
    verdict: Verdict,
    counters: Counters,
    map: CounterMap,
}

#[derive(Debug, Clone)]
enum ChainKind {
    Builtin { hook: Hook, policy: StagedPolicy },
    User,
}

#[derive(Debug, Clone)]
struct Chain {
    id: ChainId,
    name: String,
    kind: ChainKind,
    rules: Vec<StagedRule>,
}

impl Chain {
    fn is_builtin(&self) -> bool {
        matches!(self.kind, ChainKind::Builtin { .. })
    }

    fn rule_mut(&mut self, rulenum: u32) -> Result<&mut StagedRule> {
        let name = &self.name;
        let index = (rulenum as usize).checked_sub(1);
        index
            .and_then(|i| self.rules.get_mut(i))
            .ok_or_else(|| Error::NotFound(format!("rule {rulenum} in chain '{name}'")))
    }

    fn policy_mut(&mut self) -> Result<&mut StagedPolicy> {
        match &mut self.kind {
            ChainKind::Builtin { policy, .. } => Ok(policy),
            ChainKind::User => Err(Error::InvalidArgument(format!(
                "chain '{}' is user-defined and has no policy",
                self.name
            ))),
        }
    }
}

/// The serialized form of a working copy, ready for the kernel.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub header: ReplaceHeader,
    pub entries: Vec<u8>,
    plan: Vec<(CounterMap, Counters)>,
}

impl Compiled {
    /// Complete `ipt_replace` request
    pub fn replace_blob(&self) -> Result<Vec<u8>> {
        self.header.encode(&self.entries)
    }

    /// Counters to push once the kernel replaced the table and returned
    /// `previous`, one per entry of the new table.
    pub fn counters_after(&self, previous: &[Counters]) -> Vec<Counters> {
        self.plan
            .iter()
            .map(|(map, staged)| map.resolve(previous, *staged))
            .collect()
    }

    /// The compiled table as the kernel would report it after the replace.
    pub fn snapshot(&self) -> RawSnapshot {
        RawSnapshot {
            info: TableInfo {
                name: self.header.name.clone(),
                valid_hooks: self.header.valid_hooks,
                hook_entry: self.header.hook_entry,
                underflow: self.header.underflow,
                num_entries: self.header.num_entries,
                size: self.header.size,
            },
            entries: self.entries.clone(),
        }
    }
}

/// Working copy of one table.
#[derive(Debug, Clone)]
pub struct ChainTable {
    name: String,
    valid_hooks: u32,
    chains: Vec<Chain>,
    next_id: u32,
    /// Entry count of the snapshot this copy was loaded from
    baseline_entries: u32,
    dirty: bool,
}

/// Error for a chain name that resolves to nothing. Names no chain could
/// ever carry are rejected as invalid rather than reported missing.
fn missing_chain(name: &str) -> Error {
    if name.len() > validators::MAX_CHAIN_NAME_LEN {
        Error::InvalidArgument(format!(
            "chain name '{name}' exceeds {} bytes",
            validators::MAX_CHAIN_NAME_LEN
        ))
    } else {
        Error::NotFound(format!("chain '{name}'"))
    }
}

fn offset_verdict(offset: usize) -> Result<i32> {
    i32::try_from(offset).map_err(|_| Error::InvalidArgument("table too large".to_string()))
}

impl ChainTable {
    // ═══════════════════════════════════════════════════════════════════════
    // Construction
    // ═══════════════════════════════════════════════════════════════════════

    /// Empty table with the given built-in chains and policies.
    pub fn with_builtins(name: &str, builtins: &[(Hook, Verdict)]) -> Result<Self> {
        validators::validate_table_name(name).map_err(Error::InvalidArgument)?;
        let mut table = Self {
            name: name.to_string(),
            valid_hooks: 0,
            chains: Vec::new(),
            next_id: 0,
            baseline_entries: 0,
            dirty: false,
        };
        for &(hook, verdict) in builtins {
            if !verdict.is_policy() {
                return Err(Error::InvalidArgument(format!(
                    "policy must be ACCEPT or DROP, not {verdict}"
                )));
            }
            table.valid_hooks |= hook.mask();
            let id = table.alloc_id();
            table.chains.push(Chain {
                id,
                name: hook.chain_name().to_string(),
                kind: ChainKind::Builtin {
                    hook,
                    policy: StagedPolicy {
                        verdict,
                        counters: Counters::ZERO,
                        map: CounterMap::NoMap,
                    },
                },
                rules: Vec::new(),
            });
        }
        table.chains.sort_by_key(|c| match c.kind {
            ChainKind::Builtin { hook, .. } => hook.index(),
            ChainKind::User => NUM_HOOKS,
        });
        Ok(table)
    }

    /// Parses a kernel snapshot into a working copy.
    pub fn from_snapshot(snapshot: &RawSnapshot) -> Result<Self> {
        let info = &snapshot.info;
        if snapshot.entries.len() != info.size as usize {
            return Err(ParseError::SizeMismatch {
                specified: info.size as usize,
                actual: snapshot.entries.len(),
            }
            .into());
        }

        let raw = wire::parse_entries(&snapshot.entries)?;
        if raw.len() != info.num_entries as usize {
            return Err(ParseError::NumEntriesMismatch {
                specified: info.num_entries as usize,
                found: raw.len(),
            }
            .into());
        }
        match raw.last() {
            Some(RawEntry {
                target: RawTarget::Error(name),
                ..
            }) if name == wire::ERROR_TARGET => {}
            _ => return Err(ParseError::NoTrailingErrorTarget.into()),
        }

        let offsets: HashSet<usize> = raw.iter().map(|e| e.offset).collect();
        let mut hook_at: HashMap<usize, Hook> = HashMap::new();
        let mut underflow_at: HashMap<usize, Hook> = HashMap::new();
        for hook in Hook::iter() {
            if !info.hook_valid(hook.index()) {
                continue;
            }
            let entry = info.hook_entry[hook.index()];
            let underflow = info.underflow[hook.index()];
            for offset in [entry, underflow] {
                if !offsets.contains(&(offset as usize)) {
                    return Err(ParseError::InvalidHookOffset {
                        hook: hook.index(),
                        offset,
                    }
                    .into());
                }
            }
            if hook_at.insert(entry as usize, hook).is_some() {
                return Err(ParseError::InvalidHookOffset {
                    hook: hook.index(),
                    offset: entry,
                }
                .into());
            }
            underflow_at.insert(underflow as usize, hook);
        }

        let mut table = Self {
            name: info.name.clone(),
            valid_hooks: info.valid_hooks,
            chains: Vec::new(),
            next_id: 0,
            baseline_entries: info.num_entries,
            dirty: false,
        };

        // First entry offset of every user chain, for jump resolution
        let mut starts: HashMap<usize, ChainId> = HashMap::new();
        // (chain position, counter index, entry) until all starts are known
        let mut pending: Vec<(usize, u32, &RawEntry)> = Vec::new();
        let mut open: Option<usize> = None;
        let body = &raw[..raw.len() - 1];

        for (index, e) in body.iter().enumerate() {
            let counter_index = index as u32;

            if let Some(&hook) = hook_at.get(&e.offset) {
                if let Some(pos) = open {
                    return Err(ParseError::ChainHasNoPolicy {
                        chain: table.chains[pos].name.clone(),
                    }
                    .into());
                }
                let id = table.alloc_id();
                table.chains.push(Chain {
                    id,
                    name: hook.chain_name().to_string(),
                    kind: ChainKind::Builtin {
                        hook,
                        // replaced when the underflow entry is reached
                        policy: StagedPolicy {
                            verdict: Verdict::Accept,
                            counters: Counters::ZERO,
                            map: CounterMap::NoMap,
                        },
                    },
                    rules: Vec::new(),
                });
                open = Some(table.chains.len() - 1);
            }

            let Some(pos) = open else {
                let RawTarget::Error(name) = &e.target else {
                    return Err(ParseError::RuleBeforeFirstChain { offset: e.offset }.into());
                };
                if table.find(name).is_some() {
                    return Err(ParseError::DuplicateChain(name.clone()).into());
                }
                let id = table.alloc_id();
                table.chains.push(Chain {
                    id,
                    name: name.clone(),
                    kind: ChainKind::User,
                    rules: Vec::new(),
                });
                starts.insert(e.offset + e.size, id);
                open = Some(table.chains.len() - 1);
                continue;
            };

            let chain = &mut table.chains[pos];
            match &mut chain.kind {
                ChainKind::Builtin { hook, policy } => {
                    if underflow_at.get(&e.offset).copied() == Some(*hook) {
                        let verdict = match e.target {
                            RawTarget::Standard(code) => Verdict::from_code(code),
                            _ => None,
                        }
                        .ok_or(ParseError::InvalidPolicy { offset: e.offset })?;
                        *policy = StagedPolicy {
                            verdict,
                            counters: e.counters,
                            map: CounterMap::Normal {
                                index: counter_index,
                            },
                        };
                        open = None;
                    } else if let RawTarget::Error(name) = &e.target {
                        return Err(ParseError::UnexpectedErrorTarget {
                            offset: e.offset,
                            name: name.clone(),
                        }
                        .into());
                    } else {
                        pending.push((pos, counter_index, e));
                    }
                }
                ChainKind::User => {
                    if e.is_error() {
                        return Err(ParseError::ChainHasNoPolicy {
                            chain: chain.name.clone(),
                        }
                        .into());
                    }
                    // `raw` still holds the terminator, so index + 1 exists
                    let next = &raw[index + 1];
                    let is_foot = e.target == RawTarget::Standard(Verdict::Return.code())
                        && e.matches.is_empty()
                        && (next.is_error() || hook_at.contains_key(&next.offset));
                    if is_foot {
                        open = None;
                    } else {
                        pending.push((pos, counter_index, e));
                    }
                }
            }
        }
        if let Some(pos) = open {
            return Err(ParseError::ChainHasNoPolicy {
                chain: table.chains[pos].name.clone(),
            }
            .into());
        }

        for (pos, counter_index, e) in pending {
            let target = match &e.target {
                RawTarget::Standard(code) if *code < 0 => {
                    Target::Verdict(Verdict::from_code(*code).ok_or(ParseError::InvalidVerdict {
                        offset: e.offset,
                        verdict: *code,
                    })?)
                }
                RawTarget::Standard(code) => {
                    let dest = *code as usize;
                    if dest == e.offset + e.size {
                        Target::Fallthrough
                    } else if let Some(&id) = starts.get(&dest) {
                        Target::Jump(id)
                    } else {
                        return Err(ParseError::InvalidJumpTarget {
                            offset: e.offset,
                            verdict: *code,
                        }
                        .into());
                    }
                }
                RawTarget::Error(name) => {
                    return Err(ParseError::UnexpectedErrorTarget {
                        offset: e.offset,
                        name: name.clone(),
                    }
                    .into());
                }
                RawTarget::Extension {
                    name,
                    revision,
                    data,
                } => Target::Extension {
                    name: name.clone(),
                    revision: *revision,
                    data: data.clone(),
                },
            };
            table.chains[pos].rules.push(StagedRule {
                entry: Entry {
                    ip: e.ip.clone(),
                    nfcache: e.nfcache,
                    counters: e.counters,
                    matches: e.matches.clone(),
                    target,
                },
                map: CounterMap::Normal {
                    index: counter_index,
                },
            });
        }

        // built-ins first, each group in snapshot order
        table.chains.sort_by_key(|c| !c.is_builtin());

        debug!(
            table = %table.name,
            chains = table.chains.len(),
            entries = info.num_entries,
            "Parsed table snapshot"
        );
        Ok(table)
    }

    fn alloc_id(&mut self) -> ChainId {
        let id = ChainId(self.next_id);
        self.next_id += 1;
        id
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Lookup
    // ═══════════════════════════════════════════════════════════════════════

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn valid_hooks(&self) -> u32 {
        self.valid_hooks
    }

    /// True once any edit has been staged since load.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Number of entries in the snapshot this copy was parsed from.
    pub fn baseline_entries(&self) -> u32 {
        self.baseline_entries
    }

    fn find(&self, name: &str) -> Option<&Chain> {
        self.chains.iter().find(|c| c.name == name)
    }

    fn chain(&self, name: &str) -> Result<&Chain> {
        self.find(name).ok_or_else(|| missing_chain(name))
    }

    fn chain_mut(&mut self, name: &str) -> Result<&mut Chain> {
        self.chains
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| missing_chain(name))
    }

    /// Id of `name`, or the error every name-keyed operation reports.
    pub fn lookup(&self, name: &str) -> Result<ChainId> {
        self.chain(name).map(|c| c.id)
    }

    fn by_id(&self, id: ChainId) -> Option<&Chain> {
        self.chains.iter().find(|c| c.id == id)
    }

    pub fn is_chain(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.find(name).is_some_and(Chain::is_builtin)
    }

    /// Chain names in table order.
    pub fn chains(&self) -> impl Iterator<Item = &str> + '_ {
        self.chains.iter().map(|c| c.name.as_str())
    }

    pub fn chain_id(&self, name: &str) -> Option<ChainId> {
        self.find(name).map(|c| c.id)
    }

    pub fn chain_name(&self, id: ChainId) -> Option<&str> {
        self.by_id(id).map(|c| c.name.as_str())
    }

    pub fn first_chain(&self) -> Option<ChainId> {
        self.chains.first().map(|c| c.id)
    }

    /// Chain following `id` in table order.
    ///
    /// # Errors
    ///
    /// `NotFound` if `id` no longer exists.
    pub fn chain_after(&self, id: ChainId) -> Result<Option<ChainId>> {
        let pos = self
            .chains
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Error::NotFound("chain removed during iteration".to_string()))?;
        Ok(self.chains.get(pos + 1).map(|c| c.id))
    }

    /// Rule at zero-based `index` of chain `id`; `None` past the end.
    pub fn rule_at(&self, id: ChainId, index: usize) -> Result<Option<RuleEntry>> {
        let chain = self
            .by_id(id)
            .ok_or_else(|| Error::NotFound("chain removed during iteration".to_string()))?;
        Ok(chain.rules.get(index).map(|r| self.view(&r.entry)))
    }

    pub fn rule_count(&self, chain: &str) -> Result<usize> {
        Ok(self.chain(chain)?.rules.len())
    }

    /// All rules of `chain`, in order.
    pub fn rules(&self, chain: &str) -> Result<Vec<RuleEntry>> {
        Ok(self
            .chain(chain)?
            .rules
            .iter()
            .map(|r| self.view(&r.entry))
            .collect())
    }

    /// Name a target resolves to: verdict, extension, jumped-to chain, or
    /// `""` for a fallthrough.
    pub fn target_name(&self, target: &Target) -> String {
        match target {
            Target::Verdict(v) => v.as_str().to_string(),
            Target::Jump(id) => self.chain_name(*id).unwrap_or_default().to_string(),
            Target::Fallthrough => String::new(),
            Target::Extension { name, .. } => name.clone(),
        }
    }

    fn view(&self, entry: &Entry) -> RuleEntry {
        RuleEntry::from_entry(entry, self.target_name(&entry.target))
    }

    /// Policy of a built-in chain; `None` for user-defined chains.
    pub fn get_policy(&self, chain: &str) -> Result<Option<Policy>> {
        Ok(match &self.chain(chain)?.kind {
            ChainKind::Builtin { policy, .. } => Some(Policy {
                verdict: policy.verdict,
                counters: policy.counters,
            }),
            ChainKind::User => None,
        })
    }

    /// Number of rules jumping to `chain`, self-references included.
    pub fn get_references(&self, chain: &str) -> Result<u32> {
        let id = self.chain(chain)?.id;
        let count = self
            .chains
            .iter()
            .flat_map(|c| &c.rules)
            .filter(|r| r.entry.target == Target::Jump(id))
            .count();
        Ok(count as u32)
    }

    /// True when following jumps from some chain can lead back into it.
    pub fn has_jump_loop(&self) -> bool {
        let edges: HashMap<ChainId, Vec<ChainId>> = self
            .chains
            .iter()
            .map(|c| {
                let targets = c
                    .rules
                    .iter()
                    .filter_map(|r| match &r.entry.target {
                        Target::Jump(id) => Some(*id),
                        _ => None,
                    })
                    .collect();
                (c.id, targets)
            })
            .collect();

        let mut done = HashSet::new();
        for start in self.chains.iter().map(|c| c.id) {
            if done.contains(&start) {
                continue;
            }
            // (chain, index of its next edge); `path` holds the chains on the stack
            let mut stack = vec![(start, 0usize)];
            let mut path = HashSet::from([start]);
            while let Some((id, next)) = stack.last_mut() {
                let current = *id;
                match edges.get(&current).and_then(|t| t.get(*next)).copied() {
                    Some(target) => {
                        *next += 1;
                        if path.contains(&target) {
                            return true;
                        }
                        if !done.contains(&target) {
                            path.insert(target);
                            stack.push((target, 0));
                        }
                    }
                    None => {
                        stack.pop();
                        path.remove(&current);
                        done.insert(current);
                    }
                }
            }
        }
        false
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Rule edits
    // ═══════════════════════════════════════════════════════════════════════

    /// Resolves a rule's target name against this table.
    fn resolve_target(&self, rule: &RuleEntry) -> Result<Target> {
        let name = rule.target.as_str();
        if name.is_empty() {
            return Ok(Target::Fallthrough);
        }
        if let Ok(verdict) = Verdict::from_str(name) {
            return Ok(Target::Verdict(verdict));
        }
        if let Some(chain) = self.find(name) {
            if chain.is_builtin() {
                return Err(Error::InvalidArgument(format!(
                    "cannot jump to built-in chain '{name}'"
                )));
            }
            return Ok(Target::Jump(chain.id));
        }
        validators::validate_target_name(name).map_err(Error::InvalidArgument)?;
        Ok(Target::Extension {
            name: name.to_string(),
            revision: rule.extension.target_revision,
            data: rule.extension.target_data.clone(),
        })
    }

    fn staged_entry(&self, rule: &RuleEntry) -> Result<Entry> {
        Entry::from_rule(rule, self.resolve_target(rule)?)
    }

    /// Inserts `rule` so it becomes rule number `position` (1-based).
    pub fn insert_entry(&mut self, chain: &str, rule: &RuleEntry, position: u32) -> Result<()> {
        self.chain(chain)?;
        let entry = self.staged_entry(rule)?;
        let target = self.chain_mut(chain)?;
        let len = target.rules.len();
        if position == 0 || position as usize > len + 1 {
            return Err(Error::InvalidArgument(format!(
                "position {position} out of range 1..={} for chain '{chain}'",
                len + 1
            )));
        }
        target.rules.insert(
            position as usize - 1,
            StagedRule {
                entry,
                map: CounterMap::Set,
            },
        );
        self.dirty = true;
        Ok(())
    }

    pub fn append_entry(&mut self, chain: &str, rule: &RuleEntry) -> Result<()> {
        let len = self.rule_count(chain)?;
        self.insert_entry(chain, rule, len as u32 + 1)
    }

    /// Replaces rule number `position` (1-based) in place.
    pub fn replace_entry(&mut self, chain: &str, rule: &RuleEntry, position: u32) -> Result<()> {
        self.chain(chain)?;
        let entry = self.staged_entry(rule)?;
        let target = self.chain_mut(chain)?;
        let len = target.rules.len();
        let slot = (position as usize)
            .checked_sub(1)
            .and_then(|i| target.rules.get_mut(i))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "position {position} out of range 1..={len} for chain '{chain}'"
                ))
            })?;
        *slot = StagedRule {
            entry,
            map: CounterMap::Set,
        };
        self.dirty = true;
        Ok(())
    }

    fn find_masked(&self, chain: &str, rule: &RuleEntry, mask: &MatchMask) -> Result<Option<usize>> {
        let probe = self.staged_entry(rule)?;
        Ok(self
            .chain(chain)?
            .rules
            .iter()
            .position(|r| r.entry.matches_masked(&probe, mask)))
    }

    /// True when `chain` holds a rule equal to `rule` under `mask`.
    pub fn check_entry(&self, chain: &str, rule: &RuleEntry, mask: &MatchMask) -> Result<bool> {
        self.chain(chain)?;
        Ok(self.find_masked(chain, rule, mask)?.is_some())
    }

    /// Deletes the first rule equal to `rule` under `mask`. `Ok(false)`
    /// when no rule matched.
    pub fn delete_entry(&mut self, chain: &str, rule: &RuleEntry, mask: &MatchMask) -> Result<bool> {
        self.chain(chain)?;
        let Some(index) = self.find_masked(chain, rule, mask)? else {
            return Ok(false);
        };
        self.chain_mut(chain)?.rules.remove(index);
        self.dirty = true;
        Ok(true)
    }

    /// Deletes rule number `position` (1-based).
    pub fn delete_num_entry(&mut self, chain: &str, position: u32) -> Result<()> {
        let target = self.chain_mut(chain)?;
        let len = target.rules.len();
        if position == 0 || position as usize > len {
            return Err(Error::InvalidArgument(format!(
                "position {position} out of range 1..={len} for chain '{chain}'"
            )));
        }
        target.rules.remove(position as usize - 1);
        self.dirty = true;
        Ok(())
    }

    /// Removes every rule of `chain`; the policy is untouched.
    pub fn flush_entries(&mut self, chain: &str) -> Result<()> {
        self.chain_mut(chain)?.rules.clear();
        self.dirty = true;
        Ok(())
    }

    /// Zeroes every rule counter of `chain`, and its policy counters.
    pub fn zero_entries(&mut self, chain: &str) -> Result<()> {
        let target = self.chain_mut(chain)?;
        for rule in &mut target.rules {
            rule.map = rule.map.zeroed(rule.entry.counters);
            rule.entry.counters = Counters::ZERO;
        }
        if let ChainKind::Builtin { policy, .. } = &mut target.kind {
            policy.map = policy.map.zeroed(policy.counters);
            policy.counters = Counters::ZERO;
        }
        self.dirty = true;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Chain edits
    // ═══════════════════════════════════════════════════════════════════════

    /// Position a user chain named `name` takes: before the first user
    /// chain that sorts after it.
    fn sorted_position(&self, name: &str) -> usize {
        self.chains
            .iter()
            .position(|c| !c.is_builtin() && c.name.as_bytes() > name.as_bytes())
            .unwrap_or(self.chains.len())
    }

    fn check_new_name(&self, name: &str) -> Result<()> {
        validators::validate_chain_name(name)
            .map_err(|e| Error::InvalidArgument(format!("{e}: '{name}'")))?;
        if validators::is_reserved_target(name) || self.is_chain(name) {
            return Err(Error::AlreadyExists(format!("chain '{name}'")));
        }
        Ok(())
    }

    pub fn create_chain(&mut self, name: &str) -> Result<()> {
        self.check_new_name(name)?;
        let id = self.alloc_id();
        let pos = self.sorted_position(name);
        self.chains.insert(
            pos,
            Chain {
                id,
                name: name.to_string(),
                kind: ChainKind::User,
                rules: Vec::new(),
            },
        );
        self.dirty = true;
        Ok(())
    }

    pub fn delete_chain(&mut self, name: &str) -> Result<()> {
        let chain = self.chain(name)?;
        if chain.is_builtin() {
            return Err(Error::InvalidArgument(format!(
                "cannot delete built-in chain '{name}'"
            )));
        }
        let references = self.get_references(name)?;
        if references > 0 {
            return Err(Error::InUse(format!(
                "chain '{name}' is referenced by {references} rule(s)"
            )));
        }
        if !chain.rules.is_empty() {
            return Err(Error::InUse(format!(
                "chain '{name}' still holds {} rule(s)",
                chain.rules.len()
            )));
        }
        self.chains.retain(|c| c.name != name);
        self.dirty = true;
        Ok(())
    }

    /// Renames a user chain. Jumps to it follow the new name.
    pub fn rename_chain(&mut self, old: &str, new: &str) -> Result<()> {
        if self.chain(old)?.is_builtin() {
            return Err(Error::InvalidArgument(format!(
                "cannot rename built-in chain '{old}'"
            )));
        }
        self.check_new_name(new)?;
        let pos = self
            .chains
            .iter()
            .position(|c| c.name == old)
            .ok_or_else(|| missing_chain(old))?;
        let mut chain = self.chains.remove(pos);
        chain.name = new.to_string();
        let pos = self.sorted_position(new);
        self.chains.insert(pos, chain);
        self.dirty = true;
        Ok(())
    }

    /// Sets the policy of a built-in chain. `None` keeps its counters.
    pub fn set_policy(&mut self, chain: &str, policy: &str, counters: Option<Counters>) -> Result<()> {
        let target = self.chain_mut(chain)?;
        if !target.is_builtin() {
            return Err(Error::InvalidArgument(format!(
                "chain '{chain}' is user-defined and has no policy"
            )));
        }
        let verdict = Verdict::from_str(policy)
            .ok()
            .filter(|v| v.is_policy())
            .ok_or_else(|| {
                Error::InvalidArgument(format!("policy must be ACCEPT or DROP, not '{policy}'"))
            })?;
        let staged = target.policy_mut()?;
        staged.verdict = verdict;
        if let Some(counters) = counters {
            staged.counters = counters;
            staged.map = CounterMap::Set;
        }
        self.dirty = true;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Counters
    // ═══════════════════════════════════════════════════════════════════════

    /// Counters of rule number `rulenum` (1-based).
    pub fn read_counter(&self, chain: &str, rulenum: u32) -> Result<Counters> {
        let target = self.chain(chain)?;
        (rulenum as usize)
            .checked_sub(1)
            .and_then(|i| target.rules.get(i))
            .map(|r| r.entry.counters)
            .ok_or_else(|| Error::NotFound(format!("rule {rulenum} in chain '{chain}'")))
    }

    pub fn zero_counter(&mut self, chain: &str, rulenum: u32) -> Result<()> {
        let rule = self.chain_mut(chain)?.rule_mut(rulenum)?;
        rule.map = rule.map.zeroed(rule.entry.counters);
        rule.entry.counters = Counters::ZERO;
        self.dirty = true;
        Ok(())
    }

    pub fn set_counter(&mut self, chain: &str, rulenum: u32, counters: Counters) -> Result<()> {
        let rule = self.chain_mut(chain)?.rule_mut(rulenum)?;
        rule.entry.counters = counters;
        rule.map = CounterMap::Set;
        self.dirty = true;
        Ok(())
    }

    pub fn read_policy_counters(&self, chain: &str) -> Result<Counters> {
        self.get_policy(chain)?
            .map(|p| p.counters)
            .ok_or_else(|| {
                Error::InvalidArgument(format!("chain '{chain}' is user-defined and has no policy"))
            })
    }

    pub fn zero_policy_counters(&mut self, chain: &str) -> Result<()> {
        let policy = self.chain_mut(chain)?.policy_mut()?;
        policy.map = policy.map.zeroed(policy.counters);
        policy.counters = Counters::ZERO;
        self.dirty = true;
        Ok(())
    }

    pub fn set_policy_counters(&mut self, chain: &str, counters: Counters) -> Result<()> {
        let policy = self.chain_mut(chain)?.policy_mut()?;
        policy.counters = counters;
        policy.map = CounterMap::Set;
        self.dirty = true;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Compilation
    // ═══════════════════════════════════════════════════════════════════════

    /// Serializes the working copy into the kernel's replace format.
    pub fn compile(&self) -> Result<Compiled> {
        // Pass 1: lay out offsets so jumps can be resolved
        let mut starts: HashMap<ChainId, usize> = HashMap::new();
        let mut hook_entry = [0u32; NUM_HOOKS];
        let mut underflow = [0u32; NUM_HOOKS];
        let mut offset = 0usize;
        for chain in &self.chains {
            let rules: usize = chain.rules.iter().map(|r| r.entry.size()).sum();
            match &chain.kind {
                ChainKind::Builtin { hook, .. } => {
                    hook_entry[hook.index()] = offset as u32;
                    offset += rules;
                    underflow[hook.index()] = offset as u32;
                    offset += wire::STANDARD_ENTRY_SIZE;
                }
                ChainKind::User => {
                    offset += wire::ERROR_ENTRY_SIZE;
                    starts.insert(chain.id, offset);
                    offset += rules + wire::STANDARD_ENTRY_SIZE;
                }
            }
        }
        let total = offset + wire::ERROR_ENTRY_SIZE;

        // Pass 2: emit
        let structural = IpHeader::default();
        let mut out = Vec::with_capacity(total);
        let mut plan = Vec::new();
        for chain in &self.chains {
            if !chain.is_builtin() {
                wire::encode_entry(
                    &mut out,
                    &structural,
                    0,
                    Counters::ZERO,
                    &[],
                    &RawTarget::Error(chain.name.clone()),
                )?;
                plan.push((CounterMap::NoMap, Counters::ZERO));
            }

            for rule in &chain.rules {
                let here = out.len();
                let raw = match &rule.entry.target {
                    Target::Verdict(v) => RawTarget::Standard(v.code()),
                    Target::Jump(id) => {
                        let dest = starts.get(id).ok_or_else(|| {
                            Error::NotFound(format!(
                                "jump target of a rule in chain '{}'",
                                chain.name
                            ))
                        })?;
                        RawTarget::Standard(offset_verdict(*dest)?)
                    }
                    Target::Fallthrough => {
                        RawTarget::Standard(offset_verdict(here + rule.entry.size())?)
                    }
                    Target::Extension {
                        name,
                        revision,
                        data,
                    } => RawTarget::Extension {
                        name: name.clone(),
                        revision: *revision,
                        data: data.clone(),
                    },
                };
                wire::encode_entry(
                    &mut out,
                    &rule.entry.ip,
                    rule.entry.nfcache,
                    rule.entry.counters,
                    &rule.entry.matches,
                    &raw,
                )?;
                plan.push((rule.map, rule.entry.counters));
            }

            match &chain.kind {
                ChainKind::Builtin { policy, .. } => {
                    wire::encode_entry(
                        &mut out,
                        &structural,
                        0,
                        policy.counters,
                        &[],
                        &RawTarget::Standard(policy.verdict.code()),
                    )?;
                    plan.push((policy.map, policy.counters));
                }
                ChainKind::User => {
                    wire::encode_entry(
                        &mut out,
                        &structural,
                        0,
                        Counters::ZERO,
                        &[],
                        &RawTarget::Standard(Verdict::Return.code()),
                    )?;
                    plan.push((CounterMap::NoMap, Counters::ZERO));
                }
            }
        }
        wire::encode_entry(
            &mut out,
            &structural,
            0,
            Counters::ZERO,
            &[],
            &RawTarget::Error(wire::ERROR_TARGET.to_string()),
        )?;
        plan.push((CounterMap::NoMap, Counters::ZERO));
        debug_assert_eq!(out.len(), total);

        let size = u32::try_from(out.len())
            .map_err(|_| Error::InvalidArgument("table too large".to_string()))?;
        let header = ReplaceHeader {
            name: self.name.clone(),
            valid_hooks: self.valid_hooks,
            num_entries: plan.len() as u32,
            size,
            hook_entry,
            underflow,
            num_counters: self.baseline_entries,
        };
        Ok(Compiled {
            header,
            entries: out,
            plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{filter_table, logdrop_rule};

    #[test]
    fn test_parse_default_filter() {
        let table = filter_table();
        assert_eq!(
            table.chains().collect::<Vec<_>>(),
            vec!["INPUT", "FORWARD", "OUTPUT"]
        );
        assert!(table.is_builtin("INPUT"));
        assert!(!table.is_dirty());
        assert_eq!(table.baseline_entries(), 4);
    }

    #[test]
    fn test_compile_parse_preserves_structure() {
        let mut table = filter_table();
        table.create_chain("LOGDROP").unwrap();
        table.append_entry("INPUT", &logdrop_rule()).unwrap();
        table.append_entry("LOGDROP", &RuleEntry::new("DROP")).unwrap();
        table.append_entry("LOGDROP", &RuleEntry::new("")).unwrap();

        let snapshot = table.compile().unwrap().snapshot();
        let reparsed = ChainTable::from_snapshot(&snapshot).unwrap();
        assert_eq!(
            reparsed.chains().collect::<Vec<_>>(),
            vec!["INPUT", "FORWARD", "OUTPUT", "LOGDROP"]
        );
        assert_eq!(reparsed.rules("INPUT").unwrap()[0].target, "LOGDROP");
        assert_eq!(reparsed.rules("LOGDROP").unwrap()[1].target, "");
        assert_eq!(reparsed.get_references("LOGDROP").unwrap(), 1);
    }

    #[test]
    fn test_overlong_chain_name_is_invalid_argument() {
        let mut table = filter_table();
        let long = "x".repeat(40);
        assert!(matches!(
            table.append_entry(&long, &RuleEntry::new("ACCEPT")),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.delete_chain(&long),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.flush_entries(&long),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.rename_chain(&long, "short"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(table.rules("nope"), Err(Error::NotFound(_))));
        assert!(!table.is_chain(&long));
        assert!(!table.is_builtin(&long));
    }

    #[test]
    fn test_jump_loop_detection() {
        let mut table = filter_table();
        for name in ["a", "b", "c"] {
            table.create_chain(name).unwrap();
        }
        table.append_entry("INPUT", &RuleEntry::new("a")).unwrap();
        table.append_entry("a", &RuleEntry::new("b")).unwrap();
        table.append_entry("a", &RuleEntry::new("c")).unwrap();
        table.append_entry("b", &RuleEntry::new("c")).unwrap();
        assert!(!table.has_jump_loop());

        table.append_entry("c", &RuleEntry::new("a")).unwrap();
        assert!(table.has_jump_loop());

        table.flush_entries("c").unwrap();
        table.append_entry("c", &RuleEntry::new("c")).unwrap();
        assert!(table.has_jump_loop());
    }

    #[test]
    fn test_hook_offsets() {
        let mut table = filter_table();
        table.append_entry("INPUT", &RuleEntry::new("ACCEPT")).unwrap();
        let compiled = table.compile().unwrap();
        let h = &compiled.header;
        assert_eq!(h.valid_hooks, 0x0e);
        assert_eq!(h.hook_entry[1], 0);
        assert_eq!(h.underflow[1], wire::STANDARD_ENTRY_SIZE as u32);
        assert_eq!(h.hook_entry[2], 2 * wire::STANDARD_ENTRY_SIZE as u32);
        assert_eq!(h.num_entries, 5);
        assert_eq!(h.num_counters, 4);
    }

    #[test]
    fn test_user_chain_without_foot_is_rejected() {
        let mut table = filter_table();
        table.create_chain("X").unwrap();
        let mut snapshot = table.compile().unwrap().snapshot();
        // drop the RETURN foot: head is followed directly by the terminator
        let foot_at = snapshot.entries.len() - wire::ERROR_ENTRY_SIZE - wire::STANDARD_ENTRY_SIZE;
        snapshot
            .entries
            .drain(foot_at..foot_at + wire::STANDARD_ENTRY_SIZE);
        snapshot.info.num_entries -= 1;
        snapshot.info.size -= wire::STANDARD_ENTRY_SIZE as u32;
        assert!(matches!(
            ChainTable::from_snapshot(&snapshot),
            Err(Error::Parse(ParseError::ChainHasNoPolicy { .. }))
        ));
    }

    #[test]
    fn test_missing_terminator_is_rejected() {
        let mut snapshot = filter_table().compile().unwrap().snapshot();
        let len = snapshot.entries.len();
        snapshot.entries.truncate(len - wire::ERROR_ENTRY_SIZE);
        snapshot.info.num_entries -= 1;
        snapshot.info.size -= wire::ERROR_ENTRY_SIZE as u32;
        assert!(matches!(
            ChainTable::from_snapshot(&snapshot),
            Err(Error::Parse(ParseError::NoTrailingErrorTarget))
        ));
    }

    #[test]
    fn test_entry_count_mismatch_is_rejected() {
        let mut snapshot = filter_table().compile().unwrap().snapshot();
        snapshot.info.num_entries += 1;
        assert!(matches!(
            ChainTable::from_snapshot(&snapshot),
            Err(Error::Parse(ParseError::NumEntriesMismatch { .. }))
        ));
    }

    #[test]
    fn test_positions_are_strict() {
        let mut table = filter_table();
        let rule = RuleEntry::new("ACCEPT");
        assert!(matches!(
            table.insert_entry("INPUT", &rule, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.insert_entry("INPUT", &rule, 2),
            Err(Error::InvalidArgument(_))
        ));
        table.insert_entry("INPUT", &rule, 1).unwrap();
        table.insert_entry("INPUT", &RuleEntry::new("DROP"), 1).unwrap();
        assert_eq!(table.rules("INPUT").unwrap()[0].target, "DROP");
        assert!(matches!(
            table.delete_num_entry("INPUT", 3),
            Err(Error::InvalidArgument(_))
        ));
        table.delete_num_entry("INPUT", 1).unwrap();
        assert_eq!(table.rules("INPUT").unwrap()[0].target, "ACCEPT");
    }

    #[test]
    fn test_replace_entry() {
        let mut table = filter_table();
        table.append_entry("INPUT", &RuleEntry::new("ACCEPT")).unwrap();
        table.replace_entry("INPUT", &RuleEntry::new("DROP"), 1).unwrap();
        assert_eq!(table.rules("INPUT").unwrap()[0].target, "DROP");
        assert!(table.replace_entry("INPUT", &RuleEntry::new("DROP"), 2).is_err());
    }

    #[test]
    fn test_jump_to_builtin_is_rejected() {
        let mut table = filter_table();
        assert!(matches!(
            table.append_entry("INPUT", &RuleEntry::new("OUTPUT")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_target_becomes_extension() {
        let mut table = filter_table();
        table.append_entry("INPUT", &RuleEntry::new("LOG")).unwrap();
        assert_eq!(table.rules("INPUT").unwrap()[0].target, "LOG");
    }

    #[test]
    fn test_create_chain_errors() {
        let mut table = filter_table();
        assert!(matches!(
            table.create_chain("ACCEPT"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            table.create_chain("INPUT"),
            Err(Error::AlreadyExists(_))
        ));
        assert!(matches!(
            table.create_chain(&"x".repeat(29)),
            Err(Error::InvalidArgument(_))
        ));
        table.create_chain(&"x".repeat(28)).unwrap();
    }

    #[test]
    fn test_user_chains_are_sorted_on_insert() {
        let mut table = filter_table();
        for name in ["zeta", "alpha", "mid"] {
            table.create_chain(name).unwrap();
        }
        assert_eq!(
            table.chains().skip(3).collect::<Vec<_>>(),
            vec!["alpha", "mid", "zeta"]
        );
        table.rename_chain("alpha", "omega").unwrap();
        assert_eq!(
            table.chains().skip(3).collect::<Vec<_>>(),
            vec!["mid", "omega", "zeta"]
        );
    }

    #[test]
    fn test_rename_keeps_references() {
        let mut table = filter_table();
        table.create_chain("A").unwrap();
        table.append_entry("INPUT", &RuleEntry::new("A")).unwrap();
        table.rename_chain("A", "B").unwrap();
        assert_eq!(table.rules("INPUT").unwrap()[0].target, "B");
        assert_eq!(table.get_references("B").unwrap(), 1);
        assert!(matches!(
            table.rename_chain("INPUT", "C"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.rename_chain("missing", "C"),
            Err(Error::NotFound(_))
        ));
        table.create_chain("C").unwrap();
        assert!(matches!(
            table.rename_chain("B", "C"),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_delete_chain_rules() {
        let mut table = filter_table();
        table.create_chain("A").unwrap();
        table.append_entry("A", &RuleEntry::new("A")).unwrap();
        assert!(matches!(table.delete_chain("A"), Err(Error::InUse(_))));
        table.flush_entries("A").unwrap();
        table.delete_chain("A").unwrap();
        assert!(matches!(table.delete_chain("A"), Err(Error::NotFound(_))));
        assert!(matches!(
            table.delete_chain("INPUT"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_policy_rules() {
        let mut table = filter_table();
        table.create_chain("U").unwrap();
        assert_eq!(table.get_policy("U").unwrap(), None);
        assert!(matches!(
            table.get_policy("missing"),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            table.set_policy("U", "DROP", None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            table.set_policy("INPUT", "RETURN", None),
            Err(Error::InvalidArgument(_))
        ));
        table
            .set_policy("INPUT", "DROP", Some(Counters::new(1, 2)))
            .unwrap();
        assert_eq!(
            table.get_policy("INPUT").unwrap(),
            Some(Policy {
                verdict: Verdict::Drop,
                counters: Counters::new(1, 2)
            })
        );
        table.set_policy("INPUT", "ACCEPT", None).unwrap();
        assert_eq!(table.read_policy_counters("INPUT").unwrap(), Counters::new(1, 2));
        assert!(matches!(
            table.read_policy_counters("U"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_counter_plan() {
        let mut table = filter_table();
        table.set_policy_counters("INPUT", Counters::new(5, 5)).unwrap();
        table.zero_policy_counters("FORWARD").unwrap();
        let compiled = table.compile().unwrap();
        let previous = [
            Counters::new(1, 10),
            Counters::new(2, 20),
            Counters::new(3, 30),
            Counters::ZERO,
        ];
        let after = compiled.counters_after(&previous);
        assert_eq!(after[0], Counters::new(5, 5)); // INPUT policy: set
        assert_eq!(after[1], Counters::new(2, 20)); // FORWARD policy: zeroed at 0
        assert_eq!(after[2], Counters::new(3, 30)); // OUTPUT policy: carried
        assert_eq!(after[3], Counters::ZERO); // terminator
    }

    #[test]
    fn test_check_and_delete_by_content() {
        let mut table = filter_table();
        table.append_entry("INPUT", &RuleEntry::new("ACCEPT")).unwrap();
        table.append_entry("INPUT", &RuleEntry::new("DROP")).unwrap();
        table.append_entry("INPUT", &RuleEntry::new("ACCEPT")).unwrap();
        let mask = MatchMask::exact();
        assert!(table.check_entry("INPUT", &RuleEntry::new("DROP"), &mask).unwrap());
        assert!(!table.check_entry("INPUT", &RuleEntry::new("QUEUE"), &mask).unwrap());
        assert!(table.delete_entry("INPUT", &RuleEntry::new("ACCEPT"), &mask).unwrap());
        let targets: Vec<_> = table
            .rules("INPUT")
            .unwrap()
            .into_iter()
            .map(|r| r.target)
            .collect();
        assert_eq!(targets, vec!["DROP", "ACCEPT"]);
        assert!(!table.delete_entry("INPUT", &RuleEntry::new("QUEUE"), &mask).unwrap());
    }
}

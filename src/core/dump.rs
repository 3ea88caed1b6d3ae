//! Human-readable renderings of a working copy.

use super::error::Result;
use super::rule::Verdict;
use super::table::ChainTable;
use super::wire::{self, RawTarget};
use similar::{ChangeTag, TextDiff};
use std::fmt::Write;

fn hook_line(label: &str, offsets: &[u32], valid_hooks: u32) -> String {
    let mut line = format!("{label}:");
    for (i, offset) in offsets.iter().enumerate() {
        if valid_hooks & (1 << i) != 0 {
            let _ = write!(line, " {offset}");
        } else {
            line.push_str(" -");
        }
    }
    line
}

/// One line per compiled entry: offset, size, counters and target.
///
/// ```text
/// Table `filter'
/// Hooks: - 0 152 304 -
/// Underflows: - 0 152 304 -
/// Entry 0 @0 (152 bytes) [0:0] policy ACCEPT
/// ```
pub fn dump_entries(table: &ChainTable) -> Result<String> {
    let compiled = table.compile()?;
    let entries = wire::parse_entries(&compiled.entries)?;
    let header = &compiled.header;

    let mut out = String::new();
    let _ = writeln!(out, "Table `{}'", header.name);
    let _ = writeln!(out, "{}", hook_line("Hooks", &header.hook_entry, header.valid_hooks));
    let _ = writeln!(
        out,
        "{}",
        hook_line("Underflows", &header.underflow, header.valid_hooks)
    );

    for (i, entry) in entries.iter().enumerate() {
        let target = match &entry.target {
            RawTarget::Standard(code) if *code < 0 => {
                let name = Verdict::from_code(*code).map_or("UNKNOWN", |v| v.as_str());
                let underflow = header
                    .underflow
                    .iter()
                    .enumerate()
                    .any(|(h, off)| header.valid_hooks & (1 << h) != 0 && *off as usize == entry.offset);
                if underflow {
                    format!("policy {name}")
                } else {
                    name.to_string()
                }
            }
            RawTarget::Standard(code) if *code as usize == entry.offset + entry.size => {
                "fallthrough".to_string()
            }
            RawTarget::Standard(code) => format!("jump @{code}"),
            RawTarget::Error(name) if name == wire::ERROR_TARGET => "end".to_string(),
            RawTarget::Error(name) => format!("chain {name}"),
            RawTarget::Extension { name, revision, data } => {
                format!("{name} rev {revision} ({} bytes)", data.len())
            }
        };
        let _ = writeln!(
            out,
            "Entry {i} @{} ({} bytes) {} {target}",
            entry.offset, entry.size, entry.counters
        );
    }
    Ok(out)
}

/// The working copy in `iptables-save` layout.
pub fn save_format(table: &ChainTable) -> Result<String> {
    let mut out = format!("*{}\n", table.name());
    for chain in table.chains() {
        match table.get_policy(chain)? {
            Some(policy) => {
                let _ = writeln!(out, ":{chain} {} {}", policy.verdict, policy.counters);
            }
            None => {
                let _ = writeln!(out, ":{chain} - [0:0]");
            }
        }
    }
    for chain in table.chains() {
        for rule in table.rules(chain)? {
            let body = rule.to_string();
            if body.is_empty() {
                let _ = writeln!(out, "{} -A {chain}", rule.counters);
            } else {
                let _ = writeln!(out, "{} -A {chain} {body}", rule.counters);
            }
        }
    }
    out.push_str("COMMIT\n");
    Ok(out)
}

/// Line diff between two copies in save format, one sign column per line.
pub fn pending_diff(baseline: &ChainTable, working: &ChainTable) -> Result<String> {
    let old = save_format(baseline)?;
    let new = save_format(working)?;
    let diff = TextDiff::from_lines(&old, &new);

    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            ChangeTag::Delete => "- ",
            ChangeTag::Insert => "+ ",
            ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }
    Ok(result)
}

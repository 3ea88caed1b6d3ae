//! Rule representations.
//!
//! [`Entry`] is the kernel-format rule as staged in a chain table: the raw
//! `ipt_ip` header, opaque match bytes and a resolved [`Target`].
//! [`RuleEntry`] is the caller-facing view, with addresses, interfaces and
//! the target name decoded.

use super::codec::{AddressMatch, InterfaceMatch};
use super::counters::Counters;
use super::error::{Error, Result};
use super::table::ChainId;
use super::wire::{self, InvFlags, IpFlags, IpHeader};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumIter, EnumString};

// ═══════════════════════════════════════════════════════════════════════════
// Verdicts and targets
// ═══════════════════════════════════════════════════════════════════════════

/// Built-in verdicts of the standard target.
///
/// On the wire a verdict is stored as `-(NF_verdict) - 1`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    AsRefStr,
)]
pub enum Verdict {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "QUEUE")]
    Queue,
    #[strum(serialize = "RETURN")]
    Return,
}

impl Verdict {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "ACCEPT",
            Self::Drop => "DROP",
            Self::Queue => "QUEUE",
            Self::Return => "RETURN",
        }
    }

    /// Wire encoding of the verdict
    pub const fn code(self) -> i32 {
        match self {
            Self::Drop => -1,   // -NF_DROP - 1
            Self::Accept => -2, // -NF_ACCEPT - 1
            Self::Queue => -4,  // -NF_QUEUE - 1
            Self::Return => -5, // -NF_REPEAT - 1
        }
    }

    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Drop),
            -2 => Some(Self::Accept),
            -4 => Some(Self::Queue),
            -5 => Some(Self::Return),
            _ => None,
        }
    }

    /// Only ACCEPT and DROP may be installed as a chain policy.
    pub const fn is_policy(self) -> bool {
        matches!(self, Self::Accept | Self::Drop)
    }
}

/// Resolved target of a staged rule.
///
/// Jumps refer to chains by [`ChainId`], so renaming a chain never breaks
/// the rules that point at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Verdict(Verdict),
    Jump(ChainId),
    /// Standard target pointing at the next entry: the rule only counts
    Fallthrough,
    Extension {
        name: String,
        revision: u8,
        data: Vec<u8>,
    },
}

/// Opaque extension payload carried through load and commit untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extension {
    /// Raw `xt_entry_match` records, 8-byte aligned
    pub matches: Vec<u8>,
    pub target_revision: u8,
    /// Target payload following the `xt_entry_target` header
    pub target_data: Vec<u8>,
}

/// Layer-4 protocol match; 0 matches any protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolMatch {
    pub number: u16,
    pub negate: bool,
}

impl ProtocolMatch {
    pub const ANY: Self = Self {
        number: 0,
        negate: false,
    };
    pub const ICMP: u16 = 1;
    pub const TCP: u16 = 6;
    pub const UDP: u16 = 17;

    pub const fn new(number: u16, negate: bool) -> Self {
        Self { number, negate }
    }
}

/// Protocol name or number. Negation is not shown.
impl fmt::Display for ProtocolMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number {
            0 => write!(f, "all"),
            Self::ICMP => write!(f, "icmp"),
            Self::TCP => write!(f, "tcp"),
            Self::UDP => write!(f, "udp"),
            n => write!(f, "{n}"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Kernel-format rule
// ═══════════════════════════════════════════════════════════════════════════

/// A rule as staged in the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub ip: IpHeader,
    pub nfcache: u32,
    pub counters: Counters,
    pub matches: Vec<u8>,
    pub target: Target,
}

impl Entry {
    pub fn source(&self) -> AddressMatch {
        AddressMatch::from_octets(
            self.ip.src,
            self.ip.smsk,
            self.ip.invflags.contains(InvFlags::SRCIP),
        )
    }

    pub fn destination(&self) -> AddressMatch {
        AddressMatch::from_octets(
            self.ip.dst,
            self.ip.dmsk,
            self.ip.invflags.contains(InvFlags::DSTIP),
        )
    }

    pub fn in_interface(&self) -> InterfaceMatch {
        InterfaceMatch::decode(&self.ip.iniface, self.ip.invflags.contains(InvFlags::VIA_IN))
    }

    pub fn out_interface(&self) -> InterfaceMatch {
        InterfaceMatch::decode(
            &self.ip.outiface,
            self.ip.invflags.contains(InvFlags::VIA_OUT),
        )
    }

    pub fn protocol(&self) -> ProtocolMatch {
        ProtocolMatch::new(self.ip.proto, self.ip.invflags.contains(InvFlags::PROTO))
    }

    /// `Some(true)` for `-f`, `Some(false)` for `! -f`
    pub fn fragment(&self) -> Option<bool> {
        self.ip
            .flags
            .contains(IpFlags::FRAG)
            .then(|| !self.ip.invflags.contains(InvFlags::FRAG))
    }

    pub fn is_goto(&self) -> bool {
        self.ip.flags.contains(IpFlags::GOTO)
    }

    /// On-wire size of the entry (`next_offset`)
    pub fn size(&self) -> usize {
        let target = match &self.target {
            Target::Extension { data, .. } => wire::xt_align(wire::TARGET_HEADER_SIZE + data.len()),
            _ => wire::STANDARD_TARGET_SIZE,
        };
        wire::ENTRY_SIZE + self.matches.len() + target
    }

    /// Builds the header and payload of a new rule. The target must already
    /// be resolved against the owning table.
    pub fn from_rule(rule: &RuleEntry, target: Target) -> Result<Self> {
        if rule.extension.matches.len() % 8 != 0 {
            return Err(Error::InvalidArgument(format!(
                "match payload of {} bytes is not 8-byte aligned",
                rule.extension.matches.len()
            )));
        }
        if rule.goto && !matches!(target, Target::Jump(_)) {
            return Err(Error::InvalidArgument(format!(
                "goto requires a user-defined chain target, not '{}'",
                rule.target
            )));
        }

        let (iniface, iniface_mask) = rule.in_interface.encode()?;
        let (outiface, outiface_mask) = rule.out_interface.encode()?;

        let mut flags = IpFlags::empty();
        let mut invflags = InvFlags::empty();
        invflags.set(InvFlags::SRCIP, rule.source.negate);
        invflags.set(InvFlags::DSTIP, rule.destination.negate);
        invflags.set(InvFlags::VIA_IN, rule.in_interface.negate);
        invflags.set(InvFlags::VIA_OUT, rule.out_interface.negate);
        invflags.set(InvFlags::PROTO, rule.protocol.negate);
        if let Some(positive) = rule.fragment {
            flags.insert(IpFlags::FRAG);
            invflags.set(InvFlags::FRAG, !positive);
        }
        flags.set(IpFlags::GOTO, rule.goto);

        let ip = IpHeader {
            src: rule.source.network.octets(),
            dst: rule.destination.network.octets(),
            smsk: rule.source.mask.octets(),
            dmsk: rule.destination.mask.octets(),
            iniface,
            outiface,
            iniface_mask,
            outiface_mask,
            proto: rule.protocol.number,
            flags,
            invflags,
        };

        let target = match target {
            Target::Extension {
                name,
                revision,
                mut data,
            } => {
                data.resize(
                    wire::xt_align(wire::TARGET_HEADER_SIZE + data.len()) - wire::TARGET_HEADER_SIZE,
                    0,
                );
                Target::Extension {
                    name,
                    revision,
                    data,
                }
            }
            other => other,
        };

        Ok(Self {
            ip,
            nfcache: 0,
            counters: rule.counters,
            matches: rule.extension.matches.clone(),
            target,
        })
    }

    /// Compares the fields selected by `mask`. Counters never take part.
    pub fn matches_masked(&self, other: &Self, mask: &MatchMask) -> bool {
        let fields = mask.fields;
        let a = &self.ip;
        let b = &other.ip;
        let inv = |flag: InvFlags| a.invflags.contains(flag) == b.invflags.contains(flag);

        if fields.contains(MatchFields::SOURCE)
            && !(a.src == b.src && a.smsk == b.smsk && inv(InvFlags::SRCIP))
        {
            return false;
        }
        if fields.contains(MatchFields::DESTINATION)
            && !(a.dst == b.dst && a.dmsk == b.dmsk && inv(InvFlags::DSTIP))
        {
            return false;
        }
        if fields.contains(MatchFields::IN_INTERFACE)
            && !(a.iniface == b.iniface && a.iniface_mask == b.iniface_mask && inv(InvFlags::VIA_IN))
        {
            return false;
        }
        if fields.contains(MatchFields::OUT_INTERFACE)
            && !(a.outiface == b.outiface
                && a.outiface_mask == b.outiface_mask
                && inv(InvFlags::VIA_OUT))
        {
            return false;
        }
        if fields.contains(MatchFields::PROTOCOL) && !(a.proto == b.proto && inv(InvFlags::PROTO)) {
            return false;
        }
        if fields.contains(MatchFields::FRAGMENT)
            && !(a.flags.contains(IpFlags::FRAG) == b.flags.contains(IpFlags::FRAG)
                && inv(InvFlags::FRAG))
        {
            return false;
        }

        let payload = mask.payload.as_deref();
        if fields.contains(MatchFields::MATCHES)
            && !masked_eq(&self.matches, &other.matches, payload, 0)
        {
            return false;
        }
        if fields.contains(MatchFields::TARGET) {
            if self.is_goto() != other.is_goto() {
                return false;
            }
            let same = match (&self.target, &other.target) {
                (
                    Target::Extension {
                        name: na,
                        revision: ra,
                        data: da,
                    },
                    Target::Extension {
                        name: nb,
                        revision: rb,
                        data: db,
                    },
                ) => na == nb && ra == rb && masked_eq(da, db, payload, self.matches.len()),
                (ta, tb) => ta == tb,
            };
            if !same {
                return false;
            }
        }
        true
    }
}

/// Byte comparison under `mask`, which indexes `matches ++ target_data`
/// starting at `offset`. Bytes past the end of the mask compare exactly.
fn masked_eq(a: &[u8], b: &[u8], mask: Option<&[u8]>, offset: usize) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).enumerate().all(|(i, (x, y))| {
        let m = mask
            .and_then(|mask| mask.get(offset + i).copied())
            .unwrap_or(0xFF);
        x & m == y & m
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Match mask
// ═══════════════════════════════════════════════════════════════════════════

bitflags::bitflags! {
    /// Rule fields compared by check/delete-by-content
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MatchFields: u16 {
        const SOURCE = 1 << 0;
        const DESTINATION = 1 << 1;
        const IN_INTERFACE = 1 << 2;
        const OUT_INTERFACE = 1 << 3;
        const PROTOCOL = 1 << 4;
        const FRAGMENT = 1 << 5;
        const MATCHES = 1 << 6;
        const TARGET = 1 << 7;
    }
}

/// Which parts of a rule must be equal for it to count as "the same rule".
///
/// Header fields are selected whole. The optional `payload` mask is a byte
/// mask over the rule's `matches ++ target_data`; a zero byte ignores that
/// position, positions past its end compare exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchMask {
    pub fields: MatchFields,
    pub payload: Option<Vec<u8>>,
}

impl Default for MatchMask {
    fn default() -> Self {
        Self::exact()
    }
}

impl MatchMask {
    /// Every field, every payload byte
    pub fn exact() -> Self {
        Self {
            fields: MatchFields::all(),
            payload: None,
        }
    }

    pub fn fields(fields: MatchFields) -> Self {
        Self {
            fields,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Caller-facing view
// ═══════════════════════════════════════════════════════════════════════════

/// Decoded rule as seen by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEntry {
    #[serde(default)]
    pub source: AddressMatch,
    #[serde(default)]
    pub destination: AddressMatch,
    #[serde(default)]
    pub in_interface: InterfaceMatch,
    #[serde(default)]
    pub out_interface: InterfaceMatch,
    #[serde(default)]
    pub protocol: ProtocolMatch,
    /// `Some(true)`: fragments only, `Some(false)`: non-fragments only
    #[serde(default)]
    pub fragment: Option<bool>,
    /// Continue in the target chain without returning here
    #[serde(default)]
    pub goto: bool,
    /// Verdict, extension or chain name; `""` for a counting-only rule
    pub target: String,
    #[serde(default)]
    pub counters: Counters,
    #[serde(default)]
    pub extension: Extension,
}

impl RuleEntry {
    /// Rule matching everything and jumping to `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn source(mut self, source: AddressMatch) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn destination(mut self, destination: AddressMatch) -> Self {
        self.destination = destination;
        self
    }

    #[must_use]
    pub fn in_interface(mut self, iface: InterfaceMatch) -> Self {
        self.in_interface = iface;
        self
    }

    #[must_use]
    pub fn out_interface(mut self, iface: InterfaceMatch) -> Self {
        self.out_interface = iface;
        self
    }

    #[must_use]
    pub fn protocol(mut self, protocol: ProtocolMatch) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub fn goto(mut self, goto: bool) -> Self {
        self.goto = goto;
        self
    }

    #[must_use]
    pub fn counters(mut self, counters: Counters) -> Self {
        self.counters = counters;
        self
    }

    #[must_use]
    pub fn extension(mut self, extension: Extension) -> Self {
        self.extension = extension;
        self
    }

    /// View of a staged entry; `target` is the name the owning table
    /// resolved for it.
    pub fn from_entry(entry: &Entry, target: String) -> Self {
        let (target_revision, target_data) = match &entry.target {
            Target::Extension { revision, data, .. } => (*revision, data.clone()),
            _ => (0, Vec::new()),
        };
        Self {
            source: entry.source(),
            destination: entry.destination(),
            in_interface: entry.in_interface(),
            out_interface: entry.out_interface(),
            protocol: entry.protocol(),
            fragment: entry.fragment(),
            goto: entry.is_goto(),
            target,
            counters: entry.counters,
            extension: Extension {
                matches: entry.matches.clone(),
                target_revision,
                target_data,
            },
        }
    }
}

/// iptables-save style rule body, without the `-A chain` prefix
/// `-s value` or `! -s value`, as iptables-save writes it.
fn option(flag: &str, negate: bool, value: &dyn fmt::Display) -> String {
    if negate {
        format!("! {flag} {value}")
    } else {
        format!("{flag} {value}")
    }
}

impl fmt::Display for RuleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if !self.source.is_any() {
            parts.push(option("-s", self.source.negate, &self.source));
        }
        if !self.destination.is_any() {
            parts.push(option("-d", self.destination.negate, &self.destination));
        }
        if !self.in_interface.is_any() {
            parts.push(option("-i", self.in_interface.negate, &self.in_interface));
        }
        if !self.out_interface.is_any() {
            parts.push(option("-o", self.out_interface.negate, &self.out_interface));
        }
        if self.protocol != ProtocolMatch::ANY {
            parts.push(option("-p", self.protocol.negate, &self.protocol));
        }
        match self.fragment {
            Some(true) => parts.push("-f".to_string()),
            Some(false) => parts.push("! -f".to_string()),
            None => {}
        }
        if !self.extension.matches.is_empty() {
            parts.push(format!("<{} bytes of matches>", self.extension.matches.len()));
        }
        if !self.target.is_empty() {
            let flag = if self.goto { "-g" } else { "-j" };
            parts.push(format!("{flag} {}", self.target));
        }
        write!(f, "{}", parts.join(" "))
    }
}

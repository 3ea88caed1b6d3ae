//! Binary layout of the legacy iptables control plane.
//!
//! Mirrors the kernel structs exchanged over `IPT_SO_*` socket options on
//! 64-bit targets: integers in host byte order, addresses and masks in
//! network byte order, every entry aligned to 8 bytes.

use super::counters::Counters;
use super::error::{Error, ParseError, Result};
use sha2::{Digest, Sha256};

// ═══════════════════════════════════════════════════════════════════════════
// Kernel constants
// ═══════════════════════════════════════════════════════════════════════════

pub const IFNAMSIZ: usize = 16;
pub const TABLE_MAXNAMELEN: usize = 32;
pub const EXTENSION_MAXNAMELEN: usize = 29;
pub const FUNCTION_MAXNAMELEN: usize = 30;
pub const NUM_HOOKS: usize = 5;

/// Socket option level for IPv4 (`SOL_IP`)
pub const SOL_IP: i32 = 0;
pub const IPT_SO_SET_REPLACE: i32 = 64;
pub const IPT_SO_SET_ADD_COUNTERS: i32 = 65;
pub const IPT_SO_GET_INFO: i32 = 64;
pub const IPT_SO_GET_ENTRIES: i32 = 65;

/// `sizeof(struct ipt_ip)`
pub const IP_HEADER_SIZE: usize = 84;
/// `sizeof(struct ipt_entry)`
pub const ENTRY_SIZE: usize = 112;
/// `sizeof(struct xt_entry_target)`
pub const TARGET_HEADER_SIZE: usize = 32;
/// `sizeof(struct xt_standard_target)`
pub const STANDARD_TARGET_SIZE: usize = 40;
/// `sizeof(struct xt_error_target)`
pub const ERROR_TARGET_SIZE: usize = 64;
pub const STANDARD_ENTRY_SIZE: usize = ENTRY_SIZE + STANDARD_TARGET_SIZE;
pub const ERROR_ENTRY_SIZE: usize = ENTRY_SIZE + ERROR_TARGET_SIZE;

/// `sizeof(struct ipt_getinfo)`
pub const GETINFO_SIZE: usize = 84;
/// `offsetof(struct ipt_get_entries, entrytable)`
pub const GET_ENTRIES_HEADER_SIZE: usize = 40;
/// `offsetof(struct ipt_replace, entries)`
pub const REPLACE_HEADER_SIZE: usize = 96;
/// `offsetof(struct ipt_replace, counters)`
pub const REPLACE_COUNTERS_PTR_OFFSET: usize = 88;
/// `offsetof(struct xt_counters_info, counters)`
pub const COUNTERS_INFO_HEADER_SIZE: usize = 40;
/// `sizeof(struct xt_counters)`
pub const COUNTERS_SIZE: usize = 16;

/// Target name of standard (verdict/jump/fallthrough) entries
pub const STANDARD_TARGET: &str = "";
/// Target name of chain heads and the table terminator
pub const ERROR_TARGET: &str = "ERROR";

const ENTRY_NFCACHE: usize = 84;
const ENTRY_TARGET_OFFSET: usize = 88;
const ENTRY_NEXT_OFFSET: usize = 90;
const ENTRY_COMEFROM: usize = 92;
const ENTRY_COUNTERS: usize = 96;

/// Round up to the kernel's `XT_ALIGN` (8 bytes on 64-bit)
pub const fn xt_align(size: usize) -> usize {
    (size + 7) & !7
}

bitflags::bitflags! {
    /// `IPT_F_*` bits of `ipt_ip.flags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IpFlags: u8 {
        /// Match fragments only
        const FRAG = 0x01;
        /// `-g`: jump without return
        const GOTO = 0x02;
    }
}

bitflags::bitflags! {
    /// `IPT_INV_*` bits of `ipt_ip.invflags`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InvFlags: u8 {
        const VIA_IN = 0x01;
        const VIA_OUT = 0x02;
        const TOS = 0x04;
        const SRCIP = 0x08;
        const DSTIP = 0x10;
        const FRAG = 0x20;
        const PROTO = 0x40;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Byte helpers
// ═══════════════════════════════════════════════════════════════════════════

fn array_at<const N: usize>(
    bytes: &[u8],
    at: usize,
    what: &'static str,
) -> std::result::Result<[u8; N], ParseError> {
    bytes
        .get(at..at + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ParseError::BufferTooSmall {
            what,
            needed: at + N,
            available: bytes.len(),
        })
}

fn u16_at(bytes: &[u8], at: usize, what: &'static str) -> std::result::Result<u16, ParseError> {
    array_at(bytes, at, what).map(u16::from_ne_bytes)
}

fn u32_at(bytes: &[u8], at: usize, what: &'static str) -> std::result::Result<u32, ParseError> {
    array_at(bytes, at, what).map(u32::from_ne_bytes)
}

fn i32_at(bytes: &[u8], at: usize, what: &'static str) -> std::result::Result<i32, ParseError> {
    array_at(bytes, at, what).map(i32::from_ne_bytes)
}

fn u64_at(bytes: &[u8], at: usize, what: &'static str) -> std::result::Result<u64, ParseError> {
    array_at(bytes, at, what).map(u64::from_ne_bytes)
}

/// Reads a NUL-terminated name out of a fixed-size field.
pub fn read_name(field: &[u8], what: &'static str) -> std::result::Result<String, ParseError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(ParseError::UnterminatedName { what })?;
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| ParseError::InvalidName { what })
}

/// Writes `name` NUL-padded into a fixed-size field; the terminator must fit.
pub fn write_name(field: &mut [u8], name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= field.len() || bytes.contains(&0) {
        return Err(Error::InvalidArgument(format!(
            "name '{name}' does not fit in {} bytes",
            field.len() - 1
        )));
    }
    field.fill(0);
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_ne_bytes());
}

fn put_name(out: &mut Vec<u8>, name: &str, width: usize) -> Result<()> {
    let mut field = vec![0u8; width];
    write_name(&mut field, name)?;
    out.extend_from_slice(&field);
    Ok(())
}

fn put_counters(out: &mut Vec<u8>, counters: Counters) {
    put_u64(out, counters.packets);
    put_u64(out, counters.bytes);
}

fn hooks_at(bytes: &[u8], at: usize, what: &'static str) -> std::result::Result<[u32; NUM_HOOKS], ParseError> {
    let mut hooks = [0u32; NUM_HOOKS];
    for (i, hook) in hooks.iter_mut().enumerate() {
        *hook = u32_at(bytes, at + i * 4, what)?;
    }
    Ok(hooks)
}

// ═══════════════════════════════════════════════════════════════════════════
// Table info (ipt_getinfo)
// ═══════════════════════════════════════════════════════════════════════════

/// Table layout summary returned by `IPT_SO_GET_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableInfo {
    pub name: String,
    pub valid_hooks: u32,
    pub hook_entry: [u32; NUM_HOOKS],
    pub underflow: [u32; NUM_HOOKS],
    pub num_entries: u32,
    pub size: u32,
}

impl TableInfo {
    /// Request buffer for `IPT_SO_GET_INFO`: only the name is filled in.
    pub fn request(name: &str) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; GETINFO_SIZE];
        write_name(&mut buf[..TABLE_MAXNAMELEN], name)?;
        Ok(buf)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(GETINFO_SIZE);
        put_name(&mut out, &self.name, TABLE_MAXNAMELEN)?;
        put_u32(&mut out, self.valid_hooks);
        for hook in self.hook_entry {
            put_u32(&mut out, hook);
        }
        for hook in self.underflow {
            put_u32(&mut out, hook);
        }
        put_u32(&mut out, self.num_entries);
        put_u32(&mut out, self.size);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ParseError> {
        if bytes.len() < GETINFO_SIZE {
            return Err(ParseError::BufferTooSmall {
                what: "ipt_getinfo",
                needed: GETINFO_SIZE,
                available: bytes.len(),
            });
        }
        Ok(Self {
            name: read_name(&bytes[..TABLE_MAXNAMELEN], "table name")?,
            valid_hooks: u32_at(bytes, 32, "ipt_getinfo")?,
            hook_entry: hooks_at(bytes, 36, "ipt_getinfo")?,
            underflow: hooks_at(bytes, 56, "ipt_getinfo")?,
            num_entries: u32_at(bytes, 76, "ipt_getinfo")?,
            size: u32_at(bytes, 80, "ipt_getinfo")?,
        })
    }

    pub fn hook_valid(&self, hook: usize) -> bool {
        hook < NUM_HOOKS && self.valid_hooks & (1 << hook) != 0
    }
}

/// Request buffer for `IPT_SO_GET_ENTRIES`, sized to receive `size` bytes.
pub fn get_entries_request(name: &str, size: u32) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; GET_ENTRIES_HEADER_SIZE + size as usize];
    write_name(&mut buf[..TABLE_MAXNAMELEN], name)?;
    buf[32..36].copy_from_slice(&size.to_ne_bytes());
    Ok(buf)
}

/// A full table as read from the kernel: info header plus the entry blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSnapshot {
    pub info: TableInfo,
    pub entries: Vec<u8>,
}

impl RawSnapshot {
    /// SHA-256 over the table layout with every counter zeroed.
    ///
    /// Two snapshots of an unchanged table compare equal even while traffic
    /// keeps incrementing the counters.
    pub fn fingerprint(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.info.encode()?);
        hasher.update(counterless(&self.entries));
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Copy of `entries` with the counters (and the kernel's `comefrom` scratch
/// field) cleared. Stops at the first malformed entry.
fn counterless(entries: &[u8]) -> Vec<u8> {
    let mut out = entries.to_vec();
    let mut offset = 0;
    while offset + ENTRY_SIZE <= out.len() {
        out[offset + ENTRY_COMEFROM..offset + ENTRY_SIZE].fill(0);
        let Ok(next) = u16_at(&out, offset + ENTRY_NEXT_OFFSET, "ipt_entry") else {
            break;
        };
        if next == 0 {
            break;
        }
        offset += next as usize;
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// Entries (ipt_entry)
// ═══════════════════════════════════════════════════════════════════════════

/// `struct ipt_ip`: the fixed header match of every entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IpHeader {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub smsk: [u8; 4],
    pub dmsk: [u8; 4],
    pub iniface: [u8; IFNAMSIZ],
    pub outiface: [u8; IFNAMSIZ],
    pub iniface_mask: [u8; IFNAMSIZ],
    pub outiface_mask: [u8; IFNAMSIZ],
    pub proto: u16,
    pub flags: IpFlags,
    pub invflags: InvFlags,
}

impl IpHeader {
    fn decode(bytes: &[u8], offset: usize) -> std::result::Result<Self, ParseError> {
        let what = "ipt_ip";
        let flags = bytes.get(offset + 82).copied().unwrap_or_default();
        let invflags = bytes.get(offset + 83).copied().unwrap_or_default();
        Ok(Self {
            src: array_at(bytes, offset, what)?,
            dst: array_at(bytes, offset + 4, what)?,
            smsk: array_at(bytes, offset + 8, what)?,
            dmsk: array_at(bytes, offset + 12, what)?,
            iniface: array_at(bytes, offset + 16, what)?,
            outiface: array_at(bytes, offset + 32, what)?,
            iniface_mask: array_at(bytes, offset + 48, what)?,
            outiface_mask: array_at(bytes, offset + 64, what)?,
            proto: u16_at(bytes, offset + 80, what)?,
            flags: IpFlags::from_bits(flags)
                .ok_or(ParseError::InvalidFlags { offset, flags })?,
            invflags: InvFlags::from_bits(invflags).ok_or(ParseError::InvalidInverseFlags {
                offset,
                flags: invflags,
            })?,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.src);
        out.extend_from_slice(&self.dst);
        out.extend_from_slice(&self.smsk);
        out.extend_from_slice(&self.dmsk);
        out.extend_from_slice(&self.iniface);
        out.extend_from_slice(&self.outiface);
        out.extend_from_slice(&self.iniface_mask);
        out.extend_from_slice(&self.outiface_mask);
        put_u16(out, self.proto);
        out.push(self.flags.bits());
        out.push(self.invflags.bits());
    }
}

/// Target of an entry as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawTarget {
    /// Negative verdict code, or a byte offset into the entry blob
    Standard(i32),
    /// Chain head (or table terminator) carrying a name
    Error(String),
    /// Any other target: payload is carried opaque, padding included
    Extension {
        name: String,
        revision: u8,
        data: Vec<u8>,
    },
}

impl RawTarget {
    pub fn size(&self) -> usize {
        match self {
            Self::Standard(_) => STANDARD_TARGET_SIZE,
            Self::Error(_) => ERROR_TARGET_SIZE,
            Self::Extension { data, .. } => xt_align(TARGET_HEADER_SIZE + data.len()),
        }
    }
}

/// One decoded `ipt_entry` plus its matches and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    /// Byte offset from the start of the entry blob
    pub offset: usize,
    /// `next_offset`: total size of the entry
    pub size: usize,
    pub ip: IpHeader,
    pub nfcache: u32,
    pub comefrom: u32,
    pub counters: Counters,
    /// Raw `xt_entry_match` records between the header and the target
    pub matches: Vec<u8>,
    pub target: RawTarget,
}

impl RawEntry {
    pub fn is_error(&self) -> bool {
        matches!(self.target, RawTarget::Error(_))
    }
}

/// Walks an entry blob into decoded entries, validating every offset.
pub fn parse_entries(bytes: &[u8]) -> std::result::Result<Vec<RawEntry>, ParseError> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        if bytes.len() - offset < ENTRY_SIZE {
            return Err(ParseError::BufferTooSmall {
                what: "ipt_entry",
                needed: offset + ENTRY_SIZE,
                available: bytes.len(),
            });
        }

        let ip = IpHeader::decode(bytes, offset)?;
        let nfcache = u32_at(bytes, offset + ENTRY_NFCACHE, "ipt_entry")?;
        let target_offset = u16_at(bytes, offset + ENTRY_TARGET_OFFSET, "ipt_entry")? as usize;
        let next_offset = u16_at(bytes, offset + ENTRY_NEXT_OFFSET, "ipt_entry")? as usize;
        let comefrom = u32_at(bytes, offset + ENTRY_COMEFROM, "ipt_entry")?;
        let counters = Counters::new(
            u64_at(bytes, offset + ENTRY_COUNTERS, "ipt_entry")?,
            u64_at(bytes, offset + ENTRY_COUNTERS + 8, "ipt_entry")?,
        );

        if target_offset < ENTRY_SIZE {
            return Err(ParseError::TargetOffsetTooSmall {
                offset,
                target_offset,
            });
        }
        if next_offset < target_offset + TARGET_HEADER_SIZE
            || next_offset % 8 != 0
            || offset + next_offset > bytes.len()
        {
            return Err(ParseError::InvalidNextOffset {
                offset,
                next_offset,
            });
        }

        let target_at = offset + target_offset;
        let target_size = u16_at(bytes, target_at, "xt_entry_target")? as usize;
        if target_size < TARGET_HEADER_SIZE || target_offset + target_size > next_offset {
            return Err(ParseError::InvalidTargetSize {
                offset,
                size: target_size,
            });
        }
        let name = read_name(
            &bytes[target_at + 2..target_at + 2 + EXTENSION_MAXNAMELEN],
            "target name",
        )?;
        let revision = bytes[target_at + TARGET_HEADER_SIZE - 1];
        let data = &bytes[target_at + TARGET_HEADER_SIZE..target_at + target_size];

        let target = match name.as_str() {
            STANDARD_TARGET => {
                if target_size != STANDARD_TARGET_SIZE {
                    return Err(ParseError::InvalidTargetSize {
                        offset,
                        size: target_size,
                    });
                }
                RawTarget::Standard(i32_at(data, 0, "xt_standard_target")?)
            }
            ERROR_TARGET => {
                if target_size != ERROR_TARGET_SIZE {
                    return Err(ParseError::InvalidTargetSize {
                        offset,
                        size: target_size,
                    });
                }
                RawTarget::Error(read_name(&data[..FUNCTION_MAXNAMELEN], "error name")?)
            }
            _ => RawTarget::Extension {
                name,
                revision,
                data: data.to_vec(),
            },
        };

        entries.push(RawEntry {
            offset,
            size: next_offset,
            ip,
            nfcache,
            comefrom,
            counters,
            matches: bytes[offset + ENTRY_SIZE..target_at].to_vec(),
            target,
        });
        offset += next_offset;
    }

    Ok(entries)
}

/// Appends one entry to `out`. Returns the entry size (`next_offset`).
pub fn encode_entry(
    out: &mut Vec<u8>,
    ip: &IpHeader,
    nfcache: u32,
    counters: Counters,
    matches: &[u8],
    target: &RawTarget,
) -> Result<usize> {
    if matches.len() % 8 != 0 {
        return Err(Error::InvalidArgument(format!(
            "match payload of {} bytes is not 8-byte aligned",
            matches.len()
        )));
    }
    let target_offset = ENTRY_SIZE + matches.len();
    let target_size = target.size();
    let next_offset = target_offset + target_size;
    let target_offset_u16 = u16::try_from(target_offset)
        .map_err(|_| Error::InvalidArgument("entry matches are too large".to_string()))?;
    let next_offset_u16 = u16::try_from(next_offset)
        .map_err(|_| Error::InvalidArgument("entry is too large".to_string()))?;

    ip.encode(out);
    put_u32(out, nfcache);
    put_u16(out, target_offset_u16);
    put_u16(out, next_offset_u16);
    put_u32(out, 0); // comefrom is kernel scratch space
    put_counters(out, counters);
    out.extend_from_slice(matches);

    put_u16(out, target_size as u16);
    match target {
        RawTarget::Standard(verdict) => {
            put_name(out, STANDARD_TARGET, EXTENSION_MAXNAMELEN)?;
            out.push(0);
            out.extend_from_slice(&verdict.to_ne_bytes());
            out.extend_from_slice(&[0u8; 4]);
        }
        RawTarget::Error(name) => {
            put_name(out, ERROR_TARGET, EXTENSION_MAXNAMELEN)?;
            out.push(0);
            put_name(out, name, FUNCTION_MAXNAMELEN)?;
            out.extend_from_slice(&[0u8; 2]);
        }
        RawTarget::Extension {
            name,
            revision,
            data,
        } => {
            put_name(out, name, EXTENSION_MAXNAMELEN)?;
            out.push(*revision);
            out.extend_from_slice(data);
            out.resize(out.len() + target_size - TARGET_HEADER_SIZE - data.len(), 0);
        }
    }
    Ok(next_offset)
}

// ═══════════════════════════════════════════════════════════════════════════
// Replace and counters (ipt_replace, xt_counters_info)
// ═══════════════════════════════════════════════════════════════════════════

/// Header of an `ipt_replace` request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplaceHeader {
    pub name: String,
    pub valid_hooks: u32,
    pub num_entries: u32,
    pub size: u32,
    pub hook_entry: [u32; NUM_HOOKS],
    pub underflow: [u32; NUM_HOOKS],
    /// Entry count of the table being replaced
    pub num_counters: u32,
}

impl ReplaceHeader {
    /// Full `ipt_replace` blob. The counters pointer is left null; the
    /// socket exchange patches it in at [`REPLACE_COUNTERS_PTR_OFFSET`].
    pub fn encode(&self, entries: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(REPLACE_HEADER_SIZE + entries.len());
        put_name(&mut out, &self.name, TABLE_MAXNAMELEN)?;
        put_u32(&mut out, self.valid_hooks);
        put_u32(&mut out, self.num_entries);
        put_u32(&mut out, self.size);
        for hook in self.hook_entry {
            put_u32(&mut out, hook);
        }
        for hook in self.underflow {
            put_u32(&mut out, hook);
        }
        put_u32(&mut out, self.num_counters);
        put_u64(&mut out, 0);
        out.extend_from_slice(entries);
        Ok(out)
    }

    /// Splits an `ipt_replace` blob into header and entry bytes.
    pub fn decode(blob: &[u8]) -> std::result::Result<(Self, &[u8]), ParseError> {
        if blob.len() < REPLACE_HEADER_SIZE {
            return Err(ParseError::BufferTooSmall {
                what: "ipt_replace",
                needed: REPLACE_HEADER_SIZE,
                available: blob.len(),
            });
        }
        let header = Self {
            name: read_name(&blob[..TABLE_MAXNAMELEN], "table name")?,
            valid_hooks: u32_at(blob, 32, "ipt_replace")?,
            num_entries: u32_at(blob, 36, "ipt_replace")?,
            size: u32_at(blob, 40, "ipt_replace")?,
            hook_entry: hooks_at(blob, 44, "ipt_replace")?,
            underflow: hooks_at(blob, 64, "ipt_replace")?,
            num_counters: u32_at(blob, 84, "ipt_replace")?,
        };
        let entries = &blob[REPLACE_HEADER_SIZE..];
        if entries.len() != header.size as usize {
            return Err(ParseError::SizeMismatch {
                specified: header.size as usize,
                actual: entries.len(),
            });
        }
        Ok((header, entries))
    }
}

/// Decodes a packed `struct xt_counters` array.
pub fn decode_counters(bytes: &[u8]) -> std::result::Result<Vec<Counters>, ParseError> {
    if bytes.len() % COUNTERS_SIZE != 0 {
        return Err(ParseError::SizeMismatch {
            specified: bytes.len() / COUNTERS_SIZE * COUNTERS_SIZE,
            actual: bytes.len(),
        });
    }
    bytes
        .chunks_exact(COUNTERS_SIZE)
        .map(|chunk| {
            Ok(Counters::new(
                u64_at(chunk, 0, "xt_counters")?,
                u64_at(chunk, 8, "xt_counters")?,
            ))
        })
        .collect()
}

/// `xt_counters_info` blob for `IPT_SO_SET_ADD_COUNTERS`.
pub fn encode_counters_info(name: &str, counters: &[Counters]) -> Result<Vec<u8>> {
    let count = u32::try_from(counters.len())
        .map_err(|_| Error::InvalidArgument("too many counters".to_string()))?;
    let mut out = Vec::with_capacity(COUNTERS_INFO_HEADER_SIZE + counters.len() * COUNTERS_SIZE);
    put_name(&mut out, name, TABLE_MAXNAMELEN)?;
    put_u32(&mut out, count);
    put_u32(&mut out, 0);
    for c in counters {
        put_counters(&mut out, *c);
    }
    Ok(out)
}

/// Splits an `xt_counters_info` blob into table name and counters.
pub fn decode_counters_info(
    blob: &[u8],
) -> std::result::Result<(String, Vec<Counters>), ParseError> {
    if blob.len() < COUNTERS_INFO_HEADER_SIZE {
        return Err(ParseError::BufferTooSmall {
            what: "xt_counters_info",
            needed: COUNTERS_INFO_HEADER_SIZE,
            available: blob.len(),
        });
    }
    let name = read_name(&blob[..TABLE_MAXNAMELEN], "table name")?;
    let count = u32_at(blob, 32, "xt_counters_info")? as usize;
    let counters = decode_counters(&blob[COUNTERS_INFO_HEADER_SIZE..])?;
    if counters.len() != count {
        return Err(ParseError::NumEntriesMismatch {
            specified: count,
            found: counters.len(),
        });
    }
    Ok((name, counters))
}

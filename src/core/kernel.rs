//! Kernel exchange: the only place that talks to the packet filter.
//!
//! Everything above this trait works on byte blobs and plain values, so the
//! staging logic runs unprivileged against [`super::memory::MemoryKernel`].

use super::counters::Counters;
use super::error::{Error, ExchangeError, ExchangeOp, Result};
use super::wire::{self, RawSnapshot, ReplaceHeader, TableInfo};
use nix::errno::Errno;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::{debug, warn};

/// How many times a read is retried when the table changes under it
const LOAD_ATTEMPTS: usize = 3;

/// Result of a table replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// The kernel swapped the table in and returned the counters the old
    /// table held, one per old entry.
    Replaced { previous: Vec<Counters> },
    /// The table no longer has the entry count the request was built
    /// against (`EAGAIN`).
    Conflict,
}

/// Narrow interface to the kernel's rule-table control plane.
pub trait KernelExchange {
    /// Reads the full table: `IPT_SO_GET_INFO` then `IPT_SO_GET_ENTRIES`.
    fn load_table(&self, table: &str) -> Result<RawSnapshot>;

    /// Atomically replaces a table with an `ipt_replace` blob.
    fn replace_table(&self, blob: &[u8]) -> Result<ReplaceOutcome>;

    /// Adds an `xt_counters_info` blob to the live table's counters.
    fn add_counters(&self, blob: &[u8]) -> Result<()>;
}

impl<K: KernelExchange + ?Sized> KernelExchange for &K {
    fn load_table(&self, table: &str) -> Result<RawSnapshot> {
        (**self).load_table(table)
    }

    fn replace_table(&self, blob: &[u8]) -> Result<ReplaceOutcome> {
        (**self).replace_table(blob)
    }

    fn add_counters(&self, blob: &[u8]) -> Result<()> {
        (**self).add_counters(blob)
    }
}

/// Maps a raw sockopt return value onto its documented contract.
///
/// # Panics
///
/// Panics on any value other than `0` or `-1`.
fn check(ret: libc::c_int, op: ExchangeOp) -> std::result::Result<(), ExchangeError> {
    match ret {
        0 => Ok(()),
        -1 => Err(ExchangeError::last(op)),
        other => panic!("{op} returned {other}, outside its documented contract"),
    }
}

/// Exchange over a raw IPv4 socket using the iptables socket options.
#[derive(Debug)]
pub struct SocketKernel {
    fd: OwnedFd,
}

impl SocketKernel {
    /// Opens the raw socket. Needs `CAP_NET_RAW`/`CAP_NET_ADMIN`.
    pub fn new() -> Result<Self> {
        // SAFETY: plain socket(2) call; ownership of the descriptor moves into OwnedFd
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::IPPROTO_RAW) };
        if fd < 0 {
            return Err(ExchangeError::last(ExchangeOp::Socket).into());
        }
        // SAFETY: fd was just returned by socket(2) and is owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        debug!(fd = fd.as_raw_fd(), "Opened iptables control socket");
        Ok(Self { fd })
    }

    fn getsockopt(&self, option: i32, buf: &mut [u8], op: ExchangeOp) -> Result<()> {
        let mut len = libc::socklen_t::try_from(buf.len())
            .map_err(|_| Error::InvalidArgument(format!("{op} buffer too large")))?;
        // SAFETY: buf is valid for len bytes for the duration of the call
        let ret = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                wire::SOL_IP,
                option,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                &raw mut len,
            )
        };
        check(ret, op)?;
        Ok(())
    }

    fn setsockopt(&self, option: i32, buf: &[u8], op: ExchangeOp) -> std::result::Result<(), ExchangeError> {
        let len = libc::socklen_t::try_from(buf.len())
            .map_err(|_| ExchangeError::new(op, Errno::E2BIG))?;
        // SAFETY: buf is valid for len bytes for the duration of the call
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                wire::SOL_IP,
                option,
                buf.as_ptr().cast::<libc::c_void>(),
                len,
            )
        };
        check(ret, op)
    }

    fn load_once(&self, table: &str) -> Result<RawSnapshot> {
        let mut info = TableInfo::request(table)?;
        self.getsockopt(wire::IPT_SO_GET_INFO, &mut info, ExchangeOp::GetInfo)?;
        let info = TableInfo::decode(&info)?;

        let mut request = wire::get_entries_request(table, info.size)?;
        self.getsockopt(wire::IPT_SO_GET_ENTRIES, &mut request, ExchangeOp::GetEntries)?;
        let entries = request.split_off(wire::GET_ENTRIES_HEADER_SIZE);
        Ok(RawSnapshot { info, entries })
    }
}

impl KernelExchange for SocketKernel {
    fn load_table(&self, table: &str) -> Result<RawSnapshot> {
        let mut attempt = 1;
        loop {
            match self.load_once(table) {
                // size changed between GET_INFO and GET_ENTRIES
                Err(Error::System {
                    op: ExchangeOp::GetEntries,
                    errno: Errno::EAGAIN,
                    ..
                }) if attempt < LOAD_ATTEMPTS => {
                    debug!(table, attempt, "Table changed while loading, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn replace_table(&self, blob: &[u8]) -> Result<ReplaceOutcome> {
        let (header, _) = ReplaceHeader::decode(blob)?;
        let mut counters = vec![0u8; header.num_counters as usize * wire::COUNTERS_SIZE];
        let mut request = blob.to_vec();
        let ptr = counters.as_mut_ptr() as u64;
        request[wire::REPLACE_COUNTERS_PTR_OFFSET..wire::REPLACE_HEADER_SIZE]
            .copy_from_slice(&ptr.to_ne_bytes());

        match self.setsockopt(wire::IPT_SO_SET_REPLACE, &request, ExchangeOp::Replace) {
            Ok(()) => Ok(ReplaceOutcome::Replaced {
                previous: wire::decode_counters(&counters)?,
            }),
            Err(ExchangeError {
                errno: Errno::EAGAIN,
                ..
            }) => {
                warn!(table = %header.name, "Kernel refused replace: table changed since load");
                Ok(ReplaceOutcome::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn add_counters(&self, blob: &[u8]) -> Result<()> {
        self.setsockopt(wire::IPT_SO_SET_ADD_COUNTERS, blob, ExchangeOp::AddCounters)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_contract() {
        assert!(check(0, ExchangeOp::Replace).is_ok());
        assert_eq!(check(-1, ExchangeOp::Replace).unwrap_err().op, ExchangeOp::Replace);
    }

    #[test]
    #[should_panic(expected = "outside its documented contract")]
    fn test_check_panics_on_unexpected_return() {
        let _ = check(7, ExchangeOp::GetInfo);
    }
}

//! Address and interface codecs for the fixed `ipt_ip` header fields.

use super::error::{Error, Result};
use super::wire::IFNAMSIZ;
use crate::validators;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Longest usable interface name (one byte is the terminator)
pub const MAX_IFACE_LEN: usize = IFNAMSIZ - 1;

/// Source or destination address match: `network/mask`, optionally negated.
///
/// `network & mask == network` is not enforced; the kernel masks the packet
/// address before comparing, so host bits in `network` are carried as loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressMatch {
    pub network: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub negate: bool,
}

impl Default for AddressMatch {
    fn default() -> Self {
        Self::ANY
    }
}

impl AddressMatch {
    /// `0.0.0.0/0`: matches every address
    pub const ANY: Self = Self {
        network: Ipv4Addr::UNSPECIFIED,
        mask: Ipv4Addr::UNSPECIFIED,
        negate: false,
    };

    pub const fn new(network: Ipv4Addr, mask: Ipv4Addr, negate: bool) -> Self {
        Self {
            network,
            mask,
            negate,
        }
    }

    /// Decodes `in_addr.s_addr`-style values: network-order bytes read as
    /// a native integer.
    pub fn from_packed(addr: u32, mask: u32, negate: bool) -> Self {
        Self::from_octets(addr.to_ne_bytes(), mask.to_ne_bytes(), negate)
    }

    /// Inverse of [`AddressMatch::from_packed`].
    pub fn to_packed(&self) -> (u32, u32) {
        (
            u32::from_ne_bytes(self.network.octets()),
            u32::from_ne_bytes(self.mask.octets()),
        )
    }

    pub fn from_octets(addr: [u8; 4], mask: [u8; 4], negate: bool) -> Self {
        Self::new(Ipv4Addr::from(addr), Ipv4Addr::from(mask), negate)
    }

    pub fn is_any(&self) -> bool {
        self.mask.is_unspecified() && !self.negate
    }

    /// CIDR form, when the mask is a contiguous prefix.
    pub fn to_network(&self) -> Option<Ipv4Network> {
        Ipv4Network::with_netmask(self.network, self.mask).ok()
    }

    #[must_use]
    pub fn negated(mut self, negate: bool) -> Self {
        self.negate = negate;
        self
    }
}

impl From<Ipv4Network> for AddressMatch {
    fn from(net: Ipv4Network) -> Self {
        Self::new(net.network(), net.mask(), false)
    }
}

/// `addr/prefix`, or `addr/mask` for non-contiguous masks. Negation belongs
/// to the option, so it is not shown here.
impl fmt::Display for AddressMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_network() {
            Some(net) => write!(f, "{}/{}", self.network, net.prefix()),
            None => write!(f, "{}/{}", self.network, self.mask),
        }
    }
}

/// Input or output interface match.
///
/// An empty name is a wildcard. A trailing `+` matches every interface
/// whose name starts with the part before it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceMatch {
    pub name: String,
    pub negate: bool,
}

impl InterfaceMatch {
    /// Builds a match after checking the name against the kernel's rules.
    pub fn new(name: impl Into<String>, negate: bool) -> Result<Self> {
        let name = name.into();
        validators::validate_interface(&name)
            .map_err(|e| Error::InvalidArgument(format!("{e}: '{name}'")))?;
        Ok(Self { name, negate })
    }

    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.name.is_empty() && !self.negate
    }

    pub fn is_prefix(&self) -> bool {
        self.name.ends_with('+')
    }

    /// Decodes a NUL-padded name buffer. The mask is not needed to recover
    /// the name: a prefix match keeps its `+` in the name buffer.
    pub fn decode(name: &[u8; IFNAMSIZ], negate: bool) -> Self {
        let end = name.iter().position(|&b| b == 0).unwrap_or(IFNAMSIZ);
        Self {
            name: String::from_utf8_lossy(&name[..end]).into_owned(),
            negate,
        }
    }

    /// Encodes into the kernel's `(name, mask)` buffer pair.
    pub fn encode(&self) -> Result<([u8; IFNAMSIZ], [u8; IFNAMSIZ])> {
        let bytes = self.name.as_bytes();
        if bytes.len() > MAX_IFACE_LEN {
            return Err(Error::InvalidArgument(format!(
                "interface name '{}' exceeds {MAX_IFACE_LEN} bytes",
                self.name
            )));
        }

        let mut name = [0u8; IFNAMSIZ];
        let mut mask = [0u8; IFNAMSIZ];
        if bytes.is_empty() {
            return Ok((name, mask));
        }

        name[..bytes.len()].copy_from_slice(bytes);
        let significant = if self.is_prefix() {
            bytes.len() - 1
        } else {
            // exact match also compares the terminator
            bytes.len() + 1
        };
        mask[..significant].fill(0xFF);
        Ok((name, mask))
    }
}

/// Interface name, `*` for any. Negation is not shown.
impl fmt::Display for InterfaceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packed_address_reads_memory_order() {
        // 10.0.0.1 as it sits in a network-order in_addr
        let packed = u32::from_ne_bytes([10, 0, 0, 1]);
        let mask = u32::from_ne_bytes([255, 255, 255, 0]);
        let m = AddressMatch::from_packed(packed, mask, false);
        assert_eq!(m.network, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(m.mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(m.to_packed(), (packed, mask));
    }

    #[test]
    fn test_address_display() {
        let m = AddressMatch::from("10.0.0.0/8".parse::<Ipv4Network>().unwrap());
        assert_eq!(m.to_string(), "10.0.0.0/8");
        assert_eq!(m.negated(true).to_string(), "10.0.0.0/8");
        assert_eq!(AddressMatch::ANY.to_string(), "0.0.0.0/0");

        let odd = AddressMatch::new(
            Ipv4Addr::new(10, 0, 1, 0),
            Ipv4Addr::new(255, 0, 255, 0),
            false,
        );
        assert!(odd.to_network().is_none());
        assert_eq!(odd.to_string(), "10.0.1.0/255.0.255.0");
    }

    #[test]
    fn test_host_bits_are_kept() {
        let m = AddressMatch::new(
            Ipv4Addr::new(192, 168, 1, 77),
            Ipv4Addr::new(255, 255, 255, 0),
            false,
        );
        assert_eq!(m.network, Ipv4Addr::new(192, 168, 1, 77));
    }

    #[test]
    fn test_interface_exact_mask_covers_terminator() {
        let (name, mask) = InterfaceMatch::new("eth0", false).unwrap().encode().unwrap();
        assert_eq!(&name[..5], b"eth0\0");
        assert_eq!(&mask[..5], &[0xFF; 5]);
        assert!(mask[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_interface_prefix_mask_excludes_plus() {
        let iface = InterfaceMatch::new("eth+", true).unwrap();
        let (name, mask) = iface.encode().unwrap();
        assert_eq!(&name[..4], b"eth+");
        assert_eq!(&mask[..3], &[0xFF; 3]);
        assert!(mask[3..].iter().all(|&b| b == 0));
        assert_eq!(InterfaceMatch::decode(&name, true), iface);
    }

    #[test]
    fn test_interface_wildcard() {
        let (name, mask) = InterfaceMatch::any().encode().unwrap();
        assert_eq!(name, [0u8; IFNAMSIZ]);
        assert_eq!(mask, [0u8; IFNAMSIZ]);
        assert_eq!(InterfaceMatch::any().to_string(), "*");
    }

    #[test]
    fn test_interface_length_limit() {
        assert!(InterfaceMatch::new("a".repeat(15), false).is_ok());
        assert!(InterfaceMatch::new("a".repeat(16), false).is_err());
        let overlong = InterfaceMatch {
            name: "a".repeat(16),
            negate: false,
        };
        assert!(overlong.encode().is_err());
    }

    #[test]
    fn test_decode_full_width_name() {
        let raw = [b'x'; IFNAMSIZ];
        assert_eq!(InterfaceMatch::decode(&raw, false).name.len(), IFNAMSIZ);
    }
}

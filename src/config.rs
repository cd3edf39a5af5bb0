//! 4.I Interface-configuration engine.
//!
//! Validates and applies IPv4/IPv6 configuration requested on the command
//! line or via an interface ioctl. Grounded directly in `options.c`'s
//! `parse_opt`/`parse_hook_add_interface` (the parse-time half) and
//! `iioctl-ops.c`'s `configure_device` (the apply/reconfigure half).

use smoltcp::wire::{IpCidr, Ipv4Address, Ipv6Address};

use crate::iface::{prefix_len_of, Registry, SENTINEL_V4};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    DiscontiguousMask,
    GatewayMaskMismatch,
    BroadcastMismatch,
    MulticastAddress,
}

/// One `--interface` block accumulated by the parser, per spec.md §3's
/// "Parse hook" / "per-interface configuration record".
#[derive(Debug, Clone)]
pub struct ParseInterface {
    pub name: String,
    pub addr: Ipv4Address,
    pub mask: Ipv4Address,
    pub gateway: Ipv4Address,
    pub broadcast: Ipv4Address,
    pub addr6: Vec<Ipv6Address>,
}

impl ParseInterface {
    pub fn new(name: String) -> ParseInterface {
        ParseInterface {
            name,
            addr: SENTINEL_V4,
            mask: SENTINEL_V4,
            gateway: SENTINEL_V4,
            broadcast: SENTINEL_V4,
            addr6: Vec::new(),
        }
    }
}

/// Transient structure used during option parsing (spec.md §3: "Parse
/// hook"). Freed once `apply_all` has consumed it.
#[derive(Debug, Default)]
pub struct ParseHook {
    pub interfaces: Vec<ParseInterface>,
    cursor: Option<usize>,
}

impl ParseHook {
    pub fn new() -> ParseHook {
        ParseHook { interfaces: Vec::new(), cursor: None }
    }

    /// `-i/--interface`: starts a new current-interface record, or
    /// re-selects an existing one with the same name (bare `-i eth0` named
    /// twice updates the same record, matching `parse_hook_add_interface`).
    pub fn select_interface(&mut self, name: &str) {
        if let Some(idx) = self.interfaces.iter().position(|i| i.name == name) {
            self.cursor = Some(idx);
            return;
        }
        self.interfaces.push(ParseInterface::new(name.to_string()));
        self.cursor = Some(self.interfaces.len() - 1);
    }

    fn current(&mut self) -> &mut ParseInterface {
        let idx = self.cursor.expect("an --interface must precede -a/-m/-g/-p/-A");
        &mut self.interfaces[idx]
    }

    /// `-a, --address` with no argument: `options.c`'s bare `-a` resets to
    /// 0.0.0.0/255.0.0.0 with no gateway, rather than leaving the slot
    /// untouched.
    pub fn set_address_default(&mut self) {
        let iface = self.current();
        iface.addr = Ipv4Address::new(0, 0, 0, 0);
        iface.mask = Ipv4Address::new(255, 0, 0, 0);
        iface.gateway = SENTINEL_V4;
    }

    pub fn set_address(&mut self, addr: Ipv4Address) -> Result<(), ConfigError> {
        if addr.is_multicast() {
            return Err(ConfigError::MulticastAddress);
        }
        self.current().addr = addr;
        Ok(())
    }

    pub fn set_netmask(&mut self, mask: Ipv4Address) {
        self.current().mask = mask;
    }

    pub fn set_gateway(&mut self, gw: Ipv4Address) {
        self.current().gateway = gw;
    }

    /// `-p, --peer`: point-to-point destination, stored in the broadcast
    /// slot the way a peer address occupies `ifr_dstaddr`'s union member in
    /// `options.c` (supplemented from `original_source`; the distilled spec
    /// only lists the flag's existence in §6).
    pub fn set_peer(&mut self, peer: Ipv4Address) {
        self.current().broadcast = peer;
    }

    pub fn add_address6(&mut self, addr: Ipv6Address) {
        self.current().addr6.push(addr);
    }
}

/// Left-contiguous-ones check: `options.c`'s mask validation, generalized
/// from the hand-rolled bit loop into a single `leading_ones`/`count_ones`
/// comparison.
pub fn is_contiguous_mask(mask: Ipv4Address) -> bool {
    let bits = u32::from_be_bytes(mask.0);
    let ones = bits.count_ones();
    let shifted = if ones == 0 { 0 } else { u32::MAX << (32 - ones) };
    bits == shifted
}

fn is_sentinel(addr: Ipv4Address) -> bool {
    addr == SENTINEL_V4
}

fn broadcast_of(addr: Ipv4Address, mask: Ipv4Address) -> Ipv4Address {
    let a = u32::from_be_bytes(addr.0);
    let m = u32::from_be_bytes(mask.0);
    Ipv4Address::from_bytes(&(a | !m).to_be_bytes())
}

/// Validation rules from spec.md §4.I, checked independent of whether the
/// interface will actually be applied (addr==sentinel just means "skip").
pub fn validate(iface: &ParseInterface) -> Result<(), ConfigError> {
    if !is_sentinel(iface.mask) && !is_contiguous_mask(iface.mask) {
        return Err(ConfigError::DiscontiguousMask);
    }
    if !is_sentinel(iface.gateway) {
        let a = u32::from_be_bytes(iface.addr.0);
        let m = u32::from_be_bytes(iface.mask.0);
        let g = u32::from_be_bytes(iface.gateway.0);
        if (g & m) != (a & m) {
            return Err(ConfigError::GatewayMaskMismatch);
        }
    }
    if !is_sentinel(iface.broadcast) && !is_sentinel(iface.mask) {
        if iface.broadcast != broadcast_of(iface.addr, iface.mask) {
            return Err(ConfigError::BroadcastMismatch);
        }
    }
    Ok(())
}

/// `SIOCSIF*`-driven reconfiguration: revalidate, then update the registry
/// entry in place (no recreate), recomputing broadcast when the mask is
/// large enough to have a meaningful host part (spec.md §4.I: "mask ≤
/// /30").
pub fn reconfigure(registry: &mut Registry, idx: usize, mut req: ParseInterface) -> Result<(), ConfigError> {
    validate(&req)?;
    if is_sentinel(req.broadcast) && prefix_len_of(req.mask) <= 30 {
        req.broadcast = broadcast_of(req.addr, req.mask);
    }
    let iface = &mut registry.interfaces[idx];
    iface.v4_addr = req.addr;
    iface.v4_mask = req.mask;
    iface.v4_gateway = req.gateway;
    let mut stack = iface.stack.inner.lock().unwrap();
    stack.update_ip_addrs(|addrs| {
        addrs.clear();
        addrs.push(IpCidr::new(req.addr.into(), prefix_len_of(req.mask))).ok();
    });
    if !is_sentinel(req.gateway) {
        stack.routes_mut().add_default_ipv4_route(req.gateway).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_mask_accepts_normal_masks() {
        assert!(is_contiguous_mask(Ipv4Address::new(255, 255, 255, 0)));
        assert!(is_contiguous_mask(Ipv4Address::new(255, 0, 0, 0)));
        assert!(is_contiguous_mask(Ipv4Address::new(0, 0, 0, 0)));
    }

    #[test]
    fn discontiguous_mask_is_rejected() {
        // S4: 255.0.255.0 has a zero byte sandwiched between ones.
        assert!(!is_contiguous_mask(Ipv4Address::new(255, 0, 255, 0)));
    }

    #[test]
    fn s4_config_rejection_scenario() {
        let mut iface = ParseInterface::new("tun0".into());
        iface.addr = Ipv4Address::new(10, 0, 0, 5);
        iface.mask = Ipv4Address::new(255, 0, 255, 0);
        assert_eq!(validate(&iface), Err(ConfigError::DiscontiguousMask));
    }

    #[test]
    fn gateway_must_share_the_network_with_addr() {
        let mut iface = ParseInterface::new("eth0".into());
        iface.addr = Ipv4Address::new(192, 168, 1, 5);
        iface.mask = Ipv4Address::new(255, 255, 255, 0);
        iface.gateway = Ipv4Address::new(192, 168, 2, 1);
        assert_eq!(validate(&iface), Err(ConfigError::GatewayMaskMismatch));
        iface.gateway = Ipv4Address::new(192, 168, 1, 1);
        assert!(validate(&iface).is_ok());
    }

    #[test]
    fn broadcast_must_match_addr_or_mask() {
        let mut iface = ParseInterface::new("eth0".into());
        iface.addr = Ipv4Address::new(192, 168, 1, 5);
        iface.mask = Ipv4Address::new(255, 255, 255, 0);
        iface.broadcast = Ipv4Address::new(192, 168, 1, 255);
        assert!(validate(&iface).is_ok());
        iface.broadcast = Ipv4Address::new(10, 0, 0, 1);
        assert_eq!(validate(&iface), Err(ConfigError::BroadcastMismatch));
    }

    #[test]
    fn bare_address_flag_resets_to_documented_default() {
        let mut hook = ParseHook::new();
        hook.select_interface("eth0");
        hook.set_address_default();
        let iface = &hook.interfaces[0];
        assert_eq!(iface.addr, Ipv4Address::new(0, 0, 0, 0));
        assert_eq!(iface.mask, Ipv4Address::new(255, 0, 0, 0));
        assert!(is_sentinel(iface.gateway));
    }

    #[test]
    fn multicast_address_rejected_at_parse_time() {
        let mut hook = ParseHook::new();
        hook.select_interface("eth0");
        assert_eq!(hook.set_address(Ipv4Address::new(224, 0, 0, 1)), Err(ConfigError::MulticastAddress));
    }
}

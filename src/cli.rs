//! Command-line surface: one argp-style grammar, per spec.md §6, where
//! every flag applies to whichever `--interface` was last seen. Grounded
//! in `options.c`'s `parse_opt`/`parse_hook_add_interface`: argument order
//! carries meaning (clap's derive-style "collect repeated flags into a
//! Vec" model loses that), so the stateful walk below mirrors argp's own
//! sequential callback rather than trying to coerce clap into doing it.
//! `clap` (the same crate the pack's `svd2utra`/`svd2repl` tools use for
//! their own flag parsing) is still used for usage/help text and for
//! rejecting genuinely malformed invocations before the sequential walk
//! begins.

use clap::{App, Arg};
use smoltcp::wire::Ipv6Address;

use netxlate::api::Family;
use netxlate::config::ParseHook;

pub struct Args {
    pub domain: Family,
    pub hook: ParseHook,
}

fn build_app() -> App<'static, 'static> {
    App::new("netxlate")
        .about("userspace TCP/IP translator")
        .arg(Arg::with_name("interface").short("i").long("interface").takes_value(true).multiple(true))
        .arg(Arg::with_name("address").short("a").long("address").takes_value(true).min_values(0).multiple(true))
        .arg(Arg::with_name("netmask").short("m").long("netmask").takes_value(true).multiple(true))
        .arg(Arg::with_name("gateway").short("g").long("gateway").takes_value(true).multiple(true))
        .arg(Arg::with_name("peer").short("p").long("peer").takes_value(true).multiple(true))
        .arg(Arg::with_name("address6").short("A").long("address6").takes_value(true).multiple(true))
        .arg(Arg::with_name("interface4").short("4").takes_value(true))
        .arg(Arg::with_name("interface6").short("6").takes_value(true))
}

/// spec.md §6: "-4 PATH / -6 PATH -- bind an additional translator node
/// restricted to that family; the opposite family then becomes the
/// bootstrap's default."
pub fn parse_args(argv: impl Iterator<Item = String>) -> Result<Args, String> {
    let raw: Vec<String> = argv.collect();

    // Validate the grammar up front (unknown flags, missing required
    // values for flags that don't allow a bare form) the way argp rejects
    // malformed invocations before `parse_opt` ever runs.
    let app = build_app();
    let mut full_argv = vec!["netxlate".to_string()];
    full_argv.extend(raw.iter().cloned());
    app.get_matches_from_safe(full_argv).map_err(|e| e.message)?;

    let mut hook = ParseHook::new();
    let mut domain = Family::Inet;
    let mut i = 0;
    while i < raw.len() {
        let tok = raw[i].as_str();
        let (flag, inline_value) = split_inline(tok);
        match flag {
            "-i" | "--interface" => {
                let (name, consumed) = take_value(&raw, i, inline_value)?;
                hook.select_interface(&name);
                i += consumed;
                continue;
            }
            "-a" | "--address" => {
                match peek_value(&raw, i, inline_value) {
                    Some((val, consumed)) => {
                        let addr = parse_ipv4(&val)?;
                        hook.set_address(addr).map_err(|e| format!("{:?}", e))?;
                        i += consumed;
                    }
                    None => {
                        hook.set_address_default();
                        i += 1;
                    }
                }
                continue;
            }
            "-m" | "--netmask" => {
                let (val, consumed) = take_value(&raw, i, inline_value)?;
                hook.set_netmask(parse_ipv4(&val)?);
                i += consumed;
                continue;
            }
            "-g" | "--gateway" => {
                let (val, consumed) = take_value(&raw, i, inline_value)?;
                hook.set_gateway(parse_ipv4(&val)?);
                i += consumed;
                continue;
            }
            "-p" | "--peer" => {
                let (val, consumed) = take_value(&raw, i, inline_value)?;
                hook.set_peer(parse_ipv4(&val)?);
                i += consumed;
                continue;
            }
            "-A" | "--address6" => {
                let (val, consumed) = take_value(&raw, i, inline_value)?;
                let addr: Ipv6Address = val.parse().map_err(|_| format!("bad IPv6 address: {}", val))?;
                hook.add_address6(addr);
                i += consumed;
                continue;
            }
            "-4" => {
                let (_path, consumed) = take_value(&raw, i, inline_value)?;
                domain = Family::Inet6;
                i += consumed;
                continue;
            }
            "-6" => {
                let (_path, consumed) = take_value(&raw, i, inline_value)?;
                domain = Family::Inet;
                i += consumed;
                continue;
            }
            _ => return Err(format!("unrecognized option: {}", tok)),
        }
    }

    Ok(Args { domain, hook })
}

fn split_inline(tok: &str) -> (&str, Option<&str>) {
    if let Some(eq) = tok.find('=') {
        (&tok[..eq], Some(&tok[eq + 1..]))
    } else {
        (tok, None)
    }
}

fn take_value(raw: &[String], i: usize, inline: Option<&str>) -> Result<(String, usize), String> {
    if let Some(v) = inline {
        return Ok((v.to_string(), 1));
    }
    raw.get(i + 1).map(|v| (v.clone(), 2)).ok_or_else(|| format!("missing value for {}", raw[i]))
}

/// Like `take_value` but returns `None` instead of erroring when no value
/// is present -- used only by `-a`, whose bare form is meaningful
/// (`set_address_default`).
fn peek_value(raw: &[String], i: usize, inline: Option<&str>) -> Option<(String, usize)> {
    if let Some(v) = inline {
        return Some((v.to_string(), 1));
    }
    match raw.get(i + 1) {
        Some(v) if !v.starts_with('-') => Some((v.clone(), 2)),
        _ => None,
    }
}

fn parse_ipv4(s: &str) -> Result<smoltcp::wire::Ipv4Address, String> {
    let octets: Vec<u8> = s.split('.').map(|p| p.parse::<u8>().map_err(|_| format!("bad IPv4 address: {}", s))).collect::<Result<_, _>>()?;
    if octets.len() != 4 {
        return Err(format!("bad IPv4 address: {}", s));
    }
    Ok(smoltcp::wire::Ipv4Address::new(octets[0], octets[1], octets[2], octets[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(s: &str) -> impl Iterator<Item = String> {
        s.split_whitespace().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn interface_then_address_and_netmask_apply_to_same_record() {
        let args = parse_args(argv("-i eth0 -a 192.168.1.5 -m 255.255.255.0")).unwrap();
        assert_eq!(args.hook.interfaces.len(), 1);
        let iface = &args.hook.interfaces[0];
        assert_eq!(iface.addr, smoltcp::wire::Ipv4Address::new(192, 168, 1, 5));
        assert_eq!(iface.mask, smoltcp::wire::Ipv4Address::new(255, 255, 255, 0));
    }

    #[test]
    fn bare_address_flag_uses_documented_default() {
        let args = parse_args(argv("-i eth0 -a -m 255.0.0.0")).unwrap();
        let iface = &args.hook.interfaces[0];
        assert_eq!(iface.addr, smoltcp::wire::Ipv4Address::new(0, 0, 0, 0));
    }

    #[test]
    fn two_interfaces_are_tracked_independently() {
        let args = parse_args(argv("-i eth0 -a 10.0.0.1 -i tun0 -a 10.0.1.1")).unwrap();
        assert_eq!(args.hook.interfaces.len(), 2);
        assert_eq!(args.hook.interfaces[0].name, "eth0");
        assert_eq!(args.hook.interfaces[1].name, "tun0");
    }

    #[test]
    fn unrecognized_flag_is_rejected() {
        assert!(parse_args(argv("--bogus")).is_err());
    }
}

//! Linux backend, driven by the `ip` tool.
//!
//! Installing replaces the default route with the TUN gateway, then
//! re-installs the original default on a secondary table with a source rule
//! for the original interface address. Traffic the proxy originates from
//! that address keeps using the physical uplink instead of looping back into
//! the TUN.

use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use tracing::debug;

use super::{run_command, DefaultRoute};

/// Secondary table carrying the original default route.
const FALLBACK_TABLE: &str = "7113";

pub(super) fn query_default_route() -> Result<DefaultRoute> {
    let routes = run_command("ip", &["-4", "route", "show", "default"])?;
    let Some((gateway, interface)) = parse_default_route(&routes) else {
        bail!("no ipv4 default route found");
    };

    let addrs = run_command("ip", &["-4", "addr", "show", "dev", &interface])?;
    let Some(interface_ip) = parse_inet_addr(&addrs) else {
        bail!("no ipv4 address on default interface {}", interface);
    };

    Ok(DefaultRoute {
        gateway,
        interface_ip,
        interface,
    })
}

pub(super) fn install(snapshot: &DefaultRoute, tun_gateway: Ipv4Addr) -> Result<()> {
    let tun_gw = tun_gateway.to_string();
    let orig_gw = snapshot.gateway.to_string();
    let orig_ip = snapshot.interface_ip.to_string();

    run_command("ip", &["route", "del", "default"])?;
    run_command("ip", &["route", "add", "default", "via", &tun_gw])?;
    run_command(
        "ip",
        &[
            "route",
            "add",
            "default",
            "via",
            &orig_gw,
            "dev",
            &snapshot.interface,
            "table",
            FALLBACK_TABLE,
        ],
    )?;
    run_command(
        "ip",
        &["rule", "add", "from", &orig_ip, "table", FALLBACK_TABLE],
    )?;
    Ok(())
}

pub(super) fn restore(snapshot: &DefaultRoute) -> Result<()> {
    let orig_gw = snapshot.gateway.to_string();
    let orig_ip = snapshot.interface_ip.to_string();

    for args in [
        ["rule", "del", "from", orig_ip.as_str(), "table", FALLBACK_TABLE].as_slice(),
        ["route", "flush", "table", FALLBACK_TABLE].as_slice(),
        ["route", "del", "default"].as_slice(),
    ] {
        if let Err(e) = run_command("ip", args) {
            debug!(error = %e, "route cleanup step failed");
        }
    }

    match run_command("ip", &["route", "add", "default", "via", &orig_gw]) {
        Ok(_) => Ok(()),
        // Already present: restoring twice must end in the same state.
        Err(e) if e.to_string().contains("File exists") => Ok(()),
        Err(e) => Err(e),
    }
}

fn parse_default_route(output: &str) -> Option<(Ipv4Addr, String)> {
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        let gateway = tokens
            .iter()
            .position(|t| *t == "via")
            .and_then(|i| tokens.get(i + 1))
            .and_then(|t| t.parse().ok())?;
        let interface = tokens
            .iter()
            .position(|t| *t == "dev")
            .and_then(|i| tokens.get(i + 1))?
            .to_string();
        return Some((gateway, interface));
    }
    None
}

fn parse_inet_addr(output: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("inet") {
            continue;
        }
        let cidr = tokens.next()?;
        let addr = cidr.split('/').next()?;
        if let Ok(ip) = addr.parse() {
            return Some(ip);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_route_line() {
        let output = "default via 192.168.1.1 dev eth0 proto dhcp metric 100\n";
        let (gateway, interface) = parse_default_route(output).unwrap();
        assert_eq!(gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(interface, "eth0");
    }

    #[test]
    fn skips_non_default_lines() {
        let output = "10.0.0.0/24 dev tun0 scope link\n";
        assert!(parse_default_route(output).is_none());
    }

    #[test]
    fn missing_via_is_rejected() {
        let output = "default dev ppp0 scope link\n";
        assert!(parse_default_route(output).is_none());
    }

    #[test]
    fn parses_inet_address() {
        let output = "\
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP
    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic eth0
       valid_lft 86031sec preferred_lft 86031sec
";
        assert_eq!(
            parse_inet_addr(output),
            Some(Ipv4Addr::new(192, 168, 1, 23))
        );
    }

    #[test]
    fn inet_not_found() {
        assert!(parse_inet_addr("3: eth1: <NO-CARRIER>\n").is_none());
    }
}

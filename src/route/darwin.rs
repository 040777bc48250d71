//! macOS backend, driven by the `route` tool.
//!
//! Installing replaces the default route with the TUN gateway and re-adds
//! the original gateway with `-ifscope`, so scoped lookups (and with them
//! the proxy's own upstream sockets) can still reach the physical uplink.

use std::net::Ipv4Addr;

use anyhow::{bail, Result};
use tracing::debug;

use super::{run_command, DefaultRoute};

pub(super) fn query_default_route() -> Result<DefaultRoute> {
    let table = run_command("netstat", &["-rn", "-f", "inet"])?;
    let Some((gateway, interface)) = parse_routing_table(&table) else {
        bail!("no ipv4 default route found");
    };

    let addr = run_command("ipconfig", &["getifaddr", &interface])?;
    let interface_ip = addr
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("unparsable address on interface {}", interface))?;

    Ok(DefaultRoute {
        gateway,
        interface_ip,
        interface,
    })
}

pub(super) fn install(snapshot: &DefaultRoute, tun_gateway: Ipv4Addr) -> Result<()> {
    let tun_gw = tun_gateway.to_string();
    let orig_gw = snapshot.gateway.to_string();

    run_command("route", &["delete", "default"])?;
    run_command("route", &["add", "default", &tun_gw])?;
    run_command(
        "route",
        &["add", "default", &orig_gw, "-ifscope", &snapshot.interface],
    )?;
    Ok(())
}

pub(super) fn restore(snapshot: &DefaultRoute) -> Result<()> {
    let orig_gw = snapshot.gateway.to_string();

    if let Err(e) = run_command("route", &["delete", "default"]) {
        debug!(error = %e, "default route delete failed");
    }
    match run_command("route", &["add", "default", &orig_gw]) {
        Ok(_) => Ok(()),
        // Already present: restoring twice must end in the same state.
        Err(e) if e.to_string().contains("File exists") => Ok(()),
        Err(e) => Err(e),
    }
}

fn parse_routing_table(output: &str) -> Option<(Ipv4Addr, String)> {
    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"default") {
            continue;
        }
        let gateway: Ipv4Addr = tokens.get(1)?.parse().ok()?;
        let interface = tokens.last()?.to_string();
        return Some((gateway, interface));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_netstat_output() {
        let output = "\
Routing tables

Internet:
Destination        Gateway            Flags           Netif Expire
default            192.168.0.1        UGScg             en0
127                127.0.0.1          UCS               lo0
";
        let (gateway, interface) = parse_routing_table(output).unwrap();
        assert_eq!(gateway, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(interface, "en0");
    }

    #[test]
    fn no_default_entry() {
        assert!(parse_routing_table("Destination Gateway Flags Netif\n").is_none());
    }
}

//! Parser for the local/remote `ip route` enumeration output.
//!
//! Scans lines for the `default via` shape to find the gateway, and any
//! `dev ... src ...` line to fill in the per-interface address map.

use std::collections::HashMap;

use crate::error::{TunmanError, TunmanResult};

/// Parsed view of one `ip route` dump.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    gateway_ip: String,
    gateway_interface_name: String,
    gateway_interface_ip: String,
    interfaces_ip: HashMap<String, String>,
}

impl RoutingTable {
    /// Parse the textual output of `ip route`.
    pub fn parse(output: &str) -> TunmanResult<Self> {
        let lines: Vec<&str> = output.lines().collect();

        let (gateway_ip, gateway_interface_name) = Self::parse_gateway(&lines)?;
        let interfaces_ip = Self::parse_interface_ips(&lines)?;

        let gateway_interface_ip = interfaces_ip
            .get(&gateway_interface_name)
            .cloned()
            .ok_or_else(|| TunmanError::UnknownInterface(gateway_interface_name.clone()))?;

        Ok(Self {
            gateway_ip,
            gateway_interface_name,
            gateway_interface_ip,
            interfaces_ip,
        })
    }

    fn parse_gateway(lines: &[&str]) -> TunmanResult<(String, String)> {
        for line in lines {
            if !line.contains("default via") {
                continue;
            }

            let gw = line
                .split("via ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .ok_or_else(|| TunmanError::Parse(format!("missing gateway IP in line: {line}")))?;

            let dev = line
                .split("dev ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .ok_or_else(|| {
                    TunmanError::Parse(format!("missing gateway interface in line: {line}"))
                })?;

            return Ok((gw.to_string(), dev.to_string()));
        }

        Err(TunmanError::Parse(
            "no 'default via' line found in routing table".to_string(),
        ))
    }

    fn parse_interface_ips(lines: &[&str]) -> TunmanResult<HashMap<String, String>> {
        let mut interfaces_ip = HashMap::new();

        for line in lines {
            if !line.contains(" dev ") || !line.contains(" src ") {
                continue;
            }

            let dev = line
                .split("dev ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .ok_or_else(|| TunmanError::Parse(format!("cannot parse `ip route` line: {line}")))?;

            let src = line
                .split("src ")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .ok_or_else(|| TunmanError::Parse(format!("cannot parse `ip route` line: {line}")))?;

            interfaces_ip.insert(dev.to_string(), src.to_string());
        }

        Ok(interfaces_ip)
    }

    /// Gateway interface name, e.g. `eth0`
    pub fn gateway_interface(&self) -> &str {
        &self.gateway_interface_name
    }

    /// IP address assigned to the gateway interface
    pub fn gateway_interface_ip(&self) -> &str {
        &self.gateway_interface_ip
    }

    /// The default route's gateway IP
    pub fn gateway(&self) -> &str {
        &self.gateway_ip
    }

    /// Look up the primary IPv4 address of an arbitrary interface
    pub fn get_interface_ip(&self, interface_name: &str) -> TunmanResult<&str> {
        self.interfaces_ip
            .get(interface_name)
            .map(String::as_str)
            .ok_or_else(|| TunmanError::UnknownInterface(interface_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "default via 192.168.0.1 dev wlp2s0 proto dhcp metric 600\n\
192.168.0.0/24 dev wlp2s0 proto kernel scope link src 192.168.0.109 metric 600\n\
169.254.0.0/16 dev wlp2s0 scope link metric 1000";

    #[test]
    fn parses_standard_output() {
        let parsed = RoutingTable::parse(SAMPLE).unwrap();

        assert_eq!(parsed.gateway(), "192.168.0.1");
        assert_eq!(parsed.gateway_interface(), "wlp2s0");
        assert_eq!(parsed.gateway_interface_ip(), "192.168.0.109");
    }

    #[test]
    fn round_trips_gateway_interface_ip() {
        let parsed = RoutingTable::parse(SAMPLE).unwrap();

        assert_eq!(
            parsed.get_interface_ip(parsed.gateway_interface()).unwrap(),
            parsed.gateway_interface_ip()
        );
    }

    #[test]
    fn unknown_interface_is_an_error() {
        let parsed = RoutingTable::parse(SAMPLE).unwrap();
        assert!(parsed.get_interface_ip("eth9").is_err());
    }

    #[test]
    fn missing_default_route_is_an_error() {
        let output = "192.168.0.0/24 dev wlp2s0 proto kernel scope link src 192.168.0.109";
        assert!(RoutingTable::parse(output).is_err());
    }
}

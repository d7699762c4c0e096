//! Structural validation of cloud-init network configuration
//!
//! Only version 1 documents are inspected. Across all physical interfaces
//! there may be at most one static default gateway, there must be a gateway or
//! a DHCP subnet, and at least one nameserver must be available. A DHCP
//! subnet supplies its own nameserver.

use harvester_common::yaml::parse_yaml;
use harvester_common::{Error, Result};
use serde_json::{Map, Value};
use tracing::debug;

#[derive(Debug, Default, PartialEq, Eq)]
struct RouteCounts {
    gateways: usize,
    dhcp: usize,
    nameservers: usize,
}

/// Validate a network-data document. Empty input is valid.
pub fn validate_network_data(network_data: &str) -> Result<()> {
    if network_data.trim().is_empty() {
        return Ok(());
    }

    let document = parse_yaml(network_data).map_err(|e| Error::network_data(e.to_string()))?;
    let root = as_mapping(&document, "network data")?;
    let network = match root.get("network") {
        Some(Value::Null) | None => root,
        Some(section) => as_mapping(section, "network")?,
    };

    let version = required(network, "version")?
        .as_f64()
        .ok_or_else(|| Error::network_data("version must be a number"))?;

    if version != 1.0 {
        debug!(version, "Skipping structural check of network data");
        return Ok(());
    }

    let counts = count_v1(network)?;
    if counts.gateways > 1 {
        return Err(Error::network_data(format!(
            "at most one default gateway may be configured, found {}",
            counts.gateways
        )));
    }
    if counts.gateways == 0 && counts.dhcp == 0 {
        return Err(Error::network_data("static gateway or dhcp is not configured"));
    }
    if counts.nameservers == 0 {
        return Err(Error::network_data("nameserver is not configured"));
    }
    Ok(())
}

fn count_v1(network: &Map<String, Value>) -> Result<RouteCounts> {
    let mut counts = RouteCounts::default();

    for entry in as_sequence(required(network, "config")?, "config")? {
        let entry = as_mapping(entry, "config entry")?;
        match as_str(required(entry, "type")?, "type")? {
            "physical" => {
                for subnet in as_sequence(required(entry, "subnets")?, "subnets")? {
                    let subnet = as_mapping(subnet, "subnet")?;
                    match as_str(required(subnet, "type")?, "type")? {
                        "dhcp" => {
                            counts.dhcp += 1;
                            counts.nameservers += 1;
                        }
                        "static" => {
                            let gateway = subnet.get("gateway").and_then(Value::as_str);
                            if gateway.is_some_and(|g| !g.is_empty()) {
                                counts.gateways += 1;
                            }
                        }
                        _ => {}
                    }
                }
            }
            "nameserver" => {
                counts.nameservers += as_sequence(required(entry, "address")?, "address")?.len();
            }
            _ => {}
        }
    }

    Ok(counts)
}

fn required<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    match map.get(key) {
        None | Some(Value::Null) => Err(Error::missing_section(key)),
        Some(value) => Ok(value),
    }
}

fn as_mapping<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| Error::network_data(format!("{what} must be a mapping")))
}

fn as_sequence<'a>(value: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| Error::network_data(format!("{what} must be a list")))
}

fn as_str<'a>(value: &'a Value, what: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::network_data(format!("{what} must be a string")))
}

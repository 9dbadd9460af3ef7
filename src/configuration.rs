// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Server configuration.
//!
//! Configuration is a JSON object. Recognized fields are enumerated on
//! [`ServerConfig`]; any additional key is interpreted as a DHCP option,
//! either by its symbolic table name (`subnet_mask`, `router`, ...) or by its
//! numeric form (`option_NN`), and is copied verbatim into every reply.

use crate::netif;
use crate::options::{self, OptionCode, OptionMap, OptionValue, ValueKind};
use crate::store::Pattern;
use failure::{Fail, ResultExt};
use serde_derive::Deserialize;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fs::File;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Addresses reserved at the bottom of every pool; the first offered
/// address is `network_address + POOL_RESERVED + 1`.
const POOL_RESERVED: u32 = 5;

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "unrecognized option name: {}", _0)]
    UnknownOption(String),

    #[fail(display = "configured value for {} does not fit the option's type", _0)]
    IncompatibleValue(String),
}

/// The DHCP server configuration.
///
/// All durations are seconds. Unknown keys land in `extra_options`.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub dhcp_offer_after_seconds: u64,
    pub dhcp_acknowledge_after_seconds: u64,
    pub length_of_transaction: i64,
    pub network: Ipv4Addr,
    pub broadcast_address: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Vec<Ipv4Addr>>,
    pub ip_address_lease_time: u32,
    pub domain_name_server: Option<Vec<Ipv4Addr>>,
    pub host_file: PathBuf,
    /// Source addresses used for broadcasting and as server identifiers.
    /// When absent, the local interfaces are probed at startup.
    pub server_identifiers: Option<Vec<Ipv4Addr>>,
    #[serde(flatten)]
    pub extra_options: BTreeMap<String, serde_json::Value>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            dhcp_offer_after_seconds: 10,
            dhcp_acknowledge_after_seconds: 10,
            length_of_transaction: 40,
            network: Ipv4Addr::new(192, 168, 173, 0),
            broadcast_address: Ipv4Addr::new(255, 255, 255, 255),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: None,
            ip_address_lease_time: 300,
            domain_name_server: None,
            host_file: PathBuf::from("hosts.csv"),
            server_identifiers: None,
            extra_options: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The network address: `network & subnet_mask`.
    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) & u32::from(self.subnet_mask))
    }

    /// The directed broadcast address of the configured subnet.
    pub fn directed_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network_address()) | !u32::from(self.subnet_mask))
    }

    /// The allocatable addresses in ascending order. The first five usable
    /// addresses and the directed broadcast are never offered.
    pub fn pool(&self) -> impl Iterator<Item = Ipv4Addr> {
        let start = u32::from(self.network_address()).saturating_add(POOL_RESERVED + 1);
        let end = u32::from(self.directed_broadcast());
        (start..end).map(Ipv4Addr::from)
    }

    /// A store pattern selecting addresses inside the configured subnet.
    pub fn network_filter(&self) -> Pattern {
        Pattern::InNetwork(self.network, self.subnet_mask)
    }

    /// The configured option set copied onto every reply: the enumerated
    /// fields first, then every extra symbolic or `option_NN` key. Values
    /// that do not fit their option's wire type are logged and omitted.
    pub fn reply_options(&self) -> OptionMap {
        let mut map = OptionMap::new();
        map.insert(OptionCode::SubnetMask, OptionValue::Ip(self.subnet_mask));
        map.insert(OptionCode::BroadcastAddress, OptionValue::Ip(self.broadcast_address));
        map.insert(
            OptionCode::IpAddressLeaseTime,
            OptionValue::U32(self.ip_address_lease_time),
        );
        if let Some(routers) = &self.router {
            map.insert(OptionCode::Router, OptionValue::IpList(routers.clone()));
        }
        if let Some(servers) = &self.domain_name_server {
            map.insert(OptionCode::DomainNameServer, OptionValue::IpList(servers.clone()));
        }
        for (name, value) in &self.extra_options {
            match configured_option(name, value) {
                Ok((code, value)) => map.insert(code, value),
                Err(e) => log::warn!("ignoring configured option {}: {}", name, e),
            }
        }
        map
    }

    /// If one of this host's addresses ends in `.1`, treat this machine as
    /// the subnet router: adopt that address as router and name server and
    /// derive the network and broadcast option from it.
    pub fn adjust_if_this_computer_is_a_router(&mut self) {
        for ip in netif::local_ipv4_addresses().into_iter().rev() {
            let octets = ip.octets();
            if octets[3] == 1 {
                self.router = Some(vec![ip]);
                self.domain_name_server = Some(vec![ip]);
                self.network = Ipv4Addr::new(octets[0], octets[1], octets[2], 0);
                self.broadcast_address = Ipv4Addr::new(octets[0], octets[1], octets[2], 255);
                log::info!("adjusted configuration for local router address {}", ip);
            }
        }
    }
}

/// Resolves one configured `(name, value)` pair to an option code and value.
///
/// `name` is either a symbolic table name or `option_NN`; symbolic names are
/// converted per the option's declared type, numeric-only options accept a
/// byte array or a string.
pub fn configured_option(
    name: &str,
    value: &serde_json::Value,
) -> Result<(u8, OptionValue), ConfigError> {
    if let Some(d) = options::descriptor_by_name(name) {
        let converted = value_from_json(d.kind, value)
            .ok_or_else(|| ConfigError::IncompatibleValue(name.to_string()))?;
        return Ok((d.code as u8, converted));
    }
    if let Some(digits) = name.strip_prefix("option_") {
        let code: u8 = digits
            .parse()
            .map_err(|_| ConfigError::UnknownOption(name.to_string()))?;
        if let Some(d) = options::descriptor(code) {
            let converted = value_from_json(d.kind, value)
                .ok_or_else(|| ConfigError::IncompatibleValue(name.to_string()))?;
            return Ok((code, converted));
        }
        let converted = value_from_json(ValueKind::Bytes, value)
            .or_else(|| value_from_json(ValueKind::Str, value))
            .ok_or_else(|| ConfigError::IncompatibleValue(name.to_string()))?;
        return Ok((code, converted));
    }
    Err(ConfigError::UnknownOption(name.to_string()))
}

fn value_from_json(kind: ValueKind, value: &serde_json::Value) -> Option<OptionValue> {
    use serde_json::Value;
    match kind {
        ValueKind::Ip => match value {
            Value::String(s) => s.parse().ok().map(OptionValue::Ip),
            _ => None,
        },
        ValueKind::IpList => match value {
            Value::String(s) => s.parse().ok().map(|ip| OptionValue::IpList(vec![ip])),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_str().and_then(|s| s.parse().ok()))
                .collect::<Option<Vec<Ipv4Addr>>>()
                .map(OptionValue::IpList),
            _ => None,
        },
        ValueKind::U8 => value.as_u64().and_then(|n| u8::try_from(n).ok()).map(OptionValue::U8),
        ValueKind::U16 => value.as_u64().and_then(|n| u16::try_from(n).ok()).map(OptionValue::U16),
        ValueKind::U32 => value.as_u64().and_then(|n| u32::try_from(n).ok()).map(OptionValue::U32),
        ValueKind::Bool => value.as_bool().map(OptionValue::Bool),
        ValueKind::Str => value.as_str().map(|s| OptionValue::Str(s.to_string())),
        ValueKind::Bytes => match value {
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(OptionValue::Bytes),
            _ => None,
        },
        ValueKind::MessageType => value
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .and_then(|n| crate::options::MessageType::try_from(n).ok())
            .map(OptionValue::MessageType),
        ValueKind::ParameterList => match value {
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect::<Option<Vec<u8>>>()
                .map(OptionValue::ParameterList),
            _ => None,
        },
    }
}

/// Loads a `ServerConfig` from a JSON file.
pub fn load_server_config_from_file(path: &str) -> Result<ServerConfig, failure::Error> {
    let file = File::open(path).context("unable to open config file")?;
    let config = serde_json::from_reader(file).context("unable to parse config file")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_documented_values() {
        let config = ServerConfig::new();
        assert_eq!(config.dhcp_offer_after_seconds, 10);
        assert_eq!(config.dhcp_acknowledge_after_seconds, 10);
        assert_eq!(config.length_of_transaction, 40);
        assert_eq!(config.network, Ipv4Addr::new(192, 168, 173, 0));
        assert_eq!(config.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(config.broadcast_address, Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(config.ip_address_lease_time, 300);
        assert_eq!(config.host_file, PathBuf::from("hosts.csv"));
    }

    #[test]
    fn test_pool_starts_six_addresses_into_the_network() {
        let config = ServerConfig::new();
        let first = config.pool().next().unwrap();
        assert_eq!(first, Ipv4Addr::new(192, 168, 173, 6));
    }

    #[test]
    fn test_pool_excludes_the_directed_broadcast() {
        let config = ServerConfig::new();
        let last = config.pool().last().unwrap();
        assert_eq!(last, Ipv4Addr::new(192, 168, 173, 254));
    }

    #[test]
    fn test_pool_iterates_in_ascending_order() {
        let config = ServerConfig::new();
        let addrs: Vec<Ipv4Addr> = config.pool().take(3).collect();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(192, 168, 173, 6),
                Ipv4Addr::new(192, 168, 173, 7),
                Ipv4Addr::new(192, 168, 173, 8),
            ]
        );
    }

    #[test]
    fn test_network_address_applies_the_mask() {
        let mut config = ServerConfig::new();
        config.network = Ipv4Addr::new(192, 168, 173, 77);
        assert_eq!(config.network_address(), Ipv4Addr::new(192, 168, 173, 0));
    }

    #[test]
    fn test_reply_options_carry_the_enumerated_fields() {
        let mut config = ServerConfig::new();
        config.router = Some(vec![Ipv4Addr::new(192, 168, 173, 1)]);
        config.domain_name_server = Some(vec![Ipv4Addr::new(8, 8, 8, 8)]);

        let map = config.reply_options();
        assert_eq!(
            map.get(OptionCode::SubnetMask),
            Some(&OptionValue::Ip(Ipv4Addr::new(255, 255, 255, 0)))
        );
        assert_eq!(
            map.get(OptionCode::BroadcastAddress),
            Some(&OptionValue::Ip(Ipv4Addr::new(255, 255, 255, 255)))
        );
        assert_eq!(map.get(OptionCode::IpAddressLeaseTime), Some(&OptionValue::U32(300)));
        assert_eq!(
            map.get(OptionCode::Router),
            Some(&OptionValue::IpList(vec![Ipv4Addr::new(192, 168, 173, 1)]))
        );
    }

    #[test]
    fn test_reply_options_skip_unconfigured_lists() {
        let map = ServerConfig::new().reply_options();
        assert_eq!(map.get(OptionCode::Router), None);
        assert_eq!(map.get(OptionCode::DomainNameServer), None);
    }

    #[test]
    fn test_configured_option_resolves_symbolic_names() {
        let (code, value) =
            configured_option("tftp_server_name", &serde_json::json!("192.168.173.2")).unwrap();
        assert_eq!(code, 66);
        assert_eq!(value, OptionValue::Str("192.168.173.2".to_string()));
    }

    #[test]
    fn test_configured_option_resolves_numeric_names() {
        let (code, value) = configured_option("option_43", &serde_json::json!([1, 2, 3])).unwrap();
        assert_eq!(code, 43);
        assert_eq!(value, OptionValue::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_configured_option_with_numeric_name_of_known_option_uses_its_type() {
        let (code, value) = configured_option("option_51", &serde_json::json!(600)).unwrap();
        assert_eq!(code, 51);
        assert_eq!(value, OptionValue::U32(600));
    }

    #[test]
    fn test_configured_option_with_incompatible_value_is_an_error() {
        match configured_option("subnet_mask", &serde_json::json!(42)) {
            Err(ConfigError::IncompatibleValue(name)) => assert_eq!(name, "subnet_mask"),
            other => panic!("expected an incompatible value error, got {:?}", other),
        }
    }

    #[test]
    fn test_configured_option_with_unknown_name_is_an_error() {
        assert!(configured_option("no_such_option", &serde_json::json!(1)).is_err());
    }

    #[test]
    fn test_load_server_config_from_file_reads_fields_and_extras() {
        use std::io::Write;
        let path = std::env::temp_dir().join(format!("dhcpd-config-{}.json", std::process::id()));
        let mut file = File::create(&path).unwrap();
        write!(
            file,
            r#"{{
                "network": "10.0.40.0",
                "subnet_mask": "255.255.255.0",
                "router": ["10.0.40.1"],
                "ip_address_lease_time": 600,
                "tftp_server_name": "10.0.40.2",
                "option_43": [1, 2, 3]
            }}"#
        )
        .unwrap();

        let config = load_server_config_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.network, Ipv4Addr::new(10, 0, 40, 0));
        assert_eq!(config.ip_address_lease_time, 600);
        assert_eq!(config.dhcp_offer_after_seconds, 10);
        assert_eq!(config.extra_options.len(), 2);

        let map = config.reply_options();
        assert_eq!(map.get(66u8), Some(&OptionValue::Str("10.0.40.2".to_string())));
        assert_eq!(map.get(43u8), Some(&OptionValue::Bytes(vec![1, 2, 3])));

        let _ = std::fs::remove_file(&path);
    }
}

// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DHCP option codec.
//!
//! Every supported option is described by an entry in a static table mapping
//! its code to a symbolic name and a wire type. Values travel through the
//! server as [`OptionValue`]s inside an [`OptionMap`]; the per-type encoders
//! and decoders in this module translate between those values and the raw
//! TLV payloads of RFC 2132.

use crate::protocol::ProtocolError;
use byteorder::{BigEndian, ByteOrder};
use num_derive::FromPrimitive;
use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;

/// A DHCP option code.
///
/// This enum corresponds to the codes for DHCP options as defined in
/// RFC 2132. Note that not all options defined in the RFC are represented
/// here; options which are not in this type are carried as raw bytes keyed
/// by their numeric code.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    TimeOffset = 2,
    Router = 3,
    TimeServer = 4,
    NameServer = 5,
    DomainNameServer = 6,
    HostName = 12,
    DomainName = 15,
    IpForwarding = 19,
    DefaultIpTtl = 23,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    NtpServers = 42,
    RequestedIpAddress = 50,
    IpAddressLeaseTime = 51,
    DhcpMessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    Message = 56,
    MaxDhcpMessageSize = 57,
    RenewalTimeValue = 58,
    RebindingTimeValue = 59,
    VendorClassIdentifier = 60,
    ClientIdentifier = 61,
    TftpServerName = 66,
    BootfileName = 67,
    End = 255,
}

impl Into<u8> for OptionCode {
    fn into(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        <Self as num_traits::FromPrimitive>::from_u8(n).ok_or(n)
    }
}

/// A DHCP Message Type.
///
/// This enum corresponds to the DHCP Message Type option values
/// defined in section 9.6 of RFC 2132.
#[derive(FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MessageType {
    DHCPDISCOVER = 1,
    DHCPOFFER = 2,
    DHCPREQUEST = 3,
    DHCPDECLINE = 4,
    DHCPACK = 5,
    DHCPNAK = 6,
    DHCPRELEASE = 7,
    DHCPINFORM = 8,
}

impl Into<u8> for MessageType {
    fn into(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        <Self as num_traits::FromPrimitive>::from_u8(n).ok_or(n)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self, f)
    }
}

/// The wire encoding of an option's payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ValueKind {
    /// A single IPv4 address, 4 bytes in network order.
    Ip,
    /// A concatenation of IPv4 addresses; length is a multiple of 4.
    IpList,
    U8,
    /// Unsigned big-endian, 2 bytes.
    U16,
    /// Unsigned big-endian, 4 bytes.
    U32,
    /// One byte, 0 or 1.
    Bool,
    /// Bytes without a trailing NUL.
    Str,
    /// Opaque bytes.
    Bytes,
    /// A single byte mapped to [`MessageType`].
    MessageType,
    /// A sequence of option codes; order is significant.
    ParameterList,
}

/// A decoded option value.
///
/// `Raw` carries the payload of options without a table entry as well as
/// payloads that failed to decode; both are preserved byte-for-byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OptionValue {
    Ip(Ipv4Addr),
    IpList(Vec<Ipv4Addr>),
    U8(u8),
    U16(u16),
    U32(u32),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    MessageType(MessageType),
    ParameterList(Vec<u8>),
    Raw(Vec<u8>),
}

/// A table entry describing one DHCP option.
#[derive(Copy, Clone, Debug)]
pub struct OptionDescriptor {
    pub code: OptionCode,
    pub name: &'static str,
    pub kind: ValueKind,
}

const fn desc(code: OptionCode, name: &'static str, kind: ValueKind) -> OptionDescriptor {
    OptionDescriptor { code, name, kind }
}

/// The static option table, in ascending code order. Initialized once;
/// never mutated after startup.
pub static DESCRIPTORS: &[OptionDescriptor] = &[
    desc(OptionCode::SubnetMask, "subnet_mask", ValueKind::Ip),
    desc(OptionCode::TimeOffset, "time_offset", ValueKind::U32),
    desc(OptionCode::Router, "router", ValueKind::IpList),
    desc(OptionCode::TimeServer, "time_server", ValueKind::IpList),
    desc(OptionCode::NameServer, "name_server", ValueKind::IpList),
    desc(OptionCode::DomainNameServer, "domain_name_server", ValueKind::IpList),
    desc(OptionCode::HostName, "host_name", ValueKind::Str),
    desc(OptionCode::DomainName, "domain_name", ValueKind::Str),
    desc(OptionCode::IpForwarding, "ip_forwarding_enabled", ValueKind::Bool),
    desc(OptionCode::DefaultIpTtl, "default_ip_time_to_live", ValueKind::U8),
    desc(OptionCode::InterfaceMtu, "interface_mtu", ValueKind::U16),
    desc(OptionCode::BroadcastAddress, "broadcast_address", ValueKind::Ip),
    desc(OptionCode::NtpServers, "network_time_protocol_servers", ValueKind::IpList),
    desc(OptionCode::RequestedIpAddress, "requested_ip_address", ValueKind::Ip),
    desc(OptionCode::IpAddressLeaseTime, "ip_address_lease_time", ValueKind::U32),
    desc(OptionCode::DhcpMessageType, "dhcp_message_type", ValueKind::MessageType),
    desc(OptionCode::ServerIdentifier, "server_identifier", ValueKind::Ip),
    desc(OptionCode::ParameterRequestList, "parameter_request_list", ValueKind::ParameterList),
    desc(OptionCode::Message, "message", ValueKind::Str),
    desc(OptionCode::MaxDhcpMessageSize, "maximum_dhcp_message_size", ValueKind::U16),
    desc(OptionCode::RenewalTimeValue, "renewal_time_value", ValueKind::U32),
    desc(OptionCode::RebindingTimeValue, "rebinding_time_value", ValueKind::U32),
    desc(OptionCode::VendorClassIdentifier, "vendor_class_identifier", ValueKind::Str),
    desc(OptionCode::ClientIdentifier, "client_identifier", ValueKind::Bytes),
    desc(OptionCode::TftpServerName, "tftp_server_name", ValueKind::Str),
    desc(OptionCode::BootfileName, "bootfile_name", ValueKind::Str),
];

/// Returns the table entry for `code`, or `None` for unsupported codes.
pub fn descriptor(code: u8) -> Option<&'static OptionDescriptor> {
    DESCRIPTORS.iter().find(|d| d.code as u8 == code)
}

/// Returns the table entry whose symbolic name is `name`.
pub fn descriptor_by_name(name: &str) -> Option<&'static OptionDescriptor> {
    DESCRIPTORS.iter().find(|d| d.name == name)
}

/// Encodes `value` as the payload of option `code` with wire type `kind`.
///
/// A `Raw` value passes through any declared type untouched. A typed value
/// incompatible with `kind` fails with `ProtocolError::OptionEncoding` so the
/// caller can omit the option and keep the rest of the packet.
pub fn encode_value(code: u8, kind: ValueKind, value: &OptionValue) -> Result<Vec<u8>, ProtocolError> {
    let bytes = match (kind, value) {
        (_, OptionValue::Raw(b)) => b.clone(),
        (ValueKind::Ip, OptionValue::Ip(addr)) => addr.octets().to_vec(),
        (ValueKind::IpList, OptionValue::IpList(addrs)) => {
            let mut b = Vec::with_capacity(addrs.len() * 4);
            for addr in addrs {
                b.extend_from_slice(&addr.octets());
            }
            b
        }
        (ValueKind::U8, OptionValue::U8(n)) => vec![*n],
        (ValueKind::U16, OptionValue::U16(n)) => {
            let mut b = [0u8; 2];
            BigEndian::write_u16(&mut b, *n);
            b.to_vec()
        }
        (ValueKind::U32, OptionValue::U32(n)) => {
            let mut b = [0u8; 4];
            BigEndian::write_u32(&mut b, *n);
            b.to_vec()
        }
        (ValueKind::Bool, OptionValue::Bool(v)) => vec![*v as u8],
        (ValueKind::Str, OptionValue::Str(s)) => s.as_bytes().to_vec(),
        (ValueKind::Bytes, OptionValue::Bytes(b)) => b.clone(),
        (ValueKind::MessageType, OptionValue::MessageType(t)) => vec![(*t).into()],
        (ValueKind::ParameterList, OptionValue::ParameterList(codes)) => codes.clone(),
        (_, _) => return Err(ProtocolError::OptionEncoding(code)),
    };
    if bytes.len() > std::u8::MAX as usize {
        return Err(ProtocolError::OptionOversized(code));
    }
    Ok(bytes)
}

/// Decodes the payload of option `code` according to `kind`.
///
/// Length mismatches and other malformed payloads fail with
/// `ProtocolError::OptionDecoding`; callers retain the payload as `Raw`
/// rather than aborting packet parsing.
pub fn decode_value(code: u8, kind: ValueKind, bytes: &[u8]) -> Result<OptionValue, ProtocolError> {
    let malformed = || ProtocolError::OptionDecoding(code, bytes.len());
    let value = match kind {
        ValueKind::Ip => {
            if bytes.len() != 4 {
                return Err(malformed());
            }
            OptionValue::Ip(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
        }
        ValueKind::IpList => {
            if bytes.len() % 4 != 0 {
                return Err(malformed());
            }
            OptionValue::IpList(
                bytes.chunks(4).map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3])).collect(),
            )
        }
        ValueKind::U8 => {
            if bytes.len() != 1 {
                return Err(malformed());
            }
            OptionValue::U8(bytes[0])
        }
        ValueKind::U16 => {
            if bytes.len() != 2 {
                return Err(malformed());
            }
            OptionValue::U16(BigEndian::read_u16(bytes))
        }
        ValueKind::U32 => {
            if bytes.len() != 4 {
                return Err(malformed());
            }
            OptionValue::U32(BigEndian::read_u32(bytes))
        }
        ValueKind::Bool => {
            if bytes.len() != 1 {
                return Err(malformed());
            }
            OptionValue::Bool(bytes[0] != 0)
        }
        ValueKind::Str => match std::str::from_utf8(bytes) {
            Ok(s) => OptionValue::Str(s.trim_end_matches('\x00').to_string()),
            Err(_) => return Err(malformed()),
        },
        ValueKind::Bytes => OptionValue::Bytes(bytes.to_vec()),
        ValueKind::MessageType => {
            if bytes.len() != 1 {
                return Err(malformed());
            }
            // Unknown message type values are retained numerically by the
            // caller and never become a state event.
            match MessageType::try_from(bytes[0]) {
                Ok(t) => OptionValue::MessageType(t),
                Err(_) => return Err(malformed()),
            }
        }
        ValueKind::ParameterList => OptionValue::ParameterList(bytes.to_vec()),
    };
    Ok(value)
}

/// The options carried by a message, keyed by numeric code.
///
/// Insertion is last-writer-wins, which also gives duplicate codes on the
/// wire their RFC-mandated semantics. Iteration is in ascending code order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OptionMap {
    entries: BTreeMap<u8, OptionValue>,
}

impl OptionMap {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    pub fn insert<C: Into<u8>>(&mut self, code: C, value: OptionValue) {
        self.entries.insert(code.into(), value);
    }

    pub fn get<C: Into<u8>>(&self, code: C) -> Option<&OptionValue> {
        self.entries.get(&code.into())
    }

    pub fn remove<C: Into<u8>>(&mut self, code: C) -> Option<OptionValue> {
        self.entries.remove(&code.into())
    }

    pub fn contains<C: Into<u8>>(&self, code: C) -> bool {
        self.entries.contains_key(&code.into())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &OptionValue)> {
        self.entries.iter().map(|(code, value)| (*code, value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes `payload` per the option table and stores the result.
    /// Unsupported codes and undecodable payloads are kept as `Raw`.
    pub fn decode_insert(&mut self, code: u8, payload: &[u8]) {
        let value = match descriptor(code) {
            Some(d) => match decode_value(code, d.kind, payload) {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("retaining option {} as raw bytes: {}", code, e);
                    OptionValue::Raw(payload.to_vec())
                }
            },
            None => OptionValue::Raw(payload.to_vec()),
        };
        self.insert(code, value);
    }

    pub fn message_type(&self) -> Option<MessageType> {
        match self.get(OptionCode::DhcpMessageType) {
            Some(OptionValue::MessageType(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn requested_ip_address(&self) -> Option<Ipv4Addr> {
        match self.get(OptionCode::RequestedIpAddress) {
            Some(OptionValue::Ip(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        match self.get(OptionCode::ServerIdentifier) {
            Some(OptionValue::Ip(addr)) => Some(*addr),
            _ => None,
        }
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        match self.get(OptionCode::ParameterRequestList) {
            Some(OptionValue::ParameterList(codes)) => Some(codes),
            _ => None,
        }
    }

    pub fn host_name(&self) -> Option<&str> {
        match self.get(OptionCode::HostName) {
            Some(OptionValue::Str(s)) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_then_decode_ip_is_equal_to_starting_value() {
        let value = OptionValue::Ip(Ipv4Addr::new(192, 168, 173, 6));
        let bytes = encode_value(50, ValueKind::Ip, &value).unwrap();
        assert_eq!(bytes, vec![192, 168, 173, 6]);
        assert_eq!(decode_value(50, ValueKind::Ip, &bytes), Ok(value));
    }

    #[test]
    fn test_encode_then_decode_ip_list_is_equal_to_starting_value() {
        let value = OptionValue::IpList(vec![
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(8, 8, 4, 4),
        ]);
        let bytes = encode_value(6, ValueKind::IpList, &value).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode_value(6, ValueKind::IpList, &bytes), Ok(value));
    }

    #[test]
    fn test_encode_then_decode_scalars_are_equal_to_starting_values() {
        for (kind, value, expected) in vec![
            (ValueKind::U8, OptionValue::U8(64), vec![64]),
            (ValueKind::U16, OptionValue::U16(1500), vec![5, 220]),
            (ValueKind::U32, OptionValue::U32(300), vec![0, 0, 1, 44]),
            (ValueKind::Bool, OptionValue::Bool(true), vec![1]),
        ] {
            let bytes = encode_value(0, kind, &value).unwrap();
            assert_eq!(bytes, expected);
            assert_eq!(decode_value(0, kind, &bytes), Ok(value));
        }
    }

    #[test]
    fn test_encode_then_decode_string_is_equal_to_starting_value() {
        let value = OptionValue::Str("laptop".to_string());
        let bytes = encode_value(12, ValueKind::Str, &value).unwrap();
        assert_eq!(decode_value(12, ValueKind::Str, &bytes), Ok(value));
    }

    #[test]
    fn test_encode_then_decode_parameter_list_preserves_order() {
        let value = OptionValue::ParameterList(vec![1, 3, 6, 15]);
        let bytes = encode_value(55, ValueKind::ParameterList, &value).unwrap();
        assert_eq!(bytes, vec![1, 3, 6, 15]);
        assert_eq!(decode_value(55, ValueKind::ParameterList, &bytes), Ok(value));
    }

    #[test]
    fn test_encode_then_decode_message_type_is_equal_to_starting_value() {
        let value = OptionValue::MessageType(MessageType::DHCPOFFER);
        let bytes = encode_value(53, ValueKind::MessageType, &value).unwrap();
        assert_eq!(bytes, vec![2]);
        assert_eq!(decode_value(53, ValueKind::MessageType, &bytes), Ok(value));
    }

    #[test]
    fn test_encode_with_mismatched_value_returns_error() {
        let value = OptionValue::Str("not an ip".to_string());
        assert_eq!(
            encode_value(1, ValueKind::Ip, &value),
            Err(ProtocolError::OptionEncoding(1))
        );
    }

    #[test]
    fn test_encode_with_raw_value_passes_through_any_kind() {
        let value = OptionValue::Raw(vec![0xDE, 0xAD]);
        assert_eq!(encode_value(1, ValueKind::Ip, &value), Ok(vec![0xDE, 0xAD]));
    }

    #[test]
    fn test_encode_with_oversized_payload_returns_error() {
        let value = OptionValue::Bytes(vec![0u8; 256]);
        assert_eq!(
            encode_value(61, ValueKind::Bytes, &value),
            Err(ProtocolError::OptionOversized(61))
        );
    }

    #[test]
    fn test_decode_with_bad_length_returns_error() {
        assert_eq!(
            decode_value(1, ValueKind::Ip, &[255, 255, 255]),
            Err(ProtocolError::OptionDecoding(1, 3))
        );
        assert_eq!(
            decode_value(3, ValueKind::IpList, &[192, 168, 1]),
            Err(ProtocolError::OptionDecoding(3, 3))
        );
        assert_eq!(
            decode_value(51, ValueKind::U32, &[0, 1]),
            Err(ProtocolError::OptionDecoding(51, 2))
        );
    }

    #[test]
    fn test_decode_insert_with_unknown_message_type_retains_raw_bytes() {
        let mut map = OptionMap::new();
        map.decode_insert(OptionCode::DhcpMessageType.into(), &[224]);
        assert_eq!(map.get(OptionCode::DhcpMessageType), Some(&OptionValue::Raw(vec![224])));
        assert_eq!(map.message_type(), None);
    }

    #[test]
    fn test_decode_insert_with_unknown_code_retains_raw_bytes() {
        let mut map = OptionMap::new();
        map.decode_insert(249, &[1, 2, 3]);
        assert_eq!(map.get(249u8), Some(&OptionValue::Raw(vec![1, 2, 3])));
    }

    #[test]
    fn test_decode_insert_with_duplicate_code_keeps_last_value() {
        let mut map = OptionMap::new();
        map.decode_insert(OptionCode::RequestedIpAddress.into(), &[10, 0, 0, 1]);
        map.decode_insert(OptionCode::RequestedIpAddress.into(), &[10, 0, 0, 2]);
        assert_eq!(map.requested_ip_address(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_descriptor_lookup_by_code_and_name_agree() {
        let by_code = descriptor(51).unwrap();
        let by_name = descriptor_by_name("ip_address_lease_time").unwrap();
        assert_eq!(by_code.code, by_name.code);
        assert_eq!(by_code.kind, ValueKind::U32);
    }

    #[test]
    fn test_descriptor_table_is_in_ascending_code_order() {
        let codes: Vec<u8> = DESCRIPTORS.iter().map(|d| d.code as u8).collect();
        let mut sorted = codes.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(codes, sorted);
    }
}

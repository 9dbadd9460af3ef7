// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! BOOTP/DHCP packet codec as defined in RFC 2131.

use crate::options::{self, OptionMap, OptionValue, ValueKind};
use byteorder::{BigEndian, ByteOrder};
use failure::Fail;
use num_derive::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

const OP_IDX: usize = 0;
const XID_IDX: usize = 4;
const SECS_IDX: usize = 8;
const FLAGS_IDX: usize = 10;
const CIADDR_IDX: usize = 12;
const YIADDR_IDX: usize = 16;
const SIADDR_IDX: usize = 20;
const GIADDR_IDX: usize = 24;
const CHADDR_IDX: usize = 28;
const SNAME_IDX: usize = 44;
const FILE_IDX: usize = 108;
const OPTIONS_START_IDX: usize = 236;

const ETHERNET_HTYPE: u8 = 1;
const ETHERNET_HLEN: u8 = 6;
const HOPS_DEFAULT: u8 = 0;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];

const UNUSED_CHADDR_BYTES: usize = 10;

const SNAME_LEN: usize = 64;
const FILE_LEN: usize = 128;

/// Bit 15 of the flags field requests a broadcast reply.
pub const BROADCAST_FLAG: u16 = 0x8000;

const OPTION_PAD: u8 = 0;
const OPTION_END: u8 = 255;

/// Errors produced while translating packets and options to and from their
/// wire form.
#[derive(Debug, Fail, PartialEq)]
pub enum ProtocolError {
    #[fail(display = "buffer of {} bytes is too short for a dhcp message", _0)]
    BufferTooShort(usize),

    #[fail(display = "unknown bootp op code: {}", _0)]
    UnknownOpCode(u8),

    #[fail(display = "invalid utf-8 in the {} field", _0)]
    InvalidUtf8(&'static str),

    #[fail(display = "invalid mac address: {}", _0)]
    InvalidMacAddr(String),

    #[fail(display = "option {} value is incompatible with its wire encoding", _0)]
    OptionEncoding(u8),

    #[fail(display = "option {} carries a malformed payload of {} bytes", _0, _1)]
    OptionDecoding(u8, usize),

    #[fail(display = "option {} payload exceeds the one byte length field", _0)]
    OptionOversized(u8),
}

/// An Ethernet hardware address.
///
/// Displays uppercase and colon-separated, the format the host database
/// stores.
#[derive(
    Copy, Clone, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct MacAddr {
    pub octets: [u8; 6],
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.octets;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| ProtocolError::InvalidMacAddr(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| ProtocolError::InvalidMacAddr(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ProtocolError::InvalidMacAddr(s.to_string()));
        }
        Ok(MacAddr { octets })
    }
}

/// A DHCP protocol op-code as defined in RFC 2131.
///
/// `OpCode::BOOTREQUEST` should only appear in protocol messages from the
/// client, and conversely `OpCode::BOOTREPLY` should only appear in messages
/// from the server.
#[derive(FromPrimitive, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum OpCode {
    BOOTREQUEST = 1,
    BOOTREPLY = 2,
}

impl Into<u8> for OpCode {
    fn into(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        <Self as num_traits::FromPrimitive>::from_u8(n).ok_or(n)
    }
}

/// A DHCP protocol message as defined in RFC 2131.
///
/// Field names follow the conventions outlined in the RFC. `htype`, `hlen`
/// and `hops` are not exposed; they are effectively constants for an
/// Ethernet-only server.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub op: OpCode,
    pub xid: u32,
    pub secs: u16,
    /// The full flags field; bit 15 is the broadcast bit.
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: MacAddr,
    /// `sname` should not exceed 64 characters.
    pub sname: String,
    /// `file` should not exceed 128 characters.
    pub file: String,
    pub options: OptionMap,
    /// The client's parameter request list, copied onto replies to drive
    /// option emission order. Not itself a wire field of this message.
    pub parameter_order: Vec<u8>,
}

impl Message {
    /// Instantiates a new `Message` with default field values.
    pub fn new() -> Self {
        Message {
            op: OpCode::BOOTREQUEST,
            xid: 0,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: MacAddr::default(),
            sname: String::new(),
            file: String::new(),
            options: OptionMap::new(),
            parameter_order: Vec::new(),
        }
    }

    pub fn broadcast_flag(&self) -> bool {
        self.flags & BROADCAST_FLAG != 0
    }

    pub fn dhcp_message_type(&self) -> Option<crate::options::MessageType> {
        self.options.message_type()
    }

    /// Instantiates a new `Message` from a byte buffer conforming to the
    /// DHCP protocol as defined in RFC 2131.
    ///
    /// Malformed options are retained as raw bytes; a missing or wrong magic
    /// cookie leaves the option area empty (plain BOOTP).
    pub fn from_buffer(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < OPTIONS_START_IDX {
            return Err(ProtocolError::BufferTooShort(buf.len()));
        }
        let (buf, opts) = buf.split_at(OPTIONS_START_IDX);

        let mut msg = Message::new();
        msg.op = OpCode::try_from(buf[OP_IDX]).map_err(ProtocolError::UnknownOpCode)?;
        msg.xid = BigEndian::read_u32(&buf[XID_IDX..SECS_IDX]);
        msg.secs = BigEndian::read_u16(&buf[SECS_IDX..FLAGS_IDX]);
        msg.flags = BigEndian::read_u16(&buf[FLAGS_IDX..CIADDR_IDX]);
        msg.ciaddr = ip_addr_from_buf_at(buf, CIADDR_IDX);
        msg.yiaddr = ip_addr_from_buf_at(buf, YIADDR_IDX);
        msg.siaddr = ip_addr_from_buf_at(buf, SIADDR_IDX);
        msg.giaddr = ip_addr_from_buf_at(buf, GIADDR_IDX);
        msg.chaddr.octets.copy_from_slice(&buf[CHADDR_IDX..CHADDR_IDX + 6]);
        msg.sname = buf_to_msg_string(&buf[SNAME_IDX..FILE_IDX], "sname")?;
        msg.file = buf_to_msg_string(&buf[FILE_IDX..], "file")?;

        if opts.len() >= MAGIC_COOKIE.len() {
            let (magic_cookie, opts) = opts.split_at(MAGIC_COOKIE.len());
            if magic_cookie == MAGIC_COOKIE {
                parse_options(opts, &mut msg.options);
            }
        }

        Ok(msg)
    }

    /// Serializes the `Message` into a buffer of bytes.
    ///
    /// Options are emitted in the order dictated by the client's parameter
    /// request list, then the remaining table-described options in ascending
    /// code order, then the remaining numerically-addressed options. Options
    /// whose value cannot be encoded are omitted; the packet is still
    /// produced.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(OPTIONS_START_IDX + 64);
        buffer.push(self.op.into());
        buffer.push(ETHERNET_HTYPE);
        buffer.push(ETHERNET_HLEN);
        buffer.push(HOPS_DEFAULT);
        buffer.extend_from_slice(&self.xid.to_be_bytes());
        buffer.extend_from_slice(&self.secs.to_be_bytes());
        buffer.extend_from_slice(&self.flags.to_be_bytes());
        buffer.extend_from_slice(&self.ciaddr.octets());
        buffer.extend_from_slice(&self.yiaddr.octets());
        buffer.extend_from_slice(&self.siaddr.octets());
        buffer.extend_from_slice(&self.giaddr.octets());
        buffer.extend_from_slice(&self.chaddr.octets);
        buffer.extend_from_slice(&[0u8; UNUSED_CHADDR_BYTES]);
        trunc_string_to_n_and_push(&self.sname, SNAME_LEN, &mut buffer);
        trunc_string_to_n_and_push(&self.file, FILE_LEN, &mut buffer);
        buffer.extend_from_slice(&MAGIC_COOKIE);
        for code in self.ordered_option_codes() {
            let value = match self.options.get(code) {
                Some(v) => v,
                None => continue,
            };
            let kind = options::descriptor(code).map(|d| d.kind).unwrap_or(ValueKind::Bytes);
            match options::encode_value(code, kind, value) {
                Ok(payload) => {
                    buffer.push(code);
                    buffer.push(payload.len() as u8);
                    buffer.extend_from_slice(&payload);
                }
                Err(e) => log::warn!("omitting option {}: {}", code, e),
            }
        }
        buffer.push(OPTION_END);
        buffer
    }

    /// Computes the option emission order: the client's wishes first, then
    /// the named table entries, then everything else, each without
    /// duplicates.
    fn ordered_option_codes(&self) -> Vec<u8> {
        let mut done: Vec<u8> = Vec::new();
        let mut push = |code: u8, done: &mut Vec<u8>| {
            if code != OPTION_PAD && code != OPTION_END && !done.contains(&code) {
                done.push(code);
            }
        };
        for &code in &self.parameter_order {
            if self.options.contains(code) {
                push(code, &mut done);
            }
        }
        for (code, _) in self.options.iter() {
            if options::descriptor(code).is_some() {
                push(code, &mut done);
            }
        }
        for (code, _) in self.options.iter() {
            push(code, &mut done);
        }
        done
    }
}

fn parse_options(mut buf: &[u8], out: &mut OptionMap) {
    loop {
        let (&code, rest) = match buf.split_first() {
            Some(split) => split,
            None => return,
        };
        buf = rest;
        match code {
            OPTION_END => return,
            OPTION_PAD => {}
            code => {
                let (&len, rest) = match buf.split_first() {
                    Some(split) => split,
                    None => return,
                };
                buf = rest;
                let len = len as usize;
                if buf.len() < len {
                    // Truncated record: keep what is left and stop walking.
                    out.insert(code, OptionValue::Raw(buf.to_vec()));
                    return;
                }
                let (payload, rest) = buf.split_at(len);
                buf = rest;
                out.decode_insert(code, payload);
            }
        }
    }
}

fn ip_addr_from_buf_at(buf: &[u8], start: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[start], buf[start + 1], buf[start + 2], buf[start + 3])
}

fn buf_to_msg_string(buf: &[u8], field: &'static str) -> Result<String, ProtocolError> {
    std::str::from_utf8(buf)
        .map(|s| s.trim_end_matches('\x00').to_string())
        .map_err(|_| ProtocolError::InvalidUtf8(field))
}

fn trunc_string_to_n_and_push(s: &str, n: usize, buffer: &mut Vec<u8>) {
    if s.len() > n {
        buffer.extend(s[..n].as_bytes());
        return;
    }
    buffer.extend(s.as_bytes());
    let old_len = buffer.len();
    buffer.resize(old_len + n - s.len(), 0);
}

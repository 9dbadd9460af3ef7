// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The DHCP server: per-transaction state machines, address allocation and
//! the UDP receive/broadcast plumbing.
//!
//! One receiver thread owns the port 67 socket and the transaction table;
//! replies are built later on the delay scheduler's worker and handed to a
//! [`PacketSink`], which broadcasts them from every configured interface.

use crate::configuration::ServerConfig;
use crate::netif;
use crate::options::{MessageType, OptionCode, OptionValue};
use crate::protocol::{Message, OpCode, CLIENT_PORT, SERVER_PORT};
use crate::scheduler::DelayScheduler;
use crate::store::{sorted_hosts, Host, HostPattern, HostStore, Pattern, StoreError};
use failure::{Fail, ResultExt};
use net2::UdpBuilder;
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A buffer size in excess of the maximum allowable DHCP message size.
const BUF_SZ: usize = 1024;
/// How long the receiver blocks before sweeping expired transactions.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// The server's clock, injectable for tests.
pub type TimeProvider = Arc<dyn Fn() -> i64 + Send + Sync>;

/// A `TimeProvider` reading the system clock as unix seconds.
pub fn system_time_provider() -> TimeProvider {
    Arc::new(|| match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    })
}

/// A wrapper around the error types which can be returned by the server
/// while handling a client message.
#[derive(Debug, Fail)]
pub enum ServerError {
    #[fail(display = "address pool exhausted and no lease is available for reuse")]
    AddressPoolExhausted,

    #[fail(display = "host store failure: {}", _0)]
    Store(#[cause] StoreError),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Store(e)
    }
}

/// Delivery of a finished reply. The production implementation broadcasts
/// on every local interface; tests capture the replies instead.
pub trait PacketSink: Send + Sync {
    fn send(&self, msg: &Message);
}

/// Broadcasts replies from each of the host's IPv4 addresses.
///
/// Every send opens a fresh socket with `SO_REUSEADDR` and `SO_BROADCAST`
/// bound to `(local_ip, 67)`, stamps the reply's server identifier with that
/// address, and sends to both the limited broadcast address and the local
/// address on port 68. The socket is closed immediately afterwards.
pub struct UdpBroadcaster {
    identifiers: Vec<Ipv4Addr>,
}

impl UdpBroadcaster {
    pub fn new(identifiers: Vec<Ipv4Addr>) -> Self {
        UdpBroadcaster { identifiers }
    }
}

impl PacketSink for UdpBroadcaster {
    fn send(&self, msg: &Message) {
        for &addr in &self.identifiers {
            if let Err(e) = broadcast_from(addr, msg) {
                log::warn!("broadcast from {} failed: {}", addr, e);
            }
        }
    }
}

/// Returns a copy of `msg` carrying `addr` as its server identifier.
fn stamp_server_identifier(msg: &Message, addr: Ipv4Addr) -> Message {
    let mut msg = msg.clone();
    msg.options.insert(OptionCode::ServerIdentifier, OptionValue::Ip(addr));
    msg
}

fn broadcast_from(addr: Ipv4Addr, msg: &Message) -> io::Result<()> {
    let bytes = stamp_server_identifier(msg, addr).serialize();
    let builder = UdpBuilder::new_v4()?;
    builder.reuse_address(true)?;
    let socket = builder.bind((addr, SERVER_PORT))?;
    socket.set_broadcast(true)?;
    socket.send_to(&bytes, (Ipv4Addr::BROADCAST, CLIENT_PORT))?;
    socket.send_to(&bytes, (addr, CLIENT_PORT))?;
    Ok(())
}

/// State shared by every task working on one server instance.
pub struct ServerCore {
    config: ServerConfig,
    hosts: HostStore,
    scheduler: DelayScheduler,
    sink: Box<dyn PacketSink>,
    time: TimeProvider,
    closed: AtomicBool,
    time_started: i64,
}

impl ServerCore {
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn now(&self) -> i64 {
        (*self.time)()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Cooperative shutdown: stops the receive loop at its next timeout and
    /// discards scheduled replies. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.scheduler.close();
    }

    /// Every known host, sorted for presentation.
    pub fn get_all_hosts(&self) -> Result<Vec<Host>, StoreError> {
        Ok(sorted_hosts(self.hosts.all()?))
    }

    /// The hosts served since this server instance started.
    pub fn get_current_hosts(&self) -> Result<Vec<Host>, StoreError> {
        let pattern = HostPattern {
            last_used: Pattern::Gt(self.time_started),
            ..HostPattern::default()
        };
        Ok(sorted_hosts(self.hosts.get(&pattern)?))
    }
}

/// Checks that `addr` lies inside the configured subnet: every octet
/// covered by a non-zero mask byte must agree with the network address.
pub fn is_valid_client_address(config: &ServerConfig, addr: Ipv4Addr) -> bool {
    if addr.is_unspecified() {
        return false;
    }
    let addr = addr.octets();
    let mask = config.subnet_mask.octets();
    let network = config.network.octets();
    (0..4).all(|i| mask[i] == 0 || addr[i] == network[i])
}

/// Selects an address for the client behind `msg` and records the binding.
///
/// The policy, in order: the last stored binding for this MAC that is still
/// inside the subnet; the address the client requested, when acceptable; the
/// first free pool address; the least recently used in-network lease. After
/// selection the store holds exactly one record for the `(mac, ip)` pair.
pub fn get_ip_address(core: &ServerCore, msg: &Message) -> Result<Ipv4Addr, ServerError> {
    let mac = msg.chaddr;
    let known_hosts =
        core.hosts.get(&HostPattern::with_mac(Pattern::CaseInsensitiveEq(mac.to_string())))?;

    // 1. choose the known ip address; the last record wins because appends
    // are how updates happen.
    let mut ip = None;
    for host in &known_hosts {
        if is_valid_client_address(&core.config, host.ip) {
            ip = Some(host.ip);
        }
    }
    if let Some(known) = ip {
        log::debug!("known ip: {}", known);
    }

    // 2. choose the valid requested ip address
    if ip.is_none() {
        if let Some(requested) = msg.options.requested_ip_address() {
            if is_valid_client_address(&core.config, requested) {
                log::debug!("valid requested ip: {}", requested);
                ip = Some(requested);
            }
        }
    }

    let chosen = match ip {
        Some(ip) => ip,
        None => {
            // 3. choose a new, free ip address
            let mut network_hosts =
                core.hosts.get(&HostPattern::with_ip(core.config.network_filter()))?;
            let free = core
                .config
                .pool()
                .find(|candidate| !network_hosts.iter().any(|h| h.ip == *candidate));
            let picked = match free {
                Some(addr) => addr,
                None => {
                    // 4. reuse the old ip address least recently used;
                    // the stable sort keeps insertion order among ties.
                    network_hosts.sort_by_key(|h| h.last_used);
                    match network_hosts.first() {
                        Some(host) => host.ip,
                        None => return Err(ServerError::AddressPoolExhausted),
                    }
                }
            };
            log::debug!("new ip: {}", picked);
            picked
        }
    };

    if !known_hosts.iter().any(|h| h.ip == chosen) {
        let hostname = msg.options.host_name().unwrap_or("").to_string();
        core.hosts.replace(&Host::new(mac, chosen, hostname, core.now()))?;
    }
    Ok(chosen)
}

/// Records the binding a client has committed to (REQUEST or INFORM).
fn client_has_chosen(core: &ServerCore, msg: &Message) -> Result<(), ServerError> {
    let ip = msg.options.requested_ip_address().unwrap_or(msg.ciaddr);
    let host = Host::new(
        msg.chaddr,
        ip,
        msg.options.host_name().unwrap_or("").to_string(),
        core.now(),
    );
    if !host.has_valid_ip() {
        return Ok(());
    }
    core.hosts.replace(&host)?;
    Ok(())
}

/// Builds the skeleton of a reply to `client`: the configured option set
/// plus the message type, with the client's xid, flags, addresses and
/// hardware address copied over. The client's parameter request list drives
/// the reply's option order.
fn build_reply(core: &ServerCore, client: &Message, msg_type: MessageType) -> Message {
    let mut reply = Message::new();
    reply.op = OpCode::BOOTREPLY;
    reply.xid = client.xid;
    reply.flags = client.flags;
    reply.ciaddr = client.ciaddr;
    reply.giaddr = client.giaddr;
    reply.chaddr = client.chaddr;
    reply.options = core.config.reply_options();
    reply.options.insert(OptionCode::DhcpMessageType, OptionValue::MessageType(msg_type));
    reply.parameter_order = client.options.parameter_request_list().unwrap_or(&[]).to_vec();
    reply
}

fn send_offer(core: &ServerCore, discover: &Message) -> Result<(), ServerError> {
    let ip = get_ip_address(core, discover)?;
    let mut offer = build_reply(core, discover, MessageType::DHCPOFFER);
    offer.yiaddr = ip;
    offer.options.insert(
        OptionCode::ClientIdentifier,
        OptionValue::Bytes(discover.chaddr.octets.to_vec()),
    );
    log::info!("offering {} to {} (xid {:08x})", ip, discover.chaddr, discover.xid);
    core.sink.send(&offer);
    Ok(())
}

fn send_ack(core: &ServerCore, request: &Message) -> Result<(), ServerError> {
    client_has_chosen(core, request)?;
    let ip = get_ip_address(core, request)?;
    let mut ack = build_reply(core, request, MessageType::DHCPACK);
    ack.yiaddr = ip;
    log::info!("acknowledging {} for {} (xid {:08x})", ip, request.chaddr, request.xid);
    core.sink.send(&ack);
    Ok(())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum TransactionState {
    New,
    Offered,
    Requested,
    Done,
}

struct TransactionShared {
    xid: u32,
    done_at: i64,
    state: Mutex<TransactionState>,
}

impl TransactionShared {
    fn is_done(&self, now: i64) -> bool {
        if now >= self.done_at {
            return true;
        }
        match self.state.lock() {
            Ok(state) => *state == TransactionState::Done,
            Err(_) => true,
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = TransactionState::Done;
        }
    }

    fn advance_to_offered(&self) -> bool {
        match self.state.lock() {
            Ok(mut state) if *state == TransactionState::New => {
                *state = TransactionState::Offered;
                true
            }
            _ => false,
        }
    }

    fn advance_to_requested(&self) -> bool {
        match self.state.lock() {
            Ok(mut state)
                if *state == TransactionState::New || *state == TransactionState::Offered =>
            {
                *state = TransactionState::Requested;
                true
            }
            _ => false,
        }
    }
}

/// One client conversation, keyed by xid.
///
/// A transaction is created on the first unseen xid, reacts to at most one
/// DISCOVER and one REQUEST, and self-terminates `length_of_transaction`
/// seconds after creation.
pub struct Transaction {
    shared: Arc<TransactionShared>,
}

impl Transaction {
    fn new(xid: u32, now: i64, length_of_transaction: i64) -> Self {
        Transaction {
            shared: Arc::new(TransactionShared {
                xid,
                done_at: now + length_of_transaction,
                state: Mutex::new(TransactionState::New),
            }),
        }
    }

    pub fn is_done(&self, now: i64) -> bool {
        self.shared.is_done(now)
    }

    /// Feeds one inbound packet to the state machine. Returns false when
    /// the message type is not one this server handles, so the caller can
    /// log it.
    pub fn receive(&self, core: &Arc<ServerCore>, msg: Message) -> bool {
        let msg_type = match msg.dhcp_message_type() {
            Some(t) => t,
            None => return false,
        };
        match msg_type {
            MessageType::DHCPDISCOVER => {
                if !self.shared.advance_to_offered() {
                    // A repeated discover for an in-flight transaction
                    // produces no second offer.
                    return true;
                }
                let shared = Arc::clone(&self.shared);
                let core_for_closure = Arc::clone(core);
                let delay = Duration::from_secs(core.config.dhcp_offer_after_seconds);
                core.scheduler.schedule_after(delay, move || {
                    if shared.is_done(core_for_closure.now()) {
                        return;
                    }
                    if let Err(e) = send_offer(&core_for_closure, &msg) {
                        log::warn!("transaction {:08x}: dropping offer: {}", shared.xid, e);
                        shared.close();
                    }
                });
                true
            }
            MessageType::DHCPREQUEST => {
                if !self.shared.advance_to_requested() {
                    return true;
                }
                let shared = Arc::clone(&self.shared);
                let core_for_closure = Arc::clone(core);
                let delay = Duration::from_secs(core.config.dhcp_acknowledge_after_seconds);
                core.scheduler.schedule_after(delay, move || {
                    if shared.is_done(core_for_closure.now()) {
                        return;
                    }
                    if let Err(e) = send_ack(&core_for_closure, &msg) {
                        log::warn!(
                            "transaction {:08x}: dropping acknowledge: {}",
                            shared.xid,
                            e
                        );
                    }
                    shared.close();
                });
                true
            }
            MessageType::DHCPINFORM => {
                if let Err(e) = client_has_chosen(core, &msg) {
                    log::warn!("transaction {:08x}: inform not recorded: {}", msg.xid, e);
                }
                self.shared.close();
                true
            }
            _ => false,
        }
    }
}

/// The per-xid transaction table. Mutated only by the receiver task.
pub struct TransactionTable {
    transactions: HashMap<u32, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        TransactionTable { transactions: HashMap::new() }
    }

    pub fn get_or_create(&mut self, xid: u32, core: &ServerCore) -> &Transaction {
        let now = core.now();
        let length = core.config.length_of_transaction;
        self.transactions.entry(xid).or_insert_with(|| Transaction::new(xid, now, length))
    }

    /// Drops every transaction that finished or outlived its window.
    pub fn sweep(&mut self, now: i64) {
        self.transactions.retain(|_, txn| !txn.is_done(now));
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }
}

/// A handle for controlling and inspecting a running server from another
/// thread.
#[derive(Clone)]
pub struct ServerHandle {
    core: Arc<ServerCore>,
}

impl ServerHandle {
    pub fn close(&self) {
        self.core.close()
    }

    pub fn get_all_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.core.get_all_hosts()
    }

    pub fn get_current_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.core.get_current_hosts()
    }
}

/// The DHCP server: binds UDP port 67 on all interfaces and serves until
/// closed.
pub struct Server {
    core: Arc<ServerCore>,
    transactions: TransactionTable,
    socket: UdpSocket,
}

impl Server {
    /// Creates a server from `config`, probing local interfaces for the
    /// broadcast sources unless the configuration names them. Failure to
    /// bind the server port is fatal.
    pub fn new(config: ServerConfig) -> Result<Server, failure::Error> {
        let identifiers = config
            .server_identifiers
            .clone()
            .unwrap_or_else(netif::local_ipv4_addresses);
        log::info!("server identifiers: {:?}", identifiers);
        Server::with_parts(config, Box::new(UdpBroadcaster::new(identifiers)), system_time_provider())
    }

    /// Creates a server with an explicit reply sink and clock.
    pub fn with_parts(
        config: ServerConfig,
        sink: Box<dyn PacketSink>,
        time: TimeProvider,
    ) -> Result<Server, failure::Error> {
        let hosts = HostStore::open(&config.host_file).context("unable to open host database")?;
        let builder = UdpBuilder::new_v4().context("unable to create server socket")?;
        builder.reuse_address(true).context("unable to set SO_REUSEADDR")?;
        let socket = builder
            .bind((Ipv4Addr::UNSPECIFIED, SERVER_PORT))
            .context("unable to bind udp port 67")?;
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .context("unable to set the socket read timeout")?;
        socket.set_broadcast(true).context("unable to set SO_BROADCAST")?;
        let time_started = (*time)();
        let core = Arc::new(ServerCore {
            config,
            hosts,
            scheduler: DelayScheduler::new(),
            sink,
            time,
            closed: AtomicBool::new(false),
            time_started,
        });
        Ok(Server { core, transactions: TransactionTable::new(), socket })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle { core: Arc::clone(&self.core) }
    }

    /// Serves until the handle is closed. Receive errors are logged and the
    /// loop keeps going; expired transactions are swept once per wakeup.
    pub fn run(&mut self) {
        log::info!("listening on 0.0.0.0:{}", SERVER_PORT);
        let mut buf = [0u8; BUF_SZ];
        while !self.core.is_closed() {
            match self.socket.recv_from(&mut buf) {
                Ok((received, sender)) => {
                    log::debug!("received {} bytes from {}", received, sender);
                    self.handle_datagram(&buf[..received]);
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {}
                    _ => {
                        if self.core.is_closed() {
                            break;
                        }
                        log::error!("socket receive failure: {}", e);
                    }
                },
            }
            self.transactions.sweep(self.core.now());
        }
        self.core.close();
        log::info!("server loop stopped");
    }

    /// Runs the receive loop on its own thread.
    pub fn run_in_thread(mut self) -> io::Result<(ServerHandle, JoinHandle<()>)> {
        let handle = self.handle();
        let thread = thread::Builder::new()
            .name("dhcp-server".to_string())
            .spawn(move || self.run())?;
        Ok((handle, thread))
    }

    fn handle_datagram(&mut self, buf: &[u8]) {
        let msg = match Message::from_buffer(buf) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("dropping malformed packet: {}", e);
                return;
            }
        };
        if msg.op != OpCode::BOOTREQUEST {
            log::debug!("ignoring non-request message with xid {:08x}", msg.xid);
            return;
        }
        let core = Arc::clone(&self.core);
        let xid = msg.xid;
        if !self.transactions.get_or_create(xid, &core).receive(&core, msg) {
            log::debug!("received unhandled message with xid {:08x}", xid);
        }
    }
}

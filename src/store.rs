// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Flat-file persistence of host records.
//!
//! The database is a plain-text file with one `MAC;IP;HOSTNAME;EPOCH` record
//! per line. Lookups run a [`HostPattern`] over every record; mutations are
//! serialized through one exclusive lock, and deletions rewrite the file
//! through a temporary sibling that is atomically renamed into place.

use crate::protocol::MacAddr;
use failure::Fail;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const DELIMITER: char = ';';

#[derive(Debug, Fail)]
pub enum StoreError {
    #[fail(display = "host database io error: {}", _0)]
    Io(#[cause] io::Error),

    #[fail(display = "malformed host record: {:?}", _0)]
    CorruptRecord(String),

    #[fail(display = "host database lock poisoned")]
    Poisoned,
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// A known host: one MAC to IP binding with the client's reported hostname
/// and the time the binding was last handed out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Host {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub last_used: i64,
}

impl Host {
    pub fn new(mac: MacAddr, ip: Ipv4Addr, hostname: String, last_used: i64) -> Self {
        Host { mac, ip, hostname, last_used }
    }

    pub fn has_valid_ip(&self) -> bool {
        !self.ip.is_unspecified()
    }

    /// The pattern identifying this host for replace and delete: exact MAC
    /// and exact IP, any hostname, any timestamp.
    pub fn identity(&self) -> HostPattern {
        HostPattern {
            mac: Pattern::Eq(self.mac.to_string()),
            ip: Pattern::Eq(self.ip.to_string()),
            ..HostPattern::default()
        }
    }

    fn to_record(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}",
            self.mac, DELIMITER, self.ip, DELIMITER, self.hostname, DELIMITER, self.last_used
        )
    }

    fn from_record(line: &str) -> Result<Self, StoreError> {
        let fields: Vec<&str> = line.split(DELIMITER).collect();
        if fields.len() != 4 {
            return Err(StoreError::CorruptRecord(line.to_string()));
        }
        let mac = fields[0]
            .parse::<MacAddr>()
            .map_err(|_| StoreError::CorruptRecord(line.to_string()))?;
        let ip = fields[1]
            .parse::<Ipv4Addr>()
            .map_err(|_| StoreError::CorruptRecord(line.to_string()))?;
        let last_used = fields[3]
            .parse::<i64>()
            .map_err(|_| StoreError::CorruptRecord(line.to_string()))?;
        Ok(Host { mac, ip, hostname: fields[2].to_string(), last_used })
    }
}

/// A wildcard comparator applied to one stored field.
///
/// Every variant answers the same question through [`Pattern::matches`]:
/// does this record field satisfy the pattern?
#[derive(Clone, Debug)]
pub enum Pattern {
    /// Matches any value.
    Any,
    Eq(String),
    CaseInsensitiveEq(String),
    /// Numeric comparison of the stored field.
    Gt(i64),
    /// `(ip & mask) == (net & mask)`, excluding the network address itself
    /// and the directed broadcast address.
    InNetwork(Ipv4Addr, Ipv4Addr),
}

impl Pattern {
    pub fn matches(&self, field: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Eq(s) => s == field,
            Pattern::CaseInsensitiveEq(s) => s.to_lowercase() == field.to_lowercase(),
            Pattern::Gt(threshold) => match field.parse::<i64>() {
                Ok(n) => n > *threshold,
                Err(_) => false,
            },
            Pattern::InNetwork(net, mask) => match field.parse::<Ipv4Addr>() {
                Ok(ip) => {
                    let ip = u32::from(ip);
                    let mask = u32::from(*mask);
                    let network = u32::from(*net) & mask;
                    let broadcast = network | !mask;
                    ip & mask == network && ip != network && ip != broadcast
                }
                Err(_) => false,
            },
        }
    }
}

/// The 4-tuple of per-field comparators a lookup runs over each record.
#[derive(Clone, Debug)]
pub struct HostPattern {
    pub mac: Pattern,
    pub ip: Pattern,
    pub hostname: Pattern,
    pub last_used: Pattern,
}

impl Default for HostPattern {
    fn default() -> Self {
        HostPattern {
            mac: Pattern::Any,
            ip: Pattern::Any,
            hostname: Pattern::Any,
            last_used: Pattern::Any,
        }
    }
}

impl HostPattern {
    pub fn with_mac(mac: Pattern) -> Self {
        HostPattern { mac, ..HostPattern::default() }
    }

    pub fn with_ip(ip: Pattern) -> Self {
        HostPattern { ip, ..HostPattern::default() }
    }

    pub fn matches(&self, host: &Host) -> bool {
        self.mac.matches(&host.mac.to_string())
            && self.ip.matches(&host.ip.to_string())
            && self.hostname.matches(&host.hostname)
            && self.last_used.matches(&host.last_used.to_string())
    }
}

/// The host database.
pub struct HostStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HostStore {
    /// Opens the database at `path`, creating the file if it is absent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new().append(true).create(true).open(&path)?;
        Ok(HostStore { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns every record in file order.
    pub fn all(&self) -> Result<Vec<Host>, StoreError> {
        let guard = self.lock()?;
        self.load(&guard)
    }

    /// Returns the records matching `pattern`, in file order.
    pub fn get(&self, pattern: &HostPattern) -> Result<Vec<Host>, StoreError> {
        let guard = self.lock()?;
        let hosts = self.load(&guard)?;
        Ok(hosts.into_iter().filter(|h| pattern.matches(h)).collect())
    }

    /// Appends one record. No dedup.
    pub fn add(&self, host: &Host) -> Result<(), StoreError> {
        let _guard = self.lock()?;
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        writeln!(file, "{}", host.to_record())?;
        Ok(())
    }

    /// Removes every record matching `pattern`, returning how many were
    /// dropped. The file is rewritten through a temporary sibling and
    /// renamed so concurrent readers never observe a partial database.
    pub fn delete(&self, pattern: &HostPattern) -> Result<usize, StoreError> {
        let guard = self.lock()?;
        self.delete_locked(pattern, &guard)
    }

    /// Removes any record with this host's `(mac, ip)` identity, then
    /// appends the host.
    pub fn replace(&self, host: &Host) -> Result<(), StoreError> {
        let guard = self.lock()?;
        self.delete_locked(&host.identity(), &guard)?;
        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        writeln!(file, "{}", host.to_record())?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn load(&self, _guard: &MutexGuard<'_, ()>) -> Result<Vec<Host>, StoreError> {
        let file = File::open(&self.path)?;
        let mut hosts = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            hosts.push(Host::from_record(&line)?);
        }
        Ok(hosts)
    }

    fn delete_locked(
        &self,
        pattern: &HostPattern,
        guard: &MutexGuard<'_, ()>,
    ) -> Result<usize, StoreError> {
        let hosts = self.load(guard)?;
        let (dropped, kept): (Vec<&Host>, Vec<&Host>) =
            hosts.iter().partition(|h| pattern.matches(h));
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            for host in &kept {
                writeln!(file, "{}", host.to_record())?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(dropped.len())
    }
}

/// Sorts hosts the way the operator-facing views present them.
pub fn sorted_hosts(mut hosts: Vec<Host>) -> Vec<Host> {
    hosts.sort_by_key(|h| {
        (h.hostname.to_lowercase(), h.mac.to_string().to_lowercase(), h.ip.to_string())
    });
    hosts
}

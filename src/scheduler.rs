// Copyright 2026 The dhcpd Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delayed dispatch of server responses.
//!
//! A single worker thread drains a min-heap of `(fire_at, seq, callback)`
//! entries. Entries with equal fire times run in insertion order; the `seq`
//! counter exists solely for that tie-break. Shutdown is cooperative:
//! closing the scheduler discards pending work and no new work is accepted.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    fire_at: Instant,
    seq: u64,
    callback: Callback,
}

// BinaryHeap is a max-heap; the reversed ordering makes the earliest
// (fire_at, seq) the top of the heap.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct State {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    wakeup: Condvar,
}

/// A min-heap of delayed callbacks executed by one worker thread.
pub struct DelayScheduler {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl DelayScheduler {
    pub fn new() -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State { queue: BinaryHeap::new(), next_seq: 0, closed: false }),
            wakeup: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("dhcp-delay".to_string())
            .spawn(move || worker_loop(&worker_inner))
            .ok();
        if worker.is_none() {
            log::error!("failed to spawn the delay worker; delayed responses will not fire");
        }
        DelayScheduler { inner, worker }
    }

    /// Queues `callback` to run `delay` from now. Returns false if the
    /// scheduler is already closed, in which case the callback is dropped.
    pub fn schedule_after<F>(&self, delay: Duration, callback: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        if state.closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Entry {
            fire_at: Instant::now() + delay,
            seq,
            callback: Box::new(callback),
        });
        self.inner.wakeup.notify_one();
        true
    }

    /// Number of entries waiting to fire.
    pub fn pending(&self) -> usize {
        match self.inner.state.lock() {
            Ok(state) => state.queue.len(),
            Err(_) => 0,
        }
    }

    /// Stops the worker and discards pending entries. Idempotent.
    pub fn close(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            state.closed = true;
            state.queue.clear();
        }
        self.inner.wakeup.notify_all();
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.close();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: &Inner) {
    let mut state = match inner.state.lock() {
        Ok(state) => state,
        Err(_) => return,
    };
    loop {
        if state.closed {
            return;
        }
        let now = Instant::now();
        let due = match state.queue.peek() {
            None => None,
            Some(entry) => Some(entry.fire_at),
        };
        match due {
            None => {
                state = match inner.wakeup.wait(state) {
                    Ok(state) => state,
                    Err(_) => return,
                };
            }
            Some(fire_at) if fire_at <= now => {
                let entry = match state.queue.pop() {
                    Some(entry) => entry,
                    None => continue,
                };
                drop(state);
                if panic::catch_unwind(AssertUnwindSafe(entry.callback)).is_err() {
                    log::error!("delayed response task panicked");
                }
                state = match inner.state.lock() {
                    Ok(state) => state,
                    Err(_) => return,
                };
            }
            Some(fire_at) => {
                // Early wakeups land back here and re-check the heap top.
                state = match inner.wakeup.wait_timeout(state, fire_at - now) {
                    Ok((state, _)) => state,
                    Err(_) => return,
                };
            }
        }
    }
}

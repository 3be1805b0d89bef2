//! Table of outstanding calls.
//!
//! Keyed by method name, then sequence number. A sequence number is only
//! unique within its name while the call is outstanding: the next one is
//! the current maximum plus one, or 0 when nothing is outstanding for that
//! name. Numbers are reused once a name drains.
//!
//! Every entry also carries a table-wide call id. A timer only expires the
//! entry with its own id, so a timer that already woke up can never settle
//! a newer call that reused the same `(name, seq)`.
//!
//! Once closed the table accepts no new calls. Closing and inserting both
//! happen under the table's lock, so a call is either drained by the close
//! or refused by it.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Where a call's result goes.
pub type Reply = oneshot::Sender<Result<Value>>;

/// One outstanding call.
pub struct PendingCall {
    id: u64,
    reply: Reply,
    timer: Option<JoinHandle<()>>,
}

impl PendingCall {
    /// Deliver the result and cancel the timer.
    pub fn settle(self, result: Result<Value>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }

    /// Deliver the result from inside the call's own timer task.
    pub fn expire(mut self, result: Result<Value>) {
        self.timer = None;
        self.settle(result);
    }

    /// Drop without a result, cancelling the timer.
    pub fn discard(self) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
    }
}

/// Outstanding calls by method name and sequence number.
#[derive(Default)]
pub struct PendingTable {
    calls: HashMap<String, BTreeMap<u64, PendingCall>>,
    next_id: u64,
    closed: bool,
}

impl PendingTable {
    /// Sequence number the next call to `name` gets.
    pub fn next_seq(&self, name: &str) -> u64 {
        self.calls
            .get(name)
            .and_then(|calls| calls.keys().next_back())
            .map_or(0, |max| max + 1)
    }

    /// Register a call under the next sequence number for `name`.
    ///
    /// `timer` receives the seq and call id and returns the timeout task,
    /// if any. Returns `(seq, id)`, or `None` once the table is closed.
    pub fn insert<T>(&mut self, name: &str, reply: Reply, timer: T) -> Option<(u64, u64)>
    where
        T: FnOnce(u64, u64) -> Option<JoinHandle<()>>,
    {
        if self.closed {
            return None;
        }

        let seq = self.next_seq(name);
        let id = self.next_id;
        self.next_id += 1;

        let call = PendingCall {
            id,
            reply,
            timer: timer(seq, id),
        };
        self.calls
            .entry(name.to_owned())
            .or_default()
            .insert(seq, call);
        Some((seq, id))
    }

    /// Remove a call, if still outstanding.
    pub fn take(&mut self, name: &str, seq: u64) -> Option<PendingCall> {
        self.take_if(name, seq, |_| true)
    }

    /// Remove a call only if it is the one with `id`.
    pub fn take_id(&mut self, name: &str, seq: u64, id: u64) -> Option<PendingCall> {
        self.take_if(name, seq, |call| call.id == id)
    }

    fn take_if<P>(&mut self, name: &str, seq: u64, predicate: P) -> Option<PendingCall>
    where
        P: FnOnce(&PendingCall) -> bool,
    {
        let calls = self.calls.get_mut(name)?;
        if !predicate(calls.get(&seq)?) {
            return None;
        }

        let call = calls.remove(&seq);
        if calls.is_empty() {
            self.calls.remove(name);
        }
        call
    }

    /// Refuse new calls and remove every outstanding one.
    pub fn close(&mut self) -> Vec<(String, u64, PendingCall)> {
        self.closed = true;
        self.calls
            .drain()
            .flat_map(|(name, calls)| {
                calls
                    .into_iter()
                    .map(move |(seq, call)| (name.clone(), seq, call))
            })
            .collect()
    }

    /// Number of outstanding calls across all names.
    pub fn len(&self) -> usize {
        self.calls.values().map(BTreeMap::len).sum()
    }
}

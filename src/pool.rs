/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::counter::Counter;
use log::{debug, warn};
use sha1::{Digest, Sha1};
use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Identity of an upstream hostname in the pool's host index.
///
/// The full digest is the identity: two hostnames are considered the same
/// origin only when all twenty bytes match. The port is not part of the
/// hash and is checked separately during bucket scans.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HostHash([u8; 20]);

impl HostHash {
    pub fn from_hostname(hostname: &str) -> Self {
        let mut h = Sha1::new();
        h.update(hostname.as_bytes());

        Self(h.finalize().into())
    }
}

/// How an idle connection may be matched against a reuse request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MatchPolicy {
    /// Pooling disabled. Acquire always misses; release always closes.
    None,
    /// Match on remote address and port only.
    Ip,
    /// Match on hostname hash, with the port checked during the scan.
    Host,
    /// Match only when both the address and the hostname hash agree.
    Both,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionState {
    Init,
    InUse,
    KaShared,
    ToRelease,
    Closed,
}

/// Notification from the network layer about a pooled idle connection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoEvent {
    /// The peer sent bytes while the connection was idle.
    ReadReady,
    Eos,
    Error,
    InactivityTimeout,
    ActiveTimeout,
}

#[derive(PartialEq, Eq, Debug)]
pub enum EventOutcome {
    /// The entry was removed from the pool and its connection closed.
    Closed,
    /// The entry stayed pooled with its timeouts re-armed.
    Rearmed,
    /// No pooled entry matched the notification.
    NotFound,
}

/// The network-layer seam. The pool drives connection teardown and idle
/// watching through this trait and never touches sockets itself.
pub trait PoolableConnection {
    fn remote_addr(&self) -> SocketAddr;

    /// Stable identifier used to locate an entry from an event
    /// notification. Unique among live connections.
    fn connection_id(&self) -> u64;

    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// Arms or re-arms the keep-alive idle timeout.
    fn refresh_inactivity_timeout(&mut self);

    fn cancel_active_timeout(&mut self);

    /// Enables or disables read-watching while the connection sits idle,
    /// so peer activity on a pooled connection reaches the event handler.
    fn set_idle_watch(&mut self, enabled: bool);
}

/// Connections to one origin sharing a minimum-keep-alive policy. While
/// the pooled count is at or below the minimum, idle timeouts re-arm
/// instead of closing.
pub struct OriginGroup {
    min_keep_alive: usize,
    pooled: Counter,
}

impl OriginGroup {
    pub fn new(min_keep_alive: usize) -> Arc<Self> {
        Arc::new(Self {
            min_keep_alive,
            pooled: Counter::default(),
        })
    }

    pub fn pooled_count(&self) -> usize {
        self.pooled.value()
    }
}

/// Fire-and-forget pool counters. Shared with whatever sink the embedding
/// process wires up; absence never affects pool behavior.
#[derive(Default)]
pub struct PoolMetrics {
    pub pooled: Counter,
    pub total_acquired: Counter,
    pub total_released: Counter,
}

/// An upstream connection together with its pooling state and transaction
/// accounting.
pub struct SessionEntry<C> {
    conn: C,
    host_hash: HostHash,
    state: SessionState,
    transact_count: usize,
    released_transactions: usize,
    group: Option<Arc<OriginGroup>>,
}

impl<C: PoolableConnection> SessionEntry<C> {
    pub fn new(conn: C, host_hash: HostHash) -> Self {
        Self {
            conn,
            host_hash,
            state: SessionState::Init,
            transact_count: 0,
            released_transactions: 0,
            group: None,
        }
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn host_hash(&self) -> HostHash {
        self.host_hash
    }

    pub fn attach_group(&mut self, group: Arc<OriginGroup>) {
        self.group = Some(group);
    }

    pub fn transact_count(&self) -> usize {
        self.transact_count
    }

    /// Hands the connection to a transaction.
    pub fn start_transaction(&mut self) {
        self.state = SessionState::InUse;
        self.transact_count += 1;
    }

    /// Records that a transaction no longer references this entry.
    pub fn finish_transaction(&mut self) {
        assert!(self.released_transactions < self.transact_count);

        self.released_transactions += 1;
    }

    pub fn mark_to_release(&mut self) {
        self.state = SessionState::ToRelease;
    }

    /// Closes the connection. The entry's resources may only be freed once
    /// `can_destroy` also holds.
    pub fn close(&mut self) {
        if !self.conn.is_closed() {
            self.conn.close();
        }

        self.state = SessionState::Closed;
    }

    /// Whether the entry may be destroyed: closed, with no transaction
    /// still believing it owns the connection.
    pub fn can_destroy(&self) -> bool {
        self.state == SessionState::Closed && self.transact_count == self.released_transactions
    }
}

/// Idle upstream connections indexed by remote address and by hostname
/// hash simultaneously. One arena of entries, two index maps over it; all
/// mutations update both maps before returning, so no caller can observe
/// an entry in one index but not the other.
///
/// Reuse order is LIFO: the most recently released connection to a key is
/// handed out first, keeping the working set warm.
pub struct ServerSessionPool<C> {
    entries: Slab<SessionEntry<C>>,
    by_addr: HashMap<SocketAddr, Vec<usize>>,
    by_host: HashMap<HostHash, Vec<usize>>,
    metrics: Option<Arc<PoolMetrics>>,
}

impl<C: PoolableConnection> ServerSessionPool<C> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            by_addr: HashMap::with_capacity(capacity),
            by_host: HashMap::with_capacity(capacity),
            metrics: None,
        }
    }

    pub fn set_metrics(&mut self, metrics: Arc<PoolMetrics>) {
        self.metrics = Some(metrics);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pools an idle connection: arms its keep-alive timeouts, enables
    /// idle watching, and inserts it into both indexes.
    pub fn release(&mut self, mut entry: SessionEntry<C>) {
        assert!(!entry.conn.is_closed());

        entry.state = SessionState::KaShared;
        entry.conn.set_idle_watch(true);
        entry.conn.refresh_inactivity_timeout();
        entry.conn.cancel_active_timeout();

        let addr = entry.conn.remote_addr();
        let host_hash = entry.host_hash;

        if let Some(group) = &entry.group {
            group.pooled.try_inc(1);
        }

        let idx = self.entries.insert(entry);

        self.by_addr.entry(addr).or_default().push(idx);
        self.by_host.entry(host_hash).or_default().push(idx);

        if let Some(m) = &self.metrics {
            m.pooled.try_inc(1);
            m.total_released.try_inc(1);
        }

        debug!("pool: released connection to {}", addr);
    }

    /// Finds and detaches a pooled connection matching the request under
    /// `policy`, or None. A hit leaves both indexes before this returns,
    /// so no other caller can also match it.
    pub fn acquire(
        &mut self,
        addr: SocketAddr,
        host_hash: HostHash,
        policy: MatchPolicy,
    ) -> Option<SessionEntry<C>> {
        let idx = match policy {
            MatchPolicy::None => None,
            MatchPolicy::Host => {
                // the host index does not encode the port
                let bucket = self.by_host.get(&host_hash)?;

                bucket
                    .iter()
                    .rev()
                    .copied()
                    .find(|&i| self.entries[i].conn.remote_addr().port() == addr.port())
            }
            MatchPolicy::Ip => self.by_addr.get(&addr)?.last().copied(),
            MatchPolicy::Both => {
                let bucket = self.by_addr.get(&addr)?;

                bucket
                    .iter()
                    .rev()
                    .copied()
                    .find(|&i| self.entries[i].host_hash == host_hash)
            }
        }?;

        self.unindex(idx);

        let mut entry = self.entries.remove(idx);

        entry.state = SessionState::InUse;
        entry.conn.set_idle_watch(false);

        if let Some(group) = &entry.group {
            group.pooled.try_dec(1);
        }

        if let Some(m) = &self.metrics {
            m.pooled.try_dec(1);
            m.total_acquired.try_inc(1);
        }

        debug!("pool: reusing connection to {}", addr);

        Some(entry)
    }

    /// Reacts to a network notification for an idle connection. Timeouts
    /// re-arm instead of closing while the entry's origin group is at or
    /// below its minimum keep-alive count; everything else removes the
    /// entry from both indexes and closes it.
    pub fn handle_io_event(
        &mut self,
        addr: SocketAddr,
        connection_id: u64,
        event: IoEvent,
    ) -> EventOutcome {
        let idx = self.by_addr.get(&addr).and_then(|bucket| {
            bucket
                .iter()
                .copied()
                .find(|&i| self.entries[i].conn.connection_id() == connection_id)
        });

        let idx = match idx {
            Some(idx) => idx,
            None => {
                // a notification for an untracked connection indicates an
                // accounting leak somewhere upstream of the pool
                warn!(
                    "pool: no entry for connection {} to {} (event {:?})",
                    connection_id, addr, event
                );
                debug_assert!(false, "connection leak");

                return EventOutcome::NotFound;
            }
        };

        let is_timeout = matches!(event, IoEvent::InactivityTimeout | IoEvent::ActiveTimeout);

        if is_timeout {
            let entry = &mut self.entries[idx];

            let keep = match &entry.group {
                Some(group) => group.pooled.value() <= group.min_keep_alive,
                None => false,
            };

            if keep {
                entry.conn.refresh_inactivity_timeout();
                entry.conn.cancel_active_timeout();

                debug!("pool: keeping connection {} under keep-alive minimum", connection_id);

                return EventOutcome::Rearmed;
            }
        }

        self.unindex(idx);

        let mut entry = self.entries.remove(idx);
        entry.close();

        if let Some(group) = &entry.group {
            group.pooled.try_dec(1);
        }

        if let Some(m) = &self.metrics {
            m.pooled.try_dec(1);
        }

        debug!(
            "pool: closed idle connection {} to {} on {:?}",
            connection_id, addr, event
        );

        EventOutcome::Closed
    }

    /// Closes and drops every pooled entry.
    pub fn purge(&mut self) {
        for (_, entry) in self.entries.iter_mut() {
            entry.close();

            if let Some(group) = &entry.group {
                group.pooled.try_dec(1);
            }
        }

        if let Some(m) = &self.metrics {
            m.pooled.try_dec(self.entries.len());
        }

        self.entries.clear();
        self.by_addr.clear();
        self.by_host.clear();
    }

    fn unindex(&mut self, idx: usize) {
        let (addr, host_hash) = {
            let entry = &self.entries[idx];
            (entry.conn.remote_addr(), entry.host_hash)
        };

        let addr_bucket = self.by_addr.get_mut(&addr).expect("entry not in addr index");
        addr_bucket.retain(|&i| i != idx);
        if addr_bucket.is_empty() {
            self.by_addr.remove(&addr);
        }

        let host_bucket = self
            .by_host
            .get_mut(&host_hash)
            .expect("entry not in host index");
        host_bucket.retain(|&i| i != idx);
        if host_bucket.is_empty() {
            self.by_host.remove(&host_hash);
        }
    }

    #[cfg(test)]
    fn assert_indexes_consistent(&self) {
        let addr_total: usize = self.by_addr.values().map(|b| b.len()).sum();
        let host_total: usize = self.by_host.values().map(|b| b.len()).sum();

        assert_eq!(addr_total, self.entries.len());
        assert_eq!(host_total, self.entries.len());

        for (idx, entry) in self.entries.iter() {
            assert_eq!(entry.state, SessionState::KaShared);

            let addr_bucket = &self.by_addr[&entry.conn.remote_addr()];
            assert!(addr_bucket.contains(&idx));

            let host_bucket = &self.by_host[&entry.host_hash];
            assert!(host_bucket.contains(&idx));
        }
    }
}

impl<C: PoolableConnection> Default for ServerSessionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether workers share one pool or each own their own.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PoolType {
    PerThread,
    Global,
}

pub enum AcquireOutcome<C> {
    Acquired(SessionEntry<C>),
    /// No pooled connection matched. The caller dials a fresh connection.
    NotFound,
    /// The shared pool's lock was contended. The caller retries or falls
    /// back to dialing; this call never blocks.
    Retry,
}

pub enum ReleaseOutcome<C> {
    Pooled,
    /// Pooling was off or the connection was already closed.
    Closed,
    /// Lock contention on the shared pool; the entry comes back to the
    /// caller untouched.
    Retry(SessionEntry<C>),
}

/// Front door for connection reuse. Hashes hostnames and dispatches to
/// either the caller's per-thread pool or the shared global pool.
///
/// The global pool is touched only through `try_lock`: contention reports
/// `Retry` instead of stalling the calling worker's event loop.
pub struct SessionManager<C> {
    pool_type: PoolType,
    global: Arc<Mutex<ServerSessionPool<C>>>,
}

impl<C: PoolableConnection> SessionManager<C> {
    pub fn new(pool_type: PoolType) -> Self {
        Self {
            pool_type,
            global: Arc::new(Mutex::new(ServerSessionPool::new())),
        }
    }

    pub fn pool_type(&self) -> PoolType {
        self.pool_type
    }

    pub fn acquire_session(
        &self,
        local: &mut ServerSessionPool<C>,
        addr: SocketAddr,
        hostname: &str,
        policy: MatchPolicy,
    ) -> AcquireOutcome<C> {
        let host_hash = HostHash::from_hostname(hostname);

        match self.pool_type {
            PoolType::PerThread => match local.acquire(addr, host_hash, policy) {
                Some(entry) => AcquireOutcome::Acquired(entry),
                None => AcquireOutcome::NotFound,
            },
            PoolType::Global => match self.global.try_lock() {
                Ok(mut pool) => match pool.acquire(addr, host_hash, policy) {
                    Some(entry) => AcquireOutcome::Acquired(entry),
                    None => AcquireOutcome::NotFound,
                },
                Err(_) => AcquireOutcome::Retry,
            },
        }
    }

    pub fn release_session(
        &self,
        local: &mut ServerSessionPool<C>,
        mut entry: SessionEntry<C>,
        policy: MatchPolicy,
    ) -> ReleaseOutcome<C> {
        if policy == MatchPolicy::None || entry.conn.is_closed() {
            entry.close();

            return ReleaseOutcome::Closed;
        }

        match self.pool_type {
            PoolType::PerThread => {
                local.release(entry);

                ReleaseOutcome::Pooled
            }
            PoolType::Global => match self.global.try_lock() {
                Ok(mut pool) => {
                    pool.release(entry);

                    ReleaseOutcome::Pooled
                }
                Err(_) => ReleaseOutcome::Retry(entry),
            },
        }
    }

    /// Tears down every pooled connection. The global pool is try-locked;
    /// on contention only the local pool is purged and false is returned.
    pub fn purge_keepalives(&self, local: &mut ServerSessionPool<C>) -> bool {
        local.purge();

        match self.global.try_lock() {
            Ok(mut pool) => {
                pool.purge();

                true
            }
            Err(_) => false,
        }
    }
}

impl<C: PoolableConnection> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            pool_type: self.pool_type,
            global: Arc::clone(&self.global),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    struct TestConn {
        addr: SocketAddr,
        id: u64,
        closed: bool,
        idle_watch: bool,
        inactivity_refreshes: usize,
    }

    impl TestConn {
        fn new(addr: SocketAddr, id: u64) -> Self {
            Self {
                addr,
                id,
                closed: false,
                idle_watch: false,
                inactivity_refreshes: 0,
            }
        }
    }

    impl PoolableConnection for TestConn {
        fn remote_addr(&self) -> SocketAddr {
            self.addr
        }

        fn connection_id(&self) -> u64 {
            self.id
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn refresh_inactivity_timeout(&mut self) {
            self.inactivity_refreshes += 1;
        }

        fn cancel_active_timeout(&mut self) {}

        fn set_idle_watch(&mut self, enabled: bool) {
            self.idle_watch = enabled;
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn entry(addr_s: &str, id: u64, hostname: &str) -> SessionEntry<TestConn> {
        SessionEntry::new(
            TestConn::new(addr(addr_s), id),
            HostHash::from_hostname(hostname),
        )
    }

    #[test]
    fn dual_index_consistency() {
        let mut pool = ServerSessionPool::new();

        pool.release(entry("1.2.3.4:80", 1, "a.example"));
        pool.assert_indexes_consistent();

        pool.release(entry("1.2.3.4:80", 2, "a.example"));
        pool.release(entry("5.6.7.8:80", 3, "b.example"));
        pool.assert_indexes_consistent();

        let h = HostHash::from_hostname("a.example");
        let e = pool.acquire(addr("1.2.3.4:80"), h, MatchPolicy::Both).unwrap();
        assert_eq!(e.state(), SessionState::InUse);
        pool.assert_indexes_consistent();

        let out = pool.handle_io_event(addr("5.6.7.8:80"), 3, IoEvent::Eos);
        assert_eq!(out, EventOutcome::Closed);
        pool.assert_indexes_consistent();

        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn lifo_reuse_order() {
        let mut pool = ServerSessionPool::new();

        pool.release(entry("1.2.3.4:80", 1, "a.example"));
        pool.release(entry("1.2.3.4:80", 2, "a.example"));

        let h = HostHash::from_hostname("a.example");

        let e = pool.acquire(addr("1.2.3.4:80"), h, MatchPolicy::Both).unwrap();
        assert_eq!(e.conn().connection_id(), 2);

        let e = pool.acquire(addr("1.2.3.4:80"), h, MatchPolicy::Both).unwrap();
        assert_eq!(e.conn().connection_id(), 1);
    }

    #[test]
    fn match_policy_correctness() {
        let h1 = HostHash::from_hostname("one.example");
        let h2 = HostHash::from_hostname("two.example");
        let a = addr("10.0.0.1:443");

        let mut pool = ServerSessionPool::new();
        pool.release(entry("10.0.0.1:443", 1, "one.example"));

        // host ignored under Ip
        let e = pool.acquire(a, h2, MatchPolicy::Ip).unwrap();
        pool.release(e);

        // host mismatch under Both
        assert!(pool.acquire(a, h2, MatchPolicy::Both).is_none());

        // no entry under h2 in the host index
        assert!(pool.acquire(a, h2, MatchPolicy::Host).is_none());

        // pooling disabled
        assert!(pool.acquire(a, h1, MatchPolicy::None).is_none());

        // exact match still present
        assert!(pool.acquire(a, h1, MatchPolicy::Both).is_some());
        assert!(pool.is_empty());
    }

    #[test]
    fn host_policy_checks_port() {
        let h = HostHash::from_hostname("origin.example");

        let mut pool = ServerSessionPool::new();
        pool.release(entry("10.0.0.1:8080", 1, "origin.example"));

        assert!(pool.acquire(addr("10.0.0.9:443"), h, MatchPolicy::Host).is_none());

        // a different address with the right port is fine under Host
        let e = pool.acquire(addr("10.0.0.9:8080"), h, MatchPolicy::Host).unwrap();
        assert_eq!(e.conn().connection_id(), 1);
    }

    #[test]
    fn destruction_gating() {
        let mut e = entry("1.2.3.4:80", 1, "a.example");

        e.start_transaction();
        e.finish_transaction();
        e.start_transaction();
        e.finish_transaction();
        e.start_transaction();

        e.close();
        assert_eq!(e.state(), SessionState::Closed);
        assert!(!e.can_destroy());

        e.finish_transaction();
        assert!(e.can_destroy());
    }

    #[test]
    fn event_handler_read_ready_closes() {
        let mut pool = ServerSessionPool::new();
        pool.release(entry("1.2.3.4:80", 7, "a.example"));

        let out = pool.handle_io_event(addr("1.2.3.4:80"), 7, IoEvent::ReadReady);
        assert_eq!(out, EventOutcome::Closed);
        assert!(pool.is_empty());
    }

    #[test_log::test]
    fn event_handler_unknown_connection() {
        let mut pool: ServerSessionPool<TestConn> = ServerSessionPool::new();

        // debug_assert fires on a leak; probe the release-build behavior
        // only when assertions are off
        if cfg!(debug_assertions) {
            return;
        }

        let out = pool.handle_io_event(addr("1.2.3.4:80"), 99, IoEvent::Error);
        assert_eq!(out, EventOutcome::NotFound);
    }

    #[test_log::test]
    fn timeout_respects_keep_alive_minimum() {
        let group = OriginGroup::new(1);

        let mut pool = ServerSessionPool::new();

        let mut e = entry("1.2.3.4:80", 1, "a.example");
        e.attach_group(Arc::clone(&group));
        pool.release(e);

        assert_eq!(group.pooled_count(), 1);

        // at the minimum: re-armed, still pooled
        let out = pool.handle_io_event(addr("1.2.3.4:80"), 1, IoEvent::InactivityTimeout);
        assert_eq!(out, EventOutcome::Rearmed);
        assert_eq!(pool.len(), 1);
        pool.assert_indexes_consistent();

        // above the minimum: one of them may go
        let mut e = entry("1.2.3.4:80", 2, "a.example");
        e.attach_group(Arc::clone(&group));
        pool.release(e);

        let out = pool.handle_io_event(addr("1.2.3.4:80"), 2, IoEvent::InactivityTimeout);
        assert_eq!(out, EventOutcome::Closed);
        assert_eq!(pool.len(), 1);
        assert_eq!(group.pooled_count(), 1);

        // non-timeout events close regardless of the minimum
        let out = pool.handle_io_event(addr("1.2.3.4:80"), 1, IoEvent::Eos);
        assert_eq!(out, EventOutcome::Closed);
        assert!(pool.is_empty());
        assert_eq!(group.pooled_count(), 0);
    }

    #[test]
    fn purge_closes_everything() {
        let metrics = Arc::new(PoolMetrics::default());

        let mut pool = ServerSessionPool::new();
        pool.set_metrics(Arc::clone(&metrics));

        pool.release(entry("1.2.3.4:80", 1, "a.example"));
        pool.release(entry("5.6.7.8:80", 2, "b.example"));
        assert_eq!(metrics.pooled.value(), 2);

        pool.purge();
        assert!(pool.is_empty());
        pool.assert_indexes_consistent();
        assert_eq!(metrics.pooled.value(), 0);
    }

    #[test]
    fn release_arms_idle_watching() {
        let mut pool = ServerSessionPool::new();
        pool.release(entry("1.2.3.4:80", 1, "a.example"));

        let h = HostHash::from_hostname("a.example");
        let e = pool.acquire(addr("1.2.3.4:80"), h, MatchPolicy::Both).unwrap();

        // watching was on while pooled, off once handed out
        assert!(!e.conn().idle_watch);
        assert_eq!(e.conn().inactivity_refreshes, 1);
    }

    #[test]
    fn manager_per_thread_dispatch() {
        let manager: SessionManager<TestConn> = SessionManager::new(PoolType::PerThread);
        let mut local = ServerSessionPool::new();

        let out = manager.release_session(
            &mut local,
            entry("1.2.3.4:80", 1, "a.example"),
            MatchPolicy::Both,
        );
        assert!(matches!(out, ReleaseOutcome::Pooled));
        assert_eq!(local.len(), 1);

        let out = manager.acquire_session(
            &mut local,
            addr("1.2.3.4:80"),
            "a.example",
            MatchPolicy::Both,
        );
        assert!(matches!(out, AcquireOutcome::Acquired(_)));

        let out = manager.acquire_session(
            &mut local,
            addr("1.2.3.4:80"),
            "a.example",
            MatchPolicy::Both,
        );
        assert!(matches!(out, AcquireOutcome::NotFound));
    }

    #[test]
    fn manager_policy_none_closes_on_release() {
        let manager: SessionManager<TestConn> = SessionManager::new(PoolType::PerThread);
        let mut local = ServerSessionPool::new();

        let out = manager.release_session(
            &mut local,
            entry("1.2.3.4:80", 1, "a.example"),
            MatchPolicy::None,
        );
        assert!(matches!(out, ReleaseOutcome::Closed));
        assert!(local.is_empty());
    }

    #[test]
    fn at_most_one_acquirer() {
        // one pooled connection, two threads racing to reuse it
        let manager: SessionManager<TestConn> = SessionManager::new(PoolType::Global);

        {
            let mut local = ServerSessionPool::new();
            let out = manager.release_session(
                &mut local,
                entry("1.2.3.4:80", 1, "a.example"),
                MatchPolicy::Both,
            );
            assert!(matches!(out, ReleaseOutcome::Pooled));
        }

        let start = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let manager = manager.clone();
            let start = Arc::clone(&start);

            handles.push(thread::spawn(move || {
                let mut local = ServerSessionPool::new();

                while !start.load(Ordering::SeqCst) {}

                loop {
                    match manager.acquire_session(
                        &mut local,
                        addr("1.2.3.4:80"),
                        "a.example",
                        MatchPolicy::Both,
                    ) {
                        AcquireOutcome::Acquired(e) => return Some(e.conn().connection_id()),
                        AcquireOutcome::NotFound => return None,
                        AcquireOutcome::Retry => continue,
                    }
                }
            }));
        }

        start.store(true, Ordering::SeqCst);

        let results: Vec<Option<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let hits = results.iter().filter(|r| r.is_some()).count();
        assert_eq!(hits, 1);
        assert!(results.contains(&Some(1)));
    }
}

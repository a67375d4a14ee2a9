//! Session pool: at most one live connection per host.
//!
//! Sessions live in an arena keyed by host name. Each slot has its own lock,
//! held while connecting, so two tasks racing on first acquisition of the
//! same host never open two connections. Engine tasks own one host each for
//! the length of a phase, so the slot lock is otherwise uncontended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use super::tracker::{ConnectionInfo, ConnectionSummary, ConnectionTracker};
use crate::error::TransportError;
use crate::inventory::Host;
use crate::transport::{CommandOutput, Connection, Transport};

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

struct Slot {
    connection: Option<Box<dyn Connection>>,
}


// ---------------------------------------------------------------------------
// SessionPool
// ---------------------------------------------------------------------------

pub struct SessionPool {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    slots: Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
    tracker: Mutex<ConnectionTracker>,
}

impl SessionPool {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        SessionPool {
            transport,
            policy,
            slots: Mutex::new(HashMap::new()),
            tracker: Mutex::new(ConnectionTracker::new()),
        }
    }

    fn slot(&self, host: &str) -> Arc<Mutex<Slot>> {
        lock(&self.slots)
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Slot { connection: None })))
            .clone()
    }

    /// Return the host's live session, connecting (or reconnecting) first if
    /// needed. Repeated calls hand out the same underlying connection.
    pub fn acquire(&self, host: &Host) -> Result<Session<'_>, TransportError> {
        let slot = self.slot(&host.name);
        {
            let mut guard = lock(&slot);
            self.ensure_connected(host, &mut guard)?;
        }
        Ok(Session {
            pool: self,
            host: host.clone(),
            slot,
        })
    }

    fn ensure_connected(&self, host: &Host, slot: &mut Slot) -> Result<(), TransportError> {
        if let Some(conn) = slot.connection.as_mut() {
            if conn.is_alive() {
                return Ok(());
            }
            debug!(host = %host.name, "session died, reconnecting");
            conn.close();
            slot.connection = None;
        }
        slot.connection = Some(self.connect_with_retry(host)?);
        Ok(())
    }

    fn connect_with_retry(&self, host: &Host) -> Result<Box<dyn Connection>, TransportError> {
        let mut retry = 0;
        loop {
            let started = Instant::now();
            lock(&self.tracker).start_connecting(&host.name, now_ms());
            match self.transport.connect(host) {
                Ok(conn) => {
                    let latency = started.elapsed().as_millis() as u64;
                    lock(&self.tracker).mark_connected(&host.name, now_ms(), latency);
                    info!(host = %host.name, address = %host.address, attempt = retry + 1, "connected");
                    return Ok(conn);
                }
                Err(err) => {
                    lock(&self.tracker).mark_failed(&host.name, &err.to_string(), now_ms());
                    if !err.is_retryable() || !self.policy.should_retry(retry) {
                        warn!(host = %host.name, attempt = retry + 1, error = %err, "connect failed");
                        return Err(err);
                    }
                    let delay = self.policy.delay(retry);
                    warn!(
                        host = %host.name,
                        attempt = retry + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "connect failed, retrying"
                    );
                    thread::sleep(delay);
                    retry += 1;
                }
            }
        }
    }

    /// Close the host's session; the next `acquire` reconnects.
    pub fn reset(&self, host: &str) {
        let slot = lock(&self.slots).get(host).cloned();
        if let Some(slot) = slot {
            if let Some(mut conn) = lock(&slot).connection.take() {
                conn.close();
            }
            lock(&self.tracker).disconnect(host);
        }
    }

    /// Close every open session.
    pub fn release_all(&self) {
        let slots: Vec<(String, Arc<Mutex<Slot>>)> = lock(&self.slots)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut closed = 0;
        for (host, slot) in slots {
            if let Some(mut conn) = lock(&slot).connection.take() {
                conn.close();
                closed += 1;
            }
            lock(&self.tracker).disconnect(&host);
        }
        debug!(closed, "released sessions");
    }

    /// Hosts with a session object held in the arena.
    pub fn open_sessions(&self) -> usize {
        let slots: Vec<Arc<Mutex<Slot>>> = lock(&self.slots).values().cloned().collect();
        slots
            .iter()
            .filter(|s| lock(s).connection.is_some())
            .count()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        lock(&self.tracker).snapshot()
    }

    pub fn connection(&self, host: &str) -> Option<ConnectionInfo> {
        lock(&self.tracker).info(host).cloned()
    }

    pub fn summary(&self) -> ConnectionSummary {
        lock(&self.tracker).summary()
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.release_all();
    }
}


// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Handle on one host's pooled connection.
pub struct Session<'p> {
    pool: &'p SessionPool,
    host: Host,
    slot: Arc<Mutex<Slot>>,
}

impl<'p> Session<'p> {
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Run one command. A transport failure drops the connection so the next
    /// call reconnects; a non-zero exit comes back as `Ok`.
    pub fn execute(&self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError> {
        let mut slot = lock(&self.slot);
        self.pool.ensure_connected(&self.host, &mut slot)?;
        let conn = slot
            .connection
            .as_mut()
            .ok_or_else(|| TransportError::Transient {
                host: self.host.name.clone(),
                reason: "no connection".into(),
            })?;
        match conn.execute(command, timeout) {
            Ok(out) => Ok(out),
            Err(err) => {
                if err.is_retryable() {
                    conn.close();
                    slot.connection = None;
                    lock(&self.pool.tracker).mark_failed(&self.host.name, &err.to_string(), now_ms());
                }
                Err(err)
            }
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffStrategy;
    use crate::inventory::{Credentials, Role};
    use crate::transport::ScriptedTransport;

    fn host(name: &str) -> Host {
        Host {
            name: name.into(),
            address: format!("{}.lan", name),
            port: 22,
            user: "root".into(),
            credentials: Credentials::Agent,
            role: Role::Worker,
            interpreter: "/bin/sh".into(),
        }
    }

    fn pool(t: &ScriptedTransport, retries: u32) -> SessionPool {
        SessionPool::new(
            Arc::new(t.clone()),
            RetryPolicy::new(retries, BackoffStrategy::Fixed, 1),
        )
    }

    fn refused(h: &str) -> TransportError {
        TransportError::Transient {
            host: h.into(),
            reason: "Connection refused".into(),
        }
    }

    #[test]
    fn acquire_is_idempotent() {
        let t = ScriptedTransport::new();
        let p = pool(&t, 3);
        let h = host("w1");
        let s1 = p.acquire(&h).unwrap();
        s1.execute("true", Duration::from_secs(1)).unwrap();
        let s2 = p.acquire(&h).unwrap();
        s2.execute("true", Duration::from_secs(1)).unwrap();
        assert_eq!(t.connects("w1"), 1);
        assert_eq!(p.open_sessions(), 1);
    }

    #[test]
    fn transient_connect_failures_are_retried() {
        let t = ScriptedTransport::new();
        t.fail_connects("w1", vec![refused("w1"), refused("w1")]);
        let p = pool(&t, 3);
        assert!(p.acquire(&host("w1")).is_ok());
        assert_eq!(t.connects("w1"), 3);
        assert_eq!(p.connection("w1").unwrap().attempts, 3);
    }

    #[test]
    fn retry_budget_exhausted() {
        let t = ScriptedTransport::new();
        t.fail_connects("w1", vec![refused("w1"), refused("w1"), refused("w1")]);
        let p = pool(&t, 1);
        let err = p.acquire(&host("w1")).err().unwrap();
        assert!(err.is_retryable());
        assert_eq!(t.connects("w1"), 2);
    }

    #[test]
    fn authentication_failure_not_retried() {
        let t = ScriptedTransport::new();
        t.fail_connects(
            "w1",
            vec![TransportError::Authentication {
                host: "w1".into(),
                reason: "Permission denied".into(),
            }],
        );
        let p = pool(&t, 5);
        let err = p.acquire(&host("w1")).err().unwrap();
        assert!(matches!(err, TransportError::Authentication { .. }));
        assert_eq!(t.connects("w1"), 1);
    }

    #[test]
    fn dead_session_reconnects_transparently() {
        let t = ScriptedTransport::new();
        let p = pool(&t, 0);
        let h = host("w1");
        let s = p.acquire(&h).unwrap();
        t.drop_sessions("w1");
        assert!(s.execute("true", Duration::from_secs(1)).is_ok());
        assert_eq!(t.connects("w1"), 2);
        assert_eq!(p.connection("w1").unwrap().sessions_opened, 2);
    }

    #[test]
    fn concurrent_first_acquire_opens_one_connection() {
        let t = ScriptedTransport::new();
        let p = pool(&t, 0);
        let h = host("m1");
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    p.acquire(&h).unwrap();
                });
            }
        });
        assert_eq!(t.connects("m1"), 1);
    }

    #[test]
    fn release_all_closes_everything() {
        let t = ScriptedTransport::new();
        let p = pool(&t, 0);
        p.acquire(&host("w1")).unwrap();
        p.acquire(&host("w2")).unwrap();
        assert_eq!(p.summary().connected, 2);
        p.release_all();
        assert_eq!(p.open_sessions(), 0);
        assert_eq!(p.summary().disconnected, 2);
        let mut closed = t.closes();
        closed.sort();
        assert_eq!(closed, vec!["w1", "w2"]);
    }

    #[test]
    fn reset_forces_new_connection() {
        let t = ScriptedTransport::new();
        let p = pool(&t, 0);
        let h = host("w1");
        p.acquire(&h).unwrap();
        p.reset("w1");
        p.acquire(&h).unwrap();
        assert_eq!(t.connects("w1"), 2);
    }
}

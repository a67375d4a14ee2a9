//! Scriptable in-process transport.
//!
//! Answers commands from rules keyed by host and a substring of the command
//! text, and records everything it was asked to do. Any command without a
//! matching rule succeeds with empty output.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::{CommandOutput, Connection, Transport};
use crate::error::TransportError;
use crate::inventory::Host;

type Reply = Result<CommandOutput, TransportError>;

#[derive(Debug)]
struct Rule {
    /// `None` matches every host.
    host: Option<String>,
    pattern: String,
    /// Popped one per match; the last reply repeats.
    replies: VecDeque<Reply>,
}

#[derive(Debug, Default)]
struct State {
    rules: Vec<Rule>,
    connect_failures: HashMap<String, VecDeque<TransportError>>,
    /// Bumped by `drop_sessions`; connections from older epochs are dead.
    epochs: HashMap<String, u64>,
    connects: Vec<String>,
    closes: Vec<String>,
    executed: Vec<(String, String)>,
    in_flight: usize,
    max_in_flight: usize,
    latency: Duration,
}

/// Test double for `Transport`. Cheap to clone; clones share one script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        ScriptedTransport::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every command on `host` containing `pattern` answers with `reply`.
    pub fn reply(&self, host: &str, pattern: &str, reply: CommandOutput) -> &Self {
        self.reply_seq(host, pattern, vec![Ok(reply)])
    }

    /// Successive matching commands get successive replies.
    pub fn reply_seq(&self, host: &str, pattern: &str, replies: Vec<Reply>) -> &Self {
        let host = if host == "*" { None } else { Some(host.to_string()) };
        self.lock().rules.push(Rule {
            host,
            pattern: pattern.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// The next connects to `host` fail with these errors, in order.
    pub fn fail_connects(&self, host: &str, errors: Vec<TransportError>) -> &Self {
        self.lock()
            .connect_failures
            .entry(host.to_string())
            .or_default()
            .extend(errors);
        self
    }

    /// Kill every open connection to `host`.
    pub fn drop_sessions(&self, host: &str) {
        *self.lock().epochs.entry(host.to_string()).or_insert(0) += 1;
    }

    /// Sleep this long inside every command.
    pub fn with_latency(&self, latency: Duration) -> &Self {
        self.lock().latency = latency;
        self
    }

    pub fn connects(&self, host: &str) -> usize {
        self.lock().connects.iter().filter(|h| *h == host).count()
    }

    pub fn closes(&self) -> Vec<String> {
        self.lock().closes.clone()
    }

    /// Commands executed on `host`, in order.
    pub fn executed(&self, host: &str) -> Vec<String> {
        self.lock()
            .executed
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Commands containing `pattern` executed on `host`.
    pub fn count(&self, host: &str, pattern: &str) -> usize {
        self.executed(host)
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// All commands across hosts, in global order.
    pub fn history(&self) -> Vec<(String, String)> {
        self.lock().executed.clone()
    }

    /// Highest number of commands that ran at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    fn answer(&self, host: &str, command: &str) -> Reply {
        let mut state = self.lock();
        state.executed.push((host.to_string(), command.to_string()));
        let rule = state.rules.iter_mut().find(|r| {
            r.host.as_deref().map_or(true, |h| h == host) && command.contains(&r.pattern)
        });
        match rule {
            Some(rule) if rule.replies.len() > 1 => rule
                .replies
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default())),
            Some(rule) => rule
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(CommandOutput::default())),
            None => Ok(CommandOutput::default()),
        }
    }
}

impl Transport for ScriptedTransport {
    fn connect(&self, host: &Host) -> Result<Box<dyn Connection>, TransportError> {
        let mut state = self.lock();
        state.connects.push(host.name.clone());
        if let Some(err) = state
            .connect_failures
            .get_mut(&host.name)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }
        let epoch = *state.epochs.get(&host.name).unwrap_or(&0);
        Ok(Box::new(ScriptedConnection {
            host: host.name.clone(),
            epoch,
            closed: false,
            transport: self.clone(),
        }))
    }
}

struct ScriptedConnection {
    host: String,
    epoch: u64,
    closed: bool,
    transport: ScriptedTransport,
}

impl Connection for ScriptedConnection {
    fn execute(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Transient {
                host: self.host.clone(),
                reason: "broken pipe".into(),
            });
        }
        let latency = {
            let mut state = self.transport.lock();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let reply = self.transport.answer(&self.host, command);
        self.transport.lock().in_flight -= 1;
        reply
    }

    fn is_alive(&mut self) -> bool {
        let current = *self.transport.lock().epochs.get(&self.host).unwrap_or(&0);
        !self.closed && current == self.epoch
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.transport.lock().closes.push(self.host.clone());
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

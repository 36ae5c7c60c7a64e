//! One agent's part in one session. Nothing here writes past the local
//! deadline plus [`FINAL_WRITE_GRACE`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, timeout_at, Instant, MissedTickBehavior};
use crate::capture::{Engine, Filter};
use crate::config::{Config, FINAL_WRITE_GRACE, TERMINATE_TIMEOUT};
use crate::data::{ConditionStatus, Destination, Kind, Session, Trace};
use crate::resolve;
use crate::retry::RetryPolicy;
use crate::role::{Authority, Cluster, Role};
use crate::store::{Error, Store};
use crate::update::{update, Change};

/// Collaborators shared by every participant of one agent.
#[derive(Clone)]
pub struct Shared {
    pub config:  Arc<Config>,
    pub store:   Arc<dyn Store>,
    pub cluster: Arc<dyn Cluster>,
    pub engine:  Arc<dyn Engine>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stop {
    /// `Terminate=True` was observed.
    Terminated,
    /// The fail-safe deadline elapsed.
    Deadline,
    /// The capture engine finished on its own.
    Completed,
    /// The capture engine could not be started.
    Failed,
    /// The source judged enough traces were gathered.
    EnoughTraces,
    /// The record went away or the agent shut down.
    Forgotten,
}

#[derive(Clone, Debug)]
pub struct Outcome {
    pub stop:      Stop,
    pub role:      Role,
    pub captured:  Duration,
    pub observed:  usize,
    pub delivered: usize,
}

pub struct Participant {
    name:      String,
    shared:    Shared,
    role:      Role,
    ready:     bool,
    pending:   Vec<Trace>,
    observed:  usize,
    delivered: usize,
}

impl Participant {
    pub fn new(name: &str, shared: Shared) -> Self {
        Self {
            name:      name.to_owned(),
            shared:    shared,
            role:      Role::Node,
            ready:     false,
            pending:   Vec::new(),
            observed:  0,
            delivered: 0,
        }
    }

    pub async fn run(mut self, session: Session, mut updates: watch::Receiver<Session>) -> Outcome {
        let started  = Instant::now();
        let deadline = started + TERMINATE_TIMEOUT;
        let cutoff   = deadline + FINAL_WRITE_GRACE;

        self.role = self.resolve_role(&session, deadline).await;

        if let Role::Source(authority) = self.role {
            self.initialize(authority, deadline).await;
        }

        let addresses = self.resolve_destination(&session.spec.destination, deadline).await;

        let filter = Filter {
            id:          session.spec.id.clone(),
            destination: session.spec.destination.clone(),
            addresses:   addresses,
            deadline:    deadline,
        };

        let mut traces = match self.shared.engine.start(filter) {
            Ok(traces) => traces,
            Err(e)     => {
                error!("{}: capture failed to start: {:?}", self.name, e);
                self.degrade("CaptureFailed", format!("{:#}", e), deadline).await;
                if let Role::Source(authority) = self.role {
                    self.terminate(authority, "CaptureFailed", "source capture failed to start", deadline).await;
                }
                return self.outcome(Stop::Failed, Duration::ZERO);
            }
        };

        info!("{}: capturing {} as {:?}", self.name, session.spec.id, self.role);

        self.report_ready(deadline).await;

        let stop = self.capture(&mut traces, &mut updates, deadline).await;

        traces.close();
        while let Ok(trace) = traces.try_recv() {
            self.push(trace);
        }
        drop(traces);

        let captured = started.elapsed();

        match timeout_at(cutoff, self.flush()).await {
            Ok(true) => {}
            _        => warn!("{}: {} traces lost", self.name, self.pending.len()),
        }

        if let Role::Source(authority) = self.role {
            let reason = match stop {
                Stop::Completed => Some(("CaptureCompleted", "source capture completed")),
                Stop::Deadline  => Some(("DeadlineExceeded", "fail-safe deadline elapsed")),
                Stop::Forgotten => Some(("SourceStopped", "source agent stopped")),
                _               => None,
            };
            if let Some((reason, message)) = reason {
                self.terminate(authority, reason, message, cutoff).await;
            }
        }

        info!("{}: stopped ({:?}) after {:?}, {} traces captured", self.name, stop, captured, self.observed);

        self.outcome(stop, captured)
    }

    async fn capture(
        &mut self,
        traces:   &mut Receiver<Trace>,
        updates:  &mut watch::Receiver<Session>,
        deadline: Instant,
    ) -> Stop {
        let period = self.shared.config.flush_interval;
        let mut flush = interval_at(Instant::now() + period, period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);

        let current = updates.borrow_and_update().clone();
        if let Some(stop) = self.observe(&current, deadline).await {
            return stop;
        }

        loop {
            tokio::select! {
                _ = &mut expiry => return Stop::Deadline,
                changed = updates.changed() => {
                    if changed.is_err() {
                        return Stop::Forgotten;
                    }
                    let session = updates.borrow_and_update().clone();
                    if let Some(stop) = self.observe(&session, deadline).await {
                        return stop;
                    }
                }
                trace = traces.recv() => match trace {
                    Some(trace) => {
                        self.push(trace);
                        if self.pending.len() >= self.shared.config.batch_size {
                            let _ = timeout_at(deadline, self.flush()).await;
                        }
                    }
                    None => return Stop::Completed,
                },
                _ = flush.tick() => {
                    let _ = timeout_at(deadline, self.flush()).await;
                }
            }
        }
    }

    async fn observe(&mut self, session: &Session, deadline: Instant) -> Option<Stop> {
        if session.status.is_terminated() {
            return Some(Stop::Terminated);
        }

        match self.role {
            Role::Source(authority) => self.lead(authority, session, deadline).await,
            Role::Node              => None,
        }
    }

    async fn lead(&mut self, authority: Authority, session: &Session, deadline: Instant) -> Option<Stop> {
        let status = &session.status;

        if let Some(expected) = authority.expected() {
            if !status.is_ready() && status.ready_count() >= i64::from(expected) {
                self.mark_ready(authority, deadline).await;
            }
        }

        match self.shared.config.terminate_after {
            Some(limit) if status.traces.len() >= limit => {
                let message = format!("{} traces gathered", status.traces.len());
                self.terminate(authority, "EnoughTraces", &message, deadline).await;
                Some(Stop::EnoughTraces)
            }
            _ => None,
        }
    }

    fn push(&mut self, mut trace: Trace) {
        if trace.node.is_empty() {
            trace.node = self.shared.config.node.clone();
        }
        self.observed += 1;
        self.pending.push(trace);
    }

    async fn resolve_role(&self, session: &Session, deadline: Instant) -> Role {
        let source  = &session.spec.source;
        let node    = &self.shared.config.node;
        let cluster = &*self.shared.cluster;

        let role = match timeout_at(deadline, Role::resolve(source, node, cluster)).await {
            Ok(Ok(role)) => role,
            Ok(Err(e))   => {
                warn!("{}: unable to locate source: {:?}", self.name, e);
                self.degrade("ClusterLookupFailed", format!("{:#}", e), deadline).await;
                Role::Node
            }
            Err(_) => Role::Node,
        };

        if let Role::Source(authority) = role {
            if authority.expected().is_none() {
                let detail = "node count unavailable, readiness cannot be declared";
                self.degrade("NodeCountUnknown", detail.to_owned(), deadline).await;
            }
        }

        role
    }

    /// Makes sure both coordination conditions exist without resetting a
    /// counter other agents may already have bumped.
    async fn initialize(&self, _authority: Authority, deadline: Instant) {
        let result = self.write(deadline, |s| {
            let mut change = Change::Skip;

            if s.status.condition(&Kind::AgentsReady).is_none() {
                s.status.condition_mut(Kind::AgentsReady).reason = "WaitingForAgents".to_owned();
                change = Change::Write;
            }

            let terminate = s.status.condition(&Kind::Terminate).map(|c| c.status);
            if matches!(terminate, None | Some(ConditionStatus::Unknown)) {
                s.status.condition_mut(Kind::Terminate).set(ConditionStatus::False, "Capturing");
                change = Change::Write;
            }

            change
        }).await;

        if let Err(e) = result {
            warn!("{}: conditions not initialized: {}", self.name, e);
        }
    }

    async fn report_ready(&mut self, deadline: Instant) {
        if self.ready {
            return;
        }

        let node = &self.shared.config.node;
        let mut listed = false;

        let result = self.write(deadline, |s| {
            listed = false;
            if s.status.is_terminated() {
                return Change::Skip;
            }
            match s.status.count_ready(node) {
                true  => Change::Write,
                false => {
                    listed = true;
                    Change::Skip
                }
            }
        }).await;

        match result {
            Ok(true)            => self.ready = true,
            Ok(false) if listed => self.ready = true,
            Ok(false)           => debug!("{}: already terminated, readiness not reported", self.name),
            Err(e)              => warn!("{}: readiness not reported: {}", self.name, e),
        }
    }

    async fn mark_ready(&self, authority: Authority, deadline: Instant) {
        let expected = match authority.expected() {
            Some(expected) => i64::from(expected),
            None           => return,
        };

        let result = self.write(deadline, |s| {
            let count = s.status.ready_count();
            let ready = s.status.condition_mut(Kind::AgentsReady);
            if ready.status == ConditionStatus::True || count < expected {
                return Change::Skip;
            }
            ready.set(ConditionStatus::True, "AllAgentsReady");
            Change::Write
        }).await;

        match result {
            Ok(true) => info!("{}: all {} agents ready", self.name, expected),
            Ok(false) => {}
            Err(e)   => warn!("{}: readiness not declared: {}", self.name, e),
        }
    }

    async fn terminate(&self, _authority: Authority, reason: &str, message: &str, deadline: Instant) {
        let result = self.write(deadline, |s| {
            if s.status.is_terminated() {
                return Change::Skip;
            }
            let terminate = s.status.condition_mut(Kind::Terminate);
            terminate.set(ConditionStatus::True, reason);
            terminate.message = message.to_owned();
            Change::Write
        }).await;

        match result {
            Ok(true)  => info!("{}: terminated: {}", self.name, reason),
            Ok(false) => debug!("{}: already terminated", self.name),
            Err(e)    => warn!("{}: termination not written: {}", self.name, e),
        }
    }

    async fn degrade(&self, reason: &str, detail: String, deadline: Instant) {
        let line = format!("{}: {}", self.shared.config.node, detail);
        let store = &*self.shared.store;
        let retry = &self.shared.config.retry;

        match timeout_at(deadline, degrade(store, &self.name, retry, reason, &line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: failure not recorded: {}", self.name, e),
            Err(_)     => warn!("{}: failure not recorded before deadline", self.name),
        }
    }

    /// An unresolvable destination leaves the engine to match on the name.
    /// Only the source records the failure.
    async fn resolve_destination(&self, destination: &Destination, deadline: Instant) -> Vec<IpAddr> {
        let error = match timeout_at(deadline, resolve::lookup(destination)).await {
            Ok(Ok(ips)) => {
                debug!("{}: {} resolves to {:?}", self.name, destination.destination, ips);
                return ips;
            }
            Ok(Err(e)) => e,
            Err(_)     => return Vec::new(),
        };

        warn!("{}: {:#}", self.name, error);

        if self.role.is_source() {
            self.degrade("ResolutionFailed", format!("{:#}", error), deadline).await;
        }

        Vec::new()
    }

    async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }

        let store = &*self.shared.store;
        let retry = &self.shared.config.retry;
        let batch = &self.pending;

        let result = update(store, &self.name, retry, |s| {
            s.status.traces.extend(batch.iter().cloned());
            Change::Write
        }).await;

        match result {
            Ok(_) => {
                debug!("{}: delivered {} traces", self.name, self.pending.len());
                self.delivered += self.pending.len();
                self.pending.clear();
                true
            }
            Err(e) => {
                warn!("{}: {} traces pending: {}", self.name, self.pending.len(), e);
                false
            }
        }
    }

    /// Runs one bounded read-modify-write. `Ok(false)` means the mutation
    /// found nothing to change.
    async fn write<F>(&self, deadline: Instant, mutate: F) -> Result<bool, Error>
    where
        F: FnMut(&mut Session) -> Change + Send,
    {
        let store = &*self.shared.store;
        let retry = &self.shared.config.retry;

        match timeout_at(deadline, update(store, &self.name, retry, mutate)).await {
            Ok(result) => result.map(|written| written.is_some()),
            Err(_)     => Err(Error::Exhausted { attempts: 0 }),
        }
    }

    fn outcome(&self, stop: Stop, captured: Duration) -> Outcome {
        Outcome {
            stop:      stop,
            role:      self.role,
            captured:  captured,
            observed:  self.observed,
            delivered: self.delivered,
        }
    }
}

async fn degrade(store: &dyn Store, name: &str, retry: &RetryPolicy, reason: &str, line: &str) -> Result<(), Error> {
    update(store, name, retry, |s| {
        let degraded = s.status.condition_mut(Kind::Degraded);
        degraded.set(ConditionStatus::True, reason);
        degraded.observed_generation += 1;
        if !degraded.message.is_empty() {
            degraded.message.push('\n');
        }
        degraded.message.push_str(line);
        Change::Write
    }).await?;

    Ok(())
}

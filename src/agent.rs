use std::collections::{HashMap, HashSet};
use std::future::pending;
use std::sync::Arc;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout_at, Instant, MissedTickBehavior};
use crate::capture::Engine;
use crate::config::{Config, FINAL_WRITE_GRACE, TERMINATE_TIMEOUT};
use crate::data::{Invalid, Session};
use crate::phase::Phase;
use crate::role::Cluster;
use crate::session::{Outcome, Participant, Shared};
use crate::store::{Event, Store};

/// The per-node agent. It watches every session record, joins the ones it
/// may still take part in and routes later changes to the participant
/// already handling them.
pub struct Agent {
    shared:   Shared,
    sessions: RwLock<HashMap<String, Handle>>,
}

struct Handle {
    updates: watch::Sender<Session>,
    outcome: Arc<Mutex<Option<Outcome>>>,
    task:    JoinHandle<()>,
}

#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Joined,
    Observed,
    Skipped(Skip),
}

#[derive(Debug, PartialEq)]
pub enum Skip {
    Invalid(Invalid),
    Terminated,
    Expired,
}

impl Agent {
    pub fn new(config: Config, store: Arc<dyn Store>, cluster: Arc<dyn Cluster>, engine: Arc<dyn Engine>) -> Self {
        let config   = Arc::new(config);
        let shared   = Shared { config, store, cluster, engine };
        let sessions = RwLock::new(HashMap::new());
        Self { shared, sessions }
    }

    pub fn node(&self) -> &str {
        &self.shared.config.node
    }

    /// Watches until `shutdown` fires, then waits for every participant to
    /// deliver what it captured. A periodic relist covers stores without
    /// change notifications and missed deletions.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut events = self.shared.store.subscribe();
        let mut poll   = interval(self.shared.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("agent on {} watching sessions", self.node());

        loop {
            tokio::select! {
                _ = poll.tick() => self.resync().await,
                event = next(&mut events) => match event {
                    Ok(Event::Applied(v))    => { self.on_session_observed(v.session); }
                    Ok(Event::Deleted(name)) => self.forget(&name),
                    Err(RecvError::Lagged(n)) => {
                        debug!("missed {} events, relisting", n);
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("change notifications closed, polling only");
                        events = None;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        let tasks = self.sessions.write().drain().map(|(_, h)| h.task).collect::<Vec<_>>();
        let until = Instant::now() + TERMINATE_TIMEOUT + FINAL_WRITE_GRACE;

        info!("agent on {} stopping, waiting for {} sessions", self.node(), tasks.len());

        for task in tasks {
            match timeout_at(until, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("participant failed: {:?}", e),
                Err(_)     => {
                    warn!("agent on {} stopped with sessions still running", self.node());
                    break;
                }
            }
        }

        info!("agent on {} stopped", self.node());

        Ok(())
    }

    /// Handles one observation of a session record. Repeated observations
    /// of a session already joined only update what its participant sees.
    pub fn on_session_observed(&self, session: Session) -> Dispatch {
        let name = session.name().to_owned();
        let mut sessions = self.sessions.write();

        if let Some(handle) = sessions.get(&name) {
            let stopped = handle.outcome.lock().is_some();
            let before  = Phase::observe(&handle.updates.borrow().status, stopped);
            let after   = Phase::observe(&session.status, stopped);
            if before != after {
                info!("{}: {} -> {}", name, before, after);
            }
            handle.updates.send_replace(session);
            return Dispatch::Observed;
        }

        if let Err(skip) = admit(&session, Utc::now()) {
            trace!("{}: not joining: {:?}", name, skip);
            return Dispatch::Skipped(skip);
        }

        debug!("{}: joining session {}", name, session.spec.id);

        let (tx, rx)    = watch::channel(session.clone());
        let outcome     = Arc::new(Mutex::new(None));
        let finished    = outcome.clone();
        let participant = Participant::new(&name, self.shared.clone());

        let task = tokio::spawn(async move {
            let result = participant.run(session, rx).await;
            *finished.lock() = Some(result);
        });

        sessions.insert(name, Handle { updates: tx, outcome, task });

        Dispatch::Joined
    }

    pub async fn resync(&self) {
        let records = match self.shared.store.list().await {
            Ok(records) => records,
            Err(e)      => {
                warn!("relist failed: {}", e);
                return;
            }
        };

        let live = records.iter().map(|v| v.session.name().to_owned()).collect::<HashSet<_>>();

        for record in records {
            self.on_session_observed(record.session);
        }

        let mut sessions = self.sessions.write();
        let n = sessions.len();
        sessions.retain(|name, _| live.contains(name));

        if n > sessions.len() {
            debug!("swept {} deleted sessions", n - sessions.len());
        }
    }

    pub fn forget(&self, name: &str) {
        if self.sessions.write().remove(name).is_some() {
            debug!("{}: forgotten", name);
        }
    }

    pub fn phase(&self, name: &str) -> Option<Phase> {
        let sessions = self.sessions.read();
        let handle   = sessions.get(name)?;
        let stopped  = handle.outcome.lock().is_some();
        let phase    = Phase::observe(&handle.updates.borrow().status, stopped);
        Some(phase)
    }

    pub fn outcome(&self, name: &str) -> Option<Outcome> {
        self.sessions.read().get(name)?.outcome.lock().clone()
    }
}

fn admit(session: &Session, now: DateTime<Utc>) -> Result<(), Skip> {
    session.validate().map_err(Skip::Invalid)?;

    if session.status.is_terminated() {
        return Err(Skip::Terminated);
    }

    if session.is_expired(now) {
        return Err(Skip::Expired);
    }

    Ok(())
}

async fn next(events: &mut Option<Receiver<Event>>) -> Result<Event, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None         => pending().await,
    }
}

use std::collections::HashMap;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use log::trace;
use parking_lot::Mutex;
use tokio::sync::broadcast::{channel, Receiver, Sender};
use crate::data::Session;
use super::{Error, Event, Result, Store, Version, Versioned};

/// Process-local store. Every write bumps a store-wide revision, the same
/// way an etcd-backed API server hands out resource versions.
pub struct MemoryStore {
    state:  Mutex<State>,
    events: Sender<Event>,
}

#[derive(Default)]
struct State {
    records:  HashMap<String, Versioned>,
    revision: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = channel(1024);
        let state = Mutex::new(State::default());
        Self { state, events }
    }

    pub fn create(&self, mut session: Session) -> Result<Version> {
        let name = session.name().to_owned();
        let mut state = self.state.lock();

        if state.records.contains_key(&name) {
            return Err(Error::Backend(anyhow!("session {} already exists", name)));
        }

        session.metadata.creation_timestamp.get_or_insert_with(Utc::now);

        state.revision += 1;
        let version   = Version(state.revision);
        let versioned = Versioned { version, session };
        state.records.insert(name, versioned.clone());

        let _ = self.events.send(Event::Applied(versioned));

        Ok(version)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();

        match state.records.remove(name) {
            Some(_) => {
                state.revision += 1;
                let _ = self.events.send(Event::Deleted(name.to_owned()));
                Ok(())
            }
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<Session> {
        self.state.lock().records.get(name).map(|v| v.session.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list(&self) -> Result<Vec<Versioned>> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Versioned> {
        match self.state.lock().records.get(name) {
            Some(versioned) => Ok(versioned.clone()),
            None            => Err(Error::NotFound(name.to_owned())),
        }
    }

    async fn update(&self, expected: Version, session: &Session) -> Result<Version> {
        let name = session.name();
        let mut state = self.state.lock();
        let next = state.revision + 1;

        let current = match state.records.get_mut(name) {
            Some(current) => current,
            None          => return Err(Error::NotFound(name.to_owned())),
        };

        if current.version != expected {
            trace!("{}: stale write at {}, current {}", name, expected, current.version);
            return Err(Error::Conflict { name: name.to_owned(), expected });
        }

        current.version = Version(next);
        current.session.status = session.status.clone();
        let versioned = current.clone();
        state.revision = next;

        let _ = self.events.send(Event::Applied(versioned));

        Ok(Version(next))
    }

    fn subscribe(&self) -> Option<Receiver<Event>> {
        Some(self.events.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{Destination, Kind, Metadata, Spec};
    use super::*;

    fn session(name: &str) -> Session {
        Session {
            metadata: Metadata { name: name.to_owned(), creation_timestamp: None },
            spec:     Spec {
                id:          name.to_owned(),
                source:      Default::default(),
                destination: Destination {
                    destination: "10.0.0.1".to_owned(),
                    ..Default::default()
                },
            },
            status:   Default::default(),
        }
    }

    #[tokio::test]
    async fn stale_writes_conflict() {
        let store = MemoryStore::new();
        let v1 = store.create(session("a")).unwrap();

        let mut first = store.get("a").await.unwrap().session;
        first.status.condition_mut(Kind::AgentsReady).observed_generation = 1;
        let v2 = store.update(v1, &first).await.unwrap();
        assert!(v2 > v1);

        let mut second = first.clone();
        second.status.condition_mut(Kind::AgentsReady).observed_generation = 1;
        let err = store.update(v1, &second).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(err.is_retryable());

        assert_eq!(store.get("a").await.unwrap().version, v2);
    }

    #[tokio::test]
    async fn update_only_touches_status() {
        let store = MemoryStore::new();
        let v1 = store.create(session("a")).unwrap();

        let mut next = store.get("a").await.unwrap().session;
        next.spec.id = "rewritten".to_owned();
        next.status.condition_mut(Kind::Terminate);
        store.update(v1, &next).await.unwrap();

        let stored = store.snapshot("a").unwrap();
        assert_eq!(stored.spec.id, "a");
        assert_eq!(stored.status.conditions.len(), 1);
        assert!(stored.metadata.creation_timestamp.is_some());
    }

    #[tokio::test]
    async fn publishes_changes() {
        let store = MemoryStore::new();
        let mut events = store.subscribe().unwrap();

        store.create(session("a")).unwrap();
        store.delete("a").unwrap();

        assert!(matches!(events.recv().await.unwrap(), Event::Applied(v) if v.session.name() == "a"));
        assert!(matches!(events.recv().await.unwrap(), Event::Deleted(name) if name == "a"));
        assert!(matches!(store.get("a").await, Err(Error::NotFound(_))));
        assert!(store.create(session("b")).is_ok());
        assert!(store.create(session("b")).is_err());
    }
}

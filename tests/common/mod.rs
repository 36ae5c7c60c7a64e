#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{channel, Receiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use kpcap::agent::Agent;
use kpcap::capture::{Engine, Filter};
use kpcap::config::Config;
use kpcap::data::{Destination, Metadata, Session, Source, Spec, Trace};
use kpcap::retry::RetryPolicy;
use kpcap::role::{Cluster, Pinned};
use kpcap::session::Outcome;
use kpcap::store::{self, Event, MemoryStore, Store, Version, Versioned};

/// Emits a fixed list of traces, one every `every`, then either finishes
/// (capture completed) or keeps the capture open until told to stop.
pub struct Feed {
    pub traces: Vec<Trace>,
    pub every:  Duration,
    pub finish: bool,
}

impl Engine for Feed {
    fn start(&self, _filter: Filter) -> Result<Receiver<Trace>> {
        let (tx, rx) = channel(64);
        let traces = self.traces.clone();
        let every  = self.every;
        let finish = self.finish;

        tokio::spawn(async move {
            for trace in traces {
                sleep(every).await;
                if tx.send(trace).await.is_err() {
                    return;
                }
            }
            if !finish {
                tx.closed().await;
            }
        });

        Ok(rx)
    }
}

/// Passes everything through until `writes` updates went through, then
/// fails every further write as if its process had died.
pub struct Crashing {
    pub inner:  Arc<MemoryStore>,
    pub writes: AtomicU32,
}

#[async_trait]
impl Store for Crashing {
    async fn list(&self) -> store::Result<Vec<Versioned>> {
        self.inner.list().await
    }

    async fn get(&self, name: &str) -> store::Result<Versioned> {
        self.inner.get(name).await
    }

    async fn update(&self, expected: Version, session: &Session) -> store::Result<Version> {
        let left = self.writes.load(Ordering::SeqCst);
        if left == 0 {
            return Err(store::Error::Backend(anyhow!("agent crashed")));
        }
        let version = self.inner.update(expected, session).await?;
        self.writes.store(left - 1, Ordering::SeqCst);
        Ok(version)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<Event>> {
        self.inner.subscribe()
    }
}

pub fn node(i: usize) -> String {
    format!("node-{}", i)
}

/// Traces are told apart by node index and sequence number.
pub fn trace(node: usize, seq: usize) -> Trace {
    Trace {
        timestamp: Utc::now(),
        node:      String::new(),
        pod:       String::new(),
        src_iface: "eth0".to_owned(),
        dst_iface: "eth0".to_owned(),
        src_ip:    format!("10.0.{}.1", node),
        dst_ip:    "10.96.0.10".to_owned(),
        src_port:  (node * 1000 + seq) as i32,
        dst_port:  53,
    }
}

pub fn traces(node: usize, count: usize) -> Vec<Trace> {
    (0..count).map(|seq| trace(node, seq)).collect()
}

pub fn session(name: &str, source: Option<&str>) -> Session {
    Session {
        metadata: Metadata { name: name.to_owned(), creation_timestamp: Some(Utc::now()) },
        spec:     Spec {
            id:          name.to_owned(),
            source:      Source { node: source.unwrap_or_default().to_owned(), ..Default::default() },
            destination: Destination {
                destination: "10.96.0.10".to_owned(),
                port:        Some(53),
                protocol:    Some("UDP".to_owned()),
            },
        },
        status:   Default::default(),
    }
}

pub fn config(node: &str) -> Config {
    let mut config = Config::new(node);
    config.poll_interval = Duration::from_millis(500);
    config.flush_interval = Duration::from_millis(200);
    config.retry = RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(100), 50);
    config
}

pub struct Fleet {
    pub agents: Vec<Arc<Agent>>,
    pub tasks:  Vec<JoinHandle<Result<()>>>,
    pub stop:   watch::Sender<bool>,
}

pub fn start(agents: Vec<Arc<Agent>>) -> Fleet {
    let (stop, shutdown) = watch::channel(false);
    let tasks = agents.iter().map(|agent| {
        tokio::spawn(agent.clone().run(shutdown.clone()))
    }).collect();
    Fleet { agents, tasks, stop }
}

pub fn agent(config: Config, store: Arc<dyn Store>, nodes: u32, engine: Arc<dyn Engine>) -> Arc<Agent> {
    let cluster: Arc<dyn Cluster> = Arc::new(Pinned::new(nodes, None));
    Arc::new(Agent::new(config, store, cluster, engine))
}

/// Waits, in virtual time, until every agent finished with `name`.
pub async fn outcomes(agents: &[Arc<Agent>], name: &str) -> Vec<Outcome> {
    for _ in 0..1200 {
        let done = agents.iter().filter_map(|a| a.outcome(name)).collect::<Vec<_>>();
        if done.len() == agents.len() {
            return done;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("agents did not finish {}", name);
}

/// Records every version of `name` the store publishes.
pub fn history(store: &MemoryStore, name: &str) -> JoinHandle<Vec<Session>> {
    let mut events = store.subscribe().expect("memory store publishes changes");
    let name = name.to_owned();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        loop {
            match events.recv().await {
                Ok(Event::Applied(v)) if v.session.name() == name => seen.push(v.session),
                Ok(Event::Deleted(n)) if n == name => return seen,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => panic!("history lagged"),
                Err(broadcast::error::RecvError::Closed) => return seen,
            }
        }
    })
}

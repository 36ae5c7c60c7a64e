use std::fmt;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::TERMINATE_TIMEOUT;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub metadata: Metadata,
    pub spec:     Spec,
    #[serde(default)]
    pub status:   Status,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Spec {
    pub id:          String,
    #[serde(default)]
    pub source:      Source,
    pub destination: Destination,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node:      String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod:       String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port:        Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol:    Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces:     Vec<Trace>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub timestamp: DateTime<Utc>,
    pub node:      String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pod:       String,
    #[serde(rename = "srciface")]
    pub src_iface: String,
    #[serde(rename = "dstiface")]
    pub dst_iface: String,
    #[serde(rename = "srcip")]
    pub src_ip:    String,
    #[serde(rename = "dstip")]
    pub dst_ip:    String,
    #[serde(rename = "srcport")]
    pub src_port:  i32,
    #[serde(rename = "dstport")]
    pub dst_port:  i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind:                 Kind,
    pub status:               ConditionStatus,
    #[serde(default)]
    pub observed_generation:  i64,
    #[serde(default = "Utc::now")]
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason:               String,
    #[serde(default)]
    pub message:              String,
}

/// Condition types understood by agents. Types written by other tools are
/// kept verbatim so a read-modify-write never rewrites them.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Kind {
    AgentsReady,
    Terminate,
    Degraded,
    Other(String),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Error, PartialEq)]
pub enum Invalid {
    #[error("missing metadata.name")]
    MissingName,
    #[error("missing spec.id")]
    MissingId,
    #[error("missing spec.destination.destination")]
    MissingDestination,
    #[error("port {0} out of range")]
    Port(i32),
    #[error("unsupported protocol '{0}'")]
    Protocol(String),
    #[error("spec is immutable")]
    SpecChanged,
    #[error("{kind} observedGeneration regressed from {was} to {now}")]
    Regressed { kind: Kind, was: i64, now: i64 },
    #[error("{0} reverted from True")]
    Reverted(Kind),
    #[error("traces dropped from status")]
    TracesDropped,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn validate(&self) -> Result<(), Invalid> {
        let dst = &self.spec.destination;

        if self.metadata.name.is_empty() {
            return Err(Invalid::MissingName);
        }

        if self.spec.id.trim().is_empty() {
            return Err(Invalid::MissingId);
        }

        if dst.destination.trim().is_empty() {
            return Err(Invalid::MissingDestination);
        }

        if let Some(port) = dst.port {
            if !(0..=65535).contains(&port) {
                return Err(Invalid::Port(port));
            }
        }

        match dst.protocol() {
            None | Some("TCP" | "UDP" | "SCTP") => Ok(()),
            Some(other) => Err(Invalid::Protocol(other.to_owned())),
        }
    }

    /// Checks that `next` is a legal successor of `self`: `spec` is
    /// untouched, counters and True conditions never go backwards and
    /// traces are only ever appended.
    pub fn check_transition(&self, next: &Session) -> Result<(), Invalid> {
        if self.spec != next.spec {
            return Err(Invalid::SpecChanged);
        }

        let was = self.status.ready_count();
        let now = next.status.ready_count();
        if now < was {
            return Err(Invalid::Regressed { kind: Kind::AgentsReady, was, now });
        }

        for kind in [Kind::AgentsReady, Kind::Terminate] {
            if self.status.is_true(&kind) && !next.status.is_true(&kind) {
                return Err(Invalid::Reverted(kind));
            }
        }

        if !next.status.traces.starts_with(&self.status.traces) {
            return Err(Invalid::TracesDropped);
        }

        Ok(())
    }

    /// A session older than the fail-safe window has already ended on
    /// every agent that took part in it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let window = match Duration::from_std(TERMINATE_TIMEOUT) {
            Ok(window) => window,
            Err(_)     => return false,
        };

        match self.metadata.creation_timestamp {
            Some(created) => created + window < now,
            None          => false,
        }
    }
}

impl Source {
    pub fn node(&self) -> Option<&str> {
        non_empty(&self.node)
    }

    pub fn pod(&self) -> Option<&str> {
        non_empty(&self.pod)
    }

    pub fn namespace(&self) -> Option<&str> {
        non_empty(&self.namespace)
    }
}

impl Destination {
    pub fn port(&self) -> Option<u16> {
        self.port.filter(|port| *port > 0).and_then(|port| u16::try_from(port).ok())
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref().and_then(non_empty)
    }
}

impl Status {
    pub fn condition(&self, kind: &Kind) -> Option<&Condition> {
        self.conditions.iter().find(|c| &c.kind == kind)
    }

    /// Returns the condition of the given kind, inserting it as `Unknown`
    /// when the record has none yet.
    pub fn condition_mut(&mut self, kind: Kind) -> &mut Condition {
        let index = match self.conditions.iter().position(|c| c.kind == kind) {
            Some(index) => index,
            None        => {
                self.conditions.push(Condition::new(kind, ConditionStatus::Unknown, "Pending"));
                self.conditions.len() - 1
            }
        };
        &mut self.conditions[index]
    }

    pub fn is_true(&self, kind: &Kind) -> bool {
        self.condition(kind).map_or(false, |c| c.status == ConditionStatus::True)
    }

    pub fn ready_count(&self) -> i64 {
        self.condition(&Kind::AgentsReady).map_or(0, |c| c.observed_generation)
    }

    /// Nodes that reported ready, one per line of the `AgentsReady` message.
    pub fn ready_nodes(&self) -> impl Iterator<Item = &str> {
        let message = self.condition(&Kind::AgentsReady).map_or("", |c| c.message.as_str());
        message.lines().filter(|line| !line.is_empty())
    }

    /// Counts `node` as ready unless the record already lists it.
    pub fn count_ready(&mut self, node: &str) -> bool {
        if self.ready_nodes().any(|n| n == node) {
            return false;
        }

        let ready = self.condition_mut(Kind::AgentsReady);
        ready.observed_generation += 1;
        if !ready.message.is_empty() {
            ready.message.push('\n');
        }
        ready.message.push_str(node);

        true
    }

    pub fn is_ready(&self) -> bool {
        self.is_true(&Kind::AgentsReady)
    }

    pub fn is_terminated(&self) -> bool {
        self.is_true(&Kind::Terminate)
    }
}

impl Condition {
    pub fn new(kind: Kind, status: ConditionStatus, reason: &str) -> Self {
        Self {
            kind:                 kind,
            status:               status,
            observed_generation:  0,
            last_transition_time: Utc::now(),
            reason:               reason.to_owned(),
            message:              String::new(),
        }
    }

    pub fn set(&mut self, status: ConditionStatus, reason: &str) {
        if self.status != status {
            self.status = status;
            self.last_transition_time = Utc::now();
        }
        self.reason = reason.to_owned();
    }
}

impl From<String> for Kind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "AgentsReady" => Self::AgentsReady,
            "Terminate"   => Self::Terminate,
            "Degraded"    => Self::Degraded,
            _             => Self::Other(kind),
        }
    }
}

impl From<Kind> for String {
    fn from(kind: Kind) -> Self {
        kind.to_string()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AgentsReady => f.write_str("AgentsReady"),
            Self::Terminate   => f.write_str("Terminate"),
            Self::Degraded    => f.write_str("Degraded"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

fn non_empty(value: &str) -> Option<&str> {
    match value.trim() {
        ""    => None,
        value => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use super::*;

    fn session() -> Session {
        Session {
            metadata: Metadata {
                name:               "abc".to_owned(),
                creation_timestamp: None,
            },
            spec: Spec {
                id:          "abc".to_owned(),
                source:      Source::default(),
                destination: Destination {
                    destination: "example.com".to_owned(),
                    port:        Some(443),
                    protocol:    Some("TCP".to_owned()),
                },
            },
            status: Status::default(),
        }
    }

    fn trace(port: i32) -> Trace {
        Trace {
            timestamp: Utc::now(),
            node:      "node-a".to_owned(),
            pod:       String::new(),
            src_iface: "eth0".to_owned(),
            dst_iface: "veth1".to_owned(),
            src_ip:    "10.0.0.1".to_owned(),
            dst_ip:    "10.0.0.2".to_owned(),
            src_port:  port,
            dst_port:  443,
        }
    }

    #[test]
    fn decodes_wire_names() {
        let value = json!({
            "metadata": { "name": "abc", "creationTimestamp": "2024-01-01T00:00:00Z" },
            "spec": {
                "id": "abc",
                "source": { "node": "node-a" },
                "destination": { "destination": "10.0.0.2", "port": 0, "protocol": "" }
            },
            "status": {
                "traces": [{
                    "timestamp": "2024-01-01T00:00:01Z",
                    "node": "node-a",
                    "srciface": "eth0",
                    "dstiface": "eth1",
                    "srcip": "10.0.0.1",
                    "dstip": "10.0.0.2",
                    "srcport": 40000,
                    "dstport": 80
                }],
                "conditions": [
                    { "type": "AgentsReady", "status": "Unknown", "observedGeneration": 2 },
                    { "type": "SomethingElse", "status": "True", "reason": "Foo" }
                ]
            }
        });

        let session: Session = serde_json::from_value(value).unwrap();
        assert_eq!(session.spec.source.node(), Some("node-a"));
        assert_eq!(session.spec.source.pod(), None);
        assert_eq!(session.spec.destination.port(), None);
        assert_eq!(session.spec.destination.protocol(), None);
        assert_eq!(session.status.traces[0].src_port, 40000);
        assert_eq!(session.status.ready_count(), 2);
        assert!(session.validate().is_ok());

        let other = Kind::Other("SomethingElse".to_owned());
        assert!(session.status.is_true(&other));

        let encoded = serde_json::to_value(&session).unwrap();
        assert_eq!(encoded["status"]["conditions"][1]["type"], "SomethingElse");
        assert_eq!(encoded["status"]["traces"][0]["dstiface"], "eth1");
    }

    #[test]
    fn rejects_invalid_records() {
        let mut s = session();
        s.spec.id = " ".to_owned();
        assert_eq!(s.validate(), Err(Invalid::MissingId));

        let mut s = session();
        s.spec.destination.destination.clear();
        assert_eq!(s.validate(), Err(Invalid::MissingDestination));

        let mut s = session();
        s.spec.destination.port = Some(70000);
        assert_eq!(s.validate(), Err(Invalid::Port(70000)));

        let mut s = session();
        s.spec.destination.protocol = Some("ICMP".to_owned());
        assert_eq!(s.validate(), Err(Invalid::Protocol("ICMP".to_owned())));

        let mut s = session();
        s.spec.destination.port = None;
        s.spec.destination.protocol = None;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn condition_mut_inserts_once() {
        let mut status = Status::default();
        status.condition_mut(Kind::AgentsReady).observed_generation += 1;
        status.condition_mut(Kind::AgentsReady).observed_generation += 1;

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.ready_count(), 2);
        assert!(!status.is_ready());
    }

    #[test]
    fn transition_rules() {
        let old = {
            let mut s = session();
            s.status.traces.push(trace(1));
            let ready = s.status.condition_mut(Kind::AgentsReady);
            ready.observed_generation = 2;
            s.status.condition_mut(Kind::Terminate).set(ConditionStatus::True, "CaptureCompleted");
            s
        };

        let mut next = old.clone();
        next.status.traces.push(trace(2));
        next.status.condition_mut(Kind::AgentsReady).observed_generation = 3;
        assert!(old.check_transition(&next).is_ok());

        let mut next = old.clone();
        next.status.condition_mut(Kind::AgentsReady).observed_generation = 1;
        assert!(matches!(old.check_transition(&next), Err(Invalid::Regressed { .. })));

        let mut next = old.clone();
        next.status.condition_mut(Kind::Terminate).set(ConditionStatus::False, "Capturing");
        assert_eq!(old.check_transition(&next), Err(Invalid::Reverted(Kind::Terminate)));

        let mut next = old.clone();
        next.status.traces.clear();
        assert_eq!(old.check_transition(&next), Err(Invalid::TracesDropped));

        let mut next = old.clone();
        next.spec.id = "other".to_owned();
        assert_eq!(old.check_transition(&next), Err(Invalid::SpecChanged));
    }

    #[test]
    fn expiry_follows_creation_time() {
        let now = Utc::now();
        let mut s = session();
        assert!(!s.is_expired(now));

        s.metadata.creation_timestamp = Some(now - Duration::seconds(10));
        assert!(!s.is_expired(now));

        s.metadata.creation_timestamp = Some(now - Duration::seconds(31));
        assert!(s.is_expired(now));
    }

    #[test]
    fn set_tracks_transition_time() {
        let mut c = Condition::new(Kind::Terminate, ConditionStatus::False, "Capturing");
        let epoch = DateTime::parse_from_rfc3339("1970-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        c.last_transition_time = epoch;
        c.set(ConditionStatus::False, "StillCapturing");
        assert_eq!(c.last_transition_time, epoch);
        c.set(ConditionStatus::True, "CaptureCompleted");
        assert!(c.last_transition_time > epoch);
        assert_eq!(c.reason, "CaptureCompleted");
    }

    #[test]
    fn conditions_carry_every_field() {
        let mut status = Status::default();
        status.condition_mut(Kind::Terminate).set(ConditionStatus::False, "Capturing");

        let encoded = serde_json::to_value(&status).unwrap();
        let terminate = encoded["conditions"][0].as_object().unwrap();
        for key in ["type", "status", "observedGeneration", "lastTransitionTime", "reason", "message"] {
            assert!(terminate.contains_key(key), "missing {}", key);
        }
        assert_eq!(terminate["message"], "");
    }

    #[test]
    fn readiness_counts_each_node_once() {
        let mut status = Status::default();
        assert!(status.count_ready("node-a"));
        assert!(status.count_ready("node-b"));
        assert!(!status.count_ready("node-a"));

        assert_eq!(status.ready_count(), 2);
        assert_eq!(status.ready_nodes().collect::<Vec<_>>(), vec!["node-a", "node-b"]);
    }
}

//! The local packet capture, seen from the agent.
//!
//! An [`Engine`] is started once per session with a [`Filter`] and hands
//! back a channel of traces. It must stop producing by the filter's
//! deadline on its own; dropping the receiver stops it earlier.

use std::net::IpAddr;
use anyhow::Result;
use tokio::sync::mpsc::Receiver;
use tokio::time::Instant;
use crate::data::{Destination, Trace};

pub use exec::Exec;

mod exec;
mod line;

#[derive(Clone, Debug)]
pub struct Filter {
    pub id:          String,
    pub destination: Destination,
    pub addresses:   Vec<IpAddr>,
    pub deadline:    Instant,
}

pub trait Engine: Send + Sync {
    fn start(&self, filter: Filter) -> Result<Receiver<Trace>>;
}

use std::time::Duration;
use crate::retry::RetryPolicy;

/// Hard cap on how long any agent captures for one session, measured on
/// the agent's own clock from the moment it starts capturing.
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time after the deadline for delivering traces already captured and for
/// the source's last `Terminate` write.
pub const FINAL_WRITE_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct Config {
    pub node:            String,
    pub batch_size:      usize,
    pub flush_interval:  Duration,
    pub poll_interval:   Duration,
    pub terminate_after: Option<usize>,
    pub retry:           RetryPolicy,
}

impl Config {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node:            node.into(),
            batch_size:      64,
            flush_interval:  Duration::from_secs(1),
            poll_interval:   Duration::from_secs(2),
            terminate_after: None,
            retry:           RetryPolicy::default(),
        }
    }
}

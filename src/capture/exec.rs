use std::process::Stdio;
use anyhow::{anyhow, Result};
use log::{debug, trace};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc::{channel, Receiver};
use tokio::time::{sleep_until, Instant};
use crate::data::Trace;
use crate::spawn;
use super::{Engine, Filter};

/// Runs an external capture command per session. The command learns what
/// to capture from `PCAP_*` environment variables and prints one JSON
/// trace per line on stdout; it is killed once the deadline passes or the
/// agent stops listening.
pub struct Exec {
    program: String,
    args:    Vec<String>,
}

impl Exec {
    pub fn parse(command: &str) -> Result<Self> {
        let mut words = command.split_whitespace().map(str::to_owned);
        let program = words.next().ok_or_else(|| anyhow!("empty capture command"))?;
        let args    = words.collect();
        Ok(Self { program, args })
    }
}

impl Engine for Exec {
    fn start(&self, filter: Filter) -> Result<Receiver<Trace>> {
        let remaining = filter.deadline.saturating_duration_since(Instant::now());
        let dst = &filter.destination;
        let ips = filter.addresses.iter().map(|ip| ip.to_string()).collect::<Vec<_>>();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("PCAP_ID", &filter.id)
            .env("PCAP_DESTINATION", &dst.destination)
            .env("PCAP_ADDRESSES", ips.join(","))
            .env("PCAP_PORT", dst.port().map(|p| p.to_string()).unwrap_or_default())
            .env("PCAP_PROTOCOL", dst.protocol().unwrap_or_default())
            .env("PCAP_TIMEOUT", remaining.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| anyhow!("capture stdout unavailable"))?;
        let (tx, rx) = channel(1024);
        let id = filter.id;
        let deadline = filter.deadline;

        spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let deadline  = sleep_until(deadline);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = tx.closed()   => break,
                    line = lines.next_line() => match line? {
                        Some(line) => match Trace::try_from(line.as_bytes()) {
                            Ok(trace) => if tx.send(trace).await.is_err() { break },
                            Err(e)    => trace!("{}: {}", id, e),
                        },
                        None => break,
                    },
                }
            }

            child.kill().await.ok();
            debug!("{}: capture command exited: {:?}", id, child.wait().await?);

            Ok(())
        });

        Ok(rx)
    }
}

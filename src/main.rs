use std::env;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use env_logger::Builder;
use gumdrop::Options;
use log::{info, LevelFilter};
use tokio::signal::ctrl_c;
use tokio::sync::watch;
use kpcap::agent::Agent;
use kpcap::capture::Exec;
use kpcap::config::Config;
use kpcap::role::{Cluster, Pinned};
use kpcap::store::Backend;

#[derive(Options)]
pub struct Args {
    #[options(help = "print help message")]
    help: bool,
    #[options(no_short, help = "node name (default: $NODE_NAME or hostname)")]
    node: Option<String>,
    #[options(no_short, help = "session store, kube[,endpoint=URL][,token=PATH][,ca=PATH]")]
    store: Option<Backend>,
    #[options(no_short, help = "expected node count, overrides the cluster's")]
    nodes: Option<u32>,
    #[options(no_short, help = "capture command printing JSON traces")]
    capture: Option<String>,
    #[options(no_short, help = "traces per status write")]
    batch_size: Option<usize>,
    #[options(no_short, help = "trace flush interval in milliseconds")]
    flush_ms: Option<u64>,
    #[options(no_short, help = "relist interval in milliseconds")]
    poll_ms: Option<u64>,
    #[options(no_short, help = "terminate once this many traces are recorded")]
    terminate_after: Option<usize>,
    #[options(count, help = "increase log verbosity")]
    verbose: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args_default_or_exit();

    let mut builder = Builder::from_default_env();
    builder.filter(None, match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    });
    builder.init();

    let node = match args.node {
        Some(node) => node,
        None       => node_name()?,
    };

    let backend = match args.store {
        Some(backend) => backend,
        None          => "kube".parse()?,
    };

    let command = args.capture.ok_or_else(|| anyhow!("--capture is required"))?;
    let engine  = Arc::new(Exec::parse(&command)?);

    let (store, cluster) = backend.into_parts();
    let cluster: Arc<dyn Cluster> = match args.nodes {
        Some(nodes) => Arc::new(Pinned::new(nodes, Some(cluster))),
        None        => cluster,
    };

    let mut config = Config::new(node);
    config.terminate_after = args.terminate_after;
    if let Some(n) = args.batch_size {
        config.batch_size = n.max(1);
    }
    if let Some(ms) = args.flush_ms {
        config.flush_interval = Duration::from_millis(ms.max(1));
    }
    if let Some(ms) = args.poll_ms {
        config.poll_interval = Duration::from_millis(ms.max(1));
    }

    let agent = Arc::new(Agent::new(config, store, cluster, engine));
    let (stop, shutdown) = watch::channel(false);

    tokio::spawn(async move {
        if ctrl_c().await.is_ok() {
            info!("shutting down");
            let _ = stop.send(true);
        }
    });

    agent.run(shutdown).await
}

fn node_name() -> Result<String> {
    if let Ok(node) = env::var("NODE_NAME") {
        if !node.is_empty() {
            return Ok(node);
        }
    }

    hostname::get()?.into_string().map_err(|name| anyhow!("invalid hostname {:?}", name))
}

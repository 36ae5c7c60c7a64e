use std::str::FromStr;
use std::sync::Arc;
use anyhow::{anyhow, Error, Result};
use crate::role::Cluster;
use super::{Args, KubeClient, Store};

pub enum Backend {
    Kube(KubeClient),
}

impl Backend {
    pub fn into_parts(self) -> (Arc<dyn Store>, Arc<dyn Cluster>) {
        match self {
            Self::Kube(client) => {
                let client = Arc::new(client);
                let store: Arc<dyn Store> = client.clone();
                let cluster: Arc<dyn Cluster> = client;
                (store, cluster)
            }
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match Args::parse(arg)? {
            ("kube", args) => kube(args),
            _              => Err(anyhow!("unknown store: {}", arg)),
        }
    }
}

fn kube(args: Args) -> Result<Backend> {
    Ok(Backend::Kube(KubeClient::new(args)?))
}

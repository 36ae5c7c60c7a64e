use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Certificate, Client as HttpClient, Method, Request, Response, StatusCode, Url};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio::sync::broadcast::Receiver;
use crate::data::Session;
use crate::role::Cluster;
use super::{Args, Error, Event, Result, Store, Version, Versioned};

const API_VERSION:     &str = "pcap.k8s.io/v1";
const KIND:            &str = "PCAP";
const PCAPS:           &str = "/apis/pcap.k8s.io/v1/pcaps";
const SERVICE_ACCOUNT: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Talks to the Kubernetes API server. `pcaps` are cluster scoped and
/// their status is written through the `status` subresource with the read
/// `resourceVersion`, which the API server enforces as a precondition.
pub struct KubeClient {
    client:   HttpClient,
    endpoint: Url,
    token:    Option<PathBuf>,
}

impl KubeClient {
    pub fn new(args: Args) -> anyhow::Result<Self> {
        args.check(&["endpoint", "token", "ca"])?;

        let endpoint = match args.opt("endpoint") {
            Some(endpoint) => endpoint.to_owned(),
            None           => in_cluster()?,
        };
        let endpoint = Url::parse(&endpoint)?;

        let token = args.opt("token").map(PathBuf::from).or_else(|| account("token"));
        let ca    = args.opt("ca").map(PathBuf::from).or_else(|| account("ca.crt"));

        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, "application/json".try_into()?);
        headers.insert(header::CONTENT_TYPE, "application/json".try_into()?);
        headers.insert(header::USER_AGENT, env!("CARGO_PKG_NAME").try_into()?);

        let mut builder = HttpClient::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10));

        if let Some(ca) = ca {
            let pem = fs::read(&ca).with_context(|| format!("reading {}", ca.display()))?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        let client = builder.build()?;

        Ok(Self { client, endpoint, token })
    }

    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> anyhow::Result<Response> {
        let url = self.endpoint.join(path)?;
        let mut req = Request::new(method, url);

        if let Some(token) = &self.token {
            let token = tokio::fs::read_to_string(token).await?;
            let value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))?;
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }

        *req.body_mut() = body.map(Into::into);

        trace!("{} {}", req.method(), req.url());

        Ok(self.client.execute(req).await?)
    }

    async fn fetch(&self, path: &str) -> anyhow::Result<Option<Value>> {
        let res = self.request(Method::GET, path, None).await?;
        match res.status() {
            StatusCode::NOT_FOUND      => Ok(None),
            s if s.is_success()        => Ok(Some(res.json().await?)),
            s                          => Err(anyhow!("GET {}: {}: {}", path, s, res.text().await?)),
        }
    }
}

#[async_trait]
impl Store for KubeClient {
    async fn list(&self) -> Result<Vec<Versioned>> {
        let list = self.fetch(PCAPS).await?.ok_or_else(|| anyhow!("{} not served", PCAPS))?;

        let items = match list.get("items").and_then(Value::as_array) {
            Some(items) => items.clone(),
            None        => Vec::new(),
        };

        let mut sessions = Vec::with_capacity(items.len());
        for item in items {
            match decode(item) {
                Ok(versioned) => sessions.push(versioned),
                Err(e)        => debug!("skipping undecodable pcap: {:?}", e),
            }
        }

        Ok(sessions)
    }

    async fn get(&self, name: &str) -> Result<Versioned> {
        let path = format!("{}/{}", PCAPS, name);
        match self.fetch(&path).await? {
            Some(value) => Ok(decode(value)?),
            None        => Err(Error::NotFound(name.to_owned())),
        }
    }

    async fn update(&self, expected: Version, session: &Session) -> Result<Version> {
        let name = session.name();
        let path = format!("{}/{}/status", PCAPS, name);
        let body = serde_json::to_vec(&encode(expected, session)?).map_err(anyhow::Error::from)?;

        let res    = self.request(Method::PUT, &path, Some(body)).await?;
        let status = res.status();

        if status.is_success() {
            let value = res.json::<Value>().await.map_err(anyhow::Error::from)?;
            return Ok(version(&value)?);
        }

        let body = res.text().await.unwrap_or_default();
        Err(failure(status, name, expected, &body))
    }

    fn subscribe(&self) -> Option<Receiver<Event>> {
        None
    }
}

#[async_trait]
impl Cluster for KubeClient {
    async fn node_count(&self) -> anyhow::Result<u32> {
        let nodes = self.fetch("/api/v1/nodes").await?.ok_or_else(|| anyhow!("nodes not served"))?;
        let count = nodes.get("items").and_then(Value::as_array).map_or(0, Vec::len);
        Ok(count.try_into()?)
    }

    async fn pod_node(&self, namespace: &str, pod: &str) -> anyhow::Result<Option<String>> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", namespace, pod);
        let pod  = self.fetch(&path).await?;
        Ok(pod.as_ref().and_then(|pod| {
            pod.pointer("/spec/nodeName").and_then(Value::as_str).map(str::to_owned)
        }))
    }
}

/// Only conflicts, throttling and server side failures are worth retrying;
/// any other client error would be rejected again.
fn failure(status: StatusCode, name: &str, expected: Version, body: &str) -> Error {
    match status {
        StatusCode::CONFLICT          => Error::Conflict { name: name.to_owned(), expected },
        StatusCode::NOT_FOUND         => Error::NotFound(name.to_owned()),
        StatusCode::TOO_MANY_REQUESTS => Error::Backend(anyhow!("{}: {}: {}", name, status, body)),
        s if s.is_client_error()      => Error::Rejected(format!("{}: {}: {}", name, s, body)),
        s                             => Error::Backend(anyhow!("{}: {}: {}", name, s, body)),
    }
}

fn decode(value: Value) -> anyhow::Result<Versioned> {
    let version = version(&value)?;
    let session = serde_json::from_value(value)?;
    Ok(Versioned { version, session })
}

fn encode(expected: Version, session: &Session) -> anyhow::Result<Value> {
    let mut value = serde_json::to_value(session)?;
    value["apiVersion"] = json!(API_VERSION);
    value["kind"] = json!(KIND);
    value["metadata"]["resourceVersion"] = json!(expected.to_string());
    Ok(value)
}

fn version(value: &Value) -> anyhow::Result<Version> {
    let version = value.pointer("/metadata/resourceVersion").and_then(Value::as_str);
    let version = version.ok_or_else(|| anyhow!("missing metadata.resourceVersion"))?;
    Ok(Version(version.parse()?))
}

fn in_cluster() -> anyhow::Result<String> {
    let host = env::var("KUBERNETES_SERVICE_HOST").context("KUBERNETES_SERVICE_HOST unset")?;
    let port = env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_owned());
    match host.contains(':') {
        true  => Ok(format!("https://[{}]:{}", host, port)),
        false => Ok(format!("https://{}:{}", host, port)),
    }
}

fn account(file: &str) -> Option<PathBuf> {
    let path = Path::new(SERVICE_ACCOUNT).join(file);
    path.exists().then(|| path)
}

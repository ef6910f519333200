//! Docker Engine API client.
//!
//! Speaks the subset of the Docker Engine HTTP API the fleet manager needs,
//! over either the local unix socket or a plain TCP endpoint.
//!
//! Reference: https://docs.docker.com/engine/api/v1.43/

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::service::Service;
use hyper::{Body, Client, Method, Request, Response, StatusCode, Uri};
use hyperlocal::UnixConnector;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::{form_urlencoded, Url};

use crate::connection::ClientKey;
use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSummary, CreateSpec, ListFilter, RemoveOptions,
    RuntimeError,
};

enum Transport {
    Unix {
        socket_path: String,
        client: Client<ConnectTimeout<UnixConnector>>,
    },
    Tcp {
        base: String,
        client: Client<HttpConnector>,
    },
}

/// Connector wrapper that gives up after `timeout`.
///
/// `HttpConnector` has its own connect timeout; hyperlocal does not.
#[derive(Debug, Clone, Copy)]
struct ConnectTimeout<C> {
    inner: C,
    timeout: Duration,
}

impl<C> Service<Uri> for ConnectTimeout<C>
where
    C: Service<Uri, Error = io::Error>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
{
    type Response = C::Response;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<C::Response, io::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let connecting = self.inner.call(uri);
        let timeout = self.timeout;
        Box::pin(async move {
            tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
        })
    }
}

/// Parsed runtime endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// `unix:///var/run/docker.sock`
    Unix(String),
    /// `tcp://host:2375` or `http://host:2375`, stored as an http base URL.
    Tcp(String),
}

impl DockerEndpoint {
    /// Parse an endpoint URI.
    pub fn parse(uri: &str) -> Result<Self, RuntimeError> {
        let invalid = |reason: &str| RuntimeError::InvalidEndpoint {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(uri).map_err(|e| invalid(&e.to_string()))?;

        match url.scheme() {
            "unix" => {
                if url.path().is_empty() || url.path() == "/" {
                    return Err(invalid("missing socket path"));
                }
                Ok(Self::Unix(url.path().to_string()))
            }
            "tcp" | "http" => {
                let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
                let port = url.port().unwrap_or(2375);
                Ok(Self::Tcp(format!("http://{host}:{port}")))
            }
            other => Err(invalid(&format!("unsupported scheme '{other}'"))),
        }
    }
}

/// Docker Engine API client.
pub struct DockerClient {
    endpoint: String,
    transport: Transport,
    read_timeout: Duration,
}

impl DockerClient {
    /// Build a client for the endpoint described by `key`.
    ///
    /// No connection is made until the first request.
    pub fn connect(key: &ClientKey) -> Result<Self, RuntimeError> {
        let transport = match DockerEndpoint::parse(&key.uri)? {
            DockerEndpoint::Unix(socket_path) => Transport::Unix {
                socket_path,
                client: Client::builder().build(ConnectTimeout {
                    inner: UnixConnector,
                    timeout: key.connect_timeout,
                }),
            },
            DockerEndpoint::Tcp(base) => {
                let mut connector = HttpConnector::new();
                connector.set_connect_timeout(Some(key.connect_timeout));
                connector.set_nodelay(true);
                Transport::Tcp {
                    base,
                    client: Client::builder().build(connector),
                }
            }
        };

        Ok(Self {
            endpoint: key.uri.clone(),
            transport,
            read_timeout: key.read_timeout,
        })
    }

    fn uri(&self, path_and_query: &str) -> Result<hyper::Uri, RuntimeError> {
        match &self.transport {
            Transport::Unix { socket_path, .. } => {
                Ok(hyperlocal::Uri::new(socket_path, path_and_query).into())
            }
            Transport::Tcp { base, .. } => format!("{base}{path_and_query}")
                .parse::<hyper::Uri>()
                .map_err(|e| RuntimeError::Request(e.into())),
        }
    }

    async fn send(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes), RuntimeError> {
        let uri = self.uri(path_and_query)?;
        debug!(method = %method, path = path_and_query, "Docker API request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("Accept", "application/json");
        let body = match body {
            Some(bytes) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(bytes)
            }
            None => Body::empty(),
        };
        let request = builder.body(body)?;

        let exchange = async {
            let response: Response<Body> = match &self.transport {
                Transport::Unix { client, .. } => client.request(request).await?,
                Transport::Tcp { client, .. } => client.request(request).await?,
            };
            let status = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, RuntimeError>((status, body))
        };

        tokio::time::timeout(self.read_timeout, exchange)
            .await
            .map_err(|_| RuntimeError::Timeout {
                endpoint: self.endpoint.clone(),
                timeout: self.read_timeout,
            })?
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path_and_query: &str,
        subject: &str,
    ) -> Result<T, RuntimeError> {
        let (status, body) = self.send(Method::GET, path_and_query, None).await?;
        if status.is_success() {
            Ok(serde_json::from_slice(&body)?)
        } else {
            Err(error_for_status(status, &body, subject))
        }
    }

    async fn expect_success(
        &self,
        method: Method,
        path_and_query: &str,
        subject: &str,
    ) -> Result<(), RuntimeError> {
        let (status, body) = self.send(method, path_and_query, None).await?;
        // 304 means the container is already in the requested state.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            Ok(())
        } else {
            Err(error_for_status(status, &body, subject))
        }
    }
}

/// Map a non-success response onto a [`RuntimeError`].
fn error_for_status(status: StatusCode, body: &[u8], subject: &str) -> RuntimeError {
    let message = serde_json::from_slice::<ApiMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());

    match status {
        StatusCode::NOT_FOUND => RuntimeError::NotFound(subject.to_string()),
        StatusCode::CONFLICT => RuntimeError::Conflict(message),
        _ => {
            error!(status = %status, message = %message, "Docker API error");
            RuntimeError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}

/// Build the query string for a list call.
fn list_query(filter: &ListFilter) -> Result<String, RuntimeError> {
    let mut query = form_urlencoded::Serializer::new(String::new());
    if filter.all {
        query.append_pair("all", "true");
    }
    if !filter.labels.is_empty() {
        let labels: Vec<String> = filter
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        let filters = serde_json::to_string(&BTreeMap::from([("label", labels)]))?;
        query.append_pair("filters", &filters);
    }
    Ok(query.finish())
}

fn with_query(path: &str, query: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{path}?{query}")
    }
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    id: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created: i64,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl From<ListEntry> for ContainerSummary {
    fn from(entry: ListEntry) -> Self {
        Self {
            id: entry.id,
            image: entry.image,
            status: entry.status.filter(|s| !s.is_empty()),
            created: DateTime::from_timestamp(entry.created, 0).unwrap_or(DateTime::UNIX_EPOCH),
            labels: entry.labels.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectResponse {
    id: String,
    #[serde(default)]
    name: String,
    created: DateTime<Utc>,
    config: InspectConfig,
    state: InspectState,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

impl From<InspectResponse> for ContainerDetails {
    fn from(resp: InspectResponse) -> Self {
        Self {
            id: resp.id,
            name: resp.name.trim_start_matches('/').to_string(),
            image: resp.config.image,
            running: resp.state.running,
            created: resp.created,
            labels: resp.config.labels.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<&'a [String]>,
    env: Vec<String>,
    labels: &'a BTreeMap<String, String>,
    open_stdin: bool,
    attach_stdin: bool,
    stdin_once: bool,
}

impl<'a> CreateBody<'a> {
    fn from_spec(spec: &'a CreateSpec) -> Self {
        Self {
            image: &spec.image,
            hostname: spec.hostname.as_deref(),
            cmd: (!spec.cmd.is_empty()).then_some(spec.cmd.as_slice()),
            env: spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            labels: &spec.labels,
            open_stdin: spec.open_stdin,
            attach_stdin: spec.open_stdin,
            stdin_once: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn list(&self, filter: &ListFilter) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let path = with_query("/containers/json", &list_query(filter)?);
        let entries: Vec<ListEntry> = self.get_json(&path, "containers").await?;
        Ok(entries.into_iter().map(ContainerSummary::from).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDetails, RuntimeError> {
        let resp: InspectResponse = self
            .get_json(&format!("/containers/{id}/json"), id)
            .await?;
        Ok(resp.into())
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("name", &spec.name)
            .finish();
        let body = serde_json::to_vec(&CreateBody::from_spec(spec))?;

        let (status, resp) = self
            .send(
                Method::POST,
                &with_query("/containers/create", &query),
                Some(body),
            )
            .await?;
        if !status.is_success() {
            return Err(error_for_status(status, &resp, &spec.image));
        }

        let created: CreateResponse = serde_json::from_slice(&resp)?;
        for warning in created.warnings.unwrap_or_default() {
            debug!(container_id = %created.id, warning = %warning, "Docker create warning");
        }
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.expect_success(Method::POST, &format!("/containers/{id}/start"), id)
            .await
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), RuntimeError> {
        let path = format!("/containers/{id}/stop?t={}", timeout.as_secs());
        self.expect_success(Method::POST, &path, id).await
    }

    async fn remove(&self, id: &str, options: RemoveOptions) -> Result<(), RuntimeError> {
        let path = format!(
            "/containers/{id}?force={}&v={}",
            options.force, options.volumes
        );
        self.expect_success(Method::DELETE, &path, id).await
    }
}

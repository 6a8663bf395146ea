//! Consul HTTP client
//!
//! Only two endpoints are used:
//! - `GET /v1/catalog/services?tag=..&index=..&wait=..` (blocking query)
//! - `GET /v1/health/service/{name}?passing=true`

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, Url};
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use super::{ChangeIndex, ServiceInstance, CONSUL_SERVICE_NAME};
use crate::Error;

/// Header carrying the token on every request
const TOKEN_HEADER: &str = "X-Consul-Token";
/// Header carrying the blocking-query index on catalog responses
const INDEX_HEADER: &str = "X-Consul-Index";
/// Longest error body quoted in error messages
const MAX_ERROR_BODY: usize = 1024;

/// Default blocking-query wait (Consul's own maximum)
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5 * 60);
/// Default HTTP request timeout; must exceed the wait so idle long-polls
/// end on Consul's side and the connection is reused
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// One answer of the catalog endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogPage {
    /// Matching service names, sorted, without Consul's own service
    pub names: Vec<String>,
    /// Index to pass to the next blocking query
    pub index: ChangeIndex,
}

/// Read access to the Consul catalog.
///
/// Abstracted so the watcher can be exercised without a Consul agent.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// List services carrying the configured tag.
    ///
    /// With a non-zero `wait_index` the request blocks until the catalog
    /// changes past that index or the wait elapses.
    async fn list_services(&self, wait_index: ChangeIndex) -> Result<CatalogPage, Error>;

    /// Fetch the instances of one service that pass all health checks
    async fn service_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, Error>;
}

/// Connection settings for [`ConsulClient`]
#[derive(Clone, Debug)]
pub struct ConsulConfig {
    /// Agent address, e.g. `http://consul.service:8500`
    pub address: String,
    /// ACL token
    pub token: Option<String>,
    /// Only services carrying this tag are projected; empty means all
    pub tag: String,
    /// Blocking-query wait
    pub wait: Duration,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl ConsulConfig {
    /// Settings with default wait and timeout
    pub fn new(address: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: None,
            tag: tag.into(),
            wait: DEFAULT_WAIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// [`RegistryClient`] talking to a Consul agent over HTTP
#[derive(Clone, Debug)]
pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
    tag: String,
    wait: Duration,
}

/// Entry of `/v1/health/service/{name}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: HealthNode,
    service: HealthService,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthNode {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthService {
    service: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: i64,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl From<HealthEntry> for ServiceInstance {
    fn from(entry: HealthEntry) -> Self {
        let address = if entry.service.address.is_empty() {
            entry.node.address
        } else {
            entry.service.address
        };
        ServiceInstance {
            service_name: entry.service.service,
            address,
            port: entry.service.port,
            tags: entry.service.tags.unwrap_or_default().into_iter().collect(),
        }
    }
}

impl ConsulClient {
    /// Build a client; fails on an unparseable address
    pub fn new(config: ConsulConfig) -> Result<Self, Error> {
        let base = Url::parse(&config.address)
            .map_err(|e| Error::config(format!("invalid consul address {:?}: {e}", config.address)))?;
        if base.cannot_be_a_base() {
            return Err(Error::config(format!(
                "consul address {:?} cannot be used as a base URL",
                config.address
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            token: config.token.filter(|t| !t.is_empty()),
            tag: config.tag,
            wait: config.wait,
        })
    }

    /// Base URL extended with path segments, each one percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn get(
        &self,
        url: Url,
        query: &[(&str, String)],
        service: Option<&str>,
    ) -> Result<Response, Error> {
        let mut request = self.http.get(url).query(query);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| registry_error(service, format!("querying consul: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response).await;
            return Err(registry_error(
                service,
                format!("consul returned {}: {}", status.as_u16(), body),
            ));
        }
        Ok(response)
    }
}

fn registry_error(service: Option<&str>, msg: String) -> Error {
    match service {
        Some(name) => Error::registry_for(name, msg),
        None => Error::registry(msg),
    }
}

/// Read at most [`MAX_ERROR_BODY`] bytes of a response body; the rest is
/// never pulled off the wire
async fn read_error_body(mut response: Response) -> String {
    let mut body = Vec::with_capacity(MAX_ERROR_BODY);
    while body.len() < MAX_ERROR_BODY {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(MAX_ERROR_BODY - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Consul duration syntax for the `wait` parameter
fn wait_param(wait: Duration) -> String {
    format!("{}s", wait.as_secs().max(1))
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn list_services(&self, wait_index: ChangeIndex) -> Result<CatalogPage, Error> {
        let url = self.endpoint(&["v1", "catalog", "services"]);
        let mut query = vec![
            ("index", wait_index.get().to_string()),
            ("wait", wait_param(self.wait)),
        ];
        if !self.tag.is_empty() {
            query.push(("tag", self.tag.clone()));
        }

        let response = self.get(url, &query, None).await?;
        let index = ChangeIndex::from_header(
            response
                .headers()
                .get(INDEX_HEADER)
                .and_then(|v| v.to_str().ok()),
        );

        let catalog: BTreeMap<String, Option<Vec<String>>> = response
            .json()
            .await
            .map_err(|e| Error::registry(format!("decoding catalog response: {e}")))?;

        let names: Vec<String> = catalog
            .into_keys()
            .filter(|name| name != CONSUL_SERVICE_NAME)
            .collect();

        debug!(index = %index, services = names.len(), "listed consul services");
        Ok(CatalogPage { names, index })
    }

    async fn service_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, Error> {
        let url = self.endpoint(&["v1", "health", "service", service]);
        let query = [("passing", "true".to_string())];

        let response = self.get(url, &query, Some(service)).await?;
        let entries: Vec<HealthEntry> = response.json().await.map_err(|e| {
            Error::registry_for(service, format!("decoding health response: {e}"))
        })?;

        Ok(entries.into_iter().map(ServiceInstance::from).collect())
    }
}

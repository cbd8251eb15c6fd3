//! HTTP client for the routing API.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::time::Duration;
use tcp_router_core::{BackendEndpoint, ModificationTag, RoutingKey};

use super::{EventStream, RegistryEvent, RouteMapping, RoutingRegistry};
use crate::auth::AccessToken;
use crate::error::RegistryError;

const ROUTER_GROUPS_PATH: &str = "/routing/v1/router_groups";
const TCP_ROUTES_PATH: &str = "/routing/v1/tcp_routes";
const TCP_ROUTE_EVENTS_PATH: &str = "/routing/v1/tcp_routes/events";

#[derive(Debug, Deserialize)]
struct RouterGroupWire {
    guid: String,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct ModificationTagWire {
    #[serde(default)]
    guid: String,
    #[serde(default)]
    index: u32,
}

#[derive(Debug, Deserialize)]
struct TcpRouteWire {
    #[serde(default)]
    router_group_guid: String,
    port: u16,
    backend_ip: String,
    backend_port: u16,
    #[serde(default)]
    modification_tag: ModificationTagWire,
    #[serde(default)]
    ttl: Option<u32>,
}

impl TcpRouteWire {
    fn into_mapping(self) -> RouteMapping {
        let mut endpoint = BackendEndpoint::new(self.backend_ip, self.backend_port).with_tag(
            ModificationTag::new(self.modification_tag.guid, self.modification_tag.index),
        );
        if let Some(ttl) = self.ttl {
            endpoint = endpoint.with_ttl(Duration::from_secs(u64::from(ttl)));
        }
        RouteMapping::new(RoutingKey::new(self.port), endpoint)
    }
}

#[derive(Debug, Deserialize)]
struct KeyRemovedWire {
    #[serde(default)]
    router_group_guid: String,
    port: u16,
}

/// Routing API client scoped to one router group.
#[derive(Debug, Clone)]
pub struct HttpRegistryClient {
    client: reqwest::Client,
    base_url: String,
    router_group_guid: Option<String>,
}

impl HttpRegistryClient {
    /// Create a client for `base_url`. No request timeout is set so the event stream can
    /// stay open; callers bound each call themselves.
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, RegistryError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            router_group_guid: None,
        })
    }

    /// Only consider routes belonging to `guid`.
    pub fn with_router_group(mut self, guid: impl Into<String>) -> Self {
        self.router_group_guid = Some(guid.into());
        self
    }

    /// Look up the GUID of the router group called `name`.
    pub async fn router_group_guid(
        &self,
        name: &str,
        token: &AccessToken,
    ) -> Result<String, RegistryError> {
        let request = self
            .client
            .get(format!("{}{ROUTER_GROUPS_PATH}", self.base_url))
            .query(&[("name", name)]);
        let response = match checked(authorized(request, token).send().await?).await {
            Err(RegistryError::Status { status: 404, .. }) => {
                return Err(RegistryError::RouterGroupNotFound(name.to_string()))
            }
            other => other?,
        };

        let groups: Vec<RouterGroupWire> = response.json().await?;
        groups
            .into_iter()
            .find(|group| group.name == name)
            .map(|group| group.guid)
            .ok_or_else(|| RegistryError::RouterGroupNotFound(name.to_string()))
    }

    fn in_router_group(&self, guid: &str) -> bool {
        self.router_group_guid
            .as_deref()
            .map_or(true, |expected| expected == guid)
    }
}

fn authorized(request: reqwest::RequestBuilder, token: &AccessToken) -> reqwest::RequestBuilder {
    if token.is_empty() {
        request
    } else {
        request.bearer_auth(token.as_str())
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(RegistryError::Unauthorized);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RegistryError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Decode one SSE event. `Ok(None)` means the event belongs to another router group.
fn decode_event(
    name: &str,
    data: &str,
    router_group_guid: Option<&str>,
) -> Result<Option<RegistryEvent>, RegistryError> {
    let malformed = |reason: String| RegistryError::MalformedEvent {
        event: name.to_string(),
        reason,
    };
    let wanted = |guid: &str| router_group_guid.map_or(true, |expected| expected == guid);

    match name {
        "Upsert" | "Delete" => {
            let route: TcpRouteWire =
                serde_json::from_str(data).map_err(|e| malformed(e.to_string()))?;
            if !wanted(&route.router_group_guid) {
                return Ok(None);
            }
            let mapping = route.into_mapping();
            Ok(Some(if name == "Upsert" {
                RegistryEvent::Upsert(mapping)
            } else {
                RegistryEvent::Delete(mapping)
            }))
        }
        "KeyRemoved" => {
            let removed: KeyRemovedWire =
                serde_json::from_str(data).map_err(|e| malformed(e.to_string()))?;
            if !wanted(&removed.router_group_guid) {
                return Ok(None);
            }
            Ok(Some(RegistryEvent::KeyRemoved(RoutingKey::new(removed.port))))
        }
        _ => Err(malformed("unknown event type".to_string())),
    }
}

#[async_trait]
impl RoutingRegistry for HttpRegistryClient {
    async fn fetch_all_routes(
        &self,
        token: &AccessToken,
    ) -> Result<Vec<RouteMapping>, RegistryError> {
        let request = self.client.get(format!("{}{TCP_ROUTES_PATH}", self.base_url));
        let response = checked(authorized(request, token).send().await?).await?;
        let routes: Vec<TcpRouteWire> = response.json().await?;

        Ok(routes
            .into_iter()
            .filter(|route| self.in_router_group(&route.router_group_guid))
            .map(TcpRouteWire::into_mapping)
            .collect())
    }

    async fn subscribe(&self, token: &AccessToken) -> Result<EventStream, RegistryError> {
        let request = self
            .client
            .get(format!("{}{TCP_ROUTE_EVENTS_PATH}", self.base_url))
            .header(ACCEPT, "text/event-stream");
        let response = checked(authorized(request, token).send().await?).await?;

        let router_group_guid = self.router_group_guid.clone();
        let events = response
            .bytes_stream()
            .eventsource()
            .filter_map(move |item| {
                let decoded = match item {
                    Ok(event) => {
                        decode_event(&event.event, &event.data, router_group_guid.as_deref())
                            .transpose()
                    }
                    Err(e) => Some(Err(RegistryError::Stream(e.to_string()))),
                };
                futures::future::ready(decoded)
            });
        Ok(events.boxed())
    }
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod http_tests;

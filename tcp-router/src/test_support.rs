//! Test doubles shared across component tests.

use async_trait::async_trait;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tcp_router_core::{BackendEndpoint, RoutingKey, RoutingSnapshot};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::auth::{AccessToken, TokenProvider};
use crate::configurer::{RouterConfigurer, ScriptRunner};
use crate::error::{ConfigureError, RegistryError, ReloadError, TokenError};
use crate::monitor::ProcessMonitor;
use crate::registry::{EventStream, RegistryEvent, RouteMapping, RoutingRegistry};

/// A request as seen by the stub.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: String,
}

type Responder = dyn Fn(&RecordedRequest) -> Response<Full<Bytes>> + Send + Sync;

/// HTTP/1 server answering every request through a closure.
pub struct StubServer {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl StubServer {
    pub async fn spawn<F>(respond: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let respond: Arc<Responder> = Arc::new(respond);
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let respond = respond.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let respond = respond.clone();
                        let recorded = recorded.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body
                                .collect()
                                .await
                                .map(|collected| collected.to_bytes())
                                .unwrap_or_default();
                            let request = RecordedRequest {
                                method: parts.method,
                                uri: parts.uri.to_string(),
                                headers: parts.headers,
                                body: String::from_utf8_lossy(&body).into_owned(),
                            };
                            let response = respond(&request);
                            recorded.lock().unwrap().push(request);
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(body.into()))
        .unwrap()
}

pub fn json(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    respond(status, "application/json", body.to_string())
}

/// Records every configure call; fails while `fail` is set.
#[derive(Default)]
pub struct FakeConfigurer {
    attempts: Mutex<Vec<RoutingSnapshot>>,
    fail: AtomicBool,
}

impl FakeConfigurer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<RoutingSnapshot> {
        self.attempts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl RouterConfigurer for FakeConfigurer {
    async fn configure(&self, snapshot: &RoutingSnapshot) -> Result<(), ConfigureError> {
        self.attempts.lock().unwrap().push(snapshot.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConfigureError::LoadBalancerNotRunning);
        }
        Ok(())
    }
}

/// Registry double with scripted failures and a push-driven event stream.
pub struct FakeRegistry {
    routes: Mutex<Vec<RouteMapping>>,
    fetch_failures: Mutex<VecDeque<RegistryError>>,
    subscribe_failures: Mutex<VecDeque<RegistryError>>,
    fetch_delay: Mutex<Duration>,
    subscribe_delay: Mutex<Duration>,
    events: mpsc::UnboundedSender<Result<RegistryEvent, RegistryError>>,
    stream: Mutex<Option<mpsc::UnboundedReceiver<Result<RegistryEvent, RegistryError>>>>,
    pub fetch_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        let (events, stream) = mpsc::unbounded_channel();
        Arc::new(Self {
            routes: Mutex::new(Vec::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            subscribe_failures: Mutex::new(VecDeque::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
            subscribe_delay: Mutex::new(Duration::ZERO),
            events,
            stream: Mutex::new(Some(stream)),
            fetch_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_routes(&self, routes: Vec<RouteMapping>) {
        *self.routes.lock().unwrap() = routes;
    }

    pub fn fail_fetch(&self, err: RegistryError) {
        self.fetch_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_subscribe(&self, err: RegistryError) {
        self.subscribe_failures.lock().unwrap().push_back(err);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = delay;
    }

    pub fn push_event(&self, event: Result<RegistryEvent, RegistryError>) {
        let _ = self.events.send(event);
    }

    pub fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoutingRegistry for FakeRegistry {
    async fn fetch_all_routes(
        &self,
        _token: &AccessToken,
    ) -> Result<Vec<RouteMapping>, RegistryError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.fetch_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.routes.lock().unwrap().clone())
    }

    async fn subscribe(&self, _token: &AccessToken) -> Result<EventStream, RegistryError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.subscribe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.subscribe_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        match self.stream.lock().unwrap().take() {
            Some(rx) => Ok(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// Counts plain and forced token fetches.
#[derive(Default)]
pub struct FakeTokenProvider {
    pub fetches: AtomicUsize,
    pub forced: AtomicUsize,
}

impl FakeTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forced_refreshes(&self) -> usize {
        self.forced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FakeTokenProvider {
    async fn fetch_token(&self, force_refresh: bool) -> Result<AccessToken, TokenError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if force_refresh {
            self.forced.fetch_add(1, Ordering::SeqCst);
        }
        Ok(AccessToken::new("fake-token"))
    }
}

/// Liveness double with a switchable running flag.
pub struct FakeMonitor {
    pub running: AtomicBool,
    pub watching: AtomicBool,
    pub suspended: AtomicUsize,
}

impl FakeMonitor {
    pub fn new(running: bool) -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(running),
            watching: AtomicBool::new(true),
            suspended: AtomicUsize::new(0),
        })
    }
}

impl ProcessMonitor for FakeMonitor {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn start_watching(&self) {
        self.watching.store(true, Ordering::SeqCst);
    }

    fn stop_watching(&self) {
        self.suspended.fetch_add(1, Ordering::SeqCst);
        self.watching.store(false, Ordering::SeqCst);
    }
}

/// Reload double that optionally fails.
pub struct FakeReloader {
    fail: bool,
    pub calls: AtomicUsize,
}

impl FakeReloader {
    pub fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ScriptRunner for FakeReloader {
    async fn run(&self) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReloadError::Failed {
                path: "reload".into(),
                status: "exit status: 1".to_string(),
            });
        }
        Ok(())
    }
}

pub fn mapping(port: u16, host: &str, backend_port: u16) -> RouteMapping {
    RouteMapping::new(RoutingKey::new(port), BackendEndpoint::new(host, backend_port))
}

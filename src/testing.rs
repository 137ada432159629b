//! In-memory stand-ins for both transports.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::http_client::{HttpClient, HttpResponse, TransportError};
use crate::hub::{
    HubChannel, HubError, HubInvocation, HubRequest, HubSession, HubTransport, TransportSignal,
};
use crate::thread::{ThreadSnapshot, ThreadStore};
use crate::types::{GroupConnection, GroupMembership, Message};

pub fn message(id: i64, from: &str, to: &str) -> Message {
    Message {
        id,
        sender_id: None,
        sender_username: from.to_string(),
        sender_photo_url: None,
        recipient_id: None,
        recipient_username: to.to_string(),
        recipient_photo_url: None,
        content: format!("message {id}"),
        sent_at: "2024-05-01T10:00:00Z".parse().unwrap(),
        read_at: None,
    }
}

pub fn presence(usernames: &[&str]) -> GroupMembership {
    GroupMembership {
        name: None,
        connections: usernames
            .iter()
            .enumerate()
            .map(|(i, u)| GroupConnection {
                username: u.to_string(),
                connection_id: format!("conn-{i}"),
            })
            .collect(),
    }
}

/// Waits until a snapshot satisfies `pred`, failing after a second.
pub async fn wait_for_snapshot(
    store: &ThreadStore,
    pred: impl Fn(&ThreadSnapshot) -> bool,
) -> ThreadSnapshot {
    let mut stream = store.subscribe();
    tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(snapshot) = stream.next().await {
            if pred(&snapshot) {
                return snapshot;
            }
        }
        panic!("thread store dropped");
    })
    .await
    .expect("snapshot condition not reached")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: &'static str,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

enum Route {
    Ok(Value, Option<String>),
    Fail(u16),
}

#[derive(Default)]
pub struct FakeHttp {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<Vec<Call>>,
    latency: Mutex<Option<Duration>>,
}

impl FakeHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, path: &str, body: Value, pagination: Option<&str>) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            Route::Ok(body, pagination.map(str::to_string)),
        );
    }

    pub fn fail(&self, path: &str, status: u16) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route::Fail(status));
    }

    /// Holds every GET open for `latency` before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn handle(&self, call: Call) -> Result<HttpResponse, TransportError> {
        let path = call.path.clone();
        self.calls.lock().unwrap().push(call);

        let routes = self.routes.lock().unwrap();
        match routes.get(&path) {
            Some(Route::Ok(body, pagination)) => {
                let mut headers = HeaderMap::new();
                if let Some(p) = pagination {
                    headers.insert(
                        HeaderName::from_static("pagination"),
                        HeaderValue::from_str(p).unwrap(),
                    );
                }
                Ok(HttpResponse {
                    body: body.clone(),
                    headers,
                })
            }
            Some(Route::Fail(status)) => Err(TransportError::Status {
                status: *status,
                url: path,
            }),
            None => Err(TransportError::Status { status: 404, url: path }),
        }
    }
}

#[async_trait]
impl HttpClient for FakeHttp {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<HttpResponse, TransportError> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.handle(Call {
            method: "GET",
            path: path.to_string(),
            query: query.to_vec(),
            body: None,
        })
    }

    async fn put(&self, path: &str, body: &Value) -> Result<HttpResponse, TransportError> {
        self.handle(Call {
            method: "PUT",
            path: path.to_string(),
            query: Vec::new(),
            body: Some(body.clone()),
        })
    }

    async fn delete(&self, path: &str) -> Result<HttpResponse, TransportError> {
        self.handle(Call {
            method: "DELETE",
            path: path.to_string(),
            query: Vec::new(),
            body: None,
        })
    }
}

/// Hub transport driven by the test: signals are injected through
/// [`FakeHub::signals`], and opens, stops and sends are recorded in order.
#[derive(Default)]
pub struct FakeHub {
    senders: Mutex<Vec<mpsc::Sender<TransportSignal>>>,
    log: Arc<Mutex<Vec<String>>>,
    invocations: Arc<Mutex<Vec<HubInvocation>>>,
    fail_sends: Arc<AtomicBool>,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sender for the `index`th opened session.
    pub fn signals(&self, index: usize) -> mpsc::Sender<TransportSignal> {
        self.senders.lock().unwrap()[index].clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> Vec<HubInvocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl HubTransport for FakeHub {
    fn open(&self, request: HubRequest) -> HubSession {
        let (tx, rx) = mpsc::channel(16);
        self.senders.lock().unwrap().push(tx);
        self.log
            .lock()
            .unwrap()
            .push(format!("open:{}:{}", request.peer_username, (request.token)()));

        HubSession {
            signals: rx,
            channel: Arc::new(FakeChannel {
                peer: request.peer_username,
                log: self.log.clone(),
                invocations: self.invocations.clone(),
                fail_sends: self.fail_sends.clone(),
            }),
        }
    }
}

struct FakeChannel {
    peer: String,
    log: Arc<Mutex<Vec<String>>>,
    invocations: Arc<Mutex<Vec<HubInvocation>>>,
    fail_sends: Arc<AtomicBool>,
}

#[async_trait]
impl HubChannel for FakeChannel {
    async fn invoke(&self, invocation: HubInvocation) -> Result<(), HubError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(HubError::SendFailed("transport unavailable".into()));
        }
        self.invocations.lock().unwrap().push(invocation);
        Ok(())
    }

    async fn stop(&self) {
        self.log.lock().unwrap().push(format!("stop:{}", self.peer));
    }
}

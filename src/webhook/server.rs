//! Inbound HTTP plumbing: the hyper accept loop and the request shape handed
//! to [`super::WebhookManager::handle_request`].

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, warn};
use uuid::Uuid;

use super::WebhookManager;

/// A normalized inbound webhook request, decoupled from hyper's types so the
/// manager's routing and verification logic stays testable without a real
/// socket.
#[derive(Clone, Debug)]
pub struct WebhookRequest {
    pub id: String,
    pub timestamp: f64,
    pub method: String,
    pub path: String,
    pub query_params: BTreeMap<String, Vec<String>>,
    /// Header names lowercased at construction so lookups are
    /// case-insensitive without repeating the fold at every call site.
    pub headers: BTreeMap<String, String>,
    pub remote_addr: String,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// First value for a repeated query key, for the handshake lookups that
    /// only ever expect one value (`hub.mode`, `verify`, ...).
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).and_then(|values| values.first()).map(|v| v.as_str())
    }
}

fn parse_query(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Some(query) = query else { return params };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        let key = urlencoding::decode(key).map(|s| s.into_owned()).unwrap_or_else(|_| key.to_string());
        let value = urlencoding::decode(value).map(|s| s.into_owned()).unwrap_or_else(|_| value.to_string());
        params.entry(key).or_default().push(value);
    }
    params
}

async fn to_webhook_request(req: Request<Incoming>, remote_addr: SocketAddr) -> WebhookRequest {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query_params = parse_query(req.uri().query());
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or_default().to_string()))
        .collect();

    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes().to_vec())
        .unwrap_or_default();

    WebhookRequest {
        id: Uuid::new_v4().to_string(),
        timestamp: now_secs(),
        method,
        path,
        query_params,
        headers,
        remote_addr: remote_addr.to_string(),
        body,
    }
}

fn now_secs() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Binds `listener` and serves webhook requests until `shutdown` is signaled.
/// One task per accepted connection, matching the teacher's server loop.
pub async fn serve(listener: TcpListener, manager: WebhookManager, mut shutdown: watch::Receiver<bool>) {
    let manager = Arc::new(manager);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "failed to accept webhook connection");
                        continue;
                    }
                };
                let io = hyper_util::rt::TokioIo::new(stream);
                let manager = manager.clone();

                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<Incoming>| {
                        let manager = manager.clone();
                        async move {
                            let webhook_req = to_webhook_request(req, addr).await;
                            let (status, body, content_type) = manager.handle_request(webhook_req).await;
                            let response = Response::builder()
                                .status(status)
                                .header("content-type", content_type)
                                .body(Full::<Bytes>::from(body))
                                .expect("response builder invariants upheld");
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let conn = http1::Builder::new().serve_connection(io, svc);
                    if let Err(e) = conn.await {
                        error!(error = %e, "error serving webhook connection");
                    }
                });
            }
            _ = shutdown.changed() => {
                break;
            }
        }
    }
}

//! Inbound webhook receipt: registration, signature verification, provider
//! handshakes, and handler dispatch (§4.4).

pub mod registration;
pub mod server;
pub mod signature;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub use registration::{SignatureAlgorithm, SignatureConfig, WebhookRegistration};
pub use server::WebhookRequest;

use crate::config::WebhookConfig;
use crate::error::WebhookError;

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A webhook delivery matched to a registration and queued for handler
/// dispatch.
#[derive(Clone, Debug)]
pub struct WebhookEvent {
    pub webhook_id: String,
    pub request: WebhookRequest,
}

/// Boxed async webhook handler.
pub type WebhookHandler = Arc<dyn Fn(WebhookEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Tasks {
    server: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Receives webhook deliveries over HTTP, verifies their signatures, and
/// routes them to per-webhook handlers.
///
/// Cheap to clone — internal state lives behind `Arc`/`DashMap`.
#[derive(Clone)]
pub struct WebhookManager {
    config: WebhookConfig,
    webhooks: Arc<DashMap<String, WebhookRegistration>>,
    signatures: Arc<DashMap<String, SignatureConfig>>,
    handlers: Arc<DashMap<String, Vec<WebhookHandler>>>,
    verification_tokens: Arc<Mutex<HashMap<String, String>>>,
    running: Arc<AtomicBool>,
    tasks: Arc<Mutex<Option<Tasks>>>,
    events_tx: Arc<Mutex<Option<mpsc::UnboundedSender<WebhookEvent>>>>,
}

impl WebhookManager {
    pub fn new(config: WebhookConfig) -> Self {
        let verification_tokens = config.verification_tokens.clone();
        info!("webhook manager initialized");
        WebhookManager {
            config,
            webhooks: Arc::new(DashMap::new()),
            signatures: Arc::new(DashMap::new()),
            handlers: Arc::new(DashMap::new()),
            verification_tokens: Arc::new(Mutex::new(verification_tokens)),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(None)),
            events_tx: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn start_server(&self) -> Result<(), WebhookError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WebhookError::AlreadyRunning);
        }

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                WebhookError::Io(e)
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *self.events_tx.lock() = Some(events_tx);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = {
            let manager = self.clone();
            tokio::spawn(async move { server::serve(listener, manager, shutdown_rx).await })
        };
        let dispatcher = {
            let manager = self.clone();
            tokio::spawn(async move { manager.dispatch_loop(events_rx).await })
        };

        *self.tasks.lock() = Some(Tasks {
            server,
            dispatcher,
            shutdown: shutdown_tx,
        });
        info!(host = %self.config.host, port = self.config.port, "webhook server started");
        Ok(())
    }

    pub fn stop_server(&self) -> Result<(), WebhookError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(WebhookError::NotRunning);
        }
        *self.events_tx.lock() = None;
        if let Some(tasks) = self.tasks.lock().take() {
            let _ = tasks.shutdown.send(true);
            tasks.dispatcher.abort();
        }
        info!("webhook server stopped");
        Ok(())
    }

    pub fn register_webhook(
        &self,
        webhook_id: impl Into<String>,
        api_name: impl Into<String>,
        path: impl Into<String>,
        description: Option<String>,
        enabled: bool,
    ) -> Result<(), WebhookError> {
        let webhook_id = webhook_id.into();
        if self.webhooks.contains_key(&webhook_id) {
            return Err(WebhookError::AlreadyRegistered(webhook_id));
        }
        self.webhooks.insert(
            webhook_id.clone(),
            WebhookRegistration {
                id: webhook_id.clone(),
                api_name: api_name.into(),
                path: path.into(),
                description,
                enabled,
                created_at: now_secs(),
            },
        );
        info!(webhook_id, "registered webhook");
        Ok(())
    }

    pub fn unregister_webhook(&self, webhook_id: &str) -> Result<(), WebhookError> {
        self.webhooks
            .remove(webhook_id)
            .ok_or_else(|| WebhookError::NotFound(webhook_id.to_string()))?;
        self.signatures.remove(webhook_id);
        self.handlers.remove(webhook_id);
        Ok(())
    }

    pub fn register_webhook_handler(&self, webhook_id: &str, handler: WebhookHandler) -> Result<(), WebhookError> {
        if !self.webhooks.contains_key(webhook_id) {
            return Err(WebhookError::NotFound(webhook_id.to_string()));
        }
        self.handlers.entry(webhook_id.to_string()).or_default().push(handler);
        Ok(())
    }

    pub fn unregister_webhook_handlers(&self, webhook_id: &str) -> bool {
        self.handlers.remove(webhook_id).is_some()
    }

    pub fn configure_webhook_signature(&self, webhook_id: &str, config: SignatureConfig) -> Result<(), WebhookError> {
        if !self.webhooks.contains_key(webhook_id) {
            return Err(WebhookError::NotFound(webhook_id.to_string()));
        }
        self.signatures.insert(webhook_id.to_string(), config);
        Ok(())
    }

    pub fn set_verification_token(&self, api_name: impl Into<String>, token: impl Into<String>) {
        self.verification_tokens.lock().insert(api_name.into(), token.into());
    }

    pub fn get_webhook_url(&self, webhook_id: &str) -> Option<String> {
        let webhook = self.webhooks.get(webhook_id)?;
        let base_url = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.config.host, self.config.port));
        let path = if webhook.path.starts_with('/') {
            webhook.path.clone()
        } else {
            format!("/{}", webhook.path)
        };
        Some(format!("{base_url}{path}"))
    }

    pub fn get_webhook(&self, webhook_id: &str) -> Option<WebhookRegistration> {
        self.webhooks.get(webhook_id).map(|w| w.clone())
    }

    pub fn get_all_webhooks(&self) -> Vec<WebhookRegistration> {
        self.webhooks.iter().map(|w| w.clone()).collect()
    }

    fn find_webhook_for_path(&self, path: &str) -> Option<WebhookRegistration> {
        self.webhooks
            .iter()
            .find(|entry| entry.enabled && entry.path == path)
            .map(|entry| entry.clone())
    }

    /// Routes a parsed inbound request to a `(status, body, content_type)`
    /// triple, handling verification handshakes and signature checks before
    /// queuing a matched event for dispatch.
    #[instrument(skip(self, req), fields(method = %req.method, path = %req.path))]
    pub async fn handle_request(&self, req: WebhookRequest) -> (u16, String, &'static str) {
        if signature::is_verification_request(&req) {
            let webhook = self.find_webhook_for_path(&req.path);
            let body = match &webhook {
                None => "Webhook verification failed: unknown webhook".to_string(),
                Some(webhook) => {
                    let token = self.verification_tokens.lock().get(&webhook.api_name).cloned();
                    signature::handle_verification_request(&req, token.as_deref())
                }
            };
            return (200, body, "text/plain");
        }

        if req.method == "POST" {
            if let Some(webhook) = self.find_webhook_for_path(&req.path) {
                if let Some(sig_config) = self.signatures.get(&webhook.id) {
                    match req.header(&sig_config.header_name) {
                        None => {
                            warn!(webhook_id = %webhook.id, "missing signature header");
                            return (401, "Invalid webhook signature".to_string(), "text/plain");
                        }
                        Some(received) => {
                            if !signature::verify_signature(&sig_config, &req.body, received) {
                                warn!(webhook_id = %webhook.id, "signature mismatch");
                                return (401, "Invalid webhook signature".to_string(), "text/plain");
                            }
                        }
                    }
                }
            }
        }

        self.enqueue_event(req);
        (200, "{\"status\": \"success\"}".to_string(), "application/json")
    }

    fn enqueue_event(&self, req: WebhookRequest) {
        let Some(webhook) = self.find_webhook_for_path(&req.path) else {
            warn!(path = %req.path, "no webhook registered for path");
            return;
        };
        let event = WebhookEvent {
            webhook_id: webhook.id,
            request: req,
        };
        if let Some(tx) = self.events_tx.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    async fn dispatch_loop(&self, mut rx: mpsc::UnboundedReceiver<WebhookEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(handlers) = self.handlers.get(&event.webhook_id).map(|h| h.clone()) else {
                continue;
            };
            for handler in handlers {
                let event = event.clone();
                let webhook_id = event.webhook_id.clone();
                if let Err(e) = tokio::spawn(async move { handler(event).await }).await {
                    error!(webhook_id, error = %e, "webhook event handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tokio::sync::Notify;

    fn request(method: &str, path: &str, headers: &[(&str, &str)], query: &[(&str, &str)], body: &[u8]) -> WebhookRequest {
        WebhookRequest {
            id: "evt".to_string(),
            timestamp: 0.0,
            method: method.to_string(),
            path: path.to_string(),
            query_params: query.iter().map(|(k, v)| (k.to_string(), vec![v.to_string()])).collect::<BTreeMap<_, _>>(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            remote_addr: "127.0.0.1".to_string(),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn unsigned_post_to_unconfigured_webhook_succeeds() {
        let manager = WebhookManager::new(WebhookConfig::default());
        manager.register_webhook("gh", "github", "/hooks/github", None, true).unwrap();

        let (status, body, content_type) = manager.handle_request(request("POST", "/hooks/github", &[], &[], b"{}")).await;
        assert_eq!(status, 200);
        assert_eq!(content_type, "application/json");
        assert!(body.contains("success"));
    }

    #[tokio::test]
    async fn post_with_missing_signature_rejected() {
        let manager = WebhookManager::new(WebhookConfig::default());
        manager.register_webhook("gh", "github", "/hooks/github", None, true).unwrap();
        manager
            .configure_webhook_signature(
                "gh",
                SignatureConfig::new("secret", "X-Hub-Signature-256", SignatureAlgorithm::Sha256),
            )
            .unwrap();

        let (status, _, _) = manager.handle_request(request("POST", "/hooks/github", &[], &[], b"{}")).await;
        assert_eq!(status, 401);
    }

    #[tokio::test]
    async fn github_ping_returns_verification_body() {
        let manager = WebhookManager::new(WebhookConfig::default());
        manager.register_webhook("gh", "github", "/hooks/github", None, true).unwrap();

        let (status, body, content_type) = manager
            .handle_request(request("POST", "/hooks/github", &[("X-GitHub-Event", "ping")], &[], b""))
            .await;
        assert_eq!(status, 200);
        assert_eq!(content_type, "text/plain");
        assert!(body.contains("successful"));
    }

    #[tokio::test]
    async fn matched_event_dispatches_to_handler() {
        let manager = WebhookManager::new(WebhookConfig::default());
        manager.register_webhook("gh", "github", "/hooks/github", None, true).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let notify = Arc::new(Notify::new());
        {
            let count = count.clone();
            let notify = notify.clone();
            manager
                .register_webhook_handler(
                    "gh",
                    Arc::new(move |_event| {
                        let count = count.clone();
                        let notify = notify.clone();
                        Box::pin(async move {
                            count.fetch_add(1, AtomicOrdering::SeqCst);
                            notify.notify_one();
                        })
                    }),
                )
                .unwrap();
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        *manager.events_tx.lock() = Some(events_tx);
        let dispatcher = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.dispatch_loop(events_rx).await })
        };

        manager.handle_request(request("POST", "/hooks/github", &[], &[], b"{}")).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), notify.notified()).await.unwrap();
        dispatcher.abort();

        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn webhook_url_uses_configured_base_url() {
        let mut config = WebhookConfig::default();
        config.base_url = Some("https://example.com".to_string());
        let manager = WebhookManager::new(config);
        manager.register_webhook("gh", "github", "hooks/github", None, true).unwrap();
        assert_eq!(manager.get_webhook_url("gh"), Some("https://example.com/hooks/github".to_string()));
    }
}

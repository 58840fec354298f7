//! Client side of the manager API.
//!
//! [`Manager`] is what the broker consumes; [`HttpManager`] talks to a real
//! manager over HTTP and keeps the notification stream attached.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, Method, RequestBuilder};
use scanbroker_core::api::{AgentUpdate, ResolveScopeRequest, ScopeNotification};
use scanbroker_core::model::Scope;
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ManagerError;

pub const PRIVILEGE_HEADER: &str = "x-privilege-secret";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 256;
const MAX_NOTIFICATION_LINE: usize = 1 << 20;

/// Something the manager pushed, or a change of the push channel itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Notification(ScopeNotification),
    /// The notification stream attached, initially or after being lost.
    /// Notifications sent while detached are gone.
    Reconnected,
}

#[async_trait]
pub trait Manager: Send + Sync {
    /// Looks up a scope by its secret. An id of zero means the secret is
    /// unknown.
    async fn get_scope_full(&self, secret: &str) -> Result<Scope, ManagerError>;

    async fn get_scope(&self, scope_id: u64) -> Result<Scope, ManagerError>;

    async fn get_scopes(&self) -> Result<Vec<Scope>, ManagerError>;

    async fn update_agents(&self, update: &AgentUpdate) -> Result<(), ManagerError>;

    async fn new_cycle(&self, scope_id: u64) -> Result<(), ManagerError>;

    /// Whether the notification stream is currently attached.
    fn connected(&self) -> watch::Receiver<bool>;

    fn subscribe(&self) -> broadcast::Receiver<ManagerEvent>;
}

pub struct HttpManager {
    client: Client,
    base_url: String,
    privilege_secret: String,
    connected: watch::Sender<bool>,
    events: broadcast::Sender<ManagerEvent>,
}

impl HttpManager {
    pub fn new(base_url: &str, privilege_secret: &str) -> Result<Self, ManagerError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(ManagerError::from)?;
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            privilege_secret: privilege_secret.to_string(),
            connected,
            events,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header(PRIVILEGE_HEADER, &self.privilege_secret)
    }

    /// Keeps `GET /v1/notifications` attached until `shutdown` fires,
    /// reconnecting with backoff.
    pub fn spawn_subscription(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut backoff = MIN_BACKOFF;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = this.stream_notifications(&mut backoff) => match res {
                        Ok(()) => info!("manager closed the notification stream"),
                        Err(e) => debug!(error = %e, "notification stream failed"),
                    },
                }
                this.connected.send_replace(false);

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            this.connected.send_replace(false);
        })
    }

    async fn stream_notifications(&self, backoff: &mut Duration) -> Result<(), ManagerError> {
        let resp = self
            .request(Method::GET, "/v1/notifications")
            .send()
            .await?
            .error_for_status()?;

        self.connected.send_replace(true);
        *backoff = MIN_BACKOFF;
        // Anything cached before this attach may have missed a notification.
        info!("notification stream attached");
        let _ = self.events.send(ManagerEvent::Reconnected);

        let body = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
        tokio::pin!(body);
        self.forward_notifications(body).await
    }

    /// Publishes one [`ManagerEvent::Notification`] per NDJSON line of
    /// `body`. Blank and undecodable lines are skipped; an oversized line
    /// ends the stream.
    async fn forward_notifications<R>(&self, body: R) -> Result<(), ManagerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(body, LinesCodec::new_with_max_length(MAX_NOTIFICATION_LINE));
        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| match e {
                LinesCodecError::MaxLineLengthExceeded => {
                    ManagerError::Decode(format!("notification line over {MAX_NOTIFICATION_LINE} bytes"))
                }
                LinesCodecError::Io(e) => ManagerError::Connectivity(e.to_string()),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ScopeNotification>(&line) {
                Ok(n) => {
                    let _ = self.events.send(ManagerEvent::Notification(n));
                }
                Err(e) => warn!(error = %e, "skipping undecodable scope notification"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Manager for HttpManager {
    async fn get_scope_full(&self, secret: &str) -> Result<Scope, ManagerError> {
        let body = ResolveScopeRequest {
            secret: secret.to_string(),
        };
        Ok(self
            .request(Method::POST, "/v1/scopes/resolve")
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json::<Scope>()
            .await?)
    }

    async fn get_scope(&self, scope_id: u64) -> Result<Scope, ManagerError> {
        Ok(self
            .request(Method::GET, &format!("/v1/scopes/{scope_id}"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<Scope>()
            .await?)
    }

    async fn get_scopes(&self) -> Result<Vec<Scope>, ManagerError> {
        Ok(self
            .request(Method::GET, "/v1/scopes")
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Scope>>()
            .await?)
    }

    async fn update_agents(&self, update: &AgentUpdate) -> Result<(), ManagerError> {
        self.request(Method::POST, "/v1/agents")
            .timeout(REQUEST_TIMEOUT)
            .json(update)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn new_cycle(&self, scope_id: u64) -> Result<(), ManagerError> {
        self.request(Method::POST, &format!("/v1/scopes/{scope_id}/cycle"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }
}

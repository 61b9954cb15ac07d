//! Live analytics subscription for dashboards.
//!
//! [`FormAnalyticsSubscription`] watches one form type over the gateway's
//! WebSocket, reconciles pushed snapshots and activity into an
//! [`AnalyticsState`], and can re-fetch the full snapshot over HTTP on demand.

use std::sync::Arc;

use form_pulse_core::{validate_form_type, ClientEvent, FormAnalyticsResponse, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

mod state;

pub use state::{AnalyticsState, ACTIVITY_FEED_CAP};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server url `{0}`")]
    InvalidUrl(String),
    #[error(transparent)]
    InvalidFormType(#[from] form_pulse_core::ValidationError),
    #[error("websocket connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("analytics fetch failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("subscription is closed")]
    Closed,
}

/// Live subscription to one form type's analytics.
///
/// Dropping the subscription sends `unwatch_form` and stops the reader.
pub struct FormAnalyticsSubscription {
    form_type: String,
    analytics_url: Url,
    http: reqwest::Client,
    state: Arc<Mutex<AnalyticsState>>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    updates: watch::Receiver<u64>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl FormAnalyticsSubscription {
    /// Open the socket, start watching `form_type`, then prime the state with
    /// a one-shot fetch. A failed fetch is logged and leaves the state empty
    /// until the first pushed update.
    pub async fn connect(base_url: &str, form_type: &str) -> Result<Self, ClientError> {
        validate_form_type(form_type)?;
        let base = Url::parse(base_url).map_err(|_| ClientError::InvalidUrl(base_url.into()))?;
        let ws_url = websocket_url(&base)?;
        let analytics_url = endpoint(&base, &["api", "analytics", form_type])?;

        let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
        let (mut write, read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if write.send(message).await.is_err() || closing {
                    break;
                }
            }
            debug!("subscription writer finished");
        });

        let state = Arc::new(Mutex::new(AnalyticsState::new(form_type)));
        let (updates_tx, updates) = watch::channel(0u64);
        let reader = tokio::spawn(read_loop(read, state.clone(), updates_tx));

        let subscription = Self {
            form_type: form_type.to_string(),
            analytics_url,
            http: reqwest::Client::new(),
            state,
            outbound: Some(outbound),
            updates,
            reader,
            writer: Some(writer),
        };
        subscription.send(&ClientEvent::WatchForm(form_type.to_string()))?;

        if let Err(err) = subscription.refresh_analytics().await {
            warn!(form_type, error = %err, "initial analytics fetch failed");
        }
        Ok(subscription)
    }

    pub fn form_type(&self) -> &str {
        &self.form_type
    }

    /// Re-fetch the full snapshot and merge it into the local state.
    pub async fn refresh_analytics(&self) -> Result<FormAnalyticsResponse, ClientError> {
        let response: FormAnalyticsResponse = self
            .http
            .get(self.analytics_url.clone())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.form_type == self.form_type {
            self.state.lock().merge_metrics(&response.metrics);
        }
        Ok(response)
    }

    /// Copy of the current reconciled state.
    pub fn state(&self) -> AnalyticsState {
        self.state.lock().clone()
    }

    /// Wait for the next pushed change to the state.
    pub async fn changed(&mut self) -> Result<(), ClientError> {
        self.updates.changed().await.map_err(|_| ClientError::Closed)
    }

    /// Stop watching, close the socket and wait for the writer to flush.
    pub async fn close(mut self) {
        self.shutdown();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
        self.reader.abort();
    }

    fn send(&self, event: &ClientEvent) -> Result<(), ClientError> {
        let payload = serde_json::to_string(event)?;
        self.outbound
            .as_ref()
            .ok_or(ClientError::Closed)?
            .send(Message::Text(payload.into()))
            .map_err(|_| ClientError::Closed)
    }

    fn shutdown(&mut self) {
        if self.outbound.is_none() {
            return;
        }
        if let Err(err) = self.send(&ClientEvent::UnwatchForm(self.form_type.clone())) {
            debug!(error = %err, "unwatch not sent");
        }
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }
    }
}

impl Drop for FormAnalyticsSubscription {
    fn drop(&mut self) {
        self.shutdown();
        self.reader.abort();
    }
}

async fn read_loop<S>(
    mut read: S,
    state: Arc<Mutex<AnalyticsState>>,
    updates: watch::Sender<u64>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    if state.lock().apply(&event) {
                        updates.send_modify(|version| *version += 1);
                    }
                }
                Err(err) => warn!(error = %err, "ignoring undecodable server event"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "analytics subscription socket failed");
                break;
            }
        }
    }
    debug!("subscription reader finished");
}

fn websocket_url(base: &Url) -> Result<Url, ClientError> {
    let mut url = endpoint(base, &["ws"])?;
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::InvalidUrl(base.to_string()))?;
    Ok(url)
}

/// Append path segments to `base`, percent-encoding each one.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, ClientError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| ClientError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

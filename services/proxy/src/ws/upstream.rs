//! Opens the authenticated WebSocket session to the upstream realtime service.

use super::{
    frame::{Frame, FrameSink, FrameStream, SharedSink, frame_sink, frame_stream, shared},
    protocol::{FunctionDeclaration, SetupMessage},
    registry::{ConnectionRegistry, UpstreamLink},
};
use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use livewire_core::auth::BearerToken;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message as WsMessage,
        client::IntoClientRequest,
        http::{
            HeaderValue,
            header::{AUTHORIZATION, CONTENT_TYPE},
        },
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// A connected, registered upstream session whose setup has been sent.
pub struct Upstream {
    pub id: Uuid,
    pub sink: SharedSink,
    pub source: FrameStream,
}

/// Builds the per-session setup message and opens upstream sockets.
pub struct UpstreamConnector {
    url: String,
    model: String,
    voice_name: String,
    system_instruction: Arc<String>,
    functions: Vec<FunctionDeclaration>,
}

impl UpstreamConnector {
    pub fn new(
        url: String,
        model: String,
        voice_name: String,
        system_instruction: Arc<String>,
        functions: Vec<FunctionDeclaration>,
    ) -> Self {
        Self {
            url,
            model,
            voice_name,
            system_instruction,
            functions,
        }
    }

    pub fn setup_message(&self) -> SetupMessage {
        SetupMessage::new(
            self.model.clone(),
            self.voice_name.clone(),
            self.system_instruction.to_string(),
            self.functions.clone(),
        )
    }

    /// Connects with `token`, sends the setup message, and registers the socket.
    ///
    /// `session_cancel` is cancelled if the registry later closes this socket,
    /// which tears down the session relaying over it.
    #[instrument(skip_all, fields(url = %self.url))]
    pub async fn connect(
        &self,
        token: &BearerToken,
        registry: &ConnectionRegistry,
        session_cancel: CancellationToken,
    ) -> Result<Upstream, ProxyError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProxyError::UpstreamConnect(e.to_string()))?;
        let authorization = HeaderValue::from_str(&token.authorization_header())
            .map_err(|e| ProxyError::UpstreamConnect(format!("invalid bearer token: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);
        request
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        info!("Connecting to upstream service.");
        let (ws_stream, response) = connect_async(request).await.map_err(|e| {
            error!(error = %e, "Upstream connection failed.");
            ProxyError::UpstreamConnect(e.to_string())
        })?;
        info!(status = %response.status(), "Connected to upstream service.");

        let (ws_tx, ws_rx) = ws_stream.split();
        let mut sink = frame_sink::<_, WsMessage>(ws_tx);
        self.send_setup(&mut sink).await?;

        // Pongs are counted as the relay reads them so liveness checks can wait on one.
        let (pongs_tx, pongs) = watch::channel(0u64);
        let source = frame_stream(ws_rx)
            .inspect(move |item| {
                if let Ok(Frame::Pong(_)) = item {
                    pongs_tx.send_modify(|count| *count += 1);
                }
            })
            .boxed();

        let sink = shared(sink);
        let id = Uuid::new_v4();
        registry
            .register(
                id,
                Arc::new(UpstreamConnection::new(sink.clone(), pongs, session_cancel)),
            )
            .await;

        Ok(Upstream { id, sink, source })
    }

    /// Writes the setup message as the first frame on a fresh upstream socket.
    pub(crate) async fn send_setup(&self, sink: &mut FrameSink) -> Result<(), ProxyError> {
        let payload = serde_json::to_string(&self.setup_message())
            .map_err(|e| ProxyError::SetupSend(e.to_string()))?;
        debug!(%payload, "Sending setup message.");
        sink.send(Frame::Text(payload)).await.map_err(|e| {
            error!(error = %e, "Failed to send setup message.");
            ProxyError::SetupSend(e)
        })
    }
}

/// The registry's view of an upstream socket.
pub struct UpstreamConnection {
    sink: SharedSink,
    /// Bumped once for every pong read off the upstream socket.
    pongs: watch::Receiver<u64>,
    session_cancel: CancellationToken,
}

impl UpstreamConnection {
    pub fn new(
        sink: SharedSink,
        pongs: watch::Receiver<u64>,
        session_cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            pongs,
            session_cancel,
        }
    }
}

#[async_trait]
impl UpstreamLink for UpstreamConnection {
    /// Sends a ping and resolves once a pong arrives after it.
    ///
    /// Never resolves for a peer that stops answering; the registry bounds
    /// the wait with its own timeout.
    async fn probe(&self) -> anyhow::Result<()> {
        let mut pongs = self.pongs.clone();
        pongs.borrow_and_update();
        self.sink
            .lock()
            .await
            .send(Frame::Ping(Bytes::new()))
            .await
            .map_err(anyhow::Error::msg)?;
        pongs
            .changed()
            .await
            .map_err(|_| anyhow::anyhow!("upstream socket is no longer being read"))
    }

    async fn close(&self) {
        // Cancel first so a pump blocked in a send releases the sink.
        self.session_cancel.cancel();
        let _ = self.sink.lock().await.close().await;
    }
}

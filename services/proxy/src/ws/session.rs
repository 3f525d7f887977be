//! Manages the WebSocket connection lifecycle for one client.
//!
//! A connection moves through `Accepted → Authenticating → Connecting →
//! Relaying → Closed`. Whatever phase it fails in, the upstream socket is
//! removed from the registry and the client socket is closed with a code
//! derived from the error.

use super::{
    frame::{Frame, FrameStream, SharedSink, frame_sink, frame_stream, shared},
    protocol::ServerNotice,
    relay::{self, RelayChannels},
};
use crate::{
    error::{CLOSE_NORMAL, ProxyError},
    state::AppState,
};
use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Accepted,
    Authenticating,
    Connecting,
    Relaying,
    Closed,
}

/// Bookkeeping for one client connection.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    phase: SessionPhase,
    upstream_id: Option<Uuid>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            phase: SessionPhase::Accepted,
            upstream_id: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The registry id of this session's upstream socket, once connected.
    pub fn upstream_id(&self) -> Option<Uuid> {
        self.upstream_id
    }

    fn advance(&mut self, next: SessionPhase) {
        debug!(from = ?self.phase, to = ?next, "Session phase changed.");
        self.phase = next;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer, state))
}

async fn handle_socket(socket: WebSocket, peer: SocketAddr, state: Arc<AppState>) {
    info!(%peer, "New WebSocket connection.");
    let (socket_tx, socket_rx) = socket.split();
    serve_client(
        &state,
        frame_stream(socket_rx),
        shared(frame_sink::<_, Message>(socket_tx)),
    )
    .await;
}

/// Drives one client connection to completion, including cleanup.
#[instrument(name = "ws_session", skip_all, fields(session_id))]
pub(crate) async fn serve_client(
    state: &AppState,
    client_source: FrameStream,
    client_sink: SharedSink,
) -> Session {
    let mut session = Session::new();
    tracing::Span::current().record("session_id", tracing::field::display(session.id));

    let cancel = state.shutdown.child_token();
    let mut result = run_session(
        state,
        &mut session,
        client_source,
        client_sink.clone(),
        cancel.clone(),
    )
    .await;

    cancel.cancel();
    if let Some(id) = session.upstream_id {
        // Already gone from the registry means the health monitor pruned it.
        let removed = state.registry.remove_and_close(id).await;
        if !removed && result.is_ok() && !state.shutdown.is_cancelled() {
            result = Err(ProxyError::UpstreamLost);
        }
    }

    let (code, reason) = match &result {
        Ok(()) => (CLOSE_NORMAL, String::new()),
        Err(e) => {
            error!(phase = ?session.phase, error = %e, "Session terminated with error.");
            (e.close_code(), e.close_reason())
        }
    };
    close_client(&client_sink, code, reason, state.config.shutdown_grace).await;

    session.advance(SessionPhase::Closed);
    info!(
        duration_ms = (Utc::now() - session.created_at).num_milliseconds(),
        code,
        "Session closed."
    );
    session
}

async fn run_session(
    state: &AppState,
    session: &mut Session,
    client_source: FrameStream,
    client_sink: SharedSink,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    session.advance(SessionPhase::Authenticating);
    let token = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        result = tokio::time::timeout(state.config.auth_timeout, state.token_provider.token()) => {
            match result {
                Ok(token) => token?,
                Err(_) => return Err(ProxyError::AuthTimeout),
            }
        }
    };
    info!(?token, "Obtained upstream credentials.");
    send_notice(&client_sink, &ServerNotice::AuthComplete(true), "auth_complete").await?;

    session.advance(SessionPhase::Connecting);
    let upstream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        result = state.connector.connect(&token, &state.registry, cancel.clone()) => result?,
    };
    session.upstream_id = Some(upstream.id);

    session.advance(SessionPhase::Relaying);
    info!(upstream_id = %upstream.id, "Relaying between client and upstream.");
    let channels = RelayChannels {
        client_source,
        client_sink,
        upstream_source: upstream.source,
        upstream_sink: upstream.sink,
    };
    relay::run(
        channels,
        state.interceptor.clone(),
        &state.relay_settings(),
        cancel,
    )
    .await
}

/// A helper function to serialize and send a `ServerNotice` to the client.
pub(crate) async fn send_notice(
    sink: &SharedSink,
    notice: &ServerNotice,
    kind: &'static str,
) -> Result<(), ProxyError> {
    let serialized = serde_json::to_string(notice).map_err(|e| ProxyError::Send {
        direction: "proxy->client",
        kind,
        reason: e.to_string(),
    })?;
    sink.lock()
        .await
        .send(Frame::Text(serialized))
        .await
        .map_err(|reason| ProxyError::Send {
            direction: "proxy->client",
            kind,
            reason,
        })
}

async fn close_client(sink: &SharedSink, code: u16, reason: String, grace: Duration) {
    let close = async {
        let mut sink = sink.lock().await;
        sink.send(Frame::Close(Some((code, reason)))).await?;
        sink.close().await
    };
    match tokio::time::timeout(grace, close).await {
        Ok(Ok(())) => debug!(code, "Closed client socket."),
        Ok(Err(e)) => debug!(code, error = %e, "Client socket was already closed."),
        Err(_) => warn!(code, "Timed out closing client socket."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{CLOSE_AUTH_TIMEOUT, CLOSE_INTERNAL_ERROR},
        state::tests::test_config,
        ws::tools::tests::{StubWeather, paris_report},
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use livewire_core::auth::{AuthError, BearerToken, TokenProvider};
    use serde_json::{Value, json};
    use tokio::{
        net::{TcpListener, TcpStream},
        sync::oneshot,
    };
    use tokio_tungstenite::{
        WebSocketStream, accept_hdr_async,
        tungstenite::{
            Message as WsMessage,
            handshake::server::{ErrorResponse, Request, Response},
        },
    };

    struct FixedToken;

    #[async_trait]
    impl TokenProvider for FixedToken {
        async fn token(&self) -> Result<BearerToken, AuthError> {
            Ok(BearerToken::new("test-token", None))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl TokenProvider for Unreachable {
        async fn token(&self) -> Result<BearerToken, AuthError> {
            Err(AuthError::Unreachable("no route to host".to_string()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl TokenProvider for Hanging {
        async fn token(&self) -> Result<BearerToken, AuthError> {
            futures::future::pending().await
        }
    }

    type Accepted = (Option<String>, WebSocketStream<TcpStream>);

    /// Accepts one upstream connection, recording its Authorization header.
    async fn fake_upstream() -> (String, oneshot::Receiver<Accepted>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let seen = Arc::new(std::sync::Mutex::new(None));
            let record = seen.clone();
            let ws = accept_hdr_async(
                stream,
                move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *record.lock().unwrap() = req
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    Ok(resp)
                },
            )
            .await
            .unwrap();
            let header = seen.lock().unwrap().clone();
            let _ = tx.send((header, ws));
        });

        (url, rx)
    }

    struct Client {
        input: UnboundedSender<Result<Frame, String>>,
        output: UnboundedReceiver<Frame>,
        session: tokio::task::JoinHandle<Session>,
    }

    fn connect_client(state: Arc<AppState>) -> Client {
        let (input, source) = unbounded();
        let (sink, output) = unbounded();
        let session = tokio::spawn(async move {
            serve_client(&state, source.boxed(), shared(frame_sink::<_, Frame>(sink))).await
        });
        Client {
            input,
            output,
            session,
        }
    }

    fn state_with(upstream_url: &str, tokens: Arc<dyn TokenProvider>) -> Arc<AppState> {
        Arc::new(AppState::new(
            test_config(upstream_url),
            tokens,
            Arc::new(StubWeather::answering(paris_report())),
            Arc::new("Be concise.".to_string()),
        ))
    }

    async fn client_json(output: &mut UnboundedReceiver<Frame>) -> Value {
        match output.next().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    async fn upstream_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                other => panic!("expected a text message, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_full_session_relays_and_cleans_up() {
        let (url, accepted) = fake_upstream().await;
        let state = state_with(&url, Arc::new(FixedToken));
        let mut client = connect_client(state.clone());

        assert_eq!(
            client_json(&mut client.output).await,
            json!({"authComplete": true})
        );

        let (authorization, mut upstream) = accepted.await.unwrap();
        assert_eq!(authorization.as_deref(), Some("Bearer test-token"));

        let setup = upstream_json(&mut upstream).await;
        assert_eq!(
            setup["setup"]["model"],
            "projects/test-project/locations/us-central1/publishers/google/models/test-model"
        );
        assert_eq!(
            setup["setup"]["system_instruction"]["parts"][0]["text"],
            "Be concise."
        );

        let input = json!({"realtime_input": {"media_chunks": [{"mime_type": "audio/pcm", "data": "AAAA"}]}});
        client
            .input
            .unbounded_send(Ok(Frame::Text(input.to_string())))
            .unwrap();
        assert_eq!(upstream_json(&mut upstream).await, input);

        let tool_call = json!({"toolCall": {"functionCalls": [
            {"name": "get_weather", "args": {"city": "Paris"}}
        ]}});
        upstream
            .send(WsMessage::Text(tool_call.to_string().into()))
            .await
            .unwrap();
        let content = json!({"serverContent": {"modelTurn": {"parts": [{"text": "It is sunny."}]}}});
        upstream
            .send(WsMessage::Binary(Bytes::from(content.to_string())))
            .await
            .unwrap();

        let response = upstream_json(&mut upstream).await;
        let entries = &response["tool_response"]["function_responses"];
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["name"], "get_weather");
        assert_eq!(
            entries[0]["response"]["result"]["object_value"]["city"],
            "Paris"
        );

        // The tool call never reaches the client; the content after it does.
        assert_eq!(client_json(&mut client.output).await, content);
        assert_eq!(state.registry.len().await, 1);

        client
            .input
            .unbounded_send(Ok(Frame::Close(Some((1000, "done".to_string())))))
            .unwrap();
        let session = client.session.await.unwrap();

        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(session.upstream_id().is_some());
        assert!(state.registry.is_empty().await);
        assert_eq!(
            client.output.next().await,
            Some(Frame::Close(Some((CLOSE_NORMAL, String::new()))))
        );
    }

    #[tokio::test]
    async fn test_upstream_close_ends_session() {
        let (url, accepted) = fake_upstream().await;
        let state = state_with(&url, Arc::new(FixedToken));
        let mut client = connect_client(state.clone());

        let _ = client_json(&mut client.output).await;
        let (_, mut upstream) = accepted.await.unwrap();
        let _ = upstream_json(&mut upstream).await;
        upstream.close(None).await.unwrap();

        let session = client.session.await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_pruned_upstream_closes_client_with_internal_error() {
        let (url, accepted) = fake_upstream().await;
        let state = state_with(&url, Arc::new(FixedToken));
        let mut client = connect_client(state.clone());

        let _ = client_json(&mut client.output).await;
        let (_, mut upstream) = accepted.await.unwrap();
        let _ = upstream_json(&mut upstream).await;
        let id = loop {
            if let Some((id, _)) = state.registry.snapshot().await.into_iter().next() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        // What the health monitor does to an upstream that failed its check.
        assert!(state.registry.remove_and_close(id).await);

        assert_eq!(
            client.output.next().await,
            Some(Frame::Close(Some((
                CLOSE_INTERNAL_ERROR,
                "Upstream connection lost".to_string()
            ))))
        );
        let session = client.session.await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_auth_failure_closes_with_policy_code() {
        let state = state_with("ws://127.0.0.1:9/ws", Arc::new(Unreachable));
        let mut client = connect_client(state.clone());

        match client.output.next().await {
            Some(Frame::Close(Some((code, reason)))) => {
                assert_eq!(code, CLOSE_AUTH_TIMEOUT);
                assert!(reason.contains("no route to host"));
            }
            other => panic!("expected a close frame, got {:?}", other),
        }
        let session = client.session.await.unwrap();
        assert!(session.upstream_id().is_none());
        assert!(state.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_auth_timeout_closes_with_auth_timeout_reason() {
        let state = state_with("ws://127.0.0.1:9/ws", Arc::new(Hanging));
        let mut client = connect_client(state);

        assert_eq!(
            client.output.next().await,
            Some(Frame::Close(Some((
                CLOSE_AUTH_TIMEOUT,
                "Auth timeout".to_string()
            ))))
        );
        drop(client.input);
        client.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_connect_failure_closes_with_internal_error() {
        let state = state_with("ws://127.0.0.1:9/ws", Arc::new(FixedToken));
        let mut client = connect_client(state.clone());

        assert_eq!(
            client_json(&mut client.output).await,
            json!({"authComplete": true})
        );
        match client.output.next().await {
            Some(Frame::Close(Some((code, reason)))) => {
                assert_eq!(code, CLOSE_INTERNAL_ERROR);
                assert!(reason.starts_with("Failed to connect upstream"));
                assert!(reason.len() <= 123);
            }
            other => panic!("expected a close frame, got {:?}", other),
        }
        assert!(state.registry.is_empty().await);
        client.session.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_shutdown_ends_waiting_session() {
        let state = state_with("ws://127.0.0.1:9/ws", Arc::new(Hanging));
        let client = connect_client(state.clone());

        state.shutdown.cancel();
        let session = client.session.await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Closed);
    }
}

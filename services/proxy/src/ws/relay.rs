//! Bidirectional forwarding between a client socket and its upstream socket.
//!
//! Each direction runs as its own task (a "pump"). The first pump to finish
//! cancels the session token; the other is given a grace period to notice and
//! is aborted if it does not.

use super::{
    frame::{Frame, FrameStream, SharedSink},
    protocol::{MessageKind, RelayedMessage, ServerNotice, ToolCall},
    tools::ToolCallInterceptor,
};
use crate::error::ProxyError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client keep-alive: ping every `interval`, expect a pong within `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub keepalive: Option<KeepAlive>,
    pub shutdown_grace: Duration,
    pub forward_tool_summary: bool,
}

/// The two halves of both sockets of one session.
pub struct RelayChannels {
    pub client_source: FrameStream,
    pub client_sink: SharedSink,
    pub upstream_source: FrameStream,
    pub upstream_sink: SharedSink,
}

/// Why a pump stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// The source sent a close frame or its stream ended.
    SourceClosed,
    Cancelled,
}

/// Runs both pumps to completion.
///
/// Returns the outcome of whichever pump finished first. `cancel` is always
/// cancelled by the time this returns.
pub async fn run(
    channels: RelayChannels,
    interceptor: Arc<ToolCallInterceptor>,
    settings: &RelaySettings,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    let client_to_upstream = Pump {
        direction: Direction::ClientToUpstream,
        target: channels.upstream_sink.clone(),
        reply: channels.client_sink.clone(),
        interceptor: None,
        keepalive: settings.keepalive,
        forward_tool_summary: false,
        cancel: cancel.clone(),
    };
    let upstream_to_client = Pump {
        direction: Direction::UpstreamToClient,
        target: channels.client_sink,
        reply: channels.upstream_sink,
        interceptor: Some(interceptor),
        keepalive: None,
        forward_tool_summary: settings.forward_tool_summary,
        cancel: cancel.clone(),
    };

    let span = tracing::Span::current();
    let mut c2u = tokio::spawn(
        client_to_upstream
            .run(channels.client_source)
            .instrument(span.clone()),
    );
    let mut u2c = tokio::spawn(
        upstream_to_client
            .run(channels.upstream_source)
            .instrument(span),
    );

    let (first_direction, first, remaining) = tokio::select! {
        result = &mut c2u => (Direction::ClientToUpstream, result, u2c),
        result = &mut u2c => (Direction::UpstreamToClient, result, c2u),
    };
    cancel.cancel();

    let first = first.unwrap_or_else(|e| {
        Err(ProxyError::Transport {
            direction: first_direction.as_str(),
            reason: format!("forwarding task failed: {}", e),
        })
    });
    match &first {
        Ok(exit) => info!(direction = %first_direction, ?exit, "Forwarding loop finished."),
        Err(e) => error!(direction = %first_direction, error = %e, "Forwarding loop failed."),
    }

    let abort = remaining.abort_handle();
    match tokio::time::timeout(settings.shutdown_grace, remaining).await {
        Ok(Ok(Ok(exit))) => debug!(?exit, "Remaining forwarding loop stopped."),
        Ok(Ok(Err(e))) => warn!(error = %e, "Remaining forwarding loop stopped with error."),
        Ok(Err(e)) => warn!(error = %e, "Remaining forwarding loop panicked or was aborted."),
        Err(_) => {
            warn!("Remaining forwarding loop ignored cancellation; abandoning it.");
            abort.abort();
        }
    }

    first.map(|_| ())
}

/// One forwarding direction. The source stream is passed to `run` separately.
struct Pump {
    direction: Direction,
    /// The other side's socket; relayed messages go here.
    target: SharedSink,
    /// The source's own socket; tool responses and keep-alive pings go here.
    reply: SharedSink,
    interceptor: Option<Arc<ToolCallInterceptor>>,
    keepalive: Option<KeepAlive>,
    forward_tool_summary: bool,
    cancel: CancellationToken,
}

/// Outcome of a send that races the session token.
enum Delivery {
    Sent,
    Cancelled,
}

struct KeepAliveState {
    settings: KeepAlive,
    deadline: Instant,
    ping_sent_at: Option<Instant>,
}

impl KeepAliveState {
    fn new(settings: KeepAlive) -> Self {
        Self {
            settings,
            deadline: Instant::now() + settings.interval,
            ping_sent_at: None,
        }
    }

    /// Called when `deadline` passes; a ping is due unless one is already outstanding.
    fn on_deadline(&mut self) -> Result<(), ProxyError> {
        if self.ping_sent_at.is_some() {
            return Err(ProxyError::KeepAliveTimeout);
        }
        let now = Instant::now();
        self.ping_sent_at = Some(now);
        self.deadline = now + self.settings.timeout;
        Ok(())
    }

    fn on_pong(&mut self) {
        if let Some(sent) = self.ping_sent_at.take() {
            self.deadline = sent + self.settings.interval;
        }
    }
}

impl Pump {
    async fn run(self, mut source: FrameStream) -> Result<PumpExit, ProxyError> {
        let direction = self.direction;
        let mut keepalive = self.keepalive.map(KeepAliveState::new);
        debug!(%direction, "Forwarding loop started.");

        loop {
            // Disabled branches still build their future, so give it some instant.
            let deadline = keepalive
                .as_ref()
                .map(|k| k.deadline)
                .unwrap_or_else(Instant::now);

            let incoming = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(PumpExit::Cancelled),
                _ = sleep_until(deadline), if keepalive.is_some() => {
                    if let Some(state) = keepalive.as_mut() {
                        if let Err(e) = state.on_deadline() {
                            warn!(%direction, "No pong from client within keep-alive timeout.");
                            return Err(e);
                        }
                    }
                    match self.send(&self.reply, Frame::Ping(Bytes::new()), "ping").await? {
                        Delivery::Sent => continue,
                        Delivery::Cancelled => return Ok(PumpExit::Cancelled),
                    }
                }
                next = source.next() => next,
            };

            let frame = match incoming {
                None => {
                    info!(%direction, "Source stream ended.");
                    return Ok(PumpExit::SourceClosed);
                }
                Some(Err(reason)) => {
                    return Err(ProxyError::Transport {
                        direction: direction.as_str(),
                        reason,
                    });
                }
                Some(Ok(frame)) => frame,
            };

            let text = match frame {
                Frame::Text(text) => text,
                // The upstream service delivers its JSON as binary frames.
                Frame::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        let err = ProxyError::Parse(format!("binary frame is not UTF-8: {}", e));
                        warn!(%direction, error = %err, "Skipping binary frame.");
                        continue;
                    }
                },
                Frame::Pong(_) => {
                    if let Some(state) = keepalive.as_mut() {
                        state.on_pong();
                    }
                    continue;
                }
                Frame::Ping(_) => continue,
                Frame::Close(close) => {
                    info!(%direction, ?close, "Received close frame.");
                    return Ok(PumpExit::SourceClosed);
                }
            };

            let message = match RelayedMessage::parse(&text) {
                Ok(message) => message,
                Err(e) if e.is_recoverable() => {
                    warn!(%direction, error = %e, "Skipping unparseable message.");
                    continue;
                }
                Err(e) => return Err(e),
            };
            log_message(direction, &message);

            if let RelayedMessage::ToolCall(call) = &message {
                if let Some(interceptor) = self.interceptor.clone() {
                    match self.intercept(&interceptor, call).await? {
                        Delivery::Sent => continue,
                        Delivery::Cancelled => return Ok(PumpExit::Cancelled),
                    }
                }
            }

            let kind = message.kind().as_str();
            match self.send(&self.target, Frame::Text(text), kind).await? {
                Delivery::Sent => {}
                Delivery::Cancelled => return Ok(PumpExit::Cancelled),
            }
        }
    }

    /// Answers a tool call upstream instead of forwarding it to the client.
    async fn intercept(
        &self,
        interceptor: &ToolCallInterceptor,
        call: &ToolCall,
    ) -> Result<Delivery, ProxyError> {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Delivery::Cancelled),
            outcome = interceptor.execute(call) => outcome,
        };

        let payload = serde_json::to_string(&outcome.response).map_err(|e| self.send_error("tool_response", e))?;
        info!(
            direction = %self.direction,
            responses = outcome.response.tool_response.function_responses.len(),
            "Sending tool response upstream."
        );
        if let Delivery::Cancelled = self
            .send(&self.reply, Frame::Text(payload), "tool_response")
            .await?
        {
            return Ok(Delivery::Cancelled);
        }

        if self.forward_tool_summary {
            if let Some(summary) = outcome.summary {
                let notice = serde_json::to_string(&ServerNotice::ToolCallResponse(summary))
                    .map_err(|e| self.send_error("tool_call_summary", e))?;
                return self.send(&self.target, Frame::Text(notice), "tool_call_summary").await;
            }
        }
        Ok(Delivery::Sent)
    }

    async fn send(
        &self,
        sink: &SharedSink,
        frame: Frame,
        kind: &'static str,
    ) -> Result<Delivery, ProxyError> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(Delivery::Cancelled),
            result = async { sink.lock().await.send(frame).await } => result,
        };
        result.map(|_| Delivery::Sent).map_err(|e| {
            error!(direction = %self.direction, kind, error = %e, "Error sending message.");
            self.send_error(kind, e)
        })
    }

    fn send_error(&self, kind: &'static str, reason: impl fmt::Display) -> ProxyError {
        ProxyError::Send {
            direction: self.direction.as_str(),
            kind,
            reason: reason.to_string(),
        }
    }
}

fn log_message(direction: Direction, message: &RelayedMessage) {
    match message.kind() {
        MessageKind::Setup => info!(%direction, "Forwarding setup message."),
        MessageKind::RealtimeInput => debug!(%direction, "Forwarding audio/video input."),
        MessageKind::ServerContent => debug!(
            %direction,
            with_audio = message.has_inline_data(),
            "Forwarding server content."
        ),
        MessageKind::ToolCall => info!(%direction, ?message, "Received tool call."),
        MessageKind::Other => info!(%direction, keys = ?message.keys(), "Forwarding message."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{
        frame::{frame_sink, shared},
        tools::tests::{StubWeather, paris_report},
    };
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use livewire_core::weather::WeatherLookup;
    use serde_json::{Value, json};
    use tokio::task::JoinHandle;

    struct Harness {
        client_in: UnboundedSender<Result<Frame, String>>,
        client_out: UnboundedReceiver<Frame>,
        upstream_in: UnboundedSender<Result<Frame, String>>,
        upstream_out: UnboundedReceiver<Frame>,
        cancel: CancellationToken,
        relay: JoinHandle<Result<(), ProxyError>>,
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            keepalive: None,
            shutdown_grace: Duration::from_millis(100),
            forward_tool_summary: false,
        }
    }

    fn start(weather: Arc<dyn WeatherLookup>, settings: RelaySettings) -> Harness {
        let (client_in, client_source) = unbounded();
        let (client_sink, client_out) = unbounded();
        let (upstream_in, upstream_source) = unbounded();
        let (upstream_sink, upstream_out) = unbounded();
        let cancel = CancellationToken::new();

        let channels = RelayChannels {
            client_source: client_source.boxed(),
            client_sink: shared(frame_sink::<_, Frame>(client_sink)),
            upstream_source: upstream_source.boxed(),
            upstream_sink: shared(frame_sink::<_, Frame>(upstream_sink)),
        };
        let interceptor = Arc::new(ToolCallInterceptor::new(weather));
        let relay_cancel = cancel.clone();
        let relay = tokio::spawn(async move {
            run(channels, interceptor, &settings, relay_cancel).await
        });

        Harness {
            client_in,
            client_out,
            upstream_in,
            upstream_out,
            cancel,
            relay,
        }
    }

    fn text(value: Value) -> Result<Frame, String> {
        Ok(Frame::Text(value.to_string()))
    }

    async fn next_json(rx: &mut UnboundedReceiver<Frame>) -> Value {
        match rx.next().await {
            Some(Frame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_messages_reach_upstream_in_order() {
        let mut h = start(Arc::new(StubWeather::failing()), settings());

        for i in 0..20 {
            h.client_in
                .unbounded_send(text(json!({"realtime_input": {"media_chunks": [{"seq": i}]}})))
                .unwrap();
        }
        for i in 0..20 {
            assert_eq!(
                next_json(&mut h.upstream_out).await,
                json!({"realtime_input": {"media_chunks": [{"seq": i}]}})
            );
        }

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forwarded_text_is_byte_identical() {
        let mut h = start(Arc::new(StubWeather::failing()), settings());
        let raw = r#"{ "serverContent" : {"modelTurn":{"parts":[{"text":"héllo"}]}, "turnComplete": false} }"#;

        h.upstream_in
            .unbounded_send(Ok(Frame::Text(raw.to_string())))
            .unwrap();
        assert_eq!(h.client_out.next().await, Some(Frame::Text(raw.to_string())));

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_binary_json_from_upstream_is_delivered_as_text() {
        let mut h = start(Arc::new(StubWeather::failing()), settings());
        let raw = r#"{"setupComplete":{}}"#;

        h.upstream_in
            .unbounded_send(Ok(Frame::Binary(Bytes::from(raw))))
            .unwrap();
        assert_eq!(h.client_out.next().await, Some(Frame::Text(raw.to_string())));

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tool_call_is_answered_upstream_and_not_forwarded() {
        let mut h = start(Arc::new(StubWeather::answering(paris_report())), settings());

        h.upstream_in
            .unbounded_send(text(json!({"toolCall": {"functionCalls": [
                {"name": "get_weather", "args": {"city": "Paris"}}
            ]}})))
            .unwrap();
        h.upstream_in
            .unbounded_send(text(json!({"serverContent": {"turnComplete": true}})))
            .unwrap();

        let response = next_json(&mut h.upstream_out).await;
        assert_eq!(
            response,
            json!({"tool_response": {"function_responses": [{
                "name": "get_weather",
                "response": {"result": {"object_value": serde_json::to_value(paris_report()).unwrap()}}
            }]}})
        );
        // The first thing the client sees is the content after the tool call.
        assert_eq!(
            next_json(&mut h.client_out).await,
            json!({"serverContent": {"turnComplete": true}})
        );

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upstream_messages_reach_client_in_order_around_tool_call() {
        let mut h = start(Arc::new(StubWeather::answering(paris_report())), settings());

        for i in 0..10 {
            h.upstream_in
                .unbounded_send(text(json!({"serverContent": {"seq": i}})))
                .unwrap();
        }
        h.upstream_in
            .unbounded_send(text(json!({"toolCall": {"functionCalls": [
                {"name": "get_weather", "args": {"city": "Paris"}}
            ]}})))
            .unwrap();
        for i in 10..20 {
            h.upstream_in
                .unbounded_send(text(json!({"serverContent": {"seq": i}})))
                .unwrap();
        }

        for i in 0..20 {
            assert_eq!(
                next_json(&mut h.client_out).await,
                json!({"serverContent": {"seq": i}})
            );
        }
        let response = next_json(&mut h.upstream_out).await;
        assert_eq!(
            response["tool_response"]["function_responses"][0]["name"],
            "get_weather"
        );

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_lookup_still_answers_with_null() {
        let mut h = start(Arc::new(StubWeather::failing()), settings());

        h.upstream_in
            .unbounded_send(text(json!({"toolCall": {"functionCalls": [
                {"name": "get_weather", "args": {"city": "Atlantis"}},
                {"name": "book_flight", "args": {}}
            ]}})))
            .unwrap();

        assert_eq!(
            next_json(&mut h.upstream_out).await,
            json!({"tool_response": {"function_responses": [{
                "name": "get_weather",
                "response": {"result": {"object_value": null}}
            }]}})
        );

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tool_summary_echo_when_enabled() {
        let mut h = start(
            Arc::new(StubWeather::answering(paris_report())),
            RelaySettings {
                forward_tool_summary: true,
                ..settings()
            },
        );

        h.upstream_in
            .unbounded_send(text(json!({"toolCall": {"functionCalls": [
                {"name": "get_weather", "args": {"city": "Paris"}}
            ]}})))
            .unwrap();

        let _ = next_json(&mut h.upstream_out).await;
        let summary = next_json(&mut h.client_out).await;
        assert_eq!(summary["toolCallResponse"]["city"], "Paris");
        assert!(summary.get("toolCall").is_none());

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unparseable_messages_are_skipped() {
        let mut h = start(Arc::new(StubWeather::failing()), settings());

        h.client_in
            .unbounded_send(Ok(Frame::Text("{not json".to_string())))
            .unwrap();
        h.client_in
            .unbounded_send(Ok(Frame::Binary(Bytes::from_static(&[0xff, 0xfe]))))
            .unwrap();
        h.client_in
            .unbounded_send(Ok(Frame::Ping(Bytes::new())))
            .unwrap();
        h.client_in
            .unbounded_send(text(json!({"clientContent": {"turnComplete": true}})))
            .unwrap();

        assert_eq!(
            next_json(&mut h.upstream_out).await,
            json!({"clientContent": {"turnComplete": true}})
        );

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_client_close_ends_both_loops() {
        let h = start(Arc::new(StubWeather::failing()), settings());

        h.client_in
            .unbounded_send(Ok(Frame::Close(Some((1000, "bye".to_string())))))
            .unwrap();

        h.relay.await.unwrap().unwrap();
        assert!(h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_upstream_stream_end_ends_session() {
        let h = start(Arc::new(StubWeather::failing()), settings());
        drop(h.upstream_in);

        h.relay.await.unwrap().unwrap();
        assert!(h.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_transport_error_is_fatal() {
        let h = start(Arc::new(StubWeather::failing()), settings());

        h.upstream_in
            .unbounded_send(Err("connection reset".to_string()))
            .unwrap();

        let err = h.relay.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Transport {
                direction: "upstream->client",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_send_failure_tears_down_session() {
        let h = start(Arc::new(StubWeather::failing()), settings());
        drop(h.upstream_out);

        h.client_in
            .unbounded_send(text(json!({"realtime_input": {}})))
            .unwrap();

        let err = h.relay.await.unwrap().unwrap_err();
        match err {
            ProxyError::Send {
                direction, kind, ..
            } => {
                assert_eq!(direction, "client->upstream");
                assert_eq!(kind, "realtime_input");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(h.cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_timeout_without_pong() {
        let mut h = start(
            Arc::new(StubWeather::failing()),
            RelaySettings {
                keepalive: Some(KeepAlive {
                    interval: Duration::from_secs(30),
                    timeout: Duration::from_secs(10),
                }),
                ..settings()
            },
        );

        assert_eq!(h.client_out.next().await, Some(Frame::Ping(Bytes::new())));
        let err = h.relay.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::KeepAliveTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_survives_with_pongs() {
        let mut h = start(
            Arc::new(StubWeather::failing()),
            RelaySettings {
                keepalive: Some(KeepAlive {
                    interval: Duration::from_secs(30),
                    timeout: Duration::from_secs(10),
                }),
                ..settings()
            },
        );

        for _ in 0..3 {
            assert_eq!(h.client_out.next().await, Some(Frame::Ping(Bytes::new())));
            h.client_in
                .unbounded_send(Ok(Frame::Pong(Bytes::new())))
                .unwrap();
        }
        assert!(!h.relay.is_finished());

        h.cancel.cancel();
        h.relay.await.unwrap().unwrap();
    }
}

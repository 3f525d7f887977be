//! A transport-neutral WebSocket frame.
//!
//! The client side of the proxy speaks axum's WebSocket types and the upstream
//! side speaks tungstenite's. Both are adapted into boxed [`Frame`] streams and
//! sinks so the relay only ever deals with one message type.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, future, stream::BoxStream};
use std::{fmt::Display, pin::Pin, sync::Arc};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{
    Message as WsMessage,
    protocol::{CloseFrame as WsCloseFrame, frame::coding::CloseCode},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

pub type FrameStream = BoxStream<'static, Result<Frame, String>>;
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = String> + Send>>;
/// A sink written to by more than one task.
pub type SharedSink = Arc<Mutex<FrameSink>>;

/// Conversion between a socket library's message type and [`Frame`].
pub trait WireMessage: Sized + Send + 'static {
    /// `None` for library-internal frames that are never relayed.
    fn into_frame(self) -> Option<Frame>;
    fn from_frame(frame: Frame) -> Self;
}

impl WireMessage for Frame {
    fn into_frame(self) -> Option<Frame> {
        Some(self)
    }

    fn from_frame(frame: Frame) -> Self {
        frame
    }
}

impl WireMessage for AxumMessage {
    fn into_frame(self) -> Option<Frame> {
        Some(match self {
            AxumMessage::Text(text) => Frame::Text(text.as_str().to_owned()),
            AxumMessage::Binary(data) => Frame::Binary(data),
            AxumMessage::Ping(data) => Frame::Ping(data),
            AxumMessage::Pong(data) => Frame::Pong(data),
            AxumMessage::Close(close) => {
                Frame::Close(close.map(|c| (c.code, c.reason.as_str().to_owned())))
            }
        })
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => AxumMessage::Text(text.into()),
            Frame::Binary(data) => AxumMessage::Binary(data),
            Frame::Ping(data) => AxumMessage::Ping(data),
            Frame::Pong(data) => AxumMessage::Pong(data),
            Frame::Close(close) => AxumMessage::Close(close.map(|(code, reason)| {
                AxumCloseFrame {
                    code,
                    reason: reason.into(),
                }
            })),
        }
    }
}

impl WireMessage for WsMessage {
    fn into_frame(self) -> Option<Frame> {
        match self {
            WsMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            WsMessage::Binary(data) => Some(Frame::Binary(data)),
            WsMessage::Ping(data) => Some(Frame::Ping(data)),
            WsMessage::Pong(data) => Some(Frame::Pong(data)),
            WsMessage::Close(close) => Some(Frame::Close(
                close.map(|c| (u16::from(c.code), c.reason.as_str().to_owned())),
            )),
            WsMessage::Frame(_) => None,
        }
    }

    fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(data) => WsMessage::Binary(data),
            Frame::Ping(data) => WsMessage::Ping(data),
            Frame::Pong(data) => WsMessage::Pong(data),
            Frame::Close(close) => WsMessage::Close(close.map(|(code, reason)| WsCloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        }
    }
}

/// Adapts the receiving half of a socket into a [`FrameStream`].
pub fn frame_stream<S, M, E>(source: S) -> FrameStream
where
    S: Stream<Item = Result<M, E>> + Send + 'static,
    M: WireMessage,
    E: Display,
{
    source
        .filter_map(|item| {
            future::ready(match item {
                Ok(message) => message.into_frame().map(Ok),
                Err(e) => Some(Err(e.to_string())),
            })
        })
        .boxed()
}

/// Adapts the sending half of a socket into a [`FrameSink`].
pub fn frame_sink<K, M>(sink: K) -> FrameSink
where
    K: Sink<M> + Send + 'static,
    K::Error: Display,
    M: WireMessage,
{
    Box::pin(
        sink.sink_map_err(|e| e.to_string())
            .with(|frame: Frame| future::ready(Ok::<M, String>(M::from_frame(frame)))),
    )
}

pub fn shared(sink: FrameSink) -> SharedSink {
    Arc::new(Mutex::new(sink))
}

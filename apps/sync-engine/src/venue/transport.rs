//! Venue WebSocket transport.
//!
//! One `VenueSession` is one authenticated bidirectional connection to the
//! venue's streaming endpoint. Requests are framed with a client-generated
//! message id; the matching loop returns the first correlated reply,
//! silently discarding heartbeats. Each round trip is bounded by the
//! configured request timeout (the read-deadline of the underlying socket is
//! effectively re-armed before every wait via `tokio::time::timeout`).

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use super::messages::{self, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors from the venue transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Dialing the venue endpoint failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// Writing a frame failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading from the socket failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// No correlated reply arrived within the request timeout.
    #[error("timed out after {timeout:?} waiting for reply to payload type {payload_type}")]
    Timeout {
        /// Request payload type that timed out.
        payload_type: u32,
        /// Configured per-call bound.
        timeout: Duration,
    },

    /// The venue returned an explicit error payload.
    #[error("venue error: {0}")]
    Venue(String),

    /// The reply's payload type did not match the expected one.
    #[error("unexpected response type: expected {expected}, got {actual}")]
    UnexpectedResponseType {
        /// Expected reply payload type.
        expected: u32,
        /// Actual reply payload type.
        actual: u32,
    },

    /// The connection was closed by the peer.
    #[error("connection closed")]
    Closed,

    /// Frame (de)serialization failed.
    #[error("frame encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Whether `reply_type` is the well-known reply for `request_type`.
///
/// The two authentication handshakes and the two order-detail lookup
/// variants do not reliably echo the client message id, so their replies are
/// matched by type instead.
#[must_use]
pub const fn is_implied_reply(request_type: u32, reply_type: u32) -> bool {
    matches!(
        (request_type, reply_type),
        (messages::APP_AUTH_REQ, messages::APP_AUTH_RES)
            | (messages::ACCOUNT_AUTH_REQ, messages::ACCOUNT_AUTH_RES)
            | (messages::ORDER_DETAILS_REQ, messages::ORDER_DETAILS_RES)
            | (
                messages::ORDERS_BY_POSITION_REQ,
                messages::ORDERS_BY_POSITION_RES
            )
    )
}

/// One authenticated channel to a broker venue for one trading account.
pub struct VenueSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    request_timeout: Duration,
}

impl VenueSession {
    /// Dial the venue endpoint.
    pub async fn connect(endpoint: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;
        let (write, read) = stream.split();
        tracing::debug!(endpoint, "venue session connected");
        Ok(Self {
            write,
            read,
            request_timeout,
        })
    }

    /// Send a typed request and return the first correlated reply.
    ///
    /// Heartbeats arriving out of band are discarded and do not count as a
    /// reply. An explicit venue error payload is surfaced as
    /// [`TransportError::Venue`] with the payload body as detail.
    pub async fn send<T: Serialize>(
        &mut self,
        payload_type: u32,
        payload: &T,
    ) -> Result<Frame, TransportError> {
        let msg_id = format!("m-{}", Uuid::new_v4().simple());
        let frame = Frame::request(msg_id.clone(), payload_type, payload)?;
        let text = serde_json::to_string(&frame)?;

        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))?;

        loop {
            let msg = tokio::time::timeout(self.request_timeout, self.read.next())
                .await
                .map_err(|_| TransportError::Timeout {
                    payload_type,
                    timeout: self.request_timeout,
                })?
                .ok_or(TransportError::Closed)?
                .map_err(|e| TransportError::Receive(e.to_string()))?;

            let Message::Text(raw) = msg else { continue };
            let Ok(reply) = serde_json::from_str::<Frame>(raw.as_str()) else {
                continue;
            };

            if reply.payload_type == messages::HEARTBEAT_EVENT {
                continue;
            }
            if reply.payload_type == messages::ERROR_RES {
                return Err(TransportError::Venue(reply.payload.to_string()));
            }
            if reply.client_msg_id.as_deref() == Some(msg_id.as_str())
                || is_implied_reply(payload_type, reply.payload_type)
            {
                return Ok(reply);
            }
        }
    }

    /// Send a request and verify the reply's payload type.
    pub async fn send_expect<T: Serialize>(
        &mut self,
        payload_type: u32,
        payload: &T,
        expected: u32,
    ) -> Result<Frame, TransportError> {
        let reply = self.send(payload_type, payload).await?;
        if reply.payload_type != expected {
            return Err(TransportError::UnexpectedResponseType {
                expected,
                actual: reply.payload_type,
            });
        }
        Ok(reply)
    }

    /// Split the session into independent writer/reader halves for the
    /// push-event phase, where reads and keepalive writes interleave.
    #[must_use]
    pub fn into_split(self) -> (VenueWriter, VenueReader) {
        (
            VenueWriter { write: self.write },
            VenueReader { read: self.read },
        )
    }
}

/// Write half of a split session.
pub struct VenueWriter {
    write: SplitSink<WsStream, Message>,
}

impl VenueWriter {
    /// Send a keepalive heartbeat frame.
    pub async fn send_heartbeat(&mut self) -> Result<(), TransportError> {
        let text = serde_json::to_string(&Frame::heartbeat())?;
        self.write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}

/// Read half of a split session.
pub struct VenueReader {
    read: SplitStream<WsStream>,
}

impl VenueReader {
    /// Read the next decodable frame, skipping non-text messages and
    /// undecodable payloads.
    pub async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let msg = self
                .read
                .next()
                .await
                .ok_or(TransportError::Closed)?
                .map_err(|e| TransportError::Receive(e.to_string()))?;

            let Message::Text(raw) = msg else { continue };
            if let Ok(frame) = serde_json::from_str::<Frame>(raw.as_str()) {
                return Ok(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implied_replies_cover_auth_and_order_lookups() {
        assert!(is_implied_reply(
            messages::APP_AUTH_REQ,
            messages::APP_AUTH_RES
        ));
        assert!(is_implied_reply(
            messages::ACCOUNT_AUTH_REQ,
            messages::ACCOUNT_AUTH_RES
        ));
        assert!(is_implied_reply(
            messages::ORDER_DETAILS_REQ,
            messages::ORDER_DETAILS_RES
        ));
        assert!(is_implied_reply(
            messages::ORDERS_BY_POSITION_REQ,
            messages::ORDERS_BY_POSITION_RES
        ));
    }

    #[test]
    fn data_calls_are_not_implied_replies() {
        assert!(!is_implied_reply(
            messages::DEAL_LIST_REQ,
            messages::DEAL_LIST_RES
        ));
        assert!(!is_implied_reply(
            messages::ORDER_LIST_REQ,
            messages::ORDER_LIST_RES
        ));
        assert!(!is_implied_reply(
            messages::APP_AUTH_REQ,
            messages::ACCOUNT_AUTH_RES
        ));
    }

    #[test]
    fn timeout_error_mentions_payload_type() {
        let err = TransportError::Timeout {
            payload_type: messages::DEAL_LIST_REQ,
            timeout: Duration::from_secs(10),
        };
        assert!(err.to_string().contains("2133"));
    }
}

//! WebSocket transport carrying STOMP frames
//!
//! A connector opens one socket and hands back a byte stream and a byte sink; everything
//! above this layer works on raw frame bytes so the transport can be swapped in tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue, StatusCode},
        protocol::Message,
        Error as WsError,
    },
};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};

/// Inbound chunks of frame bytes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Outbound encoded frames
pub type FrameSink = Pin<Box<dyn Sink<Bytes, Error = FeedError> + Send>>;

/// Opens a transport to the feed
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, credential: &str) -> Result<(FrameStream, FrameSink)>;
}

/// `tokio-tungstenite` connector sending the session credential as a cookie
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: String,
    origin: String,
    cookie_name: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(
        endpoint: &str,
        origin: &str,
        cookie_name: &str,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            origin: origin.to_string(),
            cookie_name: cookie_name.to_string(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, credential: &str) -> Result<(FrameStream, FrameSink)> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("{}={}", self.cookie_name, credential))
                .map_err(|_| {
                    FeedError::AuthUnavailable("credential is not a valid header value".into())
                })?,
        );
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(&self.origin)
                .map_err(|e| FeedError::ConfigError(format!("invalid origin: {e}")))?,
        );

        info!(url = %self.endpoint, "Connecting to feed WebSocket");

        let upgrade = tokio::time::timeout(self.connect_timeout, connect_async(request));
        let (ws_stream, response) = upgrade
            .await
            .map_err(|_| {
                FeedError::TransportError(format!(
                    "upgrade not completed within {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(map_connect_error)?;
        info!(status = ?response.status(), "WebSocket connected");

        let (sink, stream) = ws_stream.split();

        let stream = stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text))),
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(Message::Close(frame)) => {
                    warn!(frame = ?frame, "Received close frame");
                    Some(Err(FeedError::TransportError("connection closed by peer".into())))
                }
                // pings are answered by tungstenite itself
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });

        let sink = sink.with(|bytes: Bytes| async move {
            debug!(len = bytes.len(), "Sending frame");
            Ok::<_, FeedError>(Message::Text(String::from_utf8_lossy(&bytes).into_owned()))
        });

        Ok((Box::pin(stream), Box::pin(sink)))
    }
}

/// Upgrade rejections with 401/403 mean the session credential is no good
fn map_connect_error(err: WsError) -> FeedError {
    match &err {
        WsError::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            FeedError::AuthRejected(format!("upgrade rejected with {}", response.status()))
        }
        _ => FeedError::TransportError(format!("failed to connect: {err}")),
    }
}

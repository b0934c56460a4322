//! WebSocket plumbing for BACnet/SC.
//!
//! Thin wrappers over `tokio-tungstenite` that produce boxed sink/source
//! halves, negotiate the BACnet/SC subprotocol, and set TCP_NODELAY so
//! small BACnet messages are not delayed by Nagle.

use std::pin::Pin;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, WebSocketStream};

use crate::datalink::{DataLinkError, Result};

/// Boxed write half of a websocket.
pub type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Boxed read half of a websocket.
pub type WsSource = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

fn box_halves<S>(ws: WebSocketStream<S>) -> (WsSink, WsSource)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, source): (SplitSink<_, _>, SplitStream<_>) = ws.split();
    (Box::pin(sink), Box::pin(source))
}

/// Connect to a hub or direct peer, negotiating `subprotocol`. TLS is taken
/// from the injected `connector`; `None` restricts the URI to `ws://`.
pub async fn connect(
    uri: &str,
    subprotocol: &str,
    connector: Option<Connector>,
) -> Result<(WsSink, WsSource)> {
    let mut request = uri
        .into_client_request()
        .map_err(|err| DataLinkError::WebSocket(err.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_str(subprotocol)
            .map_err(|err| DataLinkError::WebSocket(err.to_string()))?,
    );

    // disable_nagle: small BACnet messages must not sit behind delayed
    // ACKs.
    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, true, connector)
            .await
            .map_err(|err| DataLinkError::WebSocket(err.to_string()))?;
    Ok(box_halves(ws))
}

/// Accept a websocket over an already-established (and, in production,
/// TLS-wrapped) stream, answering the BACnet/SC subprotocol offer.
pub async fn accept<S>(stream: S) -> Result<(WsSink, WsSource)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let callback = |request: &Request, mut response: Response| {
        let offered = request
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        for proto in [super::HUB_SUBPROTOCOL, super::DIRECT_SUBPROTOCOL] {
            if offered.split(',').any(|p| p.trim() == proto) {
                response.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(proto),
                );
                break;
            }
        }
        Ok(response)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|err| DataLinkError::WebSocket(err.to_string()))?;
    Ok(box_halves(ws))
}

/// Send one binary BVLC-SC frame.
pub async fn send_frame(sink: &mut WsSink, frame: Vec<u8>) -> Result<()> {
    sink.send(Message::Binary(frame.into()))
        .await
        .map_err(|err| DataLinkError::WebSocket(err.to_string()))
}

/// Receive the next binary frame, skipping control frames. `None` marks a
/// closed connection.
pub async fn recv_frame(source: &mut WsSource) -> Result<Option<Vec<u8>>> {
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Text(_))) => {
                // BVLC-SC is binary-only; a text frame is a peer bug.
                log::debug!("ignoring text frame on BACnet/SC websocket");
                continue;
            }
            Some(Ok(Message::Frame(_))) => continue,
            Some(Err(err)) => return Err(DataLinkError::WebSocket(err.to_string())),
        }
    }
}

/// Close the write half gracefully.
pub async fn close(sink: &mut WsSink) {
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.flush().await;
}

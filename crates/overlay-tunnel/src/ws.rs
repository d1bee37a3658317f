//! WebSocket dial/accept plus a byte-stream adapter (§4.5).
//!
//! Grounded on the teacher's `wsh-client/src/transport/websocket.rs`:
//! split the socket into a sink and a stream, run a background pump
//! task, and answer pings inline. The teacher's pump hand-rolled its
//! own stream-multiplexing frame format on top of that pump; here the
//! multiplexing is yamux's job (see [`crate::mux`]), so the pump's only
//! responsibility is turning a message-oriented WebSocket into a plain
//! byte stream — `tokio::io::duplex` already does the buffering the
//! teacher's `VirtualStream::read_buf`/`read_offset` fields did by hand.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, WebSocketStream};

use overlay_core::error::{OverlayError, OverlayResult};

const PUMP_BUFFER: usize = 64 * 1024;

/// Dial `url` (a `ws://host:port/path` address) and return the raw
/// WebSocketStream. Plain TCP only — TLS is out of scope (§6 pins the
/// wire to unencrypted WebSocket binary frames).
pub async fn connect_client(
    url: &str,
) -> OverlayResult<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| OverlayError::UpgradeFailed(e.to_string()))?;
    Ok(stream)
}

/// Wrap an already-upgraded server-side connection (e.g. the duplex
/// half returned by `hyper::upgrade::on`) as a server-role WebSocket.
pub async fn from_raw_socket<S>(stream: S, role: Role) -> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    WebSocketStream::from_raw_socket(stream, role, None).await
}

/// Turn a WebSocket connection into a plain duplex byte stream. Spawns
/// a background task pumping WS frames in both directions; dropping the
/// returned stream or the task finishing for any other reason tears
/// down the connection. The join handle is returned so callers can
/// await clean shutdown.
pub fn wrap_as_byte_stream<S>(ws: WebSocketStream<S>) -> (DuplexStream, tokio::task::JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (app_side, pump_side) = tokio::io::duplex(PUMP_BUFFER);
    let (mut pump_read, mut pump_write) = tokio::io::split(pump_side);
    let (mut sink, mut stream) = ws.split();
    // Only `pipe_to_ws` holds the sink; `ws_to_pipe` hands pong replies
    // across this channel instead of sending on it directly, since a
    // WebSocketStream's sink half can't be driven by two tasks at once.
    let (pong_tx, mut pong_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(16);

    let handle = tokio::spawn(async move {
        let ws_to_pipe = async {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        if pump_write.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if pong_tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "websocket read error");
                        break;
                    }
                }
            }
        };

        let pipe_to_ws = async {
            let mut buf = vec![0u8; PUMP_BUFFER];
            let mut pongs_open = true;
            loop {
                tokio::select! {
                    payload = pong_rx.recv(), if pongs_open => {
                        match payload {
                            Some(payload) => {
                                if sink.send(Message::Pong(payload)).await.is_err() {
                                    break;
                                }
                            }
                            None => pongs_open = false,
                        }
                    }
                    result = tokio::io::AsyncReadExt::read(&mut pump_read, &mut buf) => {
                        match result {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if sink.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        };

        tokio::select! {
            _ = ws_to_pipe => {}
            _ = pipe_to_ws => {}
        }
    });

    (app_side, handle)
}

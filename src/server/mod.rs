pub mod hub;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use self::hub::{ClientHandle, ClientId, Hub, HubEvent};

/// Capacity of each client's outbound queue. A client that falls this many
/// payloads behind is evicted by the next broadcast.
const SEND_BUF: usize = 256;
const HUB_EVENTS: usize = 256;

pub struct Server {
    hub_tx: mpsc::Sender<HubEvent>,
    conn_counter: AtomicU64,
}

impl Server {
    /// Spawns the hub task. Must be called from within a tokio runtime.
    pub fn new() -> Arc<Self> {
        let (hub_tx, hub_rx) = mpsc::channel(HUB_EVENTS);
        tokio::spawn(Hub::new().run(hub_rx));
        Arc::new(Self {
            hub_tx,
            conn_counter: AtomicU64::new(0),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(home))
            .route("/ws", get(ws_endpoint))
            .with_state(self.clone())
    }

    pub async fn listen_and_serve(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Registration flow: fresh identity, bounded outbound queue, Join,
    /// then one writer task and the reader loop in this task.
    async fn serve_socket(self: Arc<Self>, socket: WebSocket) {
        let id = self.conn_counter.fetch_add(1, Ordering::Relaxed);
        debug!(id, "client connected");

        let (tx, rx) = mpsc::channel::<Vec<u8>>(SEND_BUF);
        if self
            .hub_tx
            .send(HubEvent::Join(ClientHandle { id, tx }))
            .await
            .is_err()
        {
            return;
        }

        let (sink, stream) = socket.split();
        tokio::spawn(write_pump(sink, rx, id, self.hub_tx.clone()));
        read_pump(stream, id, self.hub_tx.clone()).await;
        debug!(id, "connection closed");
    }
}

async fn home() -> &'static str {
    "Welcome to the homepage"
}

async fn ws_endpoint(State(srv): State<Arc<Server>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| srv.serve_socket(socket))
}

/// Forward inbound frames to the hub as broadcasts. Close, end-of-stream
/// and read errors all fall through to the single Leave below, so the hub
/// sees exactly one Leave per reader no matter how the connection died.
async fn read_pump<S>(mut stream: S, id: ClientId, hub_tx: mpsc::Sender<HubEvent>)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(Message::Close(_)) => break,
            Ok(msg) => msg,
            Err(e) => {
                debug!(id, error = %e, "read error");
                break;
            }
        };
        if let Some(payload) = frame_payload(msg) {
            if hub_tx
                .send(HubEvent::Broadcast { from: id, payload })
                .await
                .is_err()
            {
                break;
            }
        }
    }
    hub_tx.send(HubEvent::Leave(id)).await.ok();
}

/// Drain the outbound queue onto the socket. Ends when the hub drops the
/// queue's sender (Leave) and everything queued has been written; the
/// writer owns the send half, so it alone closes it. A write failure also
/// reports Leave — idempotent, the reader usually beats us to it.
async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Vec<u8>>,
    id: ClientId,
    hub_tx: mpsc::Sender<HubEvent>,
) where
    S: Sink<Message> + Unpin,
{
    while let Some(payload) = rx.recv().await {
        if sink.send(payload_frame(payload)).await.is_err() {
            debug!(id, "write error");
            hub_tx.send(HubEvent::Leave(id)).await.ok();
            break;
        }
    }
    sink.close().await.ok();
}

fn frame_payload(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.as_bytes().to_vec()),
        Message::Binary(data) => Some(data.to_vec()),
        // Ping/Pong are transport keepalive, not payload.
        _ => None,
    }
}

/// Text in, text out: payloads that arrived as UTF-8 chat lines go back
/// out as Text frames, anything else as Binary.
fn payload_frame(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text.into()),
        Err(raw) => Message::Binary(raw.into_bytes().into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc as fmpsc;
    use futures::stream;

    fn read_err() -> axum::Error {
        axum::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
    }

    #[tokio::test]
    async fn read_pump_leaves_exactly_once_on_error() {
        let frames: Vec<Result<Message, axum::Error>> = vec![
            Ok(Message::Text("hi".into())),
            Ok(Message::Ping(vec![].into())),
            Err(read_err()),
            Ok(Message::Text("unreachable".into())),
        ];
        let (hub_tx, mut hub_rx) = mpsc::channel(8);

        read_pump(stream::iter(frames), 7, hub_tx).await;

        match hub_rx.recv().await {
            Some(HubEvent::Broadcast { from, payload }) => {
                assert_eq!(from, 7);
                assert_eq!(payload, b"hi");
            }
            _ => panic!("expected broadcast"),
        }
        assert!(matches!(hub_rx.recv().await, Some(HubEvent::Leave(7))));
        assert!(hub_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_pump_leaves_exactly_once_on_clean_close() {
        let frames: Vec<Result<Message, axum::Error>> =
            vec![Ok(Message::Text("bye".into())), Ok(Message::Close(None))];
        let (hub_tx, mut hub_rx) = mpsc::channel(8);

        read_pump(stream::iter(frames), 3, hub_tx).await;

        assert!(matches!(
            hub_rx.recv().await,
            Some(HubEvent::Broadcast { from: 3, .. })
        ));
        assert!(matches!(hub_rx.recv().await, Some(HubEvent::Leave(3))));
        assert!(hub_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_pump_drains_then_closes_the_sink() {
        let (sink, mut written) = fmpsc::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(8);
        tx.send(b"one".to_vec()).await.unwrap();
        tx.send(b"two".to_vec()).await.unwrap();
        drop(tx); // the hub retiring the handle

        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        write_pump(sink, rx, 5, hub_tx).await;

        match written.next().await {
            Some(Message::Text(t)) => assert_eq!(t.as_str(), "one"),
            other => panic!("unexpected frame: {other:?}"),
        }
        match written.next().await {
            Some(Message::Text(t)) => assert_eq!(t.as_str(), "two"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(written.next().await.is_none());
        // Normal drain is not a failure: no Leave.
        assert!(hub_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_pump_reports_leave_on_write_failure() {
        let (sink, written) = fmpsc::unbounded::<Message>();
        drop(written); // peer gone, writes fail

        let (tx, rx) = mpsc::channel(8);
        tx.send(b"lost".to_vec()).await.unwrap();

        let (hub_tx, mut hub_rx) = mpsc::channel(8);
        write_pump(sink, rx, 9, hub_tx).await;

        assert!(matches!(hub_rx.recv().await, Some(HubEvent::Leave(9))));
    }

    #[test]
    fn binary_payloads_stay_binary() {
        let payload = vec![0xff, 0xfe, 0x00];
        match payload_frame(payload.clone()) {
            Message::Binary(b) => assert_eq!(b.to_vec(), payload),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

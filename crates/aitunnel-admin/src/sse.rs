use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, header};
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::router::AdminState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";
/// Log records replayed to a freshly connected subscriber.
const REPLAY_COUNT: usize = 30;

/// `GET /api/logs`: replay the recent log tail, then follow every event on
/// the hub. A slow consumer lags out of the broadcast and the stream ends;
/// the emission path never waits for it.
pub async fn log_stream(State(state): State<AdminState>) -> Response {
    let replay = state.app.hub.recent(REPLAY_COUNT);
    let mut events = state.app.hub.subscribe();

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        for record in replay {
            let Ok(frame) = encode_frame("log", &record) else {
                continue;
            };
            if tx.send(frame).await.is_err() {
                return;
            }
        }

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if tx.send(Bytes::from_static(HEARTBEAT_FRAME)).await.is_err() {
                        return;
                    }
                }
                event = events.recv() => {
                    let Ok(event) = event else {
                        return;
                    };
                    let Ok(frame) = encode_frame(event.topic(), &event) else {
                        continue;
                    };
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn encode_frame<T: serde::Serialize>(topic: &str, payload: &T) -> Result<Bytes, serde_json::Error> {
    let data = serde_json::to_string(payload)?;
    Ok(Bytes::from(format!("event: {topic}\ndata: {data}\n\n")))
}

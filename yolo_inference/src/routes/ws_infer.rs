use crate::{
    codec,
    error::InferenceError,
    params::InferenceParams,
    routes::{observe, run_pipeline},
    server::SharedState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::fmt::Display;

const ROUTE: &str = "/ws/infer";

/// What one incoming message asks the session to do.
enum Frame {
    Infer(Bytes, InferenceParams),
    Ignore,
    Close,
}

fn invalid(message: &str) -> InferenceError {
    InferenceError::InvalidEncoding(message.to_string())
}

fn parse_text_frame(text: &str) -> Result<Frame, InferenceError> {
    let payload: Value = serde_json::from_str(text)
        .map_err(|_| invalid("WebSocket text payload must be valid JSON."))?;

    let Value::Object(payload) = payload else {
        return Err(invalid("WebSocket JSON payload must be an object."));
    };

    let image_field = payload
        .get("image")
        .ok_or_else(|| invalid("WebSocket JSON payload must include \"image\"."))?;
    let image = match image_field {
        Value::String(image) if !image.trim().is_empty() => image,
        _ => return Err(invalid("\"image\" must be a non-empty base64 string.")),
    };

    let params = InferenceParams::sanitize(
        payload.get("confidence"),
        payload.get("iou"),
        payload.get("imgsz"),
    );
    let image_bytes = codec::decode_base64(image)?;

    Ok(Frame::Infer(Bytes::from(image_bytes), params))
}

fn parse_message(message: Message) -> Result<Frame, InferenceError> {
    match message {
        Message::Binary(image_bytes) => Ok(Frame::Infer(image_bytes, InferenceParams::default())),
        Message::Text(text) => parse_text_frame(text.as_str()),
        Message::Ping(_) | Message::Pong(_) => Ok(Frame::Ignore),
        Message::Close(_) => Ok(Frame::Close),
    }
}

pub async fn ws_infer(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket: WebSocket| async move {
        let (sender, receiver) = socket.split();
        run_session(sender, receiver, state).await;
    })
}

/// Receive/respond loop of one streaming session. Processing errors are answered with an
/// `{"error": ...}` frame and the loop keeps going; only a close frame, the end of the stream or
/// a transport failure ends it.
pub(crate) async fn run_session<Si, St, E>(mut sender: Si, mut receiver: St, state: SharedState)
where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    tracing::info!("Streaming session opened");

    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Streaming session transport failure: {}", e);
                break;
            }
        };

        let result = match parse_message(message) {
            Ok(Frame::Ignore) => continue,
            Ok(Frame::Close) => break,
            Ok(Frame::Infer(image_bytes, params)) => {
                state.metrics.record_request(ROUTE);
                run_pipeline(state.pipeline.clone(), image_bytes, params).await
            }
            Err(err) => {
                state.metrics.record_request(ROUTE);
                Err(err)
            }
        };
        observe(&state, ROUTE, &result);

        let reply = match result {
            Ok(result) => serde_json::to_string(&result)
                .unwrap_or_else(|e| json!({ "error": e.to_string() }).to_string()),
            Err(err) => json!({ "error": err.to_string() }).to_string(),
        };

        if sender.send(Message::Text(reply.into())).await.is_err() {
            tracing::warn!("Streaming session could not send reply, closing");
            break;
        }
    }

    tracing::info!("Streaming session closed");
}

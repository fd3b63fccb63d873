// src/web/sse.rs
// Server-Sent Events stream of live memory events

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    response::sse::{Event, Sse},
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::MemError;
use crate::events::{EventBroadcaster, StreamEvent};
use crate::web::api::ApiError;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamParams {
    pub project: Option<String>,
    pub session_id: Option<String>,
}

/// Receiver wrapper that deregisters the client when the connection drops.
struct ClientStream {
    client_id: u64,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    broadcaster: Arc<EventBroadcaster>,
}

impl Stream for ClientStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|next| {
            next.map(|event| {
                let data = serde_json::to_string(&event)
                    .unwrap_or_else(|_| "{\"type\":\"error\"}".to_string());
                Ok(Event::default().data(data))
            })
        })
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.client_id);
    }
}

/// `GET /api/stream`: connected event, typed events, 15 s heartbeats.
pub async fn stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.settings_snapshot().sse_enabled {
        return Err(ApiError(MemError::FeatureDisabled("sse".to_string())));
    }

    let (client_id, rx) = state
        .broadcaster
        .subscribe(params.project, params.session_id);

    let stream = ClientStream {
        client_id,
        rx,
        broadcaster: state.broadcaster.clone(),
    };
    Ok(Sse::new(stream))
}

//! Server-sent-events body parsing shared by the HTTP providers.

use eventsource_stream::Eventsource;
use flowlang::{RuntimeError, RuntimeResult};
use futures::{Stream, StreamExt};
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SseControl {
    Continue,
    Stop,
}

/// Feed each `(event, data)` pair of an SSE body to `on_event` until it returns
/// `SseControl::Stop` or the body ends.
pub(crate) async fn for_each_event<S, B, E, F>(body: S, mut on_event: F) -> RuntimeResult<()>
where
    S: Stream<Item = Result<B, E>> + Send,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
    F: FnMut(&str, &str) -> RuntimeResult<SseControl> + Send,
{
    let mut events = Box::pin(body.eventsource());
    while let Some(event) = events.next().await {
        let event =
            event.map_err(|e| RuntimeError::RequestFailed(format!("SSE stream error: {}", e)))?;
        if on_event(&event.event, &event.data)? == SseControl::Stop {
            break;
        }
    }
    Ok(())
}

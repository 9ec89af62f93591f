use std::pin::Pin;

use futures_util::{Sink, SinkExt};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::SessionError;

/// Write half of the live connection, one JSON document per frame.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = SessionError> + Send>>;

/// The single outbound path shared by every producer.
///
/// Only the session engine installs or tears down the underlying transport;
/// everyone else gets [`Outbound::send`]. The lock is held for the whole
/// write, so frames from concurrent callers never interleave.
#[derive(Default)]
pub struct Outbound {
    sink: Mutex<Option<FrameSink>>,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes `payload` and writes it as one text frame. Fails fast with
    /// [`SessionError::NotConnected`] while no transport is installed.
    pub async fn send<T>(&self, payload: &T) -> Result<(), SessionError>
    where
        T: Serialize + ?Sized,
    {
        let frame = serde_json::to_string(payload)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SessionError::NotConnected)?;
        sink.send(frame).await
    }

    #[cfg(test)]
    pub(crate) async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Swaps in a fresh transport. Any previous one is closed first.
    pub(crate) async fn install(&self, sink: FrameSink) {
        let mut guard = self.sink.lock().await;
        if let Some(mut previous) = guard.take() {
            close(&mut previous).await;
        }
        *guard = Some(sink);
    }

    pub(crate) async fn teardown(&self) {
        let previous = self.sink.lock().await.take();
        if let Some(mut previous) = previous {
            close(&mut previous).await;
        }
    }
}

async fn close(sink: &mut FrameSink) {
    if let Err(err) = sink.close().await {
        debug!(error = %err, "error while closing transport");
    }
}

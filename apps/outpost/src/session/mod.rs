//! Connection lifecycle for the control channel: dial, authenticate, read,
//! dispatch, and redial after any transport failure.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{future, SinkExt, Stream, StreamExt};
use outpost_proto::{AuthHello, Directive};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};
use url::Url;

mod backoff;
mod dispatch;
mod error;
mod outbound;

pub use backoff::{Backoff, INITIAL_RETRY_DELAY, MAX_RETRY_DELAY};
pub use dispatch::{Dispatcher, MAX_INFLIGHT_COMMANDS, UPGRADE_NOTICE};
pub use error::SessionError;
pub use outbound::{FrameSink, Outbound};

#[cfg(test)]
pub(crate) use outbound::testing;

use crate::auth::DirectiveVerifier;
use crate::exec::CommandRunner;
use crate::update::SelfUpdate;

/// Ceiling on TCP connect plus WebSocket upgrade. A server that accepts
/// the socket but never answers counts as a failed dial.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(45);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Identity presented to the server on every connection.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: String,
    pub server_id: String,
    pub version: String,
}

impl Credentials {
    fn hello(&self) -> AuthHello {
        AuthHello::new(&self.token, &self.server_id, &self.version)
    }
}

/// Owns the one live connection to the control server.
pub struct SessionEngine {
    endpoint: Url,
    credentials: Credentials,
    outbound: Arc<Outbound>,
    dispatcher: Dispatcher,
    dial_timeout: Duration,
    backoff: Backoff,
}

impl SessionEngine {
    pub fn new(
        endpoint: Url,
        credentials: Credentials,
        verifier: Arc<DirectiveVerifier>,
        runner: Arc<dyn CommandRunner>,
        updater: Arc<dyn SelfUpdate>,
    ) -> Self {
        let outbound = Arc::new(Outbound::new());
        let dispatcher = Dispatcher::new(
            verifier,
            runner,
            updater,
            outbound.clone(),
            credentials.version.clone(),
        );
        Self {
            endpoint,
            credentials,
            outbound,
            dispatcher,
            dial_timeout: DIAL_TIMEOUT,
            backoff: Backoff::default(),
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Handle for other producers (heartbeats) that push through the same
    /// serialized send path.
    pub fn outbound(&self) -> Arc<Outbound> {
        self.outbound.clone()
    }

    /// Dials, authenticates and reads until the connection drops, then does
    /// it again. Never returns.
    pub async fn connect_forever(&self) {
        let mut backoff = self.backoff.clone();
        loop {
            info!(endpoint = %self.endpoint, "connecting to control server");
            let stream = match self.dial().await {
                Ok(stream) => stream,
                Err(err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %err,
                        retry_in_secs = delay.as_secs_f64(),
                        "connection failed"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();
            info!("connected");

            let (sink, frames) = stream.split();
            self.outbound.install(frame_sink(sink)).await;

            if let Err(err) = self.outbound.send(&self.credentials.hello()).await {
                self.outbound.teardown().await;
                let delay = backoff.next_delay();
                warn!(
                    error = %err,
                    retry_in_secs = delay.as_secs_f64(),
                    "authentication write failed"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            self.read_loop(frames).await;
            self.outbound.teardown().await;
            info!("disconnected from control server");
        }
    }

    async fn dial(&self) -> Result<WsStream, SessionError> {
        match tokio::time::timeout(self.dial_timeout, connect_async(self.endpoint.as_str())).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(SessionError::DialTimeout(self.dial_timeout)),
        }
    }

    /// Closes the live connection, if any. Pending sends fail with
    /// [`SessionError::NotConnected`] afterwards.
    pub async fn shutdown(&self) {
        self.outbound.teardown().await;
    }

    async fn read_loop<S>(&self, mut frames: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = frames.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(close)) => {
                    info!(?close, "server closed the connection");
                    return;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(error = %err, "read error");
                    return;
                }
            };

            match Directive::parse(&text) {
                Ok(Some(directive)) => {
                    debug!(kind = directive.kind(), "dispatching directive");
                    self.dispatcher.handle(directive).await;
                }
                Ok(None) => debug!("ignoring frame without a type"),
                Err(err) => warn!(error = %err, "failed to decode frame"),
            }
        }
        info!("control stream ended");
    }
}

fn frame_sink<S>(sink: S) -> FrameSink
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Send + 'static,
{
    Box::pin(
        sink.with(|frame: String| {
            future::ready(Ok::<_, tungstenite::Error>(Message::Text(frame)))
        })
        .sink_map_err(SessionError::from),
    )
}

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use umbrette_core::nostr::RawEvent;

use crate::codec::{parse_client_message, ClientMessage, RelayMessage};
use crate::filters::Filter;
use crate::registry::{QueryGuard, SubscriptionRegistry};
use crate::store::{QueryOptions, StoreError};
use crate::AppState;

const TIMEOUT_REASON: &str = "relay could not complete request in time";
const UNKNOWN_ERROR_REASON: &str = "unknown error";

enum QueryOutcome {
    Completed,
    Canceled,
}

/// One per connection. Owns the receive loop; the send half lives in a writer
/// task fed over a channel so concurrently running handlers never interleave
/// frames. Handlers for REQ/EVENT/COUNT are spawned, so a slow query cannot
/// delay dispatch of the next inbound message.
#[derive(Clone)]
struct Session {
    state: AppState,
    outbound: mpsc::Sender<Message>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
}

pub(crate) async fn handle_socket(
    state: AppState,
    addr: Option<SocketAddr>,
    socket: WebSocket,
) {
    tracing::debug!(?addr, "client connected");
    let (sink, mut receiver) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(64);
    tokio::spawn(write_loop(sink, outbound_rx));
    let mut broadcast_rx = state.realtime_tx.subscribe();

    let session = Session {
        state,
        outbound: outbound_tx,
        registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
    };

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => session.dispatch(&text).await,
                    Some(Ok(Message::Binary(_))) => {
                        // Non-text frames are a transport violation, not a
                        // parse error: close, without a protocol-level reply.
                        session.terminate(close_code::UNSUPPORTED, "invalid message").await;
                        break;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            accepted = broadcast_rx.recv() => {
                match accepted {
                    Ok(event) => session.deliver(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(?addr, skipped, "client too slow for live events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    session.registry.lock().await.cancel_all();
    tracing::debug!(?addr, "client disconnected");
}

impl Session {
    async fn dispatch(&self, text: &str) {
        let message = match parse_client_message(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "rejecting malformed client message");
                self.send(RelayMessage::notice("invalid message")).await;
                return;
            }
        };
        tracing::trace!(target: "umbrette::relay::message", data = %text, "client message");

        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_request(subscription_id, filters).await });
            }
            ClientMessage::Event(event) => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_event(event).await });
            }
            ClientMessage::Count {
                subscription_id,
                filters,
            } => {
                let session = self.clone();
                tokio::spawn(async move { session.handle_count(subscription_id, filters).await });
            }
            // CLOSE stays on the dispatch task: it must take effect even
            // while the handlers above are busy.
            ClientMessage::Close { subscription_id } => self.handle_close(&subscription_id).await,
        }
    }

    async fn handle_request(&self, subscription_id: String, filters: Vec<Filter>) {
        if filters.len() > self.state.config.max_filters {
            self.send(RelayMessage::notice("too many filters")).await;
            return;
        }

        let guard = {
            let mut registry = self.registry.lock().await;
            registry.begin(&subscription_id, filters.clone())
        };

        match self.run_query(&subscription_id, filters, &guard).await {
            Ok(QueryOutcome::Completed) => {
                if guard.token.is_cancelled() {
                    return;
                }
                self.registry.lock().await.finish(&guard);
                self.send(RelayMessage::Eose { subscription_id }).await;
            }
            Ok(QueryOutcome::Canceled) => {
                // Superseded or closed: nothing further goes on the wire.
            }
            Err(err) => {
                self.registry.lock().await.remove(&guard);
                if guard.token.is_cancelled() {
                    return;
                }
                let reason = match err {
                    StoreError::Relay(err) => err.to_string(),
                    StoreError::Timeout => TIMEOUT_REASON.to_string(),
                    err => {
                        tracing::error!(error = %err, %subscription_id, "query failed");
                        UNKNOWN_ERROR_REASON.to_string()
                    }
                };
                self.send(RelayMessage::Closed {
                    subscription_id,
                    reason,
                })
                .await;
            }
        }
    }

    /// Drive the backlog query, forwarding events in store order. The
    /// cancellation token is observed at every yield; the whole drive,
    /// including the store call, runs under the configured timeout.
    async fn run_query(
        &self,
        subscription_id: &str,
        filters: Vec<Filter>,
        guard: &QueryGuard,
    ) -> Result<QueryOutcome, StoreError> {
        let options = QueryOptions {
            limit: self.state.config.query_limit,
            timeout: self.state.config.query_timeout,
        };

        let drive = async {
            let mut stream = self.state.store.query(filters, options).await?;
            loop {
                tokio::select! {
                    _ = guard.token.cancelled() => return Ok(QueryOutcome::Canceled),
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            self.send(RelayMessage::Event {
                                subscription_id: subscription_id.to_string(),
                                event,
                            })
                            .await;
                        }
                        Some(Err(err)) => return Err(err),
                        None => return Ok(QueryOutcome::Completed),
                    },
                }
            }
        };

        match tokio::time::timeout(options.timeout, drive).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout),
        }
    }

    async fn handle_event(&self, event: RawEvent) {
        match self.state.store.save(&event).await {
            Ok(()) => {
                self.send(RelayMessage::Ok {
                    event_id: event.id.clone(),
                    accepted: true,
                    reason: String::new(),
                })
                .await;
                // Fan out to matching live subscriptions on every connection.
                let _ = self.state.realtime_tx.send(event);
            }
            Err(StoreError::Relay(err)) => {
                self.send(RelayMessage::Ok {
                    event_id: event.id.clone(),
                    accepted: false,
                    reason: err.to_string(),
                })
                .await;
            }
            Err(err) => {
                tracing::error!(error = %err, event_id = %event.id, "failed to ingest event");
                self.send(RelayMessage::Ok {
                    event_id: event.id.clone(),
                    accepted: false,
                    reason: UNKNOWN_ERROR_REASON.into(),
                })
                .await;
            }
        }
    }

    /// Fire and forget per protocol: no reply, unknown ids tolerated.
    async fn handle_close(&self, subscription_id: &str) {
        self.registry.lock().await.cancel(subscription_id);
    }

    async fn handle_count(&self, subscription_id: String, filters: Vec<Filter>) {
        if filters.len() > self.state.config.max_filters {
            self.send(RelayMessage::notice("too many filters")).await;
            return;
        }

        match self.state.store.count(filters).await {
            Ok(count) => {
                self.send(RelayMessage::Count {
                    subscription_id,
                    count,
                    approximate: false,
                })
                .await;
            }
            Err(err) => {
                tracing::error!(error = %err, %subscription_id, "count failed");
                self.send(RelayMessage::Closed {
                    subscription_id,
                    reason: UNKNOWN_ERROR_REASON.into(),
                })
                .await;
            }
        }
    }

    /// Live broadcast: emit the accepted event for each matching
    /// subscription on this connection.
    async fn deliver(&self, event: &RawEvent) {
        let targets = { self.registry.lock().await.matching(event) };
        for subscription_id in targets {
            self.send(RelayMessage::Event {
                subscription_id,
                event: event.clone(),
            })
            .await;
        }
    }

    /// Drops silently once the connection is gone, like writes to a closed
    /// socket.
    async fn send(&self, message: RelayMessage) {
        match serde_json::to_string(&message.to_json()) {
            Ok(text) => {
                let _ = self.outbound.send(Message::Text(text)).await;
            }
            Err(err) => tracing::error!(error = %err, "failed to serialize relay message"),
        }
    }

    async fn terminate(&self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        let _ = self.outbound.send(Message::Close(Some(frame))).await;
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
}

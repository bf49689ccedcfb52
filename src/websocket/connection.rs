//! WebSocket connection lifecycle management.
//!
//! [`ConnectionManager`] owns the single feed connection: it connects,
//! authenticates, keeps the connection alive with a heartbeat, reconnects
//! under a [`ReconnectPolicy`], and re-subscribes every tracked symbol after
//! each reconnect. Minute aggregates are fanned out on a broadcast channel
//! as [`RawUpdate`]s, one per granularity a view has asked for.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tungstenite::Message as WsMessage;

use super::handler::parse_feed_text;
use super::reconnect::ReconnectPolicy;
use super::{WsReader, WsWriter, authenticate, connect, ping, subscribe, unsubscribe};
use crate::models::feed::FeedMessage;
use crate::models::{Granularity, RawUpdate};

/// Interval between heartbeats while connected.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered events per receiver before slow views start lagging.
const EVENT_CAPACITY: usize = 1024;

/// Commands sent from views to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// A view wants `symbol` updates addressed at `granularity`.
    Track {
        symbol: String,
        granularity: Granularity,
    },
    /// A view no longer needs `symbol` at `granularity`.
    Untrack {
        symbol: String,
        granularity: Granularity,
    },
}

/// Events broadcast to every view.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Disconnected,
    Update(RawUpdate),
}

/// Why the reader loop exited.
enum DisconnectReason {
    /// The connection was lost or errored.
    ConnectionError,
    /// Every [`FeedHandle`] was dropped (app shutting down).
    Shutdown,
}

/// Cloneable handle views use to talk to the connection manager.
#[derive(Debug, Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    events: broadcast::Sender<FeedEvent>,
}

impl FeedHandle {
    /// Starts routing `symbol` updates for `granularity`.
    pub fn track(&self, symbol: &str, granularity: Granularity) {
        let _ = self.commands.send(ConnectionCommand::Track {
            symbol: symbol.to_uppercase(),
            granularity,
        });
    }

    /// Stops routing `symbol` updates for `granularity`.
    pub fn untrack(&self, symbol: &str, granularity: Granularity) {
        let _ = self.commands.send(ConnectionCommand::Untrack {
            symbol: symbol.to_uppercase(),
            granularity,
        });
    }

    /// Returns a receiver for events published from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    /// Publishes an event to every current receiver.
    ///
    /// Returns the number of receivers reached.
    pub fn publish(&self, event: FeedEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

/// Tracked granularities per symbol, reference counted per view.
#[derive(Debug, Default)]
struct Routes {
    symbols: HashMap<String, HashMap<Granularity, usize>>,
}

impl Routes {
    /// Returns `true` if this is the first route for the symbol.
    fn track(&mut self, symbol: &str, granularity: Granularity) -> bool {
        let granularities = self.symbols.entry(symbol.to_string()).or_default();
        let first = granularities.is_empty();
        *granularities.entry(granularity).or_insert(0) += 1;
        first
    }

    /// Returns `true` if the last route for the symbol was removed.
    fn untrack(&mut self, symbol: &str, granularity: Granularity) -> bool {
        let Some(granularities) = self.symbols.get_mut(symbol) else {
            return false;
        };
        if let Some(count) = granularities.get_mut(&granularity) {
            *count -= 1;
            if *count == 0 {
                granularities.remove(&granularity);
            }
        }
        if granularities.is_empty() {
            self.symbols.remove(symbol);
            return true;
        }
        false
    }

    fn granularities(&self, symbol: &str) -> impl Iterator<Item = Granularity> + '_ {
        self.symbols
            .get(symbol)
            .into_iter()
            .flat_map(|granularities| granularities.keys().copied())
    }

    fn symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }
}

/// Manages the feed connection lifecycle including reconnection with
/// bounded exponential backoff.
pub struct ConnectionManager {
    url: String,
    api_key: String,
    policy: ReconnectPolicy,
    events: broadcast::Sender<FeedEvent>,
    cmd_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    routes: Routes,
}

impl ConnectionManager {
    /// Creates a manager and the handle views use to reach it.
    #[must_use]
    pub fn new(url: String, api_key: String, policy: ReconnectPolicy) -> (Self, FeedHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = FeedHandle {
            commands: cmd_tx,
            events: events.clone(),
        };
        let manager = Self {
            url,
            api_key,
            policy,
            events,
            cmd_rx,
            routes: Routes::default(),
        };
        (manager, handle)
    }

    /// Runs the connection manager loop until every [`FeedHandle`] is dropped.
    ///
    /// Connects, authenticates, subscribes all tracked symbols, and reads
    /// frames. On disconnection it backs off according to the policy and
    /// tries again; the backoff resets after each successful connection.
    pub async fn run(mut self) {
        let mut backoff = self.policy.backoff();

        loop {
            info!(url = %self.url, "Connecting to feed");
            let (mut write, read) = match connect(&self.url).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Connection failed: {e}");
                    let _ = self.events.send(FeedEvent::Disconnected);
                    if !self.wait_backoff(backoff.next_delay()).await {
                        return;
                    }
                    continue;
                }
            };

            if let Err(e) = authenticate(&mut write, &self.api_key).await {
                warn!("Authentication failed: {e}");
                let _ = self.events.send(FeedEvent::Disconnected);
                if !self.wait_backoff(backoff.next_delay()).await {
                    return;
                }
                continue;
            }

            if let Err(e) = subscribe(&mut write, &self.routes.symbols()).await {
                warn!("Failed to resubscribe tracked symbols: {e}");
            }

            let _ = self.events.send(FeedEvent::Connected);
            info!("Feed connected and subscribed");
            backoff.reset();

            match self.read_loop(&mut write, read).await {
                DisconnectReason::ConnectionError => {
                    let _ = self.events.send(FeedEvent::Disconnected);
                    if !self.wait_backoff(backoff.next_delay()).await {
                        return;
                    }
                }
                DisconnectReason::Shutdown => {
                    info!("Connection manager shutting down");
                    return;
                }
            }
        }
    }

    /// Sleeps for `delay` while still accepting route changes.
    ///
    /// Returns `false` if the app shut down during the wait.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        info!(backoff_secs = delay.as_secs(), "Backing off before retry");
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = &mut deadline => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        self.apply_route(&cmd);
                    }
                    None => return false,
                },
            }
        }
    }

    /// Updates the routing table, returning the symbol whose wire
    /// subscription must change and whether it is now subscribed.
    fn apply_route(&mut self, cmd: &ConnectionCommand) -> Option<(String, bool)> {
        match cmd {
            ConnectionCommand::Track {
                symbol,
                granularity,
            } => self
                .routes
                .track(symbol, *granularity)
                .then(|| (symbol.clone(), true)),
            ConnectionCommand::Untrack {
                symbol,
                granularity,
            } => self
                .routes
                .untrack(symbol, *granularity)
                .then(|| (symbol.clone(), false)),
        }
    }

    /// Reads frames until disconnection or shutdown.
    async fn read_loop(&mut self, write: &mut WsWriter, mut read: WsReader) -> DisconnectReason {
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                        Some(Ok(WsMessage::Close(frame))) => {
                            warn!(?frame, "Feed closed by server");
                            return DisconnectReason::ConnectionError;
                        }
                        Some(Ok(_)) => {} // Binary/Ping/Pong frames
                        Some(Err(e)) => {
                            warn!("WebSocket error: {e}");
                            return DisconnectReason::ConnectionError;
                        }
                        None => {
                            warn!("WebSocket stream ended");
                            return DisconnectReason::ConnectionError;
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        return DisconnectReason::Shutdown;
                    };
                    if let Some((symbol, subscribed)) = self.apply_route(&cmd) {
                        let symbols = [symbol];
                        let result = if subscribed {
                            subscribe(write, &symbols).await
                        } else {
                            unsubscribe(write, &symbols).await
                        };
                        if let Err(e) = result {
                            warn!("Failed to update subscription: {e}");
                            return DisconnectReason::ConnectionError;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ping(write).await {
                        warn!("Heartbeat failed: {e}");
                        return DisconnectReason::ConnectionError;
                    }
                }
            }
        }
    }

    /// Routes one text frame to the broadcast channel.
    fn dispatch(&self, text: &str) {
        for message in parse_feed_text(text) {
            match message {
                FeedMessage::MinuteAggregate(aggregate) => {
                    let symbol = aggregate.sym.to_uppercase();
                    for granularity in self.routes.granularities(&symbol) {
                        let update = aggregate.clone().into_update(granularity);
                        // No receivers just means no view is open right now.
                        let _ = self.events.send(FeedEvent::Update(update));
                    }
                }
                FeedMessage::Status(status) => {
                    info!(status = status.status, message = status.message, "Feed status");
                }
                FeedMessage::Other => debug!("Ignoring unhandled feed event"),
            }
        }
    }
}

#[cfg(test)]
impl ConnectionManager {
    /// Drains the route commands queued by views so far.
    pub(crate) fn drain_commands(&mut self) -> Vec<ConnectionCommand> {
        std::iter::from_fn(|| self.cmd_rx.try_recv().ok()).collect()
    }
}

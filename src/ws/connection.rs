use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::{RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS};
use crate::error::Result;

static NON_JSON_FRAMES: AtomicU64 = AtomicU64::new(0);

/// What the transport reports to its owner. The owner drains these from a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Application-level keepalive text frame.
    Text(&'static str),
    /// Protocol ping frame.
    Ping,
}

/// Wire format of one feed: what to send on connect, on (un)subscribe, and to keep alive.
pub trait FeedProtocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Frames sent right after every (re)connect. `subscribed` is everything currently tracked.
    fn connect_frames(&self, subscribed: &[String]) -> Vec<String>;

    /// Incremental frames while connected. `None` when the feed has no such operation.
    fn subscribe_frame(&self, ids: &[String]) -> Option<String>;
    fn unsubscribe_frame(&self, ids: &[String]) -> Option<String>;

    fn heartbeat(&self) -> Option<(Heartbeat, Duration)>;
}

/// `min(base * 2^n, cap)` after `n` consecutive failures; reset on a successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, failures: 0 }
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            Duration::from_millis(RECONNECT_MAX_DELAY_MS),
        )
    }
}

/// Splits a text frame into JSON events: an array yields each object, an object yields itself.
pub fn parse_frame(text: &str) -> Vec<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("PONG") {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) => items.into_iter().filter(Value::is_object).collect(),
        Ok(obj @ Value::Object(_)) => vec![obj],
        Ok(_) => Vec::new(),
        Err(_) => {
            let count = NON_JSON_FRAMES.fetch_add(1, Ordering::Relaxed) + 1;
            if count <= 10 || count % 1000 == 0 {
                let sample: String = trimmed.chars().take(100).collect();
                warn!(count, "[WS PARSE] non-JSON frame: {sample}");
            }
            Vec::new()
        }
    }
}

/// Owner-side handles for a spawned `TransportManager`.
pub struct TransportHandle {
    pub events: mpsc::Receiver<TransportEvent>,
    pub commands: mpsc::Sender<TransportCommand>,
}

/// One persistent websocket with reconnect, heartbeat and a tracked subscription set.
///
/// The subscription set lives here, so every reconnect re-sends it through
/// `FeedProtocol::connect_frames`. No gap-fill is attempted.
pub struct TransportManager<P: FeedProtocol> {
    url: String,
    protocol: P,
    events: mpsc::Sender<TransportEvent>,
    commands: mpsc::Receiver<TransportCommand>,
    shutdown: watch::Receiver<bool>,
    subscribed: Vec<String>,
    backoff: ReconnectBackoff,
}

impl<P: FeedProtocol> TransportManager<P> {
    pub fn new(
        url: String,
        protocol: P,
        shutdown: watch::Receiver<bool>,
        capacity: usize,
    ) -> (Self, TransportHandle) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let manager = Self {
            url,
            protocol,
            events: event_tx,
            commands: command_rx,
            shutdown,
            subscribed: Vec::new(),
            backoff: ReconnectBackoff::default(),
        };
        let handle = TransportHandle {
            events: event_rx,
            commands: command_tx,
        };
        (manager, handle)
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_subscriptions(mut self, ids: Vec<String>) -> Self {
        self.track(TransportCommand::Subscribe(ids));
        self
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Applies a command to the tracked set; returns the ids that actually changed.
    fn track(&mut self, cmd: TransportCommand) -> (bool, Vec<String>) {
        match cmd {
            TransportCommand::Subscribe(ids) => {
                let fresh: Vec<String> = ids
                    .into_iter()
                    .filter(|id| !self.subscribed.contains(id))
                    .collect();
                self.subscribed.extend(fresh.iter().cloned());
                (true, fresh)
            }
            TransportCommand::Unsubscribe(ids) => {
                let gone: Vec<String> = ids
                    .into_iter()
                    .filter(|id| self.subscribed.contains(id))
                    .collect();
                self.subscribed.retain(|id| !gone.contains(id));
                (false, gone)
            }
        }
    }

    pub async fn run(mut self) {
        let name = self.protocol.name();
        loop {
            if self.stopping() {
                break;
            }
            while let Ok(cmd) = self.commands.try_recv() {
                self.track(cmd);
            }

            info!(feed = name, url = %self.url, "WS connecting");
            let result = self.connect_once().await;
            if self.events.send(TransportEvent::Disconnected).await.is_err() {
                break;
            }
            match result {
                Ok(true) => {
                    info!(feed = name, "WS stopped");
                    break;
                }
                Ok(false) => info!(feed = name, "WS connection closed"),
                Err(e) => error!(feed = name, "WS connection error: {e}"),
            }

            let delay = self.backoff.next_delay();
            warn!(feed = name, delay_ms = delay.as_millis() as u64, "WS reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.changed() => {}
            }
        }
    }

    /// `Ok(true)` when the owner asked to stop, `Ok(false)` when the peer closed.
    async fn connect_once(&mut self) -> Result<bool> {
        let (ws_stream, _) = tokio::select! {
            connected = connect_async(self.url.as_str()) => connected?,
            _ = self.shutdown.changed() => return Ok(true),
        };
        let (mut write, mut read) = ws_stream.split();
        self.backoff.reset();

        if self.events.send(TransportEvent::Connected).await.is_err() {
            return Ok(true);
        }
        for frame in self.protocol.connect_frames(&self.subscribed) {
            write.send(Message::Text(frame.into())).await?;
        }
        if !self.subscribed.is_empty() {
            info!(feed = self.protocol.name(), ids = self.subscribed.len(), "WS subscribed");
        }

        let heartbeat = self.protocol.heartbeat();
        let mut ticker = interval(heartbeat.map(|(_, d)| d).unwrap_or(Duration::from_secs(3600)));
        ticker.tick().await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            for event in parse_frame(&text) {
                                if self.events.send(TransportEvent::Message(event)).await.is_err() {
                                    return Ok(true);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(false),
                        Some(Err(e)) => return Err(e.into()),
                        Some(Ok(_)) => {}
                    }
                }

                _ = ticker.tick(), if heartbeat.is_some() => {
                    match heartbeat {
                        Some((Heartbeat::Text(frame), _)) => {
                            write.send(Message::Text(frame.to_string().into())).await?;
                        }
                        Some((Heartbeat::Ping, _)) => {
                            write.send(Message::Ping(Vec::new().into())).await?;
                        }
                        None => {}
                    }
                    debug!(feed = self.protocol.name(), "WS heartbeat");
                }

                cmd = self.commands.recv() => {
                    let Some(cmd) = cmd else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(true);
                    };
                    let (is_subscribe, changed) = self.track(cmd);
                    if changed.is_empty() {
                        continue;
                    }
                    let frame = if is_subscribe {
                        self.protocol.subscribe_frame(&changed)
                    } else {
                        self.protocol.unsubscribe_frame(&changed)
                    };
                    if let Some(frame) = frame {
                        write.send(Message::Text(frame.into())).await?;
                        info!(
                            feed = self.protocol.name(),
                            ids = changed.len(),
                            subscribe = is_subscribe,
                            "WS subscription change"
                        );
                    }
                }

                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(true);
                }
            }
        }
    }
}

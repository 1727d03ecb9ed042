//! Connection lifecycle as an explicit state machine.
//!
//! `Disconnected → Connecting → Connected → Disconnected`, with
//! `Connecting → Disconnected` when an attempt fails. Every accepted
//! transition fires the matching hook on each registered [`LifecycleHook`]
//! and is broadcast on a `watch` channel.

use std::fmt;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnected)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Client-initiated shutdown.
    Normal,
    ConnectFailed(String),
    ConnectTimeout,
    PublishFailed(String),
    PublishTimeout,
    /// Broker sent DISCONNECT.
    Broker(String),
    /// Socket or protocol error.
    Transport(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal disconnection"),
            Self::ConnectFailed(e) => write!(f, "connect failed: {e}"),
            Self::ConnectTimeout => f.write_str("connect timed out"),
            Self::PublishFailed(e) => write!(f, "publish failed: {e}"),
            Self::PublishTimeout => f.write_str("publish timed out"),
            Self::Broker(e) => write!(f, "broker disconnected: {e}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Named callbacks for connection transitions.
pub trait LifecycleHook: Send + Sync {
    fn on_connecting(&self, _client_id: &str) {}
    fn on_connected(&self) {}
    fn on_disconnected(&self, _reason: &DisconnectReason) {}
}

/// Logs every transition at `info`.
#[derive(Debug, Default)]
pub struct LoggingHook;

impl LifecycleHook for LoggingHook {
    fn on_connecting(&self, client_id: &str) {
        info!(client_id, "Connecting to broker");
    }

    fn on_connected(&self) {
        info!("Connected to broker");
    }

    fn on_disconnected(&self, reason: &DisconnectReason) {
        info!(%reason, "Disconnected from broker");
    }
}

pub struct ConnectionLifecycle {
    state: ConnectionState,
    hooks: Vec<Box<dyn LifecycleHook>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionLifecycle {
    /// Starts `Disconnected` with a [`LoggingHook`] registered.
    pub fn new() -> Self {
        let mut lifecycle = Self::without_hooks();
        lifecycle.register(LoggingHook);
        lifecycle
    }

    pub fn without_hooks() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            hooks: Vec::new(),
            state_tx,
        }
    }

    pub fn register(&mut self, hook: impl LifecycleHook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Unregister every hook; later transitions only update the state.
    pub fn clear_hooks(&mut self) {
        self.hooks.clear();
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn connecting(&mut self, client_id: &str) -> bool {
        if !self.advance(ConnectionState::Connecting) {
            return false;
        }
        for hook in &self.hooks {
            hook.on_connecting(client_id);
        }
        true
    }

    pub fn connected(&mut self) -> bool {
        if !self.advance(ConnectionState::Connected) {
            return false;
        }
        for hook in &self.hooks {
            hook.on_connected();
        }
        true
    }

    pub fn disconnected(&mut self, reason: &DisconnectReason) -> bool {
        if !self.advance(ConnectionState::Disconnected) {
            return false;
        }
        for hook in &self.hooks {
            hook.on_disconnected(reason);
        }
        true
    }

    fn advance(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(from = %self.state, to = %next, "Ignoring invalid connection transition");
            return false;
        }
        self.state = next;
        self.state_tx.send_replace(next);
        true
    }
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

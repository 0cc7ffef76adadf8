//! Connection state tracking
//!
//! The transport reports lifecycle signals here; the rest of the session only
//! asks one question, [`ConnectionTracker::is_usable`]. States form a loose
//! graph: every non-connected state may return to `Connected`.
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Reconnecting | Offline | Closed | Ended
//!                                     ▲                  │
//!                                     └──────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
    Closed,
    Ended,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline => "offline",
            ConnectionState::Closed => "closed",
            ConnectionState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Outcome of reporting a new state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Set only for the very first entry into `Connected`
    pub first_connection: bool,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }

    pub fn entered_connected(&self) -> bool {
        self.changed() && self.current == ConnectionState::Connected
    }
}

#[derive(Debug)]
pub struct ConnectionTracker {
    state: watch::Sender<ConnectionState>,
    ever_connected: AtomicBool,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            ever_connected: AtomicBool::new(false),
        }
    }

    pub fn is_usable(&self) -> bool {
        *self.state.borrow() == ConnectionState::Connected
    }

    pub fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Records a lifecycle signal from the transport
    pub fn transition(&self, next: ConnectionState) -> Transition {
        let previous = self.state.send_replace(next);
        let first_connection = next == ConnectionState::Connected
            && previous != ConnectionState::Connected
            && !self.ever_connected.swap(true, Ordering::SeqCst);

        let transition = Transition {
            previous,
            current: next,
            first_connection,
        };
        if !transition.changed() {
            debug!("Connection state unchanged: {}", next);
        } else if next == ConnectionState::Connected {
            info!("Connection state {} -> {}", previous, next);
        } else {
            warn!("Connection state {} -> {}", previous, next);
        }
        transition
    }
}

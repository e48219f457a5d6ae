//! Cluster daemon state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Watching <-> ProcessingPull
//!       |                                   (steady loop)
//!       +-- ConfigRejected --> Failed       (terminal)
//! any live state -- Stop --> Stopped        (terminal)
//! ```
//!
//! [`DaemonState::on`] is the bare transition table. [`DaemonStatus`] folds
//! reports from every task into one daemon-wide state and only reports
//! `Watching` while every channel holds an open watch.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Disconnected,
    Connecting,
    Watching,
    ProcessingPull,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Watch tasks were spawned.
    Start,
    /// A watch task reached the store and holds an open watch.
    Connected,
    /// A watch task lost its store connection and is reconnecting.
    ConnectionLost,
    PullStarted,
    PullFinished,
    /// Startup validation failed.
    ConfigRejected,
    Stop,
}

impl DaemonState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DaemonState::Failed | DaemonState::Stopped)
    }

    /// Apply an event; events that don't apply leave the state unchanged.
    pub fn on(self, event: DaemonEvent) -> DaemonState {
        use DaemonEvent as E;
        use DaemonState as S;

        if self.is_terminal() {
            return self;
        }
        match (self, event) {
            (S::Disconnected, E::ConfigRejected) => S::Failed,
            (_, E::Stop) => S::Stopped,
            (S::Disconnected, E::Start) => S::Connecting,
            (S::Connecting, E::Connected) => S::Watching,
            (S::Watching, E::ConnectionLost) => S::Connecting,
            (S::Connecting | S::Watching, E::PullStarted) => S::ProcessingPull,
            (S::ProcessingPull, E::PullFinished) => S::Watching,
            (state, _) => state,
        }
    }
}

/// Daemon-wide state plus the number of channels without an open watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    state: DaemonState,
    unwatched: usize,
}

impl DaemonStatus {
    /// Status before any task runs; every channel starts unwatched.
    pub fn new(channels: usize) -> Self {
        Self {
            state: DaemonState::Disconnected,
            unwatched: channels,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn unwatched(&self) -> usize {
        self.unwatched
    }

    /// Apply one task's report. A connection lost during a pull is kept in
    /// the count and surfaces as `Connecting` once the pull finishes.
    pub fn on(self, event: DaemonEvent) -> DaemonStatus {
        if self.state.is_terminal() {
            return self;
        }
        let unwatched = match event {
            DaemonEvent::Connected => self.unwatched.saturating_sub(1),
            DaemonEvent::ConnectionLost => self.unwatched + 1,
            _ => self.unwatched,
        };
        let state = match self.state.on(event) {
            DaemonState::Watching if unwatched > 0 => DaemonState::Connecting,
            state => state,
        };
        DaemonStatus { state, unwatched }
    }
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DaemonState::Disconnected => "disconnected",
            DaemonState::Connecting => "connecting",
            DaemonState::Watching => "watching",
            DaemonState::ProcessingPull => "processing-pull",
            DaemonState::Failed => "failed",
            DaemonState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

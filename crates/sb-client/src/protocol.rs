//! Client-side connection state machine.
//!
//! [`Protocol`] does no I/O and owns no timers. Every input (`start`,
//! `on_open`, `on_close`, `on_timer`, `reconnect`, `shutdown`) returns the
//! [`Effect`]s the driver must carry out: open or close the transport, arm
//! or cancel a timer, fetch a status snapshot, or report connectivity.
//!
//! There is at most one pending timer per concern ([`TimerKind`]). Timer
//! ids carry a generation, so a timer that fires after it was cancelled or
//! replaced is ignored.

use std::time::Duration;

use sb_core::config::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Connectivity indicator shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Connecting,
    Connected,
    Disconnected,
    /// Disconnected past the threshold; status snapshots are being polled.
    Polling,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Connecting => write!(f, "connecting"),
            Connectivity::Connected => write!(f, "connected"),
            Connectivity::Disconnected => write!(f, "disconnected"),
            Connectivity::Polling => write!(f, "polling"),
        }
    }
}

/// Transport lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    /// Torn down; every further input is a no-op.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    /// Disconnect-duration counter.
    Tick,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport connection.
    Open,
    /// Close the current transport connection.
    Close,
    Schedule { timer: TimerId, after: Duration },
    Cancel(TimerId),
    /// Issue one status request on the side channel.
    FetchStatus,
    Connectivity(Connectivity),
    /// Automatic reconnection gave up after this many attempts.
    Exhausted { attempts: u32 },
}

/// Timing parameters for [`Protocol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolSettings {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub disconnect_threshold: Duration,
    pub poll_interval: Duration,
    pub tick: Duration,
    /// Whether a status endpoint exists to poll.
    pub polling_enabled: bool,
}

impl ProtocolSettings {
    pub fn from_config(config: &ClientConfig, polling_enabled: bool) -> Self {
        Self {
            base_delay: config.base_delay(),
            max_attempts: config.max_attempts,
            disconnect_threshold: config.disconnect_threshold(),
            poll_interval: config.poll_interval(),
            tick: config.tick(),
            polling_enabled,
        }
    }

    /// Delay before reconnect attempt `attempt` (0-indexed), or `None` once
    /// the attempt budget is spent.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt)?;
        self.base_delay.checked_mul(factor)
    }
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default(), true)
    }
}

/// Connection state for one terminal view.
#[derive(Debug)]
pub struct Protocol {
    settings: ProtocolSettings,
    state: LinkState,
    attempts: u32,
    exhausted: bool,
    disconnected_for: Duration,
    polling: bool,
    reconnect_timer: Option<TimerId>,
    tick_timer: Option<TimerId>,
    poll_timer: Option<TimerId>,
    next_generation: u64,
    reported: Option<Connectivity>,
}

impl Protocol {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self {
            settings,
            state: LinkState::Idle,
            attempts: 0,
            exhausted: false,
            disconnected_for: Duration::ZERO,
            polling: false,
            reconnect_timer: None,
            tick_timer: None,
            poll_timer: None,
            next_generation: 0,
            reported: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn settings(&self) -> &ProtocolSettings {
        &self.settings
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn disconnected_for(&self) -> Duration {
        self.disconnected_for
    }

    /// Whether a status snapshot arriving now should reach the user. Late
    /// snapshots (after the stream came back) are stale.
    pub fn accepts_snapshot(&self) -> bool {
        self.polling && self.state != LinkState::Connected && self.state != LinkState::Closed
    }

    pub fn connectivity(&self) -> Connectivity {
        if self.polling {
            return Connectivity::Polling;
        }
        match self.state {
            LinkState::Idle | LinkState::Connecting => Connectivity::Connecting,
            LinkState::Connected => Connectivity::Connected,
            LinkState::Disconnected | LinkState::Closed => Connectivity::Disconnected,
        }
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    /// First connect when the view mounts.
    pub fn start(&mut self) -> Vec<Effect> {
        if self.state != LinkState::Idle {
            return Vec::new();
        }
        self.state = LinkState::Connecting;
        let mut effects = vec![Effect::Open];
        self.report(&mut effects);
        effects
    }

    /// The transport connected.
    pub fn on_open(&mut self) -> Vec<Effect> {
        if self.state != LinkState::Connecting {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.state = LinkState::Connected;
        self.attempts = 0;
        self.exhausted = false;
        self.disconnected_for = Duration::ZERO;
        self.polling = false;
        self.cancel(TimerKind::Reconnect, &mut effects);
        self.cancel(TimerKind::Tick, &mut effects);
        self.cancel(TimerKind::Poll, &mut effects);
        info!("connection established");
        self.report(&mut effects);
        effects
    }

    /// The transport closed or errored, or a connect attempt failed.
    pub fn on_close(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.state {
            LinkState::Connected => {
                info!("connection lost");
                self.disconnected_for = Duration::ZERO;
                let tick = self.settings.tick;
                self.schedule(TimerKind::Tick, tick, &mut effects);
            }
            LinkState::Connecting => {
                debug!(attempt = self.attempts, "connect attempt failed");
                if self.tick_timer.is_none() && !self.polling {
                    let tick = self.settings.tick;
                    self.schedule(TimerKind::Tick, tick, &mut effects);
                }
            }
            LinkState::Idle | LinkState::Disconnected | LinkState::Closed => return effects,
        }
        self.state = LinkState::Disconnected;
        self.schedule_reconnect(&mut effects);
        self.report(&mut effects);
        effects
    }

    /// A timer fired. Stale or cancelled timers are ignored.
    pub fn on_timer(&mut self, timer: TimerId) -> Vec<Effect> {
        let mut effects = Vec::new();
        let slot = self.slot(timer.kind);
        if *slot != Some(timer) {
            debug!(?timer, "ignoring stale timer");
            return effects;
        }
        *slot = None;

        match timer.kind {
            TimerKind::Reconnect => {
                if self.state == LinkState::Disconnected {
                    info!(attempt = self.attempts, "reconnecting");
                    self.state = LinkState::Connecting;
                    effects.push(Effect::Open);
                }
            }
            TimerKind::Tick => self.on_tick(&mut effects),
            TimerKind::Poll => {
                if self.polling && self.state != LinkState::Connected {
                    effects.push(Effect::FetchStatus);
                    let interval = self.settings.poll_interval;
                    self.schedule(TimerKind::Poll, interval, &mut effects);
                }
            }
        }
        self.report(&mut effects);
        effects
    }

    /// Reconnect on request, resetting the attempt budget. A no-op while a
    /// connection is up or being opened.
    pub fn reconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state != LinkState::Disconnected {
            return effects;
        }
        info!("manual reconnect requested");
        self.attempts = 0;
        self.exhausted = false;
        self.cancel(TimerKind::Reconnect, &mut effects);
        self.state = LinkState::Connecting;
        effects.push(Effect::Open);
        self.report(&mut effects);
        effects
    }

    /// Tear down: cancel every timer and close the transport.
    pub fn shutdown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state == LinkState::Closed {
            return effects;
        }
        self.cancel(TimerKind::Reconnect, &mut effects);
        self.cancel(TimerKind::Tick, &mut effects);
        self.cancel(TimerKind::Poll, &mut effects);
        if matches!(self.state, LinkState::Connecting | LinkState::Connected) {
            effects.push(Effect::Close);
        }
        self.state = LinkState::Closed;
        self.polling = false;
        debug!("connection protocol shut down");
        effects
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn on_tick(&mut self, effects: &mut Vec<Effect>) {
        if matches!(self.state, LinkState::Connected | LinkState::Closed) {
            return;
        }
        self.disconnected_for += self.settings.tick;
        if self.settings.polling_enabled
            && !self.polling
            && self.disconnected_for >= self.settings.disconnect_threshold
        {
            info!(
                disconnected_ms = self.disconnected_for.as_millis() as u64,
                "disconnect threshold crossed, polling status"
            );
            self.polling = true;
            effects.push(Effect::FetchStatus);
            let interval = self.settings.poll_interval;
            self.schedule(TimerKind::Poll, interval, effects);
            return;
        }
        if !self.polling {
            let tick = self.settings.tick;
            self.schedule(TimerKind::Tick, tick, effects);
        }
    }

    fn schedule_reconnect(&mut self, effects: &mut Vec<Effect>) {
        match self.settings.backoff(self.attempts) {
            Some(delay) => {
                debug!(
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.attempts += 1;
                self.schedule(TimerKind::Reconnect, delay, effects);
            }
            None => {
                if !self.exhausted {
                    warn!(attempts = self.attempts, "reconnect attempts exhausted");
                    self.exhausted = true;
                    effects.push(Effect::Exhausted {
                        attempts: self.attempts,
                    });
                }
            }
        }
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration, effects: &mut Vec<Effect>) {
        self.cancel(kind, effects);
        self.next_generation += 1;
        let timer = TimerId {
            kind,
            generation: self.next_generation,
        };
        *self.slot(kind) = Some(timer);
        effects.push(Effect::Schedule { timer, after });
    }

    fn cancel(&mut self, kind: TimerKind, effects: &mut Vec<Effect>) {
        if let Some(timer) = self.slot(kind).take() {
            effects.push(Effect::Cancel(timer));
        }
    }

    fn slot(&mut self, kind: TimerKind) -> &mut Option<TimerId> {
        match kind {
            TimerKind::Reconnect => &mut self.reconnect_timer,
            TimerKind::Tick => &mut self.tick_timer,
            TimerKind::Poll => &mut self.poll_timer,
        }
    }

    fn report(&mut self, effects: &mut Vec<Effect>) {
        let now = self.connectivity();
        if self.reported != Some(now) {
            self.reported = Some(now);
            effects.push(Effect::Connectivity(now));
        }
    }
}

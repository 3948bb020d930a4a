//! Lifecycle state machine of one upstream link.
//!
//! [`LinkMachine`] owns every lifecycle decision (readiness, keepalive,
//! reconnect scheduling, the retry cap and the stable-close rule) and performs
//! no I/O.  Each input takes the current [`Instant`] explicitly and returns the
//! [`LinkCommand`]s the I/O driver must carry out, in order.
//!
//! ```text
//!  Idle ──connect──▶ Connecting ──open──▶ OpenPendingAuth ──settle──▶ Ready
//!                      ▲   │                    │                      │
//!                      │   └──────── loss ──────┴──────── loss ────────┤
//!                      │                   │                           │
//!                      └── reconnect delay ┘ (attempts < max)          │
//!                                          │                           │
//!                              Closed ◀────┘ (attempts ≥ max,          │
//!                                             stable normal close)     │
//!                              Closing ◀──────────── close ────────────┘
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::domain::{LinkPolicy, RelayError};

/// WebSocket close code for a normal, deliberate closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Lifecycle state of an upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Connecting,
    OpenPendingAuth,
    Ready,
    Closing,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Connecting => "connecting",
            LinkState::OpenPendingAuth => "open_pending_auth",
            LinkState::Ready => "ready",
            LinkState::Closing => "closing",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors from link operations attempted in the wrong state or failing on
/// the wire.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// A send was attempted while the link was not ready.
    #[error("upstream link is not ready (state: {0})")]
    NotReady(LinkState),

    /// The operation is not valid in the current state.
    #[error("cannot {op} an upstream link in state {from}")]
    InvalidTransition { from: LinkState, op: &'static str },

    /// Writing to the upstream socket failed.
    #[error("upstream write failed: {0}")]
    Transport(String),
}

impl From<LinkError> for RelayError {
    fn from(e: LinkError) -> Self {
        RelayError::Transport(e.to_string())
    }
}

/// How the transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLoss {
    /// The transport never opened (refused, DNS, TLS, timeout).
    ConnectFailed(String),
    /// An open transport failed with an I/O or protocol error.
    Errored(String),
    /// An open transport was closed, with or without a close frame.
    Closed { code: Option<u16>, reason: String },
}

impl TransportLoss {
    fn into_code_and_reason(self) -> (Option<u16>, String) {
        match self {
            TransportLoss::ConnectFailed(reason) | TransportLoss::Errored(reason) => (None, reason),
            TransportLoss::Closed { code, reason } => (code, reason),
        }
    }
}

/// Lifecycle notifications for the session that owns the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link became ready; queued messages may be drained.
    Ready,
    /// A previously opened transport went away.
    Disconnected { code: Option<u16>, reason: String },
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// A stable connection was closed normally; the link will not reconnect.
    Ended { code: u16, reason: String },
    /// The consecutive failure cap was reached; the link is closed for good.
    Exhausted { attempts: u32 },
}

/// An action the I/O driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    /// Start a new transport-open attempt.
    OpenTransport,
    /// Send the authentication frame on the freshly opened transport.
    Authenticate,
    /// Send the per-link session setup frames.
    Configure,
    /// Send a keepalive ping.
    Ping,
    /// Tear down the current transport or connect attempt.
    CloseTransport,
    /// Report a lifecycle event to the session.
    Notify(LinkEvent),
}

/// The pure upstream link state machine.
#[derive(Debug)]
pub struct LinkMachine {
    policy: LinkPolicy,
    state: LinkState,
    /// Consecutive failures since the last stable connection.
    failures: u32,
    opened_at: Option<Instant>,
    last_activity: Option<Instant>,
    settle_at: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl LinkMachine {
    pub fn new(policy: LinkPolicy) -> Self {
        Self {
            policy,
            state: LinkState::Idle,
            failures: 0,
            opened_at: None,
            last_activity: None,
            settle_at: None,
            reconnect_at: None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    /// Consecutive failures counted toward the retry cap.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns `Ok` only when content may be sent.
    pub fn ensure_ready(&self) -> Result<(), LinkError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(LinkError::NotReady(self.state))
        }
    }

    /// Starts connecting.  Valid from `Idle` and `Closed`.
    pub fn connect(&mut self) -> Result<Vec<LinkCommand>, LinkError> {
        match self.state {
            LinkState::Idle | LinkState::Closed => {
                self.clear_timers();
                self.failures = 0;
                self.state = LinkState::Connecting;
                Ok(vec![LinkCommand::OpenTransport])
            }
            from => Err(LinkError::InvalidTransition {
                from,
                op: "connect",
            }),
        }
    }

    /// The transport opened.  Authentication goes out immediately; readiness
    /// follows after the settle delay.
    pub fn on_transport_open(&mut self, now: Instant) -> Vec<LinkCommand> {
        if self.state != LinkState::Connecting {
            return Vec::new();
        }
        self.state = LinkState::OpenPendingAuth;
        self.opened_at = Some(now);
        self.last_activity = Some(now);
        self.settle_at = Some(now + self.policy.settle_delay);
        self.reconnect_at = None;
        vec![LinkCommand::Authenticate]
    }

    /// Any frame sent or received on the transport resets the idle clock.
    pub fn on_activity(&mut self, now: Instant) {
        if matches!(self.state, LinkState::OpenPendingAuth | LinkState::Ready) {
            self.last_activity = Some(now);
        }
    }

    /// The earliest instant at which [`Self::on_deadline`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            LinkState::Connecting => self.reconnect_at,
            LinkState::OpenPendingAuth => self.settle_at,
            LinkState::Ready => self
                .last_activity
                .map(|last| last + self.policy.keepalive_idle),
            _ => None,
        }
    }

    /// Fires whichever timer is due at `now`.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<LinkCommand> {
        match self.state {
            LinkState::Connecting => {
                if self.reconnect_at.is_some_and(|at| now >= at) {
                    self.reconnect_at = None;
                    return vec![LinkCommand::OpenTransport];
                }
            }
            LinkState::OpenPendingAuth => {
                if self.settle_at.is_some_and(|at| now >= at) {
                    self.settle_at = None;
                    self.state = LinkState::Ready;
                    self.last_activity = Some(now);
                    return vec![
                        LinkCommand::Configure,
                        LinkCommand::Notify(LinkEvent::Ready),
                    ];
                }
            }
            LinkState::Ready => {
                let due = self
                    .last_activity
                    .map(|last| last + self.policy.keepalive_idle);
                if due.is_some_and(|at| now >= at) {
                    self.last_activity = Some(now);
                    return vec![LinkCommand::Ping];
                }
            }
            _ => {}
        }
        Vec::new()
    }

    /// The transport failed to open, errored or closed.
    ///
    /// A connection that lived at least `stable_after` clears the failure
    /// count; if it was also closed with code 1000 the link ends instead of
    /// reconnecting.  Every other loss counts as one failure.
    pub fn on_transport_lost(&mut self, now: Instant, loss: TransportLoss) -> Vec<LinkCommand> {
        match self.state {
            LinkState::Closing => {
                self.state = LinkState::Closed;
                return Vec::new();
            }
            LinkState::Idle | LinkState::Closed => return Vec::new(),
            LinkState::Connecting | LinkState::OpenPendingAuth | LinkState::Ready => {}
        }

        let lifetime = self
            .opened_at
            .take()
            .map(|opened| now.saturating_duration_since(opened));
        self.clear_timers();

        let normal_close = matches!(
            loss,
            TransportLoss::Closed {
                code: Some(NORMAL_CLOSE_CODE),
                ..
            }
        );
        let (code, reason) = loss.into_code_and_reason();

        let mut commands = Vec::new();
        if lifetime.is_some() {
            commands.push(LinkCommand::Notify(LinkEvent::Disconnected {
                code,
                reason: reason.clone(),
            }));
        }

        if lifetime.is_some_and(|lived| lived >= self.policy.stable_after) {
            if normal_close {
                self.state = LinkState::Closed;
                commands.push(LinkCommand::Notify(LinkEvent::Ended {
                    code: NORMAL_CLOSE_CODE,
                    reason,
                }));
                return commands;
            }
            self.failures = 0;
        }

        self.failures += 1;
        if self.failures >= self.policy.max_reconnect_attempts {
            self.state = LinkState::Closed;
            commands.push(LinkCommand::Notify(LinkEvent::Exhausted {
                attempts: self.failures,
            }));
            return commands;
        }

        self.state = LinkState::Connecting;
        self.reconnect_at = Some(now + self.policy.reconnect_delay);
        commands.push(LinkCommand::Notify(LinkEvent::Reconnecting {
            attempt: self.failures,
            delay: self.policy.reconnect_delay,
        }));
        commands
    }

    /// Deliberate shutdown.  Idempotent; never schedules a reconnect.
    pub fn close(&mut self) -> Vec<LinkCommand> {
        self.clear_timers();
        match self.state {
            LinkState::Closing | LinkState::Closed => Vec::new(),
            LinkState::Idle => {
                self.state = LinkState::Closed;
                Vec::new()
            }
            LinkState::Connecting => {
                self.state = LinkState::Closed;
                vec![LinkCommand::CloseTransport]
            }
            LinkState::OpenPendingAuth | LinkState::Ready => {
                self.opened_at = None;
                self.state = LinkState::Closing;
                vec![LinkCommand::CloseTransport]
            }
        }
    }

    /// The driver finished tearing the transport down after [`Self::close`].
    pub fn on_close_complete(&mut self) {
        if self.state == LinkState::Closing {
            self.state = LinkState::Closed;
        }
    }

    fn clear_timers(&mut self) {
        self.last_activity = None;
        self.settle_at = None;
        self.reconnect_at = None;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> LinkPolicy {
        LinkPolicy::default()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// Drives a fresh machine to `Ready` with the transport opened at `t0`.
    fn ready_machine(t0: Instant) -> LinkMachine {
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();
        m.on_transport_open(t0);
        m.on_deadline(t0 + policy().settle_delay);
        assert!(m.is_ready());
        m
    }

    fn events(commands: &[LinkCommand]) -> Vec<LinkEvent> {
        commands
            .iter()
            .filter_map(|c| match c {
                LinkCommand::Notify(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn closed_normally() -> TransportLoss {
        TransportLoss::Closed {
            code: Some(NORMAL_CLOSE_CODE),
            reason: "bye".to_string(),
        }
    }

    #[test]
    fn test_connect_from_idle_opens_transport() {
        let mut m = LinkMachine::new(policy());

        let commands = m.connect().unwrap();

        assert_eq!(commands, vec![LinkCommand::OpenTransport]);
        assert_eq!(m.state(), LinkState::Connecting);
    }

    #[test]
    fn test_connect_twice_is_invalid_transition() {
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();

        let err = m.connect().unwrap_err();

        assert_eq!(
            err,
            LinkError::InvalidTransition {
                from: LinkState::Connecting,
                op: "connect"
            }
        );
    }

    #[test]
    fn test_open_authenticates_but_is_not_ready_before_settle_delay() {
        // Arrange
        let t0 = Instant::now();
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();

        // Act
        let on_open = m.on_transport_open(t0);
        let early = m.on_deadline(t0 + Duration::from_millis(999));

        // Assert
        assert_eq!(on_open, vec![LinkCommand::Authenticate]);
        assert!(early.is_empty());
        assert_eq!(m.state(), LinkState::OpenPendingAuth);
        assert_eq!(m.ensure_ready(), Err(LinkError::NotReady(LinkState::OpenPendingAuth)));
    }

    #[test]
    fn test_settle_delay_expiry_configures_then_reports_ready() {
        let t0 = Instant::now();
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();
        m.on_transport_open(t0);
        assert_eq!(m.next_deadline(), Some(t0 + secs(1)));

        let commands = m.on_deadline(t0 + secs(1));

        assert_eq!(
            commands,
            vec![LinkCommand::Configure, LinkCommand::Notify(LinkEvent::Ready)]
        );
        assert!(m.is_ready());
    }

    #[test]
    fn test_keepalive_ping_after_idle_window() {
        // Arrange
        let t0 = Instant::now();
        let mut m = ready_machine(t0);
        let ready_at = t0 + secs(1);

        // Act
        let before = m.on_deadline(ready_at + secs(14));
        let at = m.on_deadline(ready_at + secs(15));

        // Assert
        assert!(before.is_empty());
        assert_eq!(at, vec![LinkCommand::Ping]);
        assert_eq!(m.next_deadline(), Some(ready_at + secs(30)));
    }

    #[test]
    fn test_activity_postpones_keepalive() {
        let t0 = Instant::now();
        let mut m = ready_machine(t0);
        let ready_at = t0 + secs(1);

        m.on_activity(ready_at + secs(10));

        assert!(m.on_deadline(ready_at + secs(15)).is_empty());
        assert_eq!(m.next_deadline(), Some(ready_at + secs(25)));
    }

    #[test]
    fn test_fast_close_with_normal_code_reconnects() {
        // Arrange
        let t0 = Instant::now();
        let mut m = ready_machine(t0);

        // Act
        let commands = m.on_transport_lost(t0 + secs(5), closed_normally());

        // Assert
        assert_eq!(
            events(&commands),
            vec![
                LinkEvent::Disconnected {
                    code: Some(1000),
                    reason: "bye".to_string()
                },
                LinkEvent::Reconnecting {
                    attempt: 1,
                    delay: secs(2)
                },
            ]
        );
        assert_eq!(m.state(), LinkState::Connecting);
        assert_eq!(m.next_deadline(), Some(t0 + secs(7)));
    }

    #[test]
    fn test_stable_normal_close_ends_without_reconnect() {
        let t0 = Instant::now();
        let mut m = ready_machine(t0);

        let commands = m.on_transport_lost(t0 + secs(90), closed_normally());

        assert_eq!(
            events(&commands),
            vec![
                LinkEvent::Disconnected {
                    code: Some(1000),
                    reason: "bye".to_string()
                },
                LinkEvent::Ended {
                    code: 1000,
                    reason: "bye".to_string()
                },
            ]
        );
        assert_eq!(m.state(), LinkState::Closed);
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn test_stable_abnormal_close_resets_failures_and_reconnects() {
        // Arrange: two quick failures, then a connection that lives 2 minutes.
        let t0 = Instant::now();
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();
        m.on_transport_lost(t0, TransportLoss::ConnectFailed("refused".to_string()));
        m.on_deadline(t0 + secs(2));
        m.on_transport_lost(t0 + secs(2), TransportLoss::ConnectFailed("refused".to_string()));
        assert_eq!(m.failures(), 2);
        m.on_deadline(t0 + secs(4));
        m.on_transport_open(t0 + secs(4));

        // Act
        let commands = m.on_transport_lost(
            t0 + secs(124),
            TransportLoss::Closed {
                code: Some(1006),
                reason: String::new(),
            },
        );

        // Assert
        assert!(events(&commands).contains(&LinkEvent::Reconnecting {
            attempt: 1,
            delay: secs(2)
        }));
        assert_eq!(m.failures(), 1);
    }

    #[test]
    fn test_connect_failure_reports_no_disconnect() {
        let t0 = Instant::now();
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();

        let commands = m.on_transport_lost(t0, TransportLoss::ConnectFailed("refused".to_string()));

        assert_eq!(
            events(&commands),
            vec![LinkEvent::Reconnecting {
                attempt: 1,
                delay: secs(2)
            }]
        );
    }

    #[test]
    fn test_reconnect_bound_emits_exhausted_exactly_once() {
        // Arrange
        let mut t = Instant::now();
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();
        let mut reconnecting = 0;
        let mut exhausted = 0;
        let mut opens = 1;

        // Act: every attempt fails until the machine gives up.
        for _ in 0..40 {
            let commands = m.on_transport_lost(t, TransportLoss::ConnectFailed("refused".to_string()));
            for event in events(&commands) {
                match event {
                    LinkEvent::Reconnecting { .. } => reconnecting += 1,
                    LinkEvent::Exhausted { attempts } => {
                        assert_eq!(attempts, 15);
                        exhausted += 1;
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            }
            t += secs(2);
            if m.on_deadline(t).contains(&LinkCommand::OpenTransport) {
                opens += 1;
            }
        }

        // Assert
        assert_eq!(exhausted, 1);
        assert_eq!(reconnecting, 14);
        assert_eq!(opens, 15);
        assert_eq!(m.state(), LinkState::Closed);
    }

    #[test]
    fn test_close_is_idempotent_and_never_reconnects() {
        // Arrange
        let t0 = Instant::now();
        let mut m = ready_machine(t0);

        // Act
        let first = m.close();
        let second = m.close();
        let after_loss = m.on_transport_lost(t0 + secs(2), closed_normally());
        let third = m.close();

        // Assert
        assert_eq!(first, vec![LinkCommand::CloseTransport]);
        assert!(second.is_empty());
        assert!(after_loss.is_empty());
        assert!(third.is_empty());
        assert_eq!(m.state(), LinkState::Closed);
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn test_close_while_connecting_cancels_attempt() {
        let mut m = LinkMachine::new(policy());
        m.connect().unwrap();

        assert_eq!(m.close(), vec![LinkCommand::CloseTransport]);
        assert_eq!(m.state(), LinkState::Closed);
        assert!(m.on_transport_open(Instant::now()).is_empty());
    }

    #[test]
    fn test_close_complete_moves_closing_to_closed() {
        let mut m = ready_machine(Instant::now());
        m.close();
        assert_eq!(m.state(), LinkState::Closing);

        m.on_close_complete();

        assert_eq!(m.state(), LinkState::Closed);
    }

    #[test]
    fn test_reconnect_from_closed_starts_fresh() {
        let mut m = LinkMachine::new(policy());
        m.close();

        let commands = m.connect().unwrap();

        assert_eq!(commands, vec![LinkCommand::OpenTransport]);
        assert_eq!(m.failures(), 0);
    }
}

//! Registration with the upstream node
//!
//! Tracks the BootNotification handshake and heartbeat schedule, and drives
//! both over the engine's outbound side.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ocpp_engine::ocpp::types::{
    BootNotificationRequest, BootNotificationResponse, BootReason, ChargingStationInfo,
    HeartbeatRequest, RegistrationStatus,
};
use ocpp_engine::{NetworkingNode, Outcome, SourceRouting};
use tracing::{debug, info, warn};

/// Interval used until the upstream names one
const DEFAULT_INTERVAL_SECS: i64 = 60;

/// How often the session loop wakes up
const TICK: Duration = Duration::from_secs(1);

/// Registration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No upstream connection
    Disconnected,
    /// Connected, BootNotification not yet answered
    Connected,
    /// Upstream answered Pending
    BootPending,
    /// Registered, heartbeats running
    Registered,
    /// Upstream answered Rejected
    Rejected,
}

/// Events driving the state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    BootAccepted { interval: i64 },
    BootPending { interval: i64 },
    BootRejected { interval: i64 },
    HeartbeatSent,
}

/// What the session loop should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SendBoot,
    SendHeartbeat,
    Wait,
}

/// Registration session with one upstream
#[derive(Debug)]
pub struct Session {
    pub state: SessionState,
    pub heartbeat_interval: i64,
    pub registered_at: Option<DateTime<Utc>>,
    last_boot: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
    info: ChargingStationInfo,
}

impl Session {
    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            state: SessionState::Disconnected,
            heartbeat_interval: DEFAULT_INTERVAL_SECS,
            registered_at: None,
            last_boot: None,
            last_heartbeat: None,
            info: ChargingStationInfo {
                model: model.into(),
                vendor_name: vendor.into(),
                serial_number: None,
                firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent, now: DateTime<Utc>) {
        debug!("Session event: {:?}", event);

        match event {
            SessionEvent::Connected => {
                if self.state == SessionState::Disconnected {
                    self.state = SessionState::Connected;
                    self.last_boot = None;
                    info!("Upstream connected, will send BootNotification");
                }
            }
            SessionEvent::Disconnected => {
                if self.state != SessionState::Disconnected {
                    warn!("Upstream disconnected");
                }
                self.state = SessionState::Disconnected;
                self.registered_at = None;
                self.last_heartbeat = None;
            }
            SessionEvent::BootAccepted { interval } => {
                self.state = SessionState::Registered;
                self.registered_at = Some(now);
                self.last_heartbeat = Some(now);
                self.heartbeat_interval = positive_or_default(interval);
                info!("Registered, heartbeat interval: {}s", self.heartbeat_interval);
            }
            SessionEvent::BootPending { interval } => {
                self.state = SessionState::BootPending;
                self.last_boot = Some(now);
                self.heartbeat_interval = positive_or_default(interval);
                info!("Boot pending, will retry in {}s", self.heartbeat_interval);
            }
            SessionEvent::BootRejected { interval } => {
                self.state = SessionState::Rejected;
                self.last_boot = Some(now);
                self.heartbeat_interval = positive_or_default(interval);
                warn!("Boot rejected by upstream, retry in {}s", self.heartbeat_interval);
            }
            SessionEvent::HeartbeatSent => {
                self.last_heartbeat = Some(now);
            }
        }
    }

    /// Next step at `now`
    pub fn next_action(&self, now: DateTime<Utc>) -> Action {
        let elapsed = |since: Option<DateTime<Utc>>| match since {
            None => true,
            Some(t) => now.signed_duration_since(t).num_seconds() >= self.heartbeat_interval,
        };

        match self.state {
            SessionState::Disconnected => Action::Wait,
            SessionState::Connected => Action::SendBoot,
            SessionState::BootPending | SessionState::Rejected if elapsed(self.last_boot) => {
                Action::SendBoot
            }
            SessionState::Registered if elapsed(self.last_heartbeat) => Action::SendHeartbeat,
            _ => Action::Wait,
        }
    }

    pub fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charging_station: self.info.clone(),
            reason: BootReason::PowerUp,
        }
    }

    /// Feed a BootNotification outcome into the state machine
    pub fn on_boot_outcome(&mut self, outcome: Outcome<BootNotificationResponse>, now: DateTime<Utc>) {
        match outcome {
            Outcome::Response(response) => {
                let interval = i64::from(response.interval);
                let event = match response.status {
                    RegistrationStatus::Accepted => SessionEvent::BootAccepted { interval },
                    RegistrationStatus::Pending => SessionEvent::BootPending { interval },
                    RegistrationStatus::Rejected => SessionEvent::BootRejected { interval },
                };
                self.handle_event(event, now);
            }
            other => {
                warn!("BootNotification failed: {:?}", other);
                // Retry after one interval
                self.handle_event(
                    SessionEvent::BootPending {
                        interval: self.heartbeat_interval,
                    },
                    now,
                );
            }
        }
    }
}

fn positive_or_default(interval: i64) -> i64 {
    if interval > 0 {
        interval
    } else {
        DEFAULT_INTERVAL_SECS
    }
}

/// Keep the session with `upstream` alive for as long as the node runs
pub async fn run(node: NetworkingNode, upstream: String, mut session: Session) {
    let route = SourceRouting::to(upstream.clone());
    let mut ticker = tokio::time::interval(TICK);

    loop {
        ticker.tick().await;

        let connected = node.connections().contains(&upstream);
        match (connected, session.state) {
            (true, SessionState::Disconnected) => {
                session.handle_event(SessionEvent::Connected, Utc::now())
            }
            (false, state) if state != SessionState::Disconnected => {
                session.handle_event(SessionEvent::Disconnected, Utc::now())
            }
            _ => {}
        }

        match session.next_action(Utc::now()) {
            Action::Wait => {}
            Action::SendBoot => {
                let outcome = node.outbound().request(&route, &session.boot_request()).await;
                match outcome {
                    Ok(outcome) => session.on_boot_outcome(outcome, Utc::now()),
                    Err(e) => {
                        warn!("Could not send BootNotification: {}", e);
                        session.handle_event(SessionEvent::Disconnected, Utc::now());
                    }
                }
            }
            Action::SendHeartbeat => {
                session.handle_event(SessionEvent::HeartbeatSent, Utc::now());
                match node.outbound().request(&route, &HeartbeatRequest {}).await {
                    Ok(Outcome::Response(response)) => {
                        debug!("Heartbeat acknowledged, upstream time {}", response.current_time)
                    }
                    Ok(other) => warn!("Heartbeat failed: {:?}", other),
                    Err(e) => warn!("Could not send Heartbeat: {}", e),
                }
            }
        }
    }
}

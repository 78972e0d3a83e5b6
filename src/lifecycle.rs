//! The "companion app is open" belief as an explicit state machine.
//!
//! The machine never touches a clock or the transport. It consumes
//! [`LifecycleEvent`]s and answers with [`LifecycleAction`]s the session
//! carries out; the grace period is represented by a generation number that
//! the timer hands back when it elapses.

use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The device was enumerated (plugged in, or an app was opened on it).
    Attached,
    /// The device went away (unplugged, or the foreground app changed).
    Removed,
    /// A version handshake confirmed the companion app is in the foreground.
    VersionConfirmed,
    /// The grace timer armed with this generation has elapsed.
    GraceElapsed(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Run a best-effort version handshake.
    CheckVersion,
    /// Close the device handle and forget the transport.
    ReleaseTransport,
    /// Start the grace timer; it must report back with this generation.
    StartGraceTimer { generation: u64 },
    NotifyAppOpened,
    NotifyLocked,
}

#[derive(Debug)]
pub struct Lifecycle {
    state: AppState,
    generation: u64,
    armed: Option<u64>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AppState::Closed,
            generation: 0,
            armed: None,
        }
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn is_app_open(&self) -> bool {
        self.state == AppState::Open
    }

    /// Generation of the grace timer that may still raise a lock, if any.
    pub fn armed_timer(&self) -> Option<u64> {
        self.armed
    }

    pub fn handle(&mut self, event: LifecycleEvent) -> Vec<LifecycleAction> {
        let actions = match event {
            LifecycleEvent::Attached => vec![LifecycleAction::CheckVersion],
            LifecycleEvent::VersionConfirmed => {
                if self.transition(AppState::Open) {
                    vec![LifecycleAction::NotifyAppOpened]
                } else {
                    Vec::new()
                }
            }
            LifecycleEvent::Removed => {
                let was_open = self.transition(AppState::Closed);
                let mut actions = Vec::with_capacity(2);
                if was_open {
                    self.generation += 1;
                    self.armed = Some(self.generation);
                    actions.push(LifecycleAction::StartGraceTimer {
                        generation: self.generation,
                    });
                }
                actions.push(LifecycleAction::ReleaseTransport);
                actions
            }
            LifecycleEvent::GraceElapsed(generation) => {
                if self.armed != Some(generation) {
                    debug!("ignoring superseded grace timer {}", generation);
                    Vec::new()
                } else {
                    self.armed = None;
                    if self.state == AppState::Closed {
                        vec![LifecycleAction::NotifyLocked]
                    } else {
                        Vec::new()
                    }
                }
            }
        };

        debug!("{:?} -> {:?} in state {:?}", event, actions, self.state);
        actions
    }

    /// Move to `next`, returning true if the state actually changed.
    fn transition(&mut self, next: AppState) -> bool {
        if self.state == next {
            return false;
        }
        info!("companion app state {:?} -> {:?}", self.state, next);
        self.state = next;
        true
    }
}

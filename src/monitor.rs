//! Idle-in-transaction watchdog.
//!
//! A binding goes `Unarmed -> Armed` at BEGIN and ends either `Disarmed`
//! (COMMIT/ROLLBACK/release before the deadline) or `Fired`. The deadline is
//! wall-clock from BEGIN and runs on its own task, so a caller stuck on a slow
//! downstream call can't hold a transaction open past it. Firing and
//! disarming both go through the connection's state lock; whichever takes
//! it first decides the outcome.
//!
//! The same deadline is set on the session, so the server usually kills it
//! a moment before the local timer runs out. An error pushed by the
//! transport while the binding is armed counts as the deadline firing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{ConnectionState, Shared};
use crate::error::Error;
use crate::router::ErrorRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorState {
    #[default]
    Unarmed,
    Armed,
    Disarmed,
    Fired,
}

#[derive(Debug, Default)]
pub(crate) struct TimeoutMonitor {
    state: MonitorState,
    deadline: Option<Instant>,
    timeout: Duration,
    // distinguishes a stale timer from the binding currently armed
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl TimeoutMonitor {
    pub(crate) fn state(&self) -> MonitorState {
        self.state
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Armed -> Disarmed. Any other state is left alone and returned as is.
    pub(crate) fn disarm(&mut self) -> MonitorState {
        if self.state == MonitorState::Armed {
            self.state = MonitorState::Disarmed;
            self.deadline = None;
            if let Some(timer) = self.timer.take() {
                timer.abort();
            }
        }
        self.state
    }

    /// Drop whatever binding is left; the next transaction starts clean.
    pub(crate) fn reset(&mut self) {
        self.disarm();
        self.state = MonitorState::Unarmed;
    }

    /// Armed -> Fired ahead of the local timer, returning the armed timeout.
    pub(crate) fn preempt(&mut self) -> Option<Duration> {
        if self.state != MonitorState::Armed {
            return None;
        }
        self.state = MonitorState::Fired;
        self.deadline = None;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        Some(self.timeout)
    }

    fn fire(&mut self, generation: u64) -> bool {
        if self.state != MonitorState::Armed || self.generation != generation {
            return false;
        }
        self.state = MonitorState::Fired;
        self.deadline = None;
        self.timer = None;
        true
    }
}

/// Arm the watchdog on a checked-out connection. Returns false if the
/// connection is no longer usable.
pub(crate) fn arm(shared: &Arc<Shared>, router: &Arc<ErrorRouter>, timeout: Duration) -> bool {
    let mut slot = shared.slot.lock();
    if slot.state != ConnectionState::CheckedOut {
        return false;
    }
    let monitor = &mut slot.monitor;
    monitor.disarm();
    monitor.generation += 1;
    let deadline = Instant::now() + timeout;
    monitor.state = MonitorState::Armed;
    monitor.deadline = Some(deadline);
    monitor.timeout = timeout;
    monitor.timer = Some(tokio::spawn(watch(
        shared.clone(),
        router.clone(),
        monitor.generation,
        deadline,
        timeout,
    )));
    tracing::debug!(connection = %shared.id, ?timeout, "idle-in-transaction monitor armed");
    true
}

async fn watch(
    shared: Arc<Shared>,
    router: Arc<ErrorRouter>,
    generation: u64,
    deadline: Instant,
    timeout: Duration,
) {
    tokio::time::sleep_until(deadline).await;
    fire(&shared, &router, generation, timeout);
}

fn fire(shared: &Shared, router: &ErrorRouter, generation: u64, timeout: Duration) {
    let delivery = {
        let mut slot = shared.slot.lock();
        if !slot.monitor.fire(generation) {
            return;
        }
        tracing::warn!(connection = %shared.id, ?timeout, "idle-in-transaction deadline elapsed, terminating connection");
        router.raise(shared, &mut slot, Error::IdleInTransactionTimeout(timeout))
    };
    if let Some(delivery) = delivery {
        delivery.deliver();
    }
}

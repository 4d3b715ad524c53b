//! Deferred cleanup of drained rooms.
//!
//! A room that loses its last session does not die immediately: a timer is
//! armed for a grace period, and only if nobody rejoins does the cleanup
//! run. The lifecycle is a tagged state machine so the cancellation race is
//! explicit: each armed timer carries a generation number, and a fire that
//! arrives with a stale generation (the room came back to life, possibly
//! more than once) is ignored.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Where a room is in its life.
#[derive(Debug)]
pub enum Lifecycle {
    /// At least one session attached.
    Active,
    /// Zero sessions; a cleanup timer is armed.
    Draining(PendingCleanup),
    /// Cleanup ran; the room is gone from the registry.
    Cleaned,
}

impl Lifecycle {
    pub fn is_draining(&self) -> bool {
        matches!(self, Lifecycle::Draining(_))
    }
}

/// An armed cleanup: the resource keys captured when the room emptied and
/// the handle of the timer that will fire after the grace period.
#[derive(Debug)]
pub struct PendingCleanup {
    pub generation: u64,
    pub resource_keys: Vec<String>,
    timer: JoinHandle<()>,
}

impl PendingCleanup {
    /// Abort the timer and discard the captured keys. A fire already in
    /// flight is recognized by its stale generation and ignored.
    pub fn cancel(self) {
        self.timer.abort();
    }
}

/// Arms cleanup timers for one room, handing out generation numbers.
#[derive(Debug)]
pub struct CleanupScheduler {
    grace: Duration,
    generation: u64,
}

impl CleanupScheduler {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            generation: 0,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Arm a timer. `fire` is invoked with the new generation after the
    /// grace period elapses (typically sending a command back into the
    /// room's channel).
    pub fn arm<F, Fut>(&mut self, resource_keys: Vec<String>, fire: F) -> PendingCleanup
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.generation += 1;
        let generation = self.generation;
        let grace = self.grace;
        let callback = fire(generation);
        let timer = tokio::spawn(async move {
            sleep(grace).await;
            callback.await;
        });
        PendingCleanup {
            generation,
            resource_keys,
            timer,
        }
    }

    /// True when `generation` is the most recently armed timer.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }
}

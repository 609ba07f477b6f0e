//! Deferred engine timers.
//!
//! The engine never sleeps; it asks a [`Scheduler`] to deliver a [`Timer`]
//! back later. The tokio scheduler feeds the runtime event channel, the
//! manual one lets tests move time by hand.
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::{Event, Timer};

pub trait Scheduler: Send {
    fn schedule_after(&self, delay: Duration, timer: Timer);
}

pub struct TokioScheduler {
    events: mpsc::UnboundedSender<Event>,
}

impl TokioScheduler {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self { events }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_after(&self, delay: Duration, timer: Timer) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if events.send(Event::Timer(timer)).is_err() {
                debug!(?timer, "event loop gone, timer dropped");
            }
        });
    }
}

#[cfg(test)]
pub use manual::ManualScheduler;

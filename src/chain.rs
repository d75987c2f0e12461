//! Running one request after another against several remote owners.
//!
//! Stacking into every nearby chest needs each chest's owner to hand over the chest first. The
//! owners are other peers, so every step waits for a reply. `RequestChain` keeps at most one
//! request in flight, moves on when the reply arrives or the wait times out, and stops early if
//! whoever started the chain goes away.

use std::{
    collections::VecDeque,
    fmt::Debug,
    time::{Duration, Instant},
};

/// How long to wait for a reply before moving on to the next target.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// What the chain needs from the host.
pub trait ChainDriver<T> {
    /// Whether `target` is being used by someone else and should be skipped.
    fn is_busy(&self, target: &T) -> bool;

    /// Sends the request for `target`.
    fn dispatch(&mut self, target: &T);

    /// Whether whoever started the chain still exists.
    fn initiator_alive(&self) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReport {
    pub dispatched: usize,
    pub completed: usize,
    pub timed_out: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

struct InFlight<T> {
    target: T,
    since: Instant,
}

type Completion<D> = Box<dyn FnOnce(&ChainReport, &mut D) + Send>;

pub struct RequestChain<T, D> {
    pending: VecDeque<T>,
    in_flight: Option<InFlight<T>>,
    timeout: Duration,
    report: ChainReport,

    /// Taken when the chain finishes.
    on_complete: Option<Completion<D>>,
}

impl<T, D> RequestChain<T, D>
where
    T: PartialEq + Debug,
    D: ChainDriver<T>,
{
    pub fn new(
        targets: impl IntoIterator<Item = T>,
        timeout: Duration,
        on_complete: impl FnOnce(&ChainReport, &mut D) + Send + 'static,
    ) -> RequestChain<T, D> {
        RequestChain {
            pending: targets.into_iter().collect(),
            in_flight: None,
            timeout,
            report: ChainReport::default(),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn report(&self) -> &ChainReport {
        &self.report
    }

    pub fn is_finished(&self) -> bool {
        self.on_complete.is_none()
    }

    pub fn in_flight(&self) -> Option<&T> {
        self.in_flight.as_ref().map(|f| &f.target)
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Dispatches the first request.
    pub fn start(&mut self, driver: &mut D, now: Instant) {
        if self.in_flight.is_none() {
            self.advance(driver, now);
        }
    }

    /// A reply arrived. Replies for anything but the request in flight are ignored; returns
    /// whether this one was accepted.
    pub fn on_response(&mut self, driver: &mut D, target: &T, now: Instant) -> bool {
        match &self.in_flight {
            Some(in_flight) if in_flight.target == *target => {}
            _ => {
                log::debug!("Ignoring reply for {target:?}, which is not in flight.");
                return false;
            }
        }

        self.in_flight = None;
        self.report.completed += 1;
        self.advance(driver, now);

        true
    }

    /// Checks the in-flight request against the timeout and the initiator against liveness.
    /// Call this every tick.
    pub fn poll(&mut self, driver: &mut D, now: Instant) {
        if self.is_finished() {
            return;
        }

        if !driver.initiator_alive() {
            self.cancel(driver);
            return;
        }

        let expired = match &self.in_flight {
            Some(in_flight) => now.duration_since(in_flight.since) >= self.timeout,
            None => false,
        };

        if expired {
            if let Some(in_flight) = self.in_flight.take() {
                log::warn!("No reply for {:?} in time, moving on.", in_flight.target);
            }

            self.report.timed_out += 1;
            self.advance(driver, now);
        }
    }

    /// Stops the chain. Nothing more is dispatched; the completion callback still runs.
    pub fn cancel(&mut self, driver: &mut D) {
        if self.is_finished() {
            return;
        }

        self.pending.clear();
        self.in_flight = None;
        self.report.cancelled = true;
        self.finish(driver);
    }

    fn advance(&mut self, driver: &mut D, now: Instant) {
        if !driver.initiator_alive() {
            self.cancel(driver);
            return;
        }

        while let Some(target) = self.pending.pop_front() {
            if driver.is_busy(&target) {
                self.report.skipped += 1;
                continue;
            }

            driver.dispatch(&target);
            self.report.dispatched += 1;
            self.in_flight = Some(InFlight {
                target,
                since: now,
            });

            return;
        }

        self.finish(driver);
    }

    fn finish(&mut self, driver: &mut D) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&self.report, driver);
        }
    }
}

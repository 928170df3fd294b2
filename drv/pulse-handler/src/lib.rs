//! C3: debounces raw pulse-input edges, maintains a sliding one-minute
//! window of accepted pulses to report pulses-per-minute, and accumulates
//! an undrained pulse count for the innermost bucket stage to fetch.
//! Recovered from `PHD_PulseHandler.c`: `PHD_HandlePulse`'s debounce-then-
//! record path, `PHD_Process`'s window eviction and change-triggered
//! notification, and `PHD_GetPulses`'s drain-and-reset fetch.
//!
//! `handle_pulse` is the one method meant to be called from interrupt
//! context (a real GPIO edge ISR, in the original); every field it shares
//! with `process`/`drain_pending` lives behind a `critical_section` guard
//! so a pulse arriving mid-`process` can't tear a multi-word update.

#![cfg_attr(not(test), no_std)]

use core::cell::RefCell;
use critical_section::Mutex;
use eventbus::EventBus;
use metermaid_abi::{Error, Result};
use ringbuf::{ringbuf, ringbuf_entry};
use tick_source::{SubTickHardware, TickSource, Ticks};

const WINDOW_MS: u64 = 60_000;
const TICKS_PER_MINUTE: u32 = 60_000;
/// The debounce interval is a fraction of the naive one-pulse-per-slot
/// spacing (`ticks_per_minute / max_ppm`), not the spacing itself.
const DEBOUNCE_FACTOR: u32 = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Debounced,
    Accepted,
    PpmChanged(u32),
    StorageReady(u32),
}

ringbuf!(Trace, 32, Trace::None);

struct Shared<const WINDOW: usize> {
    debounce_deadline: Ticks,
    ring: [Ticks; WINDOW],
    head: usize,
    tail: usize,
    pending: u32,
    last_seen_pending: u32,
    last_reported_ppm: u32,
}

/// One instance per physical pulse input. `WINDOW` is the sliding-window
/// ring's capacity: `max_pulses_per_minute + 1`, the same sentinel-slot
/// convention `bucket-memory` uses, so a full minute of pulses never
/// collides `head` with `tail`. `MAX_LOAD_SUBS` bounds the load-subscriber
/// count (`PHD_MAX_EVENTS` was 5 in the original).
pub struct PulseHandler<S, const WINDOW: usize, const MAX_LOAD_SUBS: usize> {
    debounce_ms: u32,
    shared: Mutex<RefCell<Shared<WINDOW>>>,
    load_subscribers: EventBus<S, MAX_LOAD_SUBS>,
    storage_subscriber: Option<S>,
}

impl<S: Copy + PartialEq, const WINDOW: usize, const MAX_LOAD_SUBS: usize>
    PulseHandler<S, WINDOW, MAX_LOAD_SUBS>
{
    /// Rejects `max_pulses_per_minute == 0` rather than computing an
    /// infinite debounce interval, and rejects a `WINDOW` that can't hold
    /// `max_pulses_per_minute + 1` timestamps (the sentinel-slot ring needs
    /// exactly one more slot than the maximum pulses expected in a minute,
    /// or `load_ppm` silently saturates below the true rate instead of
    /// reporting it).
    pub fn new(max_pulses_per_minute: u32) -> Result<Self> {
        if max_pulses_per_minute == 0 {
            return Err(Error::InvalidArgument);
        }
        let required_window = (max_pulses_per_minute as usize)
            .checked_add(1)
            .ok_or(Error::InvalidArgument)?;
        if WINDOW < required_window {
            return Err(Error::InvalidArgument);
        }
        Ok(PulseHandler {
            debounce_ms: (TICKS_PER_MINUTE / max_pulses_per_minute) / DEBOUNCE_FACTOR,
            shared: Mutex::new(RefCell::new(Shared {
                debounce_deadline: Ticks::EXPIRED,
                ring: [Ticks::EXPIRED; WINDOW],
                head: 0,
                tail: 0,
                pending: 0,
                last_seen_pending: 0,
                last_reported_ppm: 0,
            })),
            load_subscribers: EventBus::new(),
            storage_subscriber: None,
        })
    }

    /// Sets the single subscriber notified when undrained pulses become
    /// available. There is exactly one, matching `PHD_SetStorageClient`.
    pub fn set_storage_subscriber(&mut self, subscriber: S) {
        self.storage_subscriber = Some(subscriber);
    }

    pub fn add_load_subscriber(&mut self, subscriber: S) -> Result<()> {
        self.load_subscribers.subscribe(subscriber)
    }

    pub fn remove_load_subscriber(&mut self, subscriber: S) -> Result<()> {
        self.load_subscribers.unsubscribe(subscriber)
    }

    /// Call on every raw pulse edge, including bounces. Rejects the pulse
    /// if it arrives before the debounce deadline; otherwise records it
    /// and re-arms the deadline.
    pub fn handle_pulse<H: SubTickHardware>(&self, ticks: &TickSource<H>) {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            if !ticks.expired(shared.debounce_deadline) {
                ringbuf_entry!(Trace::Debounced);
                return;
            }
            let now = ticks.now();
            let next_head = (shared.head + 1) % WINDOW;
            if next_head == shared.tail {
                shared.tail = (shared.tail + 1) % WINDOW;
            }
            shared.ring[shared.head] = now;
            shared.head = next_head;
            shared.pending += 1;
            shared.debounce_deadline = ticks.set_timeout(self.debounce_ms);
            ringbuf_entry!(Trace::Accepted);
        });
    }

    /// Drains and returns the undrained pulse count, resetting it to
    /// zero. This is the fetch function `bucket-memory`'s innermost stage
    /// calls, matching `PHD_GetPulses`.
    pub fn drain_pending(&self) -> u32 {
        critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            let pending = shared.pending;
            shared.pending = 0;
            pending
        })
    }

    /// The most recently computed pulses-per-minute, as of the last
    /// [`Self::process`] call.
    pub fn load_ppm(&self) -> u32 {
        critical_section::with(|cs| self.shared.borrow(cs).borrow().last_reported_ppm)
    }

    /// Evicts window entries older than one minute, recomputes
    /// pulses-per-minute, and notifies subscribers of whatever changed.
    /// Intended to be polled periodically (the original's `PHD_Process`
    /// loop yields with `KE_TaskSleep(0)` between passes).
    pub fn process<H: SubTickHardware>(
        &self,
        ticks: &TickSource<H>,
        mut dispatch_load: impl FnMut(S),
        mut dispatch_storage: impl FnMut(S),
    ) {
        let now = ticks.now();
        let (ppm_changed, ppm, storage_ready, pending) = critical_section::with(|cs| {
            let mut shared = self.shared.borrow(cs).borrow_mut();
            while shared.tail != shared.head {
                if shared.ring[shared.tail].age(now) > WINDOW_MS {
                    shared.tail = (shared.tail + 1) % WINDOW;
                } else {
                    break;
                }
            }
            let ppm = ((shared.head + WINDOW - shared.tail) % WINDOW) as u32;
            let ppm_changed = ppm != shared.last_reported_ppm;
            shared.last_reported_ppm = ppm;

            let pending = shared.pending;
            let storage_ready = pending != shared.last_seen_pending;
            shared.last_seen_pending = pending;

            (ppm_changed, ppm, storage_ready, pending)
        });

        if ppm_changed {
            ringbuf_entry!(Trace::PpmChanged(ppm));
            self.load_subscribers.publish(ppm, |s, _| dispatch_load(s));
        }
        if storage_ready {
            ringbuf_entry!(Trace::StorageReady(pending));
            if let Some(storage) = self.storage_subscriber {
                dispatch_storage(storage);
            }
        }
    }
}

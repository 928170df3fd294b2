//! C2: the wall-clock driver. Polls an RTC hardware seam for raw epoch
//! seconds on every poll, clamps them to monotonic (the original firmware
//! never lets `RTC_GetTime` report time moving backward, even across a
//! hardware resync), converts to local calendar time, and fires edge
//! notifications to subscribers when the second/minute/hour/day field rolls
//! over, per `RTC_Process`'s `t_oldDateTime` comparison, generalized onto
//! `eventbus::EventBus`.
//!
//! Calendar math (`calendar` module) is recovered from
//! `RTC_Seconds2UTC`/`RTC_Date2Seconds`/the `RTC_DST` macro: 1970-01-01 is
//! day 0, the weekday offset treats it as day 1 before applying the
//! `+4 mod 7` rule (an original fencepost quirk, preserved exactly), and
//! the local zone is fixed Central European Time (UTC+1, +2 under DST)
//! with DST in effect April through September and across the last-Sunday
//! 01:00 UTC transitions in March and October.

#![cfg_attr(not(test), no_std)]

use eventbus::EventBus;
use metermaid_abi::{Error, Result};
use ringbuf::{ringbuf, ringbuf_entry};
use tick_source::{SubTickHardware, TickSource};

pub mod calendar;
pub use calendar::Utc;

/// The RTC hardware seam: raw UTC epoch seconds in, raw seconds out. A
/// read failure (`Err`) is the one place the original silently kept
/// serving the last known value instead of surfacing the fault; this
/// keeps the monotonic-hold behavior but the caller always learns about
/// it via the trace log.
pub trait RtcBus {
    fn read_epoch_seconds(&mut self) -> Result<u32>;
    fn write_epoch_seconds(&mut self, seconds: u32) -> Result<()>;
}

/// A wall-clock field whose rollover a subscriber can be notified of.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Edge {
    Second,
    Minute,
    Hour,
    Day,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Read(u32),
    ReadFault,
    EdgeFired(Edge),
}

ringbuf!(Trace, 32, Trace::None);

/// One driver instance per RTC peripheral. `S` is the subscriber identity
/// (typically a `metermaid_abi::Handle<T>` into the caller's arena); `N`
/// bounds the combined count of edge subscriptions, mirroring the
/// original's `RTC_MAX_EVENTS`.
pub struct WallClock<B, S, const N: usize> {
    bus: B,
    last_seconds: Option<u32>,
    last_local: Option<Utc>,
    subscribers: EventBus<(Edge, S), N>,
}

impl<B: RtcBus, S: Copy + PartialEq, const N: usize> WallClock<B, S, N> {
    pub fn new(bus: B) -> Self {
        WallClock {
            bus,
            last_seconds: None,
            last_local: None,
            subscribers: EventBus::new(),
        }
    }

    pub fn add_client(&mut self, edge: Edge, subscriber: S) -> Result<()> {
        self.subscribers.subscribe((edge, subscriber))
    }

    pub fn remove_client(&mut self, edge: Edge, subscriber: S) -> Result<()> {
        self.subscribers.unsubscribe((edge, subscriber))
    }

    /// The current clamped epoch second, if the clock has synced at least
    /// once. `Err(NotFound)` replaces the original's silent zero-return
    /// for "never read the hardware yet".
    pub fn current_seconds(&self) -> Result<u32> {
        self.last_seconds.ok_or(Error::NotFound)
    }

    /// The current local calendar time, if synced.
    pub fn current_local(&self) -> Result<Utc> {
        self.last_local.ok_or(Error::NotFound)
    }

    /// One poll of the driver: reads the hardware, clamps the reading to
    /// monotonic, converts to local calendar time, and fires whatever
    /// field-rollover edges occurred since the previous poll. Intended to
    /// be called on a fixed poll interval (the original polls every 100ms
    /// via `KE_TaskSleep10(1)`); the read happens unconditionally on every
    /// call, matching `RTC_Process`'s per-poll read — there is no gating
    /// state machine on this path, since that's what drove every edge the
    /// rest of the pipeline (bucket-memory rollover) depends on.
    pub fn tick<H: SubTickHardware>(
        &mut self,
        _ticks: &TickSource<H>,
        mut dispatch: impl FnMut(S, Edge),
    ) {
        match self.bus.read_epoch_seconds() {
            Ok(raw) => {
                let clamped = self.last_seconds.map_or(raw, |prev| prev.max(raw));
                self.last_seconds = Some(clamped);
                ringbuf_entry!(Trace::Read(clamped));
            }
            Err(_) => {
                ringbuf_entry!(Trace::ReadFault);
                // Hold the last known value; try again next tick.
            }
        }

        let Some(seconds) = self.last_seconds else {
            return;
        };
        let local = calendar::seconds_to_utc(calendar::local_seconds(seconds));
        self.fire_edges(local, &mut dispatch);
        self.last_local = Some(local);
    }

    fn fire_edges(&self, new_local: Utc, dispatch: &mut impl FnMut(S, Edge)) {
        let Some(old) = self.last_local else {
            return;
        };
        let mut fire = |edge: Edge| {
            ringbuf_entry!(Trace::EdgeFired(edge));
            self.subscribers.publish(edge, |entry, fired| {
                if entry.0 == fired {
                    dispatch(entry.1, fired);
                }
            });
        };
        if new_local.day != old.day {
            fire(Edge::Day);
        }
        if new_local.hour != old.hour {
            fire(Edge::Hour);
        }
        if new_local.minute != old.minute {
            fire(Edge::Minute);
        }
        if new_local.second != old.second {
            fire(Edge::Second);
        }
    }

    /// Writes a new epoch second to the hardware and resets the monotonic
    /// clamp to it, matching `RTC_WriteDateTime`'s commit path. This is the
    /// external-time-set seam (a user or NTP-resynced value arriving from
    /// outside); the resync source itself is out of scope here.
    pub fn set_epoch_seconds(&mut self, seconds: u32) -> Result<()> {
        self.bus.write_epoch_seconds(seconds)?;
        self.last_seconds = Some(seconds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeHw;
    impl SubTickHardware for FakeHw {
        fn spin_micros(&self, _micros: u32) {}
    }

    struct FakeBus {
        readings: std::vec::Vec<Result<u32>>,
        idx: Cell<usize>,
    }

    impl RtcBus for FakeBus {
        fn read_epoch_seconds(&mut self) -> Result<u32> {
            let i = self.idx.get();
            self.idx.set(i + 1);
            self.readings[i.min(self.readings.len() - 1)]
        }
        fn write_epoch_seconds(&mut self, _seconds: u32) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn clamps_monotonic_even_if_hardware_goes_backward() {
        let bus = FakeBus {
            readings: std::vec![Ok(1_000), Ok(500)],
            idx: Cell::new(0),
        };
        let mut wc: WallClock<_, u32, 4> = WallClock::new(bus);
        let ticks: TickSource<FakeHw> = TickSource::new(FakeHw);

        wc.tick(&ticks, |_, _| {});
        assert_eq!(wc.current_seconds().unwrap(), 1_000);

        wc.tick(&ticks, |_, _| {});
        assert_eq!(wc.current_seconds().unwrap(), 1_000);
    }

    #[test]
    fn read_fault_holds_last_value_and_reports_not_found_before_first_sync() {
        let bus = FakeBus {
            readings: std::vec![Err(Error::InvalidHandle)],
            idx: Cell::new(0),
        };
        let mut wc: WallClock<_, u32, 4> = WallClock::new(bus);
        let ticks: TickSource<FakeHw> = TickSource::new(FakeHw);
        wc.tick(&ticks, |_, _| {});
        assert_eq!(wc.current_seconds().unwrap_err(), Error::NotFound);
    }

    #[test]
    fn fires_minute_edge_to_subscribed_client_only() {
        let bus = FakeBus {
            readings: std::vec![Ok(0), Ok(60)],
            idx: Cell::new(0),
        };
        let mut wc: WallClock<_, u32, 4> = WallClock::new(bus);
        let ticks: TickSource<FakeHw> = TickSource::new(FakeHw);
        wc.add_client(Edge::Minute, 42).unwrap();
        wc.add_client(Edge::Hour, 99).unwrap();

        wc.tick(&ticks, |_, _| {});

        let mut fired = std::vec::Vec::new();
        wc.tick(&ticks, |s, e| fired.push((s, e)));
        assert_eq!(fired, std::vec![(42, Edge::Minute)]);
    }

    #[test]
    fn reads_the_hardware_on_every_poll_without_a_gating_state() {
        // Each poll advances the fake bus reading by one second; with no
        // external hook needed (unlike the old resync-gated path), every
        // `tick` call should observe the hardware's current value.
        let bus = FakeBus {
            readings: std::vec![Ok(0), Ok(1), Ok(2), Ok(3)],
            idx: Cell::new(0),
        };
        let mut wc: WallClock<_, u32, 4> = WallClock::new(bus);
        let ticks: TickSource<FakeHw> = TickSource::new(FakeHw);

        for expected in 0..4u32 {
            wc.tick(&ticks, |_, _| {});
            assert_eq!(wc.current_seconds().unwrap(), expected);
        }
    }
}

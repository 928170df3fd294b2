//! C1: the free-running millisecond tick counter every other module times
//! against. Replaces the original firmware's 5-byte, interrupt-incremented
//! counter and its read-side retry loop (`TMR_CurrentTicks`'s "re-read
//! byte 1 if it changed under us" protocol) with a single lock-free atomic
//! word.
//!
//! The counter is still bounded, and still fatal on overflow: the original
//! panics the whole firmware rather than silently wrapping a timestamp that
//! every debounce and rollover decision depends on, and this keeps that
//! contract.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::Ordering;
use portable_atomic::AtomicU64;
use ringbuf::{ringbuf, ringbuf_entry};

/// Ticks are bounded to 48 bits, one more byte than the original's 40-bit
/// counter, generous enough that no real deployment reaches it; the bound
/// exists so overflow is a deliberate, tested, fatal path rather than a
/// silent wrap two hundred years from boot.
const MAX_TICKS: u64 = (1u64 << 48) - 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Trace {
    None,
    Advanced(u32),
    Overflow,
}

ringbuf!(Trace, 32, Trace::None);

/// A point on the tick counter's timeline: either a reading of `now()` or a
/// deadline computed from one. `NEVER` and `EXPIRED` are the two sentinels
/// the original represents by setting every timer byte to `0xFF` or `0x00`
/// respectively.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Ticks(u64);

impl Ticks {
    /// A deadline that has already passed, whenever it is checked.
    pub const EXPIRED: Ticks = Ticks(0);
    /// A deadline that never expires.
    pub const NEVER: Ticks = Ticks(MAX_TICKS);

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// How long ago `self` was, relative to `now`. Saturates to zero if
    /// `self` is actually in the future (a caller comparing against a stale
    /// reading), matching `TMR_TimeStampAge`'s defensive clamp.
    pub fn age(self, now: Ticks) -> u64 {
        now.0.saturating_sub(self.0)
    }
}

/// The hardware seam for sub-millisecond busy-waits (`TMR_MicroDelay` in
/// the original), kept separate from the tick counter itself: advancing
/// the millisecond counter is interrupt-driven, but a microsecond delay
/// spins on a free-running hardware counter that rolls under, not over.
pub trait SubTickHardware {
    /// Busy-waits for approximately `micros` microseconds.
    fn spin_micros(&self, micros: u32);
}

/// The tick source. One instance per firmware image; `advance_ms` is called
/// from the millisecond timer interrupt, every other method is callable
/// from any context.
pub struct TickSource<H> {
    ticks_ms: AtomicU64,
    hw: H,
}

impl<H: SubTickHardware> TickSource<H> {
    pub fn new(hw: H) -> Self {
        TickSource {
            ticks_ms: AtomicU64::new(0),
            hw,
        }
    }

    /// Advances the counter by `ms` milliseconds. Called from the tick
    /// interrupt. Fatal if the counter would exceed [`MAX_TICKS`]: every
    /// timestamp and debounce window in the system assumes monotonic,
    /// unbounded-looking time, and a wrap would silently reorder events.
    pub fn advance_ms(&self, ms: u32) {
        let updated = self.ticks_ms.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
            let next = prev.checked_add(ms as u64)?;
            (next <= MAX_TICKS).then_some(next)
        });
        if updated.is_err() {
            ringbuf_entry!(Trace::Overflow);
            panic!("tick counter overflow");
        }
        ringbuf_entry!(Trace::Advanced(ms));
    }

    /// The current reading of the tick counter.
    pub fn now(&self) -> Ticks {
        Ticks(self.ticks_ms.load(Ordering::SeqCst))
    }

    /// A deadline `duration_ms` from now. Saturates at [`Ticks::NEVER`]
    /// rather than wrapping, matching `TMR_SetTimeout`'s carry-into-short
    /// arithmetic never being allowed to roll the deadline backward.
    pub fn set_timeout(&self, duration_ms: u32) -> Ticks {
        Ticks(self.now().0.saturating_add(duration_ms as u64).min(MAX_TICKS))
    }

    /// Pushes an existing deadline `duration_ms` further out, as
    /// `TMR_PostponeTimeout` does for a debounce window that keeps getting
    /// re-armed by fresh pulses.
    pub fn postpone(&self, deadline: Ticks, duration_ms: u32) -> Ticks {
        Ticks(deadline.0.saturating_add(duration_ms as u64).min(MAX_TICKS))
    }

    /// Whether `deadline` has passed. `Ticks::NEVER` never expires;
    /// `Ticks::EXPIRED` always has.
    pub fn expired(&self, deadline: Ticks) -> bool {
        if deadline == Ticks::NEVER {
            return false;
        }
        self.now().0 >= deadline.0
    }

    /// Busy-waits for approximately `micros` microseconds.
    pub fn micro_delay(&self, micros: u32) {
        self.hw.spin_micros(micros);
    }

    /// Busy-waits for `ms` milliseconds, built on [`Self::micro_delay`].
    pub fn delay_ms(&self, ms: u32) {
        for _ in 0..ms {
            self.hw.spin_micros(1000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeHw {
        spins: Cell<u32>,
    }

    impl SubTickHardware for FakeHw {
        fn spin_micros(&self, _micros: u32) {
            self.spins.set(self.spins.get() + 1);
        }
    }

    fn source() -> TickSource<FakeHw> {
        TickSource::new(FakeHw { spins: Cell::new(0) })
    }

    #[test]
    fn now_advances_with_ticks() {
        let ts = source();
        assert_eq!(ts.now(), Ticks::EXPIRED);
        ts.advance_ms(10);
        ts.advance_ms(5);
        assert_eq!(ts.now().as_millis(), 15);
    }

    #[test]
    fn timeout_expires_after_duration() {
        let ts = source();
        let deadline = ts.set_timeout(100);
        assert!(!ts.expired(deadline));
        ts.advance_ms(99);
        assert!(!ts.expired(deadline));
        ts.advance_ms(1);
        assert!(ts.expired(deadline));
    }

    #[test]
    fn postpone_pushes_deadline_further_out() {
        let ts = source();
        let deadline = ts.set_timeout(50);
        ts.advance_ms(40);
        let postponed = ts.postpone(deadline, 50);
        assert!(!ts.expired(postponed));
        ts.advance_ms(50);
        assert!(!ts.expired(postponed));
        ts.advance_ms(10);
        assert!(ts.expired(postponed));
    }

    #[test]
    fn never_never_expires() {
        let ts = source();
        ts.advance_ms(1_000_000);
        assert!(!ts.expired(Ticks::NEVER));
    }

    #[test]
    fn expired_sentinel_is_always_due() {
        let ts = source();
        assert!(ts.expired(Ticks::EXPIRED));
    }

    #[test]
    fn age_is_saturating() {
        let ts = source();
        ts.advance_ms(10);
        let stamp = ts.now();
        ts.advance_ms(5);
        assert_eq!(stamp.age(ts.now()), 5);
        assert_eq!(ts.now().age(stamp), 0);
    }

    #[test]
    #[should_panic(expected = "tick counter overflow")]
    fn overflow_is_fatal() {
        let ts = TickSource {
            ticks_ms: AtomicU64::new(MAX_TICKS - 5),
            hw: FakeHw { spins: Cell::new(0) },
        };
        ts.advance_ms(10);
    }

    #[test]
    fn micro_delay_spins_hardware_counter() {
        let ts = source();
        ts.micro_delay(5);
        ts.hw.spin_micros(0);
        assert_eq!(ts.hw.spins.get(), 2);
    }
}

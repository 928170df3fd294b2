//! The publish/subscribe capability every producer crate (`pulse-handler`,
//! `bucket-memory`, `wall-clock`) uses in place of the original firmware's
//! "fixed array of subscriber PIDs, looped over at fire time, posted to by
//! task-to-task IPC". A producer owns one `EventBus<S, N>` per event it
//! fires; `S` is a small `Copy` subscriber identity (commonly a
//! `metermaid_abi::Handle<T>`). Dispatch itself, how to actually reach the
//! thing `S` identifies, is left to the caller of [`EventBus::publish`],
//! since that's the one place that knows which arena `S` indexes into.

#![cfg_attr(not(test), no_std)]

use metermaid_abi::Error;

/// A subscriber that can be notified of an event `E` directly, for the
/// simpler case where the subscriber's own state lives inline (no external
/// arena lookup needed).
pub trait Notify<E> {
    fn notify(&mut self, event: E);
}

/// A fixed-capacity subscriber list. `N` mirrors the original firmware's
/// per-module `_MAX_EVENTS` constant (5 for PulseHandler and BucketMemory
/// clients, 15 for WallClock).
pub struct EventBus<S, const N: usize> {
    subscribers: [Option<S>; N],
}

impl<S: Copy, const N: usize> EventBus<S, N> {
    pub const fn new() -> Self {
        EventBus {
            subscribers: [None; N],
        }
    }

    /// Registers `subscriber` in the first free slot.
    pub fn subscribe(&mut self, subscriber: S) -> Result<(), Error> {
        for slot in self.subscribers.iter_mut() {
            if slot.is_none() {
                *slot = Some(subscriber);
                return Ok(());
            }
        }
        Err(Error::NoFreeSlot)
    }

    pub fn len(&self) -> usize {
        self.subscribers.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes `dispatch` once per live subscriber, in subscription order.
    /// `dispatch` is where the caller turns `S` into an actual notification
    /// (e.g. looking `S` up in its own arena and calling a method on it).
    pub fn publish<E: Copy>(&self, event: E, mut dispatch: impl FnMut(S, E)) {
        for subscriber in self.subscribers.iter().flatten() {
            dispatch(*subscriber, event);
        }
    }
}

impl<S: Copy + PartialEq, const N: usize> EventBus<S, N> {
    /// Removes the first slot matching `subscriber`. Fails with `NotFound`
    /// if it isn't registered, matching the original's
    /// `PHD_RemoveClient`/`BMM_RemoveClient` behavior.
    pub fn unsubscribe(&mut self, subscriber: S) -> Result<(), Error> {
        for slot in self.subscribers.iter_mut() {
            if *slot == Some(subscriber) {
                *slot = None;
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }
}

impl<S: Notify<E> + Copy, const N: usize> EventBus<S, N> {
    /// Notifies every subscriber in place, for the case where `S` holds its
    /// own state rather than naming an external arena slot.
    pub fn notify_all<E: Copy>(&mut self, event: E) {
        for subscriber in self.subscribers.iter_mut().flatten() {
            subscriber.notify(event);
        }
    }
}

impl<S: Copy, const N: usize> Default for EventBus<S, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_and_publish_dispatches_to_all() {
        let mut bus: EventBus<u32, 3> = EventBus::new();
        bus.subscribe(10).unwrap();
        bus.subscribe(20).unwrap();

        let mut seen = std::vec::Vec::new();
        bus.publish(7u32, |id, event| seen.push((id, event)));
        assert_eq!(seen, std::vec![(10, 7), (20, 7)]);
    }

    #[test]
    fn no_free_slot_once_full() {
        let mut bus: EventBus<u32, 2> = EventBus::new();
        bus.subscribe(1).unwrap();
        bus.subscribe(2).unwrap();
        assert_eq!(bus.subscribe(3).unwrap_err(), Error::NoFreeSlot);
    }

    #[test]
    fn unsubscribe_missing_is_not_found() {
        let mut bus: EventBus<u32, 2> = EventBus::new();
        bus.subscribe(1).unwrap();
        assert_eq!(bus.unsubscribe(99).unwrap_err(), Error::NotFound);
        bus.unsubscribe(1).unwrap();
        assert!(bus.is_empty());
    }

    #[derive(Copy, Clone)]
    struct Counter {
        total: u32,
    }

    impl Notify<u32> for Counter {
        fn notify(&mut self, event: u32) {
            self.total += event;
        }
    }

    #[test]
    fn notify_all_mutates_inline_subscriber_state() {
        let mut bus: EventBus<Counter, 1> = EventBus::new();
        bus.subscribe(Counter { total: 0 }).unwrap();
        bus.notify_all(5u32);
        bus.notify_all(2u32);

        let mut total = 0;
        bus.publish(0u32, |c, _| total = c.total);
        assert_eq!(total, 7);
    }
}

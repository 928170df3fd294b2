//! Shared types for the MeterMaid core: the status/error kind every public
//! operation returns, the wire-level error codes retained for consumer
//! compatibility (spec section 6), the generational handle/arena pair that
//! replaces the original firmware's `void*` + magic-signature instances, and
//! the `Bucket` wire record shared by `drv-bucket-memory` and its consumers.

#![cfg_attr(not(test), no_std)]

use core::marker::PhantomData;
use unwrap_lite::UnwrapLite;
use zerocopy::{AsBytes, FromBytes};

/// Status returned by every public operation. No panics cross a public call
/// boundary except the two documented fatal paths (tick-counter overflow,
/// `max_ppm == 0` at construction).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Null handle-out, zero capacity, out-of-range index.
    InvalidArgument,
    /// A storage allocation failed (arena full at construction time).
    OutOfMemory,
    /// Signature/generation mismatch on a public op: use-after-destroy.
    InvalidHandle,
    /// A worker task could not be started.
    WorkerStartFailed,
    /// A subscriber array has no empty slot.
    NoFreeSlot,
    /// A subscriber removal target is not registered.
    NotFound,
    /// A singleton subsystem (WallClock) was initialized twice.
    DoubleInit,
}

impl Error {
    /// The wire-level status code retained for consumer compatibility, per
    /// spec section 6. Note `OutOfMemory` and `DoubleInit` share `-2`, as in
    /// the original firmware (WallClock's second-init error reuses
    /// `ERR_MEMORY`'s numeric value).
    pub const fn wire_code(self) -> i32 {
        match self {
            Error::InvalidArgument => -1,
            Error::OutOfMemory => -2,
            Error::InvalidHandle => -3,
            Error::WorkerStartFailed => -4,
            Error::NoFreeSlot => -5,
            Error::NotFound => -6,
            Error::DoubleInit => -2,
        }
    }
}

pub const OK: i32 = 0;

pub type Result<T> = core::result::Result<T, Error>;

/// A `(count, timestamp)` accumulator bucket. Fixed-size value record so it
/// can be copied into a caller-supplied slot by `get`/`BMM_GetBucketCont`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default, AsBytes, FromBytes)]
#[repr(C)]
pub struct Bucket {
    /// Sum of pulses observed while this bucket was the head.
    pub count: u32,
    /// Wall-clock second at which this bucket became the head.
    pub timestamp_secs: u32,
}

impl Bucket {
    pub const fn new(timestamp_secs: u32) -> Self {
        Bucket {
            count: 0,
            timestamp_secs,
        }
    }
}

/// A type-safe reference to a slot in an [`Arena`]. Carries the slot's
/// generation at creation time; a handle whose generation no longer matches
/// the slot's current generation is stale (the slot was destroyed and,
/// possibly, reused) and every arena operation rejects it with
/// `Error::InvalidHandle`.
///
/// This is the replacement for the original firmware's `u24_signature`
/// probe: the signature word becomes part of the type system's job instead
/// of a runtime constant compared on every call.
pub struct Handle<T> {
    index: u16,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Handle<T> {}
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Eq for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> core::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// A fixed-capacity, generation-checked arena. Construction of a stateful
/// instance (`PulseHandler`, `BucketMemory`) allocates a slot here; teardown
/// frees it and bumps its generation so any handle still held by a
/// misbehaving caller is detectably stale.
pub struct Arena<T, const N: usize> {
    slots: [Slot<T>; N],
}

impl<T, const N: usize> Arena<T, N> {
    pub fn new() -> Self {
        Arena {
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                value: None,
            }),
        }
    }

    /// Allocates a slot for `value` and returns a handle to it.
    /// Fails with `OutOfMemory` if every slot is occupied.
    pub fn create(&mut self, value: T) -> Result<Handle<T>> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                slot.value = Some(value);
                return Ok(Handle {
                    index: index as u16,
                    generation: slot.generation,
                    _marker: PhantomData,
                });
            }
        }
        Err(Error::OutOfMemory)
    }

    /// Frees the slot referenced by `handle` and returns its value,
    /// bumping the slot's generation so stale handles are rejected from
    /// here on.
    pub fn destroy(&mut self, handle: Handle<T>) -> Result<T> {
        let slot = self.slot_mut(handle)?;
        let value = slot.value.take().unwrap_lite();
        slot.generation = slot.generation.wrapping_add(1);
        Ok(value)
    }

    pub fn get(&self, handle: Handle<T>) -> Result<&T> {
        let slot = self
            .slots
            .get(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation {
            return Err(Error::InvalidHandle);
        }
        slot.value.as_ref().ok_or(Error::InvalidHandle)
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Result<&mut T> {
        let slot = self.slot_mut(handle)?;
        Ok(slot.value.as_mut().unwrap_lite())
    }

    fn slot_mut(&mut self, handle: Handle<T>) -> Result<&mut Slot<T>> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .ok_or(Error::InvalidHandle)?;
        if slot.generation != handle.generation || slot.value.is_none() {
            return Err(Error::InvalidHandle);
        }
        Ok(slot)
    }
}

impl<T, const N: usize> Default for Arena<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

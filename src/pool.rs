// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The descriptor pool: two free-lists over peripheral RAM, plus fair-refill bookkeeping.
//!
//! Grounded on `spinal_udc_ram_init`/`spinal_udc_ep_desc_refill`/`spinal_udc_ep_desc_free` in
//! `original_source/services/usb-test/src/spinal_udc.c`.

use alloc::vec::Vec;

use crate::descriptor::{Class, DescIdx, Descriptor, Owner};
use crate::list::{ListHead, Which};
use crate::mmio::{DESC_HEADER_SIZE, DESC_LARGE_COUNT, RAM_ALIGN, RAM_EP0_SETUP_REGION, RAM_SCRATCH};

/// The two free-lists of [`Descriptor`]s, plus the fairness state that decides which starved
/// endpoint gets first refusal of the next descriptor returned to the pool.
///
/// `refill_queue`/`refill_robin` live here rather than on `Device` (SPEC_FULL.md §9): both are
/// read and written exclusively by [`Pool::take`] and [`Pool::give`].
pub struct Pool {
    arena: Vec<Descriptor>,
    small_free: ListHead,
    large_free: ListHead,
    /// Bit `n` set means endpoint `n` is waiting on a descriptor becoming available.
    refill_queue: u16,
    /// Round-robin cursor over non-EP0 waiters in `refill_queue`.
    refill_robin: u8,
}

impl Pool {
    /// Builds the pool's arena from the peripheral's reported address width (`1 << width`
    /// bytes of RAM), in the exact slot order `spinal_udc_ram_init` lays them out in: an 8-byte
    /// scratch region, the EP0 SETUP-descriptor region (never allocated as a pool descriptor),
    /// [`DESC_LARGE_COUNT`] large slots, then as many small slots as remain.
    pub fn new(address_width: u32) -> Pool {
        let mut left: i64 = 1i64 << address_width;
        let mut offset: u32 = 0;

        left -= i64::from(RAM_SCRATCH);
        offset += RAM_SCRATCH;

        left -= i64::from(RAM_EP0_SETUP_REGION);
        offset += RAM_EP0_SETUP_REGION;

        let mut arena = Vec::new();
        let mut large_free = ListHead::default();
        for _ in 0..DESC_LARGE_COUNT {
            let (idx, consumed) = Self::carve(&mut arena, &mut offset, Class::Large);
            large_free.push_back(&mut arena, Which::Owner, idx);
            left -= i64::from(consumed);
        }

        let mut small_free = ListHead::default();
        loop {
            let pad = Self::pad_to_align(offset);
            let needed = i64::from(pad) + i64::from(DESC_HEADER_SIZE) + i64::from(Class::Small.reserved());
            if left < needed {
                break;
            }
            let (idx, consumed) = Self::carve(&mut arena, &mut offset, Class::Small);
            small_free.push_back(&mut arena, Which::Owner, idx);
            left -= i64::from(consumed);
        }

        Pool {
            arena,
            small_free,
            large_free,
            refill_queue: 0,
            refill_robin: 0,
        }
    }

    fn pad_to_align(offset: u32) -> u32 {
        (RAM_ALIGN - (offset % RAM_ALIGN)) % RAM_ALIGN
    }

    /// Pushes one new descriptor of `class` at the next 16-byte-aligned offset, advances
    /// `offset` past it, and returns its index plus the total bytes consumed (including
    /// alignment padding), for the caller to subtract from its running `left` budget.
    fn carve(arena: &mut Vec<Descriptor>, offset: &mut u32, class: Class) -> (DescIdx, u32) {
        let pad = Self::pad_to_align(*offset);
        *offset += pad;
        let base = *offset;
        let idx = arena.len() as DescIdx;
        arena.push(Descriptor::new(base, class));
        let slot = DESC_HEADER_SIZE + class.reserved();
        *offset += slot;
        (idx, pad + slot)
    }

    pub fn descriptor(&self, idx: DescIdx) -> &Descriptor {
        &self.arena[usize::from(idx)]
    }

    pub fn descriptor_mut(&mut self, idx: DescIdx) -> &mut Descriptor {
        &mut self.arena[usize::from(idx)]
    }

    pub(crate) fn arena_mut(&mut self) -> &mut [Descriptor] {
        &mut self.arena
    }

    /// Takes a descriptor able to carry at least (up to) `size_hint` bytes, preferring the large
    /// pool once `size_hint` reaches a large descriptor's capacity. Endpoints other than EP0
    /// (`ep_number != 0`) can never take the last remaining small descriptor.
    pub fn take(&mut self, size_hint: u32, ep_number: u8) -> Option<DescIdx> {
        if size_hint >= Class::Large.capacity() && !self.large_free.is_empty() {
            let idx = self.large_free.pop_front(&mut self.arena, Which::Owner).unwrap();
            self.arena[usize::from(idx)].owner = Owner::InFlight {
                ep: ep_number,
                req: 0,
            };
            return Some(idx);
        }
        if !self.small_free.is_empty() && (ep_number == 0 || self.small_free.len() > 1) {
            let idx = self.small_free.pop_front(&mut self.arena, Which::Owner).unwrap();
            self.arena[usize::from(idx)].owner = Owner::InFlight {
                ep: ep_number,
                req: 0,
            };
            return Some(idx);
        }
        None
    }

    /// Returns `idx` to its origin free-list, then picks the next starved endpoint to refill (if
    /// any), per the fairness rule: EP0 wins unconditionally if waiting, else round-robin over
    /// the remaining waiters starting at `refill_robin`.
    ///
    /// The picked bit is deliberately *not* cleared here (see SPEC_FULL.md §9): it mirrors
    /// `spinal_udc_ep_desc_free` exactly, which only clears the whole mask on reset.
    pub fn give(&mut self, idx: DescIdx) -> Option<u8> {
        let class = self.arena[usize::from(idx)].class;
        self.arena[usize::from(idx)].owner = Owner::Free;
        match class {
            Class::Small => self.small_free.push_back(&mut self.arena, Which::Owner, idx),
            Class::Large => self.large_free.push_back(&mut self.arena, Which::Owner, idx),
        }

        if self.refill_queue == 0 {
            return None;
        }
        let winner = if self.refill_queue & 1 != 0 {
            0
        } else {
            let mut w = self.refill_robin & 0xF;
            while self.refill_queue & (1 << w) == 0 {
                w = (w + 1) & 0xF;
            }
            self.refill_robin = (w + 1) & 0xF;
            w
        };
        Some(winner)
    }

    /// Marks endpoint `ep_number` as starved for a descriptor. The caller (the refill loop) is
    /// responsible for only calling this when that endpoint's in-flight list is empty, per
    /// invariant 7.
    pub fn set_refill_waiting(&mut self, ep_number: u8) {
        self.refill_queue |= 1 << ep_number;
    }

    /// Clears all fairness state. Called on controller stop/reset.
    pub fn reset_refill(&mut self) {
        self.refill_queue = 0;
        self.refill_robin = 0;
    }

    #[cfg(test)]
    pub(crate) fn refill_queue(&self) -> u16 {
        self.refill_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_take_and_give() {
        let mut pool = Pool::new(13);
        let large = pool.take(512, 1).expect("large descriptor available");
        assert_eq!(pool.descriptor(large).class, Class::Large);
        assert!(pool.give(large).is_none());

        let small = pool.take(10, 1).expect("small descriptor available");
        assert_eq!(pool.descriptor(small).class, Class::Small);
        assert!(pool.give(small).is_none());
    }

    #[test]
    fn last_small_descriptor_reserved_for_ep0() {
        let mut pool = Pool::new(13);
        // Drain every large descriptor so `take` falls through to small.
        let mut taken = Vec::new();
        while let Some(idx) = pool.take(512, 0) {
            taken.push(idx);
        }
        // Drain all but one small descriptor.
        let mut smalls = Vec::new();
        loop {
            match pool.take(10, 5) {
                Some(idx) => smalls.push(idx),
                None => break,
            }
        }
        // Exactly one small descriptor remains, reserved for EP0.
        assert!(pool.take(10, 5).is_none());
        assert!(pool.take(10, 0).is_some());
    }

    #[test]
    fn give_picks_ep0_first_then_round_robins() {
        let mut pool = Pool::new(13);
        let a = pool.take(512, 1).unwrap();
        pool.set_refill_waiting(2);
        pool.set_refill_waiting(0);
        assert_eq!(pool.give(a), Some(0));

        let b = pool.take(512, 1).unwrap();
        // EP0's bit is still set (never cleared), so it wins again.
        assert_eq!(pool.give(b), Some(0));
    }
}

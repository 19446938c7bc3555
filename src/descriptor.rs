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

//! Descriptor records: the arena-indexed replacement for the original's intrusive list nodes.

use crate::list::{Link, Which};
use crate::mmio::{DESC_GUARD, DESC_LARGE_PAYLOAD, DESC_SMALL_PAYLOAD};

/// Index of a [`Descriptor`] within [`crate::pool::Pool`]'s arena.
///
/// The hardware's own descriptor RAM is at most a few KiB, so `u16` is ample and keeps every
/// list-node field compact.
pub type DescIdx = u16;

/// Which free-list a descriptor was carved from, and therefore how much payload it can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Small,
    Large,
}

impl Class {
    /// Usable payload capacity, in bytes (excludes the header and the guard word).
    pub fn capacity(self) -> u32 {
        match self {
            Class::Small => DESC_SMALL_PAYLOAD,
            Class::Large => DESC_LARGE_PAYLOAD,
        }
    }

    /// Total peripheral-RAM footprint including the guard word (not the header, which is
    /// accounted for separately since it is fixed-size across both classes).
    pub fn reserved(self) -> u32 {
        self.capacity() + DESC_GUARD
    }
}

/// Who currently owns a descriptor.
///
/// Mirrors SPEC_FULL.md §9's REDESIGN FLAG directly: the original's "on the free list" vs. "on
/// an endpoint's in-flight list and a request's descriptor list" duality becomes this tagged
/// variant instead of two bare intrusive-list memberships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Sitting in its class's free-list, not in use.
    Free,
    /// Carrying bytes for `req` on endpoint `ep`.
    InFlight { ep: u8, req: u32 },
}

/// One hardware descriptor record.
///
/// The `offset`/`base` byte address is the descriptor's fixed location in peripheral RAM,
/// computed once at [`crate::pool::Pool::new`] and never changed thereafter; `length_deployed`/
/// `offset_in_payload`/`req_completion` are working state rewritten on every refill pass.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Fixed byte offset of this descriptor's header within peripheral RAM.
    pub base: u32,
    pub class: Class,
    pub owner: Owner,
    /// Byte offset within the descriptor's payload area where data begins this pass; absorbs
    /// the low two bits of a misaligned user buffer (SPEC_FULL.md §4.5 step 3).
    pub offset: u16,
    /// Bytes carried this pass.
    pub length_deployed: u32,
    /// True if this descriptor carries the last bytes of its request.
    pub req_completion: bool,

    owner_link: Link,
    request_link: Link,
}

impl Descriptor {
    pub(crate) fn new(base: u32, class: Class) -> Descriptor {
        Descriptor {
            base,
            class,
            owner: Owner::Free,
            offset: 0,
            length_deployed: 0,
            req_completion: false,
            owner_link: Link::default(),
            request_link: Link::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: u32, class: Class) -> Descriptor {
        Descriptor::new(base, class)
    }

    pub(crate) fn link(&self, which: Which) -> Link {
        match which {
            Which::Owner => self.owner_link,
            Which::Request => self.request_link,
        }
    }

    pub(crate) fn link_mut(&mut self, which: Which) -> &mut Link {
        match which {
            Which::Owner => &mut self.owner_link,
            Which::Request => &mut self.request_link,
        }
    }
}

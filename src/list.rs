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

//! Arena-indexed doubly-linked lists.
//!
//! The original driver builds its descriptor bookkeeping out of intrusive doubly-linked lists:
//! a descriptor lives simultaneously on an endpoint's in-flight list and on the list of
//! descriptors belonging to one request. Rust has no intrusive-list primitive that doesn't
//! fight the borrow checker, so descriptors instead live in one arena (a `Vec`) addressed by a
//! small integer handle, and each record carries two independent link pairs managed through
//! this module — one per list it can simultaneously belong to.

use crate::descriptor::{DescIdx, Descriptor};

/// One (prev, next) pair. A descriptor carries one of these per list it can belong to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<DescIdx>,
    pub next: Option<DescIdx>,
}

/// Selects which of a descriptor's two link pairs an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    /// The list tracking the descriptor's current owner (a free-list, or one endpoint's
    /// in-flight list).
    Owner,
    /// The list of descriptors belonging to one in-flight request.
    Request,
}

/// Head/tail bookkeeping for one doubly-linked list threaded through an arena of descriptors.
///
/// Every mutating method takes the arena explicitly rather than owning it, since the same arena
/// is shared by many `ListHead`s (one pool free-list, sixteen endpoint in-flight lists, and one
/// descriptor list per in-flight request).
#[derive(Debug, Clone, Copy, Default)]
pub struct ListHead {
    head: Option<DescIdx>,
    tail: Option<DescIdx>,
    len: u32,
}

impl ListHead {
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn front(&self) -> Option<DescIdx> {
        self.head
    }

    pub fn back(&self) -> Option<DescIdx> {
        self.tail
    }

    fn link(arena: &[Descriptor], which: Which, idx: DescIdx) -> Link {
        arena[usize::from(idx)].link(which)
    }

    fn link_mut(arena: &mut [Descriptor], which: Which, idx: DescIdx) -> &mut Link {
        arena[usize::from(idx)].link_mut(which)
    }

    /// Appends `idx` to the tail of this list. `idx` must not already be linked on this list.
    pub fn push_back(&mut self, arena: &mut [Descriptor], which: Which, idx: DescIdx) {
        *Self::link_mut(arena, which, idx) = Link {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => Self::link_mut(arena, which, tail).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Removes and returns the list's head element, if any.
    pub fn pop_front(&mut self, arena: &mut [Descriptor], which: Which) -> Option<DescIdx> {
        let idx = self.head?;
        self.remove(arena, which, idx);
        Some(idx)
    }

    /// Removes `idx` from this list. `idx` must currently be linked on this list.
    pub fn remove(&mut self, arena: &mut [Descriptor], which: Which, idx: DescIdx) {
        let Link { prev, next } = Self::link(arena, which, idx);
        match prev {
            Some(p) => Self::link_mut(arena, which, p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => Self::link_mut(arena, which, n).prev = prev,
            None => self.tail = prev,
        }
        *Self::link_mut(arena, which, idx) = Link::default();
        self.len -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Class;

    fn arena_of(n: usize) -> alloc::vec::Vec<Descriptor> {
        (0..n)
            .map(|i| Descriptor::new_for_test(i as u32, Class::Small))
            .collect()
    }

    #[test]
    fn push_and_pop_front_is_fifo() {
        let mut arena = arena_of(3);
        let mut list = ListHead::default();
        list.push_back(&mut arena, Which::Owner, 0);
        list.push_back(&mut arena, Which::Owner, 1);
        list.push_back(&mut arena, Which::Owner, 2);
        assert_eq!(list.len(), 3);
        assert_eq!(list.pop_front(&mut arena, Which::Owner), Some(0));
        assert_eq!(list.pop_front(&mut arena, Which::Owner), Some(1));
        assert_eq!(list.pop_front(&mut arena, Which::Owner), Some(2));
        assert!(list.is_empty());
    }

    #[test]
    fn remove_middle_relinks_neighbours() {
        let mut arena = arena_of(3);
        let mut list = ListHead::default();
        list.push_back(&mut arena, Which::Owner, 0);
        list.push_back(&mut arena, Which::Owner, 1);
        list.push_back(&mut arena, Which::Owner, 2);
        list.remove(&mut arena, Which::Owner, 1);
        assert_eq!(list.len(), 2);
        assert_eq!(list.front(), Some(0));
        assert_eq!(list.back(), Some(2));
        assert_eq!(list.pop_front(&mut arena, Which::Owner), Some(0));
        assert_eq!(list.pop_front(&mut arena, Which::Owner), Some(2));
    }

    #[test]
    fn owner_and_request_links_are_independent() {
        let mut arena = arena_of(2);
        let mut owner = ListHead::default();
        let mut req = ListHead::default();
        owner.push_back(&mut arena, Which::Owner, 0);
        owner.push_back(&mut arena, Which::Owner, 1);
        req.push_back(&mut arena, Which::Request, 1);
        req.push_back(&mut arena, Which::Request, 0);
        assert_eq!(owner.front(), Some(0));
        assert_eq!(req.front(), Some(1));
    }
}

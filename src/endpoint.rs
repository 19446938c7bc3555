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

//! Per-endpoint configuration and queues.
//!
//! Grounded on `struct spinal_udc_ep` in `original_source/services/usb-test/src/spinal_udc.c`
//! and SPEC_FULL.md §3/§4.3. The register writes and FIFO/descriptor-list manipulation that act
//! on an [`Endpoint`] live in `engine.rs`/`device.rs`, which also own the sibling [`crate::pool::Pool`]
//! and [`crate::mmio::MmioAccess`] instances an endpoint's operations need; this module is just
//! the data and its own-field validation.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::error::{Error, Result};
use crate::list::ListHead;
use crate::mmio::EP_DESC_MAX;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Out,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

/// A validated endpoint configuration, parsed from a USB endpoint descriptor's
/// `bEndpointAddress`/`bmAttributes`/`wMaxPacketSize` (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub number: u8,
    pub direction: Direction,
    pub ty: EndpointType,
    pub max_packet: u16,
}

impl Config {
    /// Parses and validates a descriptor's three relevant fields. Rejects bulk endpoints whose
    /// max-packet isn't a power of two in `[8, 512]`, interrupt endpoints over 64 bytes, and
    /// control endpoints other than 0 (mirrors `__spinal_udc_ep_enable`'s switch on
    /// `bmAttributes & USB_ENDPOINT_XFERTYPE_MASK`).
    pub fn parse(b_endpoint_address: u8, bm_attributes: u8, w_max_packet_size: u16) -> Result<Config> {
        let number = b_endpoint_address & 0x0F;
        let direction = if b_endpoint_address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        let ty = match bm_attributes & 0x03 {
            0 => EndpointType::Control,
            1 => EndpointType::Isochronous,
            2 => EndpointType::Bulk,
            3 => EndpointType::Interrupt,
            _ => unreachable!(),
        };

        match ty {
            EndpointType::Control => return Err(Error::Invalid),
            EndpointType::Interrupt if w_max_packet_size > 64 => return Err(Error::Invalid),
            EndpointType::Bulk => {
                if !(8..=512).contains(&w_max_packet_size) || !w_max_packet_size.is_power_of_two() {
                    return Err(Error::Invalid);
                }
            }
            _ => {}
        }

        Ok(Config {
            number,
            direction,
            ty,
            max_packet: w_max_packet_size,
        })
    }
}

/// One of the controller's sixteen logical data pipes. Index 0 is always the control endpoint.
pub struct Endpoint {
    pub number: u8,
    pub direction: Direction,
    pub ty: EndpointType,
    pub max_packet: u16,
    pub enabled: bool,
    /// Requests not yet (fully) handed to hardware, FIFO order; index 0 is the oldest.
    pub(crate) pending: VecDeque<Box<Request>>,
    /// Descriptors currently linked into hardware on this endpoint's chain, in hardware order.
    pub(crate) inflight: ListHead,
    pub(crate) descriptor_count: u32,
    /// Number of requests queued but not yet completed (drives `-ESHUTDOWN`/teardown bookkeeping).
    pub(crate) pending_completion: u32,
}

impl Endpoint {
    pub(crate) fn new(number: u8) -> Endpoint {
        Endpoint {
            number,
            direction: Direction::Out,
            ty: EndpointType::Control,
            max_packet: if number == 0 { 64 } else { 0 },
            enabled: number == 0,
            pending: VecDeque::new(),
            inflight: ListHead::default(),
            descriptor_count: 0,
            pending_completion: 0,
        }
    }

    pub fn is_control(&self) -> bool {
        self.number == 0
    }

    pub fn is_in(&self) -> bool {
        self.direction == Direction::In
    }

    pub fn has_room_for_descriptor(&self) -> bool {
        (self.descriptor_count as usize) < EP_DESC_MAX
    }
}

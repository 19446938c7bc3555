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

//! USB 2.0 full-speed device-controller (UDC) driver core.
//!
//! This crate implements the transfer engine of a memory-mapped USB device-controller
//! peripheral: a descriptor-pool allocator over a fixed on-chip descriptor RAM, a per-endpoint
//! queue manager, and the control-endpoint (EP0) chapter-9 request state machine. It does not
//! probe hardware, register interrupts, or implement a gadget framework; [`gadget::Driver`] and
//! [`mmio::MmioAccess`] are the two seams a host-platform adapter binds to.

#![no_std]

extern crate alloc;

mod control;
mod descriptor;
pub mod device;
mod engine;
pub mod endpoint;
pub mod error;
pub mod gadget;
mod list;
pub mod mmio;
mod pool;
pub mod request;

pub use device::Device;
pub use error::{Error, Result, Status};
pub use request::Request;

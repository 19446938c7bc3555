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

//! The seam this crate binds to: chapter-9 SETUP packet decoding, and the `Driver` trait a
//! higher-level gadget framework implements to receive class/vendor requests and bus events.
//!
//! `SetupPacket`'s bit layout is the decode side of the teacher's (now-removed) host-side
//! `control_packets::Request` encoder: same three-bit direction/type/recipient packing in
//! `bRequestType`, read instead of written. `Driver` is grounded on SPEC_FULL.md §4.8's dispatch
//! table and §1's "exposes the trait surface... does not implement a framework" scope note.

use crate::device::Device;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ty {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

pub const GET_STATUS: u8 = 0x00;
pub const CLEAR_FEATURE: u8 = 0x01;
pub const SET_FEATURE: u8 = 0x03;
pub const SET_ADDRESS: u8 = 0x05;

pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 0x01;
pub const FEATURE_TEST_MODE: u16 = 0x02;

/// A decoded 8-byte SETUP packet, latched from `SETUP_LATCH_OFFSET` on a SETUP interrupt.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub direction: Direction,
    pub ty: Ty,
    pub recipient: Recipient,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn parse(raw: &[u8; 8]) -> SetupPacket {
        let bm_request_type = raw[0];
        let direction = if bm_request_type & 0x80 != 0 {
            Direction::DeviceToHost
        } else {
            Direction::HostToDevice
        };
        let ty = match (bm_request_type >> 5) & 0x03 {
            0 => Ty::Standard,
            1 => Ty::Class,
            2 => Ty::Vendor,
            _ => Ty::Reserved,
        };
        let recipient = match bm_request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            _ => Recipient::Other,
        };

        SetupPacket {
            direction,
            ty,
            recipient,
            b_request: raw[1],
            w_value: u16::from_le_bytes([raw[2], raw[3]]),
            w_index: u16::from_le_bytes([raw[4], raw[5]]),
            w_length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn is_standard(&self) -> bool {
        self.ty == Ty::Standard
    }
}

/// The gadget-framework interface this driver calls back into. Implemented externally; this
/// crate's `Device` is the only caller. All methods run with the device lock released.
pub trait Driver {
    /// A SETUP packet this core doesn't handle itself (anything but GET_STATUS/SET_ADDRESS/
    /// SET_FEATURE/CLEAR_FEATURE, or a class/vendor request). Returning `Err` stalls EP0.
    fn setup(&mut self, device: &Device, packet: &SetupPacket) -> Result<()>;

    /// The bus issued a RESET; every endpoint has already been nuked with `Error::Reset`.
    fn reset(&mut self, device: &Device);

    fn suspend(&mut self, device: &Device);

    fn resume(&mut self, device: &Device);

    /// The peripheral reports disconnection; every endpoint has already been nuked with
    /// `Error::Shutdown`.
    fn disconnect(&mut self, device: &Device);
}

impl Default for SetupPacket {
    fn default() -> SetupPacket {
        SetupPacket {
            direction: Direction::HostToDevice,
            ty: Ty::Standard,
            recipient: Recipient::Device,
            b_request: 0,
            w_value: 0,
            w_index: 0,
            w_length: 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_driver {
    use super::*;

    /// A `Driver` that accepts nothing, used by tests that only exercise in-core dispatch.
    pub(crate) struct NullDriver;

    impl Driver for NullDriver {
        fn setup(&mut self, _device: &Device, _packet: &SetupPacket) -> Result<()> {
            Err(crate::error::Error::Invalid)
        }

        fn reset(&mut self, _device: &Device) {}

        fn suspend(&mut self, _device: &Device) {}

        fn resume(&mut self, _device: &Device) {}

        fn disconnect(&mut self, _device: &Device) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_address_packet() {
        let raw = [0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00];
        let setup = SetupPacket::parse(&raw);
        assert_eq!(setup.direction, Direction::HostToDevice);
        assert_eq!(setup.ty, Ty::Standard);
        assert_eq!(setup.recipient, Recipient::Device);
        assert_eq!(setup.b_request, SET_ADDRESS);
        assert_eq!(setup.w_value, 5);
        assert_eq!(setup.w_length, 0);
    }

    #[test]
    fn parses_get_status_device_packet() {
        let raw = [0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00];
        let setup = SetupPacket::parse(&raw);
        assert_eq!(setup.direction, Direction::DeviceToHost);
        assert_eq!(setup.b_request, GET_STATUS);
        assert_eq!(setup.w_length, 2);
    }
}

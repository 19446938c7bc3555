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

//! The control-endpoint (EP0) request state machine: SETUP dispatch and the DATA/STATUS phase
//! transitions of SPEC_FULL.md §4.8.
//!
//! Grounded on `spinal_udc_setup_irq`, `__spinal_udc_ep0_queue`, `spinal_udc_ep0_data_completion`,
//! `spinal_udc_get_status`, `spinal_udc_set_clear_feature`, `spinal_udc_ep0_status` in
//! `original_source/services/usb-test/src/spinal_udc.c`. Where the original substitutes a new C
//! function pointer into the request's completion field to splice in the DATA→STATUS transition,
//! this module instead stashes the caller's completion on `Inner` (`ep0_saved_completion`, per
//! SPEC_FULL.md §3's data model) and reuses the ordinary completion path once the STATUS-phase
//! request is itself queued — no closure substitution needed for that half of the machine.

use alloc::boxed::Box;
use smallvec::SmallVec;

use crate::device::Inner;
use crate::endpoint::Direction as EpDirection;
use crate::engine;
use crate::error::{Error, Result, Status};
use crate::gadget::{self, SetupPacket};
use crate::mmio::{
    ep_reg_offset, ADDRESS_OFFSET, ADDRESS_PENDING, ADDRESS_VALUE_MASK, EP_HEAD_CLEAR_MASK,
    EP_PHASE, EP_STALL, INTERRUPT_OFFSET, INTERRUPT_SETUP, SETUP_LATCH_OFFSET,
};
use crate::request::{Request, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Ep0State {
    Data,
    Status,
}

/// What a SETUP dispatch decided to do with the request, once the request type is determined.
pub(crate) enum Dispatch {
    /// Handled in-core; nothing further to do.
    Handled,
    /// Handled in-core by stalling EP0.
    Stall,
    /// Not a request this core understands; forward to the gadget driver with the lock released.
    ToDriver,
}

/// The result of a SETUP interrupt: any requests nuked off the old transfer that must now be
/// completed (lock released), and what to do about the new SETUP packet.
pub(crate) struct SetupOutcome {
    pub(crate) completions: SmallVec<[Box<Request>; 2]>,
    pub(crate) dispatch: Dispatch,
    pub(crate) packet: SetupPacket,
}

/// Handles a SETUP interrupt (SPEC_FULL.md §4.8): latches the packet, nukes EP0, resets EP0
/// state, and dispatches standard requests handled in-core.
pub(crate) fn on_setup(inner: &mut Inner) -> SetupOutcome {
    let mut raw = [0u8; 8];
    for (i, b) in raw.iter_mut().enumerate() {
        *b = inner.mmio.read8(SETUP_LATCH_OFFSET + i as u32);
    }
    let packet = SetupPacket::parse(&raw);

    let nuked = engine::nuke_all(inner, 0, Err(Error::ConnReset));

    inner.ep0_state = Ep0State::Data;
    inner.ep0_saved_completion = None;
    inner.ep0_data_req = None;
    inner.setup = packet;
    inner.endpoints[0].direction = if packet.direction == gadget::Direction::DeviceToHost {
        EpDirection::In
    } else {
        EpDirection::Out
    };

    let dispatch = if packet.is_standard() {
        match packet.b_request {
            gadget::GET_STATUS if packet.direction == gadget::Direction::DeviceToHost => {
                handle_get_status(inner, &packet)
            }
            gadget::SET_ADDRESS
                if packet.direction == gadget::Direction::HostToDevice
                    && packet.recipient == gadget::Recipient::Device =>
            {
                handle_set_address(inner, &packet)
            }
            gadget::SET_FEATURE | gadget::CLEAR_FEATURE => handle_feature(inner, &packet),
            _ => Dispatch::ToDriver,
        }
    } else {
        Dispatch::ToDriver
    };

    SetupOutcome {
        completions: nuked,
        dispatch,
        packet,
    }
}

/// Re-reads the interrupt register before and after applying EP0's stall, per §4.4: a fresh
/// SETUP always wins over a stall issued in response to the packet it's superseding. Always
/// discards any still-queued descriptors (`throw_desc`) along with the stall: every call site in
/// the original driver that stalls EP0 directly does so with `throw_desc=1`.
pub(crate) fn stall_ep0(inner: &mut Inner) {
    if inner.mmio.read32(INTERRUPT_OFFSET) & INTERRUPT_SETUP != 0 {
        return;
    }
    inner.mmio.ep_status_mask(0, !EP_HEAD_CLEAR_MASK, EP_STALL);
    if inner.mmio.read32(INTERRUPT_OFFSET) & INTERRUPT_SETUP != 0 {
        inner.mmio.ep_status_mask(0, !EP_STALL, 0);
    }
}

fn handle_get_status(inner: &mut Inner, setup: &SetupPacket) -> Dispatch {
    let value: u16 = match setup.recipient {
        gadget::Recipient::Device => {
            let remote_wakeup = if inner.remote_wakeup { 1u16 << 1 } else { 0 };
            1u16 | remote_wakeup
        }
        gadget::Recipient::Interface => 0,
        gadget::Recipient::Endpoint => {
            let ep_number = (setup.w_index & 0x0F) as u8;
            if usize::from(ep_number) >= inner.endpoints.len() {
                return Dispatch::Stall;
            }
            if ep_number != 0 {
                let wants_in = setup.w_index & 0x80 != 0;
                if wants_in != inner.endpoints[usize::from(ep_number)].is_in() {
                    return Dispatch::Stall;
                }
            }
            let reg = inner.mmio.read32(ep_reg_offset(ep_number));
            u16::from(reg & EP_STALL != 0)
        }
        gadget::Recipient::Other => return Dispatch::Stall,
    };

    inner.ep0_scratch[0] = value as u8;
    inner.ep0_scratch[1] = (value >> 8) as u8;
    let buf_ptr = inner.ep0_scratch.as_mut_ptr();
    let req = Box::new(Request::new(buf_ptr, 2));
    queue_result_to_dispatch(ep0_queue(inner, req))
}

fn handle_set_address(inner: &mut Inner, setup: &SetupPacket) -> Dispatch {
    let address = u32::from(setup.w_value) & ADDRESS_VALUE_MASK;
    let reg = inner.mmio.read32(ADDRESS_OFFSET);
    inner.mmio.write32(
        ADDRESS_OFFSET,
        (reg & !(ADDRESS_PENDING | ADDRESS_VALUE_MASK)) | ADDRESS_PENDING | address,
    );

    let mut req = Box::new(Request::new(core::ptr::null_mut(), 0));
    req.completion = Some(Box::new(|device, _ep, completed| {
        device.ep0_set_address_completion(completed.status);
    }));
    queue_result_to_dispatch(ep0_queue(inner, req))
}

fn handle_feature(inner: &mut Inner, setup: &SetupPacket) -> Dispatch {
    let set = setup.b_request == gadget::SET_FEATURE;
    match setup.recipient {
        gadget::Recipient::Device => match setup.w_value {
            gadget::FEATURE_DEVICE_REMOTE_WAKEUP => inner.remote_wakeup = set,
            gadget::FEATURE_TEST_MODE => {}
            _ => return Dispatch::Stall,
        },
        gadget::Recipient::Endpoint if setup.w_value == gadget::FEATURE_ENDPOINT_HALT => {
            let ep_number = (setup.w_index & 0x0F) as u8;
            if usize::from(ep_number) >= inner.endpoints.len() {
                return Dispatch::Stall;
            }
            // Unlike GET_STATUS (which exempts EP0 from this check), `spinal_udc_set_clear_feature`
            // applies the direction check to every endpoint including 0; its `!target_ep` branch
            // only selects clear-only behavior below, it does not skip the check.
            let wants_in = setup.w_index & 0x80 != 0;
            if wants_in != inner.endpoints[usize::from(ep_number)].is_in() {
                return Dispatch::Stall;
            }
            if ep_number == 0 {
                if !set {
                    inner.mmio.ep_status_mask(0, !EP_STALL, 0);
                }
            } else if set {
                inner.mmio.ep_status_mask(ep_number, !0, EP_STALL);
            } else {
                inner.mmio.ep_status_mask(ep_number, !(EP_STALL | EP_PHASE), 0);
            }
        }
        _ => return Dispatch::Stall,
    }

    let req = Box::new(Request::new(core::ptr::null_mut(), 0));
    queue_result_to_dispatch(ep0_queue(inner, req))
}

fn queue_result_to_dispatch(result: Result<()>) -> Dispatch {
    match result {
        Ok(()) => Dispatch::Handled,
        Err(_) => Dispatch::Stall,
    }
}

/// `__spinal_udc_ep0_queue` (SPEC_FULL.md §4.8): single-outstanding, with the DATA→STATUS
/// splice for a fresh DATA-phase request. Reused verbatim to submit the STATUS-phase
/// zero-length request itself, since by then `ep0_state` already reads `Status`.
pub(crate) fn ep0_queue(inner: &mut Inner, mut req: Box<Request>) -> Result<RequestId> {
    if !inner.endpoints[0].pending.is_empty() {
        return Err(Error::Busy);
    }

    let id = inner.next_request_id();
    req.reset_for_queue(id);

    let is_data_phase = inner.ep0_state == Ep0State::Data;
    if is_data_phase {
        inner.ep0_saved_completion = req.completion.take();
        inner.ep0_state = Ep0State::Status;
        if req.length == 0 {
            data_phase_done(inner, Ok(()));
            return Ok(id);
        }
        // Remembers which queued request is the DATA phase itself (as opposed to the STATUS
        // phase's own zero-length request, queued later by `data_phase_done`), since by the time
        // it completes `ep0_state` has already moved on to `Status` for both and can no longer
        // tell them apart on its own (SPEC_FULL.md §3's "reference to the in-flight EP0 data
        // request").
        inner.ep0_data_req = Some(id);
    }
    inner.endpoints[0].pending.push_back(req);
    inner.endpoints[0].pending_completion += 1;
    engine::refill(inner, 0);
    Ok(id)
}

/// The DATA phase (or an immediately-synthesised zero-length one) finished. On success, flips
/// EP0's direction and queues the zero-length STATUS request carrying the caller's original
/// completion. On failure, returns a synthetic completed request wrapping the original
/// completion so the caller can invoke it immediately with the lock released — mirrors
/// `spinal_udc_ep0_data_completion`'s direct-invoke-on-error branch.
pub(crate) fn data_phase_done(inner: &mut Inner, status: Result<()>) -> Option<Box<Request>> {
    match status {
        Ok(()) => {
            flip_ep0_direction(inner);
            let mut status_req = Box::new(Request::new(core::ptr::null_mut(), 0));
            status_req.completion = inner.ep0_saved_completion.take();
            let _ = ep0_queue(inner, status_req);
            None
        }
        Err(e) => {
            let mut synthetic = Box::new(Request::new(core::ptr::null_mut(), 0));
            synthetic.completion = inner.ep0_saved_completion.take();
            synthetic.status = Status::Done(Err(e));
            Some(synthetic)
        }
    }
}

fn flip_ep0_direction(inner: &mut Inner) {
    let ep0 = &mut inner.endpoints[0];
    ep0.direction = match ep0.direction {
        EpDirection::In => EpDirection::Out,
        EpDirection::Out => EpDirection::In,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::gadget::test_driver::NullDriver;
    use crate::mmio::test_mmio::TestMmio;
    use crate::mmio::ADDRESS_WIDTH_OFFSET;

    fn new_test_device() -> Device {
        let mmio = TestMmio::new(0x10000);
        mmio.write32(ADDRESS_WIDTH_OFFSET, 13);
        let device = Device::probe(Box::new(mmio));
        device.start(Box::new(NullDriver));
        device
    }

    #[test]
    fn get_status_device_reports_self_powered() {
        let device = new_test_device();
        device.test_setup_interrupt(&[0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00]);
        device.on_interrupt();
        assert_eq!(device.test_ep0_scratch()[0] & 1, 1);
    }

    #[test]
    fn set_address_writes_pending_bit() {
        let device = new_test_device();
        device.test_setup_interrupt(&[0x00, 0x05, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00]);
        device.on_interrupt();
        let reg = device.test_read_register(ADDRESS_OFFSET);
        assert_eq!(reg & ADDRESS_PENDING, ADDRESS_PENDING);
        assert_eq!(reg & ADDRESS_VALUE_MASK, 5);
    }

    #[test]
    fn get_status_endpoint_reflects_halt_set_by_set_feature() {
        let device = new_test_device();
        device.ep_enable(2, 0x82, 0x02, 512).unwrap();

        // SET_FEATURE(ENDPOINT_HALT) on EP2 IN.
        device.test_setup_interrupt(&[0x02, 0x03, 0x00, 0x00, 0x82, 0x00, 0x00, 0x00]);
        device.on_interrupt();

        // GET_STATUS(Endpoint 2 IN).
        device.test_setup_interrupt(&[0x82, 0x00, 0x00, 0x00, 0x82, 0x00, 0x02, 0x00]);
        device.on_interrupt();
        assert_eq!(device.test_ep0_scratch()[0] & 1, 1, "halted endpoint must report bit 0 set");
    }
}

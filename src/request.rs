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

//! Transfer requests: the unit of work the gadget framework submits on an endpoint.
//!
//! Grounded on `struct spinal_udc_req` in `original_source/services/usb-test/src/spinal_udc.c`.
//! The gadget there keeps ownership of `usb_request` and hands the driver a bare pointer for the
//! duration of the transfer; this crate instead transfers ownership of a boxed [`Request`] into
//! the driver at [`crate::device::Device::queue`] and hands it back, by value, to the completion
//! closure — avoiding the raw back-pointer the C struct relies on while keeping the same
//! lifecycle ("owned by the driver from queue until the completion callback returns").

use alloc::boxed::Box;

use crate::error::{Result, Status};
use crate::list::ListHead;

/// Identifies a previously-queued [`Request`] for [`crate::device::Device::dequeue`].
///
/// Assigned by `Device::queue`/`Device::ep0_queue` at submission time; the original driver uses
/// pointer identity for the same purpose ("locate req in the endpoint FIFO"), which Rust's
/// ownership-transfer model doesn't give us for free.
pub type RequestId = u32;

/// A completion closure, called once a [`Request`] finishes (successfully, cancelled, or
/// errored). Invoked with the device lock released (see `device.rs`), so it may freely call back
/// into [`crate::device::Device`], including re-queuing on any endpoint.
pub type Completion = Box<dyn FnMut(&crate::device::Device, u8, Box<Request>)>;

/// One pending or in-flight transfer on an endpoint.
///
/// `buf`/`length` describe a plain, CPU-accessible buffer owned by the caller (not peripheral
/// RAM); the engine copies to/from it through [`crate::mmio::MmioAccess`]'s byte/word primitives
/// as descriptors are filled or harvested. The caller must keep the buffer alive and unaliased
/// for as long as the request is queued.
pub struct Request {
    pub(crate) id: RequestId,
    buf: *mut u8,
    /// Total requested length, in bytes.
    pub length: u32,
    /// Append a zero-length packet once `length` is exhausted (IN only).
    pub zero: bool,
    /// An OUT transfer must not be allowed to terminate early on a short packet.
    pub short_not_ok: bool,
    /// Bytes actually transferred so far.
    pub actual: u32,
    /// Observational status; [`Status::InProgress`] until the completion callback fires.
    pub status: Status,
    /// Bytes already handed to hardware (may exceed `actual`, which lags until harvested).
    pub(crate) commited_length: u32,
    /// Distinguishes "not started" from "fully handed to hardware" when `commited_length == 0`.
    pub(crate) commited_once: bool,
    /// Descriptors currently carrying this request's bytes, threaded via
    /// [`crate::list::Which::Request`] through the pool's arena.
    pub(crate) descs: ListHead,
    pub(crate) completion: Option<Completion>,
}

// The raw `buf` pointer is only ever dereferenced while the device lock is held (or during the
// completion callback, which the caller is required not to race against further engine activity
// on the same request).
unsafe impl Send for Request {}

impl Request {
    /// Builds a new request over `buf[..length]`. `buf` may be unaligned; the engine absorbs the
    /// low two bits of misalignment per-descriptor (SPEC_FULL.md §4.5 step 3).
    pub fn new(buf: *mut u8, length: u32) -> Request {
        Request {
            id: 0,
            buf,
            length,
            zero: false,
            short_not_ok: false,
            actual: 0,
            status: Status::InProgress,
            commited_length: 0,
            commited_once: false,
            descs: ListHead::default(),
            completion: None,
        }
    }

    pub fn zero(mut self, zero: bool) -> Request {
        self.zero = zero;
        self
    }

    pub fn short_not_ok(mut self, short_not_ok: bool) -> Request {
        self.short_not_ok = short_not_ok;
        self
    }

    pub fn with_completion(mut self, completion: Completion) -> Request {
        self.completion = Some(completion);
        self
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub(crate) fn buf_ptr(&self) -> *mut u8 {
        self.buf
    }

    pub(crate) fn reset_for_queue(&mut self, id: RequestId) {
        self.id = id;
        self.status = Status::InProgress;
        self.actual = 0;
        self.commited_length = 0;
        self.commited_once = false;
    }

    /// Returns `Ok` once a completion has actually run with status recorded; used by tests to
    /// assert on the terminal state without needing a completion closure.
    #[cfg(test)]
    pub(crate) fn result(&self) -> Option<Result<()>> {
        match self.status {
            Status::Done(r) => Some(r),
            Status::InProgress => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_starts_in_progress() {
        let mut buf = [0u8; 8];
        let req = Request::new(buf.as_mut_ptr(), 8);
        assert!(req.status.is_in_progress());
        assert_eq!(req.commited_length, 0);
        assert!(!req.commited_once);
    }
}

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

//! Error taxonomy shared by every operation in this crate.

use derive_more::Display;

/// Kinds of failure an operation against the transfer engine can report.
///
/// This does not attempt to carry as much context as the register contents that caused it;
/// callers that need more should log before returning it (see the `log` call sites throughout
/// `engine`/`control`/`device`).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration: unsupported max-packet size, control requested on a non-zero
    /// endpoint, or a missing descriptor.
    #[display(fmt = "invalid configuration")]
    Invalid,
    /// The endpoint already has an outstanding request where only one is allowed (EP0).
    #[display(fmt = "endpoint busy")]
    Busy,
    /// The requested state transition cannot be applied right now; retry once in-flight work
    /// drains (e.g. halting an IN endpoint that has pending requests).
    #[display(fmt = "operation would need to wait")]
    Again,
    /// The endpoint or device was torn down while the request was outstanding.
    #[display(fmt = "shut down")]
    Shutdown,
    /// The request was cancelled by an explicit dequeue.
    #[display(fmt = "connection reset by dequeue")]
    ConnReset,
    /// The request was cancelled by a bus reset.
    #[display(fmt = "reset")]
    Reset,
}

/// Result type used throughout the crate's public API.
pub type Result<T> = core::result::Result<T, Error>;

/// Terminal state of a [`crate::request::Request`], as observed by its completion callback.
///
/// Distinct from [`Result`]: a request that is still being serviced by the engine is not an
/// error, it simply hasn't completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Still queued or in flight.
    InProgress,
    /// Finished, successfully or not.
    Done(Result<()>),
}

impl Status {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, Status::InProgress)
    }
}

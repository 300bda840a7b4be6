// Copyright 2023, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Errors reported by the NFCEE routing core.

use crate::manager::EmState;
use crate::registry::EeId;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of NFCEE management and routing table operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The operation targets an unknown or removed execution environment.
    #[error("bad nfcee handle {0:#04x}")]
    BadHandle(EeId),

    /// A routing rule or request parameter is malformed.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// A single routing entry does not fit in one command packet.
    #[error("routing entry of {size} bytes exceeds the packet capacity of {max} bytes")]
    TableEntryTooLarge { size: usize, max: usize },

    /// The encoded routing table exceeds the controller capacity.
    #[error("routing table of {size} bytes exceeds the controller capacity of {max} bytes")]
    TableFull { size: usize, max: usize },

    /// The controller did not acknowledge a routing table packet in time.
    #[error("routing table commit timed out")]
    CommitTimeout,

    /// An observed routing command buffer could not be decoded.
    #[error("malformed routing table command")]
    MalformedCapture,

    /// The controller returned a non-OK status.
    #[error("controller rejected the command with status {0:#04x}")]
    Rejected(u8),

    /// The feature is not supported by the controller.
    #[error("not supported by the controller")]
    NotSupported,

    /// The request is not allowed in the current state.
    #[error("request not allowed in state {0}")]
    WrongState(EmState),

    /// The processing context is gone.
    #[error("nfcee task channel closed")]
    ChannelClosed,
}

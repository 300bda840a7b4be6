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

//! NFCEE lifecycle management and Listen Mode Routing Table commit.
//!
//! The crate tracks the execution environments reported by an NCI
//! controller, compiles their routing rules into the Listen Mode Routing
//! Table and commits the table to the controller one packet at a time.

/// Declare a `u8` bit mask newtype with named flags.
macro_rules! bit_mask {
    ($(#[$meta:meta])* $name:ident { $($(#[$flag_meta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u8);

        #[allow(missing_docs)]
        impl $name {
            pub const NONE: $name = $name(0);
            $($(#[$flag_meta])* pub const $flag: $name = $name($value);)*

            /// Return true if all the bits of `other` are set.
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// Return true if no bit is set.
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// Return the mask with the bits of `other` cleared.
            pub fn without(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0
            }
        }

        impl std::ops::BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl crate::routing::Mask for $name {
            fn bits(self) -> u8 {
                self.0
            }
            fn from_bits(bits: u8) -> Self {
                $name(bits)
            }
        }
    };
}

pub mod config;
pub mod error;
pub mod lmrt;
pub mod manager;
pub mod packets;
pub mod registry;
pub mod routing;
pub mod task;
pub mod transport;
pub mod view;

pub use error::{Error, Result};
pub use manager::{EeManager, EmState, Event, Notification, PowerMode, Request};
pub use registry::{EeId, EeInfo, EeInterface, EeStatus, Registry, TechMask, HOST_ID};
pub use task::{EeHandle, EeTask};

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Wire types shared by the vswitch control process and the DPDK
//! datapath.
//!
//! Every message defined here has a fixed-size, padding-free wire
//! representation. The representations are `zerocopy` structs whose
//! layouts are checked at compile time; the friendlier Rust types
//! (e.g. [`FlowKey`], [`ActionList`]) convert to and from them.

#![no_std]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

#[cfg(test)]
#[macro_use]
extern crate std;

#[macro_use]
extern crate alloc;

use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

pub mod action;
pub mod cmd;
pub mod codec;
pub mod flow;
pub mod ip;
pub mod key;
pub mod mac;
pub mod msg;
pub mod packet;
pub mod stat;
pub mod tcp;
pub mod upcall;
pub mod vport;

pub use action::*;
pub use cmd::*;
pub use codec::*;
pub use flow::*;
pub use ip::*;
pub use key::*;
pub use mac::*;
pub use msg::*;
pub use packet::*;
pub use stat::*;
pub use tcp::*;
pub use upcall::*;
pub use vport::*;

/// The overall version of the wire protocol. Anytime a message layout
/// changes (including the action slot count or any embedded struct)
/// this number must increment. Currently we attach no semantic
/// meaning to the number other than as a means to verify that the
/// vswitch and the datapath are compiled against the same layouts.
pub const API_VERSION: u64 = 1;

/// The transport family a message travels on.
///
/// The envelope never says which body it carries; the receiver knows
/// from the family of the channel the bytes arrived on. The values are
/// chosen to stay clear of the reserved/system families of the
/// underlying transport.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(u16)]
pub enum Family {
    Vport = 0xE,
    Flow = 0xF,
    Packet = 0x1F,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Vport, Family::Flow, Family::Packet];

    pub const fn id(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Family {
    type Error = u16;

    fn try_from(val: u16) -> Result<Self, Self::Error> {
        match val {
            0xE => Ok(Self::Vport),
            0xF => Ok(Self::Flow),
            0x1F => Ok(Self::Packet),
            _ => Err(val),
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Family::Vport => "vport",
            Family::Flow => "flow",
            Family::Packet => "packet",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn family_ids_are_distinct() {
        for fam in Family::ALL {
            assert_eq!(Family::try_from(fam.id()), Ok(fam));
        }
        assert_eq!(Family::try_from(0x10), Err(0x10));
    }
}

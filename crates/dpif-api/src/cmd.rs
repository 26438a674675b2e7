// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Command codes, message flags, and response status.
//!
//! The message codecs are command-agnostic: they carry whatever command
//! byte they are given. The enumerations here are the contract between
//! the vswitch and the datapath about what those bytes mean.

use alloc::string::String;
use bitflags::bitflags;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;

/// Commands of the vport family.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum VportCmd {
    New = 1, // create a vport
    Del = 2, // delete a vport
    Get = 3, // read a vport, by number or by name
    Dump = 4, // return the vport after the cursor
}

impl TryFrom<u8> for VportCmd {
    type Error = u8;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::New),
            2 => Ok(Self::Del),
            3 => Ok(Self::Get),
            4 => Ok(Self::Dump),
            _ => Err(num),
        }
    }
}

/// Commands of the flow family.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum FlowCmd {
    New = 1,   // install or modify a flow
    Del = 2,   // delete a flow, returning its final stats
    Get = 3,   // read a flow, optionally clearing its stats
    Dump = 4,  // return the flow after the cursor
    Flush = 5, // delete all flows
}

impl TryFrom<u8> for FlowCmd {
    type Error = u8;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::New),
            2 => Ok(Self::Del),
            3 => Ok(Self::Get),
            4 => Ok(Self::Dump),
            5 => Ok(Self::Flush),
            _ => Err(num),
        }
    }
}

/// Commands of the packet family.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum PacketCmd {
    Execute = 1, // run the actions on the attached packet
}

impl TryFrom<u8> for PacketCmd {
    type Error = u8;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::Execute),
            _ => Err(num),
        }
    }
}

bitflags! {
    /// Modifiers carried in the `flags` word of vport and flow messages.
    #[derive(
        Clone,
        Copy,
        Debug,
        Default,
        Deserialize,
        Eq,
        Hash,
        PartialEq,
        Serialize,
    )]
    pub struct MsgFlags: u32 {
        /// `New` may create an entry that does not exist.
        const CREATE = 0x1;
        /// `New` may replace the actions of an existing entry.
        const MODIFY = 0x2;
        /// The message holds a dump cursor; return the entry strictly
        /// after it. Without this flag a dump starts from the beginning.
        const DUMP_CONTINUE = 0x4;
    }
}

/// The value of an envelope's `type` field on a response.
///
/// Non-negative values are success, possibly selecting a result
/// variant; negative values are a negated errno.
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
pub struct Status(pub i16);

impl Status {
    pub const OK: Self = Self(0);

    /// A dump request found no entry after the cursor.
    pub const DUMP_DONE: Self = Self(1);

    pub fn from_errno(errno: libc::c_int) -> Self {
        Self(-(errno as i16))
    }

    pub fn is_ok(&self) -> bool {
        self.0 >= 0
    }

    pub fn is_err(&self) -> bool {
        self.0 < 0
    }

    /// The errno carried by an error status.
    pub fn errno(&self) -> Option<libc::c_int> {
        self.is_err().then(|| -libc::c_int::from(self.0))
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::OK => write!(f, "ok"),
            Self::DUMP_DONE => write!(f, "dump done"),
            Status(code) if code > 0 => write!(f, "ok ({code})"),
            Status(code) => write!(f, "errno {}", -i32::from(code)),
        }
    }
}

/// A command failure reported by the datapath.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DpifError {
    /// The datapath could not service the request right now.
    Busy,
    /// The command code is not part of this family.
    BadCommand(u8),
    /// The request body could not be decoded.
    DecodeReq(String),
    FlowExists,
    FlowNotFound,
    /// The request is well formed but makes no sense.
    Invalid(String),
    /// An action names a port that does not exist.
    NoSuchOutput(u32),
    PortExists(String),
    PortNotFound,
    /// The named table is at its configured limit.
    TableFull(u32),
    /// An error status that does not map onto any of the above.
    Status(i16),
}

impl DpifError {
    /// Convert to an errno value.
    pub fn to_errno(&self) -> libc::c_int {
        use libc::*;

        match self {
            Self::Busy => EBUSY,
            Self::BadCommand(_) => EOPNOTSUPP,
            Self::DecodeReq(_) => EPROTO,
            Self::FlowExists => EEXIST,
            Self::FlowNotFound => ENOENT,
            Self::Invalid(_) => EINVAL,
            Self::NoSuchOutput(_) => ENODEV,
            Self::PortExists(_) => EEXIST,
            Self::PortNotFound => ENOENT,
            Self::TableFull(_) => ENOSPC,
            Self::Status(code) => -libc::c_int::from(*code),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_errno(self.to_errno())
    }

    /// Recover the best description available from an error status.
    ///
    /// The status code alone cannot distinguish, e.g., a missing port
    /// from a missing flow; the family disambiguates. Payloads do not
    /// travel with the status and come back empty or zero.
    pub fn from_status(family: super::Family, status: Status) -> Self {
        use super::Family;

        match (family, status.errno()) {
            (_, Some(libc::EBUSY)) => Self::Busy,
            (_, Some(libc::EOPNOTSUPP)) => Self::BadCommand(0),
            (_, Some(libc::EPROTO)) => Self::DecodeReq(String::new()),
            (_, Some(libc::EINVAL)) => Self::Invalid(String::new()),
            (_, Some(libc::ENODEV)) => Self::NoSuchOutput(0),
            (_, Some(libc::ENOSPC)) => Self::TableFull(0),
            (Family::Vport, Some(libc::ENOENT)) => Self::PortNotFound,
            (Family::Flow, Some(libc::ENOENT)) => Self::FlowNotFound,
            (Family::Flow, Some(libc::EEXIST)) => Self::FlowExists,
            (Family::Vport, Some(libc::EEXIST)) => {
                Self::PortExists(String::new())
            }
            _ => Self::Status(status.0),
        }
    }
}

impl Display for DpifError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "datapath busy"),
            Self::BadCommand(cmd) => write!(f, "unknown command {cmd}"),
            Self::DecodeReq(msg) => write!(f, "bad request: {msg}"),
            Self::FlowExists => write!(f, "flow exists"),
            Self::FlowNotFound => write!(f, "flow not found"),
            Self::Invalid(msg) => write!(f, "invalid request: {msg}"),
            Self::NoSuchOutput(port) => write!(f, "no output port {port}"),
            Self::PortExists(name) => write!(f, "port exists: {name}"),
            Self::PortNotFound => write!(f, "port not found"),
            Self::TableFull(limit) => write!(f, "table full ({limit})"),
            Self::Status(code) => write!(f, "{}", Status(*code)),
        }
    }
}

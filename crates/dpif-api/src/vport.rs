// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Virtual port management messages.

use super::cmd::MsgFlags;
use super::cmd::VportCmd;
use super::codec::DecodeError;
use super::codec::EncodeError;
use super::codec::WireMsg;
use super::codec::read_raw;
use super::codec::write_raw;
use super::stat::VportStats;
use super::stat::VportStatsRaw;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::byteorder::little_endian::U32;

/// The size of the port name buffer.
pub const PORT_NAME_LEN: usize = 32;

/// The size of the reserved extension area of a vport message.
pub const VPORT_EXT_LEN: usize = 16;

/// A `port_no` asking the datapath to pick the port number.
pub const PORT_NO_ANY: u32 = u32::MAX;

/// A port name: at most [`PORT_NAME_LEN`] bytes of UTF-8 without NUL.
///
/// On the wire the name is NUL padded to the full buffer; a name of
/// exactly 32 bytes carries no terminator. The empty name means "not
/// set".
#[derive(
    Clone,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct PortName(heapless::String<PORT_NAME_LEN>);

impl PortName {
    pub fn new(name: &str) -> Result<Self, EncodeError> {
        if name.len() > PORT_NAME_LEN {
            return Err(EncodeError::NameTooLong {
                len: name.len(),
                max: PORT_NAME_LEN,
            });
        }

        if name.contains('\0') {
            return Err(EncodeError::InvalidName);
        }

        let mut s = heapless::String::new();
        s.push_str(name).map_err(|_| EncodeError::NameTooLong {
            len: name.len(),
            max: PORT_NAME_LEN,
        })?;
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_raw(&self) -> [u8; PORT_NAME_LEN] {
        let mut raw = [0u8; PORT_NAME_LEN];
        raw[..self.0.len()].copy_from_slice(self.0.as_bytes());
        raw
    }

    pub fn from_raw(raw: &[u8; PORT_NAME_LEN]) -> Result<Self, DecodeError> {
        let end = raw.iter().position(|b| *b == 0).unwrap_or(PORT_NAME_LEN);
        let name = core::str::from_utf8(&raw[..end])
            .map_err(|_| DecodeError::BadName)?;
        let mut s = heapless::String::new();
        // `end` never exceeds the capacity.
        s.push_str(name).map_err(|_| DecodeError::BadName)?;
        Ok(Self(s))
    }
}

impl FromStr for PortName {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for PortName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a virtual port.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
#[repr(u32)]
pub enum VportType {
    #[default]
    Disabled = 0,
    /// The control process's own port.
    Vswitchd = 1,
    Bridge = 2,
    /// A physical NIC port.
    Phy = 3,
    /// A shared-memory ring to a client application.
    Client = 4,
    /// A kernel NIC interface.
    Kni = 5,
    Veth = 6,
    /// A vhost-user port to a virtual machine.
    Vhost = 7,
}

impl TryFrom<u32> for VportType {
    type Error = DecodeError;

    fn try_from(num: u32) -> Result<Self, Self::Error> {
        match num {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::Vswitchd),
            2 => Ok(Self::Bridge),
            3 => Ok(Self::Phy),
            4 => Ok(Self::Client),
            5 => Ok(Self::Kni),
            6 => Ok(Self::Veth),
            7 => Ok(Self::Vhost),
            _ => Err(DecodeError::UnknownVportType(num)),
        }
    }
}

impl FromStr for VportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "vswitchd" => Ok(Self::Vswitchd),
            "bridge" => Ok(Self::Bridge),
            "phy" => Ok(Self::Phy),
            "client" => Ok(Self::Client),
            "kni" => Ok(Self::Kni),
            "veth" => Ok(Self::Veth),
            "vhost" => Ok(Self::Vhost),
            _ => Err(format!("bad vport type: {s}")),
        }
    }
}

impl Display for VportType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::Disabled => "disabled",
            Self::Vswitchd => "vswitchd",
            Self::Bridge => "bridge",
            Self::Phy => "phy",
            Self::Client => "client",
            Self::Kni => "kni",
            Self::Veth => "veth",
            Self::Vhost => "vhost",
        };
        write!(f, "{s}")
    }
}

/// The extension area of a vport message.
///
/// The first byte is a version. Version 0 is the only one defined and
/// requires the remaining bytes to be zero; anything else is rejected
/// so that a future extension is never silently ignored.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub struct VportExt {
    version: u8,
}

impl VportExt {
    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn to_raw(&self) -> [u8; VPORT_EXT_LEN] {
        let mut raw = [0u8; VPORT_EXT_LEN];
        raw[0] = self.version;
        raw
    }

    pub fn from_raw(raw: &[u8; VPORT_EXT_LEN]) -> Result<Self, DecodeError> {
        match raw {
            [0, rest @ ..] if rest.iter().all(|b| *b == 0) => {
                Ok(Self { version: 0 })
            }
            [version, ..] => Err(DecodeError::UnsupportedExtension(*version)),
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    FromBytes,
    Immutable,
    IntoBytes,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct VportMessageRaw {
    pub id: U32,
    pub cmd: u8,
    pub _pad0: [u8; 3],
    pub flags: U32,
    pub port_no: U32,
    pub name: [u8; PORT_NAME_LEN],
    pub vport_type: U32,
    pub ext: [u8; VPORT_EXT_LEN],
    pub _pad1: [u8; 4],
    pub stats: VportStatsRaw,
}

const _: () = assert!(core::mem::size_of::<VportMessageRaw>() == 136);

/// A vport request or response body.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct VportMessage {
    /// Correlates a response with the thread that sent the request.
    pub id: u32,
    /// The command code, carried verbatim.
    pub cmd: u8,
    pub flags: MsgFlags,
    pub port_no: u32,
    pub name: PortName,
    pub vport_type: VportType,
    pub ext: VportExt,
    pub stats: VportStats,
}

impl VportMessage {
    pub fn new(cmd: VportCmd) -> Self {
        Self { cmd: cmd as u8, ..Default::default() }
    }

    /// The command, if the code is one this crate knows.
    pub fn command(&self) -> Result<VportCmd, u8> {
        VportCmd::try_from(self.cmd)
    }

    pub fn to_raw(&self) -> VportMessageRaw {
        VportMessageRaw {
            id: U32::new(self.id),
            cmd: self.cmd,
            _pad0: [0; 3],
            flags: U32::new(self.flags.bits()),
            port_no: U32::new(self.port_no),
            name: self.name.to_raw(),
            vport_type: U32::new(self.vport_type as u32),
            ext: self.ext.to_raw(),
            _pad1: [0; 4],
            stats: self.stats.to_raw(),
        }
    }

    pub fn from_raw(raw: &VportMessageRaw) -> Result<Self, DecodeError> {
        Ok(Self {
            id: raw.id.get(),
            cmd: raw.cmd,
            flags: MsgFlags::from_bits_retain(raw.flags.get()),
            port_no: raw.port_no.get(),
            name: PortName::from_raw(&raw.name)?,
            vport_type: VportType::try_from(raw.vport_type.get())?,
            ext: VportExt::from_raw(&raw.ext)?,
            stats: VportStats::from(&raw.stats),
        })
    }
}

impl WireMsg for VportMessage {
    const WIRE_LEN: usize = core::mem::size_of::<VportMessageRaw>();

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_raw(&self.to_raw(), buf)
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        read_raw::<VportMessageRaw>(buf).and_then(Self::from_raw)
    }
}

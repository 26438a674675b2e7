// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use super::codec::DecodeError;
use super::codec::EncodeError;
use super::codec::WireMsg;
use super::codec::read_raw;
use super::codec::write_raw;
use super::key::FlowKey;
use super::key::FlowKeyRaw;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Why the datapath handed a packet to the vswitch.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[repr(u8)]
pub enum UpcallCmd {
    /// No flow matched the packet.
    Miss = 1,
    /// A flow's actions asked for the packet.
    Action = 2,
}

impl TryFrom<u8> for UpcallCmd {
    type Error = DecodeError;

    fn try_from(num: u8) -> Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::Miss),
            2 => Ok(Self::Action),
            _ => Err(DecodeError::UnknownUpcallCmd(num)),
        }
    }
}

impl Display for UpcallCmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Miss => write!(f, "miss"),
            Self::Action => write!(f, "action"),
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
pub struct UpcallRaw {
    pub cmd: u8,
    pub key: FlowKeyRaw,
}

const _: () = assert!(core::mem::size_of::<UpcallRaw>() == 38);

/// A packet the datapath could not handle on its own.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Upcall {
    pub cmd: UpcallCmd,
    pub key: FlowKey,
}

impl WireMsg for Upcall {
    const WIRE_LEN: usize = core::mem::size_of::<UpcallRaw>();

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        let raw = UpcallRaw { cmd: self.cmd as u8, key: self.key.to_raw() };
        write_raw(&raw, buf)
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let raw = read_raw::<UpcallRaw>(buf)?;
        Ok(Self {
            cmd: UpcallCmd::try_from(raw.cmd)?,
            key: FlowKey::from(&raw.key),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn upcall_layout() {
        let key =
            FlowKey { in_port: 3, tran_dst_port: 80, ..Default::default() };
        let up = Upcall { cmd: UpcallCmd::Miss, key };
        let mut buf = [0u8; 38];
        up.encode_into(&mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(&buf[1..], &key.encode());
        assert_eq!(Upcall::decode(&buf), Ok(up));

        buf[0] = 9;
        assert_eq!(Upcall::decode(&buf), Err(DecodeError::UnknownUpcallCmd(9)));
    }
}

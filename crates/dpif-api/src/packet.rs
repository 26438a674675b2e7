// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packet injection messages.
//!
//! A packet message is the action list of a one-shot flow: the datapath
//! treats the attached packet as if it had matched a flow whose actions
//! are exactly these. The packet bytes follow the message in the frame.

use super::action::ActionList;
use super::action::ActionsRaw;
use super::codec::DecodeError;
use super::codec::EncodeError;
use super::codec::WireMsg;
use super::codec::read_raw;
use super::codec::write_raw;
use serde::Deserialize;
use serde::Serialize;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PacketMessage {
    pub actions: ActionList,
}

impl PacketMessage {
    pub fn new(actions: ActionList) -> Self {
        Self { actions }
    }
}

impl WireMsg for PacketMessage {
    const WIRE_LEN: usize = core::mem::size_of::<ActionsRaw>();

    fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError> {
        write_raw(&self.actions.to_raw(), buf)
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        read_raw::<ActionsRaw>(buf)
            .and_then(ActionList::from_raw)
            .map(Self::new)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::Action;

    #[test]
    fn packet_message_is_an_action_list() {
        let mut actions = ActionList::new();
        actions.push(Action::PopVlan).unwrap();
        actions.push(Action::Output { port: 4 }).unwrap();
        let msg = PacketMessage::new(actions.clone());

        let mut buf = [0u8; 768];
        msg.encode_into(&mut buf).unwrap();
        assert_eq!(buf, actions.encode());
        assert_eq!(PacketMessage::decode(&buf), Ok(msg));
        assert_eq!(PacketMessage::WIRE_LEN, 768);
    }

    #[test]
    fn small_buffer() {
        let mut buf = [0u8; 100];
        assert_eq!(
            PacketMessage::default().encode_into(&mut buf),
            Err(EncodeError::BufferTooSmall { needed: 768, given: 100 })
        );
    }
}

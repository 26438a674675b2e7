// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! An in-process transport between the vswitch and the datapath.
//!
//! Each message family gets its own pair of ordered, reliable channels.
//! A frame is one encoded envelope, optionally followed by packet
//! bytes. The endpoints are typed by family body, so a flow message can
//! never be sent on the vport channel.

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use dpif_api::BODY_OFFSET;
use dpif_api::DecodeError;
use dpif_api::EncodeError;
use dpif_api::Family;
use dpif_api::FamilyMsg;
use dpif_api::FlowMessage;
use dpif_api::MESSAGE_SIZE;
use dpif_api::PacketMessage;
use dpif_api::Request;
use dpif_api::Response;
use dpif_api::Upcall;
use dpif_api::VportMessage;
use dpif_api::WireMsg;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LinkError {
    #[error("{0} channel disconnected")]
    Disconnected(Family),

    #[error("{0} channel full")]
    Full(Family),

    #[error("frame of {given} bytes is shorter than a message")]
    ShortFrame { given: usize },

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
}

/// One unit of transfer: an encoded envelope plus trailing packet
/// bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    /// Build a frame around an envelope encoder, appending `payload`.
    pub fn build<F>(payload: &[u8], encode: F) -> Result<Self, LinkError>
    where
        F: FnOnce(&mut [u8]) -> Result<(), EncodeError>,
    {
        let mut buf = vec![0u8; MESSAGE_SIZE + payload.len()];
        encode(&mut buf[..MESSAGE_SIZE])?;
        buf[MESSAGE_SIZE..].copy_from_slice(payload);
        Ok(Self { buf })
    }

    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The envelope portion of the frame.
    pub fn message(&self) -> Result<&[u8], LinkError> {
        self.buf
            .get(..MESSAGE_SIZE)
            .ok_or(LinkError::ShortFrame { given: self.buf.len() })
    }

    /// The bytes after the envelope.
    pub fn payload(&self) -> &[u8] {
        self.buf.get(MESSAGE_SIZE..).unwrap_or(&[])
    }

    /// Peek at the correlation id of a vport or flow body without
    /// decoding the rest of the message. This is how a receiver answers
    /// a request it could not decode.
    pub fn raw_id(&self) -> Option<u32> {
        let id = self.buf.get(BODY_OFFSET..BODY_OFFSET + 4)?;
        Some(u32::from_le_bytes([id[0], id[1], id[2], id[3]]))
    }

    pub fn request<M: FamilyMsg>(&self) -> Result<Request<M>, LinkError> {
        Ok(Request::decode(self.message()?)?)
    }

    pub fn response<M: FamilyMsg>(&self) -> Result<Response<M>, LinkError> {
        Ok(Response::decode(self.message()?)?)
    }
}

/// The vswitch side of one family's channel pair.
#[derive(Debug)]
pub struct ClientEnd<M> {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    _family: PhantomData<fn() -> M>,
}

impl<M: FamilyMsg> ClientEnd<M> {
    pub fn family(&self) -> Family {
        M::FAMILY
    }

    pub fn send(
        &self,
        req: &Request<M>,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let frame = Frame::build(payload, |buf| req.encode_into(buf))?;
        self.tx.send(frame).map_err(|_| LinkError::Disconnected(M::FAMILY))
    }

    /// Block until the next frame arrives.
    pub fn recv_frame(&self) -> Result<Frame, LinkError> {
        self.rx.recv().map_err(|_| LinkError::Disconnected(M::FAMILY))
    }

    pub fn recv(&self) -> Result<Response<M>, LinkError> {
        self.recv_frame()?.response()
    }
}

/// The datapath side of one family's channel pair.
#[derive(Debug)]
pub struct EngineEnd<M> {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    _family: PhantomData<fn() -> M>,
}

impl<M: FamilyMsg> EngineEnd<M> {
    pub fn family(&self) -> Family {
        M::FAMILY
    }

    /// The raw receiver, for use with `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<Frame> {
        &self.rx
    }

    pub fn recv(&self) -> Result<Frame, LinkError> {
        self.rx.recv().map_err(|_| LinkError::Disconnected(M::FAMILY))
    }

    pub fn reply(
        &self,
        resp: &Response<M>,
        payload: &[u8],
    ) -> Result<(), LinkError> {
        let frame = Frame::build(payload, |buf| resp.encode_into(buf))?;
        self.tx.send(frame).map_err(|_| LinkError::Disconnected(M::FAMILY))
    }
}

fn family_pair<M>(depth: usize) -> (ClientEnd<M>, EngineEnd<M>) {
    let (req_tx, req_rx) = crossbeam_channel::bounded(depth);
    let (resp_tx, resp_rx) = crossbeam_channel::bounded(depth);
    let client = ClientEnd { tx: req_tx, rx: resp_rx, _family: PhantomData };
    let engine = EngineEnd { tx: resp_tx, rx: req_rx, _family: PhantomData };
    (client, engine)
}

/// The datapath's sending half of the upcall queue.
///
/// Sending never blocks: the packet path must not stall on a slow
/// vswitch, so a full queue drops the upcall.
#[derive(Clone, Debug)]
pub struct UpcallTx {
    tx: Sender<Vec<u8>>,
}

impl UpcallTx {
    pub fn send(&self, up: &Upcall, packet: &[u8]) -> Result<(), LinkError> {
        let mut buf = vec![0u8; Upcall::WIRE_LEN + packet.len()];
        up.encode_into(&mut buf)?;
        buf[Upcall::WIRE_LEN..].copy_from_slice(packet);
        self.tx.try_send(buf).map_err(|e| match e {
            // Upcalls ride with the packet family.
            TrySendError::Full(_) => LinkError::Full(Family::Packet),
            TrySendError::Disconnected(_) => {
                LinkError::Disconnected(Family::Packet)
            }
        })
    }
}

#[derive(Debug)]
pub struct UpcallRx {
    rx: Receiver<Vec<u8>>,
}

impl UpcallRx {
    pub fn recv(&self) -> Result<(Upcall, Vec<u8>), LinkError> {
        let buf = self
            .rx
            .recv()
            .map_err(|_| LinkError::Disconnected(Family::Packet))?;
        Self::split(buf)
    }

    /// Return the next upcall if one is already queued.
    pub fn try_recv(&self) -> Result<Option<(Upcall, Vec<u8>)>, LinkError> {
        match self.rx.try_recv() {
            Ok(buf) => Self::split(buf).map(Some),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Err(LinkError::Disconnected(Family::Packet))
            }
        }
    }

    fn split(mut buf: Vec<u8>) -> Result<(Upcall, Vec<u8>), LinkError> {
        let up = Upcall::decode(&buf)?;
        let packet = buf.split_off(Upcall::WIRE_LEN);
        Ok((up, packet))
    }
}

/// The vswitch's view of the transport.
#[derive(Debug)]
pub struct ClientLink {
    pub vport: ClientEnd<VportMessage>,
    pub flow: ClientEnd<FlowMessage>,
    pub packet: ClientEnd<PacketMessage>,
    pub upcall: UpcallRx,
}

/// The datapath's view of the transport.
#[derive(Debug)]
pub struct EngineLink {
    pub vport: EngineEnd<VportMessage>,
    pub flow: EngineEnd<FlowMessage>,
    pub packet: EngineEnd<PacketMessage>,
    pub upcall: UpcallTx,
}

/// Create a connected transport.
///
/// `depth` bounds each request and response channel; `upcall_depth`
/// bounds the upcall queue.
pub fn link(depth: usize, upcall_depth: usize) -> (ClientLink, EngineLink) {
    let (cvport, evport) = family_pair(depth);
    let (cflow, eflow) = family_pair(depth);
    let (cpacket, epacket) = family_pair(depth);
    let (up_tx, up_rx) = crossbeam_channel::bounded(upcall_depth);

    let client = ClientLink {
        vport: cvport,
        flow: cflow,
        packet: cpacket,
        upcall: UpcallRx { rx: up_rx },
    };
    let engine = EngineLink {
        vport: evport,
        flow: eflow,
        packet: epacket,
        upcall: UpcallTx { tx: up_tx },
    };
    (client, engine)
}

#[cfg(test)]
mod test {
    use super::*;
    use dpif_api::FlowKey;
    use dpif_api::PacketCmd;
    use dpif_api::Status;
    use dpif_api::UpcallCmd;
    use dpif_api::VportCmd;

    #[test]
    fn request_reply_round_trip() {
        let (client, engine) = link(4, 4);
        let mut body = VportMessage::new(VportCmd::Get);
        body.id = 11;
        client.vport.send(&Request::new(VportCmd::Get, body), &[]).unwrap();

        let frame = engine.vport.recv().unwrap();
        assert_eq!(frame.raw_id(), Some(11));
        let req = frame.request::<VportMessage>().unwrap();
        assert_eq!(req.command(), Ok(VportCmd::Get));

        engine.vport.reply(&Response::new(Status::OK, req.body), &[]).unwrap();
        let resp = client.vport.recv().unwrap();
        assert_eq!(resp.id(), Some(11));
        assert!(resp.status.is_ok());
    }

    #[test]
    fn packet_bytes_follow_the_message() {
        let (client, engine) = link(1, 1);
        let req = Request::new(PacketCmd::Execute, PacketMessage::default());
        client.packet.send(&req, &[1, 2, 3]).unwrap();

        let frame = engine.packet.recv().unwrap();
        assert_eq!(frame.len(), MESSAGE_SIZE + 3);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(frame.request::<PacketMessage>().unwrap(), req);
    }

    #[test]
    fn short_frame() {
        let frame = Frame::from_bytes(vec![0; 10]);
        assert_eq!(
            frame.request::<FlowMessage>(),
            Err(LinkError::ShortFrame { given: 10 })
        );
        assert_eq!(frame.raw_id(), None);
    }

    #[test]
    fn upcall_queue_drops_when_full() {
        let (client, engine) = link(1, 1);
        let up = Upcall { cmd: UpcallCmd::Miss, key: FlowKey::default() };
        engine.upcall.send(&up, &[0xaa]).unwrap();
        assert_eq!(
            engine.upcall.send(&up, &[0xbb]),
            Err(LinkError::Full(Family::Packet))
        );

        let (got, pkt) = client.upcall.recv().unwrap();
        assert_eq!(got, up);
        assert_eq!(pkt, vec![0xaa]);
        assert_eq!(client.upcall.try_recv(), Ok(None));
    }

    #[test]
    fn disconnect_is_reported() {
        let (client, engine) = link(1, 1);
        drop(engine);
        assert_eq!(
            client.flow.recv(),
            Err(LinkError::Disconnected(Family::Flow))
        );
    }
}

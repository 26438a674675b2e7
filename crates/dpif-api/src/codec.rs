// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Encode/decode plumbing shared by all fixed-size messages.

use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A failure to produce a wire message from caller-supplied values.
///
/// These are caller errors; they never travel over a channel.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum EncodeError {
    #[error("action list is full ({0} slots)")]
    CapacityExceeded(usize),

    #[error("port name is {len} bytes, the limit is {max}")]
    NameTooLong { len: usize, max: usize },

    #[error("port name contains a NUL byte")]
    InvalidName,

    #[error("buffer of {given} bytes cannot hold {needed} bytes")]
    BufferTooSmall { needed: usize, given: usize },
}

/// A failure to interpret bytes received from a channel.
///
/// Decoding is all-or-nothing: a message that produces one of these
/// errors must not be acted upon in part.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum DecodeError {
    #[error("need {needed} bytes, got {given}")]
    Truncated { needed: usize, given: usize },

    #[error("unknown action type {0}")]
    UnknownActionType(u32),

    #[error("unknown vport type {0}")]
    UnknownVportType(u32),

    #[error("unsupported vport extension version {0}")]
    UnsupportedExtension(u8),

    #[error("port name is not valid UTF-8")]
    BadName,

    #[error("invalid boolean byte {0:#x}")]
    BadBool(u8),

    #[error("request type {0} is not a command code")]
    BadMsgType(i16),

    #[error("unknown upcall command {0}")]
    UnknownUpcallCmd(u8),
}

/// A message with a fixed-size wire representation.
pub trait WireMsg: Sized {
    /// The exact number of bytes this message occupies on the wire.
    const WIRE_LEN: usize;

    /// Write the wire form of `self` into the front of `buf`.
    fn encode_into(&self, buf: &mut [u8]) -> Result<(), EncodeError>;

    /// Interpret the front of `buf` as this message.
    fn decode(buf: &[u8]) -> Result<Self, DecodeError>;
}

/// Copy the raw struct `raw` into the front of `buf`.
pub(crate) fn write_raw<T>(raw: &T, buf: &mut [u8]) -> Result<(), EncodeError>
where
    T: IntoBytes + Immutable,
{
    let bytes = raw.as_bytes();
    match buf.get_mut(..bytes.len()) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            Ok(())
        }

        None => Err(EncodeError::BufferTooSmall {
            needed: bytes.len(),
            given: buf.len(),
        }),
    }
}

/// View the front of `buf` as the raw struct `T`.
pub(crate) fn read_raw<T>(buf: &[u8]) -> Result<&T, DecodeError>
where
    T: FromBytes + KnownLayout + Immutable,
{
    T::ref_from_prefix(buf).map(|(raw, _)| raw).map_err(|_| {
        DecodeError::Truncated {
            needed: core::mem::size_of::<T>(),
            given: buf.len(),
        }
    })
}

pub(crate) fn decode_bool(val: u8) -> Result<bool, DecodeError> {
    match val {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DecodeError::BadBool(val)),
    }
}

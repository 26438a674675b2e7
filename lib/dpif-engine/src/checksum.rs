// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The internet checksum (RFC 1071), with incremental update (RFC 1624).
//!
//! Words are summed as native-endian `u16`s and the result is stored
//! back native-endian. Since the summed bytes are in network order the
//! stored checksum ends up in network order too; no byte swapping is
//! ever applied to a checksum field.

/// A rolling one's complement sum with deferred carries.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    inner: u32,
}

impl Checksum {
    pub fn compute(bytes: &[u8]) -> Self {
        let mut csum = Self::default();
        csum.add_bytes(bytes);
        csum
    }

    /// Start from the checksum field of a header.
    pub fn from_header(hc: [u8; 2]) -> Self {
        Self { inner: u32::from(!u16::from_ne_bytes(hc)) }
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        for w in bytes.chunks(2) {
            let word = match *w {
                [a, b] => u16::from_ne_bytes([a, b]),
                [a] => u16::from_ne_bytes([a, 0]),
                _ => 0,
            };
            self.inner += u32::from(word);
            self.fold_if_large();
        }
    }

    pub fn sub_bytes(&mut self, bytes: &[u8]) {
        for w in bytes.chunks(2) {
            let word = match *w {
                [a, b] => u16::from_ne_bytes([a, b]),
                [a] => u16::from_ne_bytes([a, 0]),
                _ => 0,
            };
            self.inner += u32::from(!word);
            self.fold_if_large();
        }
    }

    /// Replace `old` with `new` in the sum. Both must be the same
    /// length and start at the same parity.
    pub fn replace(&mut self, old: &[u8], new: &[u8]) {
        self.sub_bytes(old);
        self.add_bytes(new);
    }

    pub fn finalize(&mut self) -> u16 {
        while (self.inner >> 16) != 0 {
            self.inner = (self.inner >> 16) + (self.inner & 0xFFFF);
        }
        self.inner as u16
    }

    /// The bytes to store in a header's checksum field.
    pub fn to_header(mut self) -> [u8; 2] {
        (!self.finalize()).to_ne_bytes()
    }

    fn fold_if_large(&mut self) {
        if self.inner > 0xFFFF_0000 {
            self.finalize();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // The example header from RFC 1071's companion, checksum b861.
    const IPV4_HDR: [u8; 20] = [
        0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00,
        0x00, 0xc0, 0xa8, 0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
    ];

    #[test]
    fn full_compute() {
        assert_eq!(Checksum::compute(&IPV4_HDR).to_header(), [0xb8, 0x61]);
    }

    #[test]
    fn incremental_matches_full() {
        let mut hdr = IPV4_HDR;
        hdr[10..12].copy_from_slice(&[0xb8, 0x61]);

        let mut csum = Checksum::from_header([0xb8, 0x61]);
        csum.replace(&hdr[12..16], &[10, 0, 0, 9]);
        hdr[12..16].copy_from_slice(&[10, 0, 0, 9]);

        let mut zeroed = hdr;
        zeroed[10..12].copy_from_slice(&[0, 0]);
        assert_eq!(csum.to_header(), Checksum::compute(&zeroed).to_header());
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U32,
};

/// First byte of every frame, used to re-synchronize after garbage.
pub const PACKET_BEGIN_FLAG: u8 = 0x55;
/// Wire size of [`PacketHeader`]: 1 + 4 + 4 + 1 + 4 + 1 = 15 bytes, packed.
pub const HEADER_LENGTH: usize = size_of::<PacketHeader>();
/// Hard cap on a whole frame (header + body).
pub const MAX_PACKET_LENGTH: usize = 16 * 1024;
/// Largest body that still fits a frame.
pub const MAX_BODY_LENGTH: usize = MAX_PACKET_LENGTH - HEADER_LENGTH;

/// Command id reserved for client heartbeats. Applications must not register
/// a request processor for it.
pub const HEARTBEAT_CMD: u32 = 0;

const CRC8_INIT: u8 = 0x77;

static CRC8_TABLE: [u8; 256] = [
    0x00, 0x5e, 0xbc, 0xe2, 0x61, 0x3f, 0xdd, 0x83, 0xc2, 0x9c, 0x7e, 0x20, 0xa3,
    0xfd, 0x1f, 0x41, 0x9d, 0xc3, 0x21, 0x7f, 0xfc, 0xa2, 0x40, 0x1e, 0x5f, 0x01,
    0xe3, 0xbd, 0x3e, 0x60, 0x82, 0xdc, 0x23, 0x7d, 0x9f, 0xc1, 0x42, 0x1c, 0xfe,
    0xa0, 0xe1, 0xbf, 0x5d, 0x03, 0x80, 0xde, 0x3c, 0x62, 0xbe, 0xe0, 0x02, 0x5c,
    0xdf, 0x81, 0x63, 0x3d, 0x7c, 0x22, 0xc0, 0x9e, 0x1d, 0x43, 0xa1, 0xff, 0x46,
    0x18, 0xfa, 0xa4, 0x27, 0x79, 0x9b, 0xc5, 0x84, 0xda, 0x38, 0x66, 0xe5, 0xbb,
    0x59, 0x07, 0xdb, 0x85, 0x67, 0x39, 0xba, 0xe4, 0x06, 0x58, 0x19, 0x47, 0xa5,
    0xfb, 0x78, 0x26, 0xc4, 0x9a, 0x65, 0x3b, 0xd9, 0x87, 0x04, 0x5a, 0xb8, 0xe6,
    0xa7, 0xf9, 0x1b, 0x45, 0xc6, 0x98, 0x7a, 0x24, 0xf8, 0xa6, 0x44, 0x1a, 0x99,
    0xc7, 0x25, 0x7b, 0x3a, 0x64, 0x86, 0xd8, 0x5b, 0x05, 0xe7, 0xb9, 0x8c, 0xd2,
    0x30, 0x6e, 0xed, 0xb3, 0x51, 0x0f, 0x4e, 0x10, 0xf2, 0xac, 0x2f, 0x71, 0x93,
    0xcd, 0x11, 0x4f, 0xad, 0xf3, 0x70, 0x2e, 0xcc, 0x92, 0xd3, 0x8d, 0x6f, 0x31,
    0xb2, 0xec, 0x0e, 0x50, 0xaf, 0xf1, 0x13, 0x4d, 0xce, 0x90, 0x72, 0x2c, 0x6d,
    0x33, 0xd1, 0x8f, 0x0c, 0x52, 0xb0, 0xee, 0x32, 0x6c, 0x8e, 0xd0, 0x53, 0x0d,
    0xef, 0xb1, 0xf0, 0xae, 0x4c, 0x12, 0x91, 0xcf, 0x2d, 0x73, 0xca, 0x94, 0x76,
    0x28, 0xab, 0xf5, 0x17, 0x49, 0x08, 0x56, 0xb4, 0xea, 0x69, 0x37, 0xd5, 0x8b,
    0x57, 0x09, 0xeb, 0xb5, 0x36, 0x68, 0x8a, 0xd4, 0x95, 0xcb, 0x29, 0x77, 0xf4,
    0xaa, 0x48, 0x16, 0xe9, 0xb7, 0x55, 0x0b, 0x88, 0xd6, 0x34, 0x6a, 0x2b, 0x75,
    0x97, 0xc9, 0x4a, 0x14, 0xf6, 0xa8, 0x74, 0x2a, 0xc8, 0x96, 0x15, 0x4b, 0xa9,
    0xf7, 0xb6, 0xe8, 0x0a, 0x54, 0xd7, 0x89, 0x6b, 0x35,
];

/// CRC-8 as used by the frame header: table-driven, seeded with `0x77`.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(CRC8_INIT, |val, byte| CRC8_TABLE[(val ^ byte) as usize])
}

/// Fixed frame header. All multi-byte fields are big-endian; the CRC covers
/// every header byte preceding it and never the body.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    pub flag: u8,                 // 0
    pub cmd: U32<BigEndian>,      // 1..5
    pub seq: U32<BigEndian>,      // 5..9
    pub is_push: u8,              // 9
    pub body_len: U32<BigEndian>, // 10..14
    pub crc: u8,                  // 14
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("body of {0} bytes exceeds the {MAX_BODY_LENGTH}-byte maximum")]
    FrameTooLarge(usize),
}

/// One framed unit on the wire. Immutable after construction; clones share
/// the underlying frame bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    cmd: u32,
    seq: u32,
    is_push: bool,
    frame: Bytes,
}

impl Packet {
    /// Serialize a new frame. Fails iff the body does not fit a frame.
    pub fn build(
        cmd: u32,
        seq: u32,
        is_push: bool,
        body: Bytes,
    ) -> Result<Self, PacketError> {
        if body.len() > MAX_BODY_LENGTH {
            return Err(PacketError::FrameTooLarge(body.len()));
        }

        let mut header = PacketHeader {
            flag: PACKET_BEGIN_FLAG,
            cmd: U32::new(cmd),
            seq: U32::new(seq),
            is_push: is_push.into(),
            body_len: U32::new(body.len() as u32),
            crc: 0,
        };
        header.crc = crc8(&header.as_bytes()[..HEADER_LENGTH - 1]);

        let mut frame = BytesMut::with_capacity(HEADER_LENGTH + body.len());
        frame.put_slice(header.as_bytes());
        frame.put_slice(&body);

        Ok(Self {
            cmd,
            seq,
            is_push,
            frame: frame.freeze(),
        })
    }

    /// Empty-body ACK echoing a received push's identity.
    pub fn push_ack(cmd: u32, seq: u32) -> Self {
        match Self::build(cmd, seq, true, Bytes::new()) {
            Ok(packet) => packet,
            Err(_) => unreachable!("an empty body always fits a frame"),
        }
    }

    /// Client liveness probe: `cmd = 0`, push bit set, no body.
    pub fn heartbeat(seq: u32) -> Self {
        Self::push_ack(HEARTBEAT_CMD, seq)
    }

    /// Scan-and-sync parse over a contiguous readable span.
    ///
    /// Returns the first complete frame found plus the number of bytes the
    /// caller must consume. When no complete frame is available yet, the
    /// consumed count still covers leading garbage so the buffer does not
    /// grow unbounded on junk input.
    pub fn parse(buf: &[u8]) -> (Option<Self>, usize) {
        let mut consumed = 0usize;
        loop {
            while consumed < buf.len() && buf[consumed] != PACKET_BEGIN_FLAG {
                consumed += 1;
            }

            let rest = &buf[consumed..];
            if rest.len() < HEADER_LENGTH {
                return (None, consumed);
            }

            let Ok((header, _)) = PacketHeader::ref_from_prefix(rest) else {
                consumed += 1;
                continue;
            };

            if crc8(&rest[..HEADER_LENGTH - 1]) != header.crc {
                // false start byte inside other data
                consumed += 1;
                continue;
            }

            let body_len = header.body_len.get() as usize;
            if body_len > MAX_BODY_LENGTH {
                // header checksummed fine but cannot be legitimate
                consumed += HEADER_LENGTH;
                continue;
            }

            if rest.len() < HEADER_LENGTH + body_len {
                return (None, consumed);
            }

            let packet = Self {
                cmd: header.cmd.get(),
                seq: header.seq.get(),
                is_push: header.is_push == 1,
                frame: Bytes::copy_from_slice(&rest[..HEADER_LENGTH + body_len]),
            };
            consumed += HEADER_LENGTH + body_len;
            return (Some(packet), consumed);
        }
    }

    #[inline]
    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    #[inline]
    pub fn seq(&self) -> u32 {
        self.seq
    }

    #[inline]
    pub fn is_push(&self) -> bool {
        self.is_push
    }

    /// Body view into the shared frame.
    #[inline]
    pub fn body(&self) -> Bytes {
        self.frame.slice(HEADER_LENGTH..)
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.frame.len() - HEADER_LENGTH
    }

    /// Full wire image, ready for the socket. Cheap to clone.
    #[inline]
    pub fn frame(&self) -> Bytes {
        self.frame.clone()
    }

    #[inline]
    pub fn frame_len(&self) -> usize {
        self.frame.len()
    }
}

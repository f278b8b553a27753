// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request and response framing.
//!
//! A [`RequestPacket`] owns its extras/key/value as cheaply cloneable
//! [`Bytes`] so the same packet can be re-encoded after it has been detached
//! into the retry queue. A [`ResponsePacket`] is a zero-copy view over a
//! body slice split off the connection's read rope; the header is decoded
//! separately so the read loop can wait for the full body before consuming
//! anything.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CouchError, Result};
use crate::protocol::{Opcode, Status, MAGIC_REQUEST, MAGIC_RESPONSE};

/// Fixed header length for both directions.
pub const HEADER_LEN: usize = 24;

/// Per-packet state flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u16);

impl PacketFlags {
    /// Packet bytes were handed to the socket at least once.
    pub const FLUSHED: u16 = 1 << 0;
    /// The final callback has been delivered. Must never be set twice.
    pub const INVOKED: u16 = 1 << 1;
    /// Packet buffers are heap-owned, independent of any pipeline.
    pub const DETACHED: u16 = 1 << 2;
    /// Routed to an explicit server index, bypassing the vbucket map.
    pub const UFWD: u16 = 1 << 3;
    /// Key is not collection-qualified.
    pub const NOCID: u16 = 1 << 4;
    /// Packet carries extension datums (retry metadata).
    pub const HASEXT: u16 = 1 << 5;

    #[must_use]
    pub fn contains(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u16) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u16) {
        self.0 &= !bit;
    }

    /// Drop pipeline-specific state when a packet is detached for retry.
    pub fn clear_transient(&mut self) {
        self.clear(Self::FLUSHED);
        self.clear(Self::UFWD);
    }
}

/// An encoded request owned by the client side.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
    pub flags: PacketFlags,
}

impl RequestPacket {
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            datatype: 0,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
            flags: PacketFlags::default(),
        }
    }

    #[must_use]
    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    #[must_use]
    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    #[must_use]
    pub fn with_vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    #[must_use]
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    /// Total frame length on the wire.
    #[must_use]
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Append the full frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(MAGIC_REQUEST);
        dst.put_u8(self.opcode.as_u8());
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(self.datatype);
        dst.put_u16(self.vbucket);
        dst.put_u32(body_len as u32);
        // Opaque is an echo token, not byte-swapped by the library; encode
        // with native ordering so the response comparison is a plain equality.
        dst.put_u32_ne(self.opaque);
        dst.put_u64(self.cas);
        dst.put_slice(&self.extras);
        dst.put_slice(&self.key);
        dst.put_slice(&self.value);
    }

    /// Produce a detached copy whose buffers are independently owned and
    /// whose pipeline-transient flags are cleared.
    #[must_use]
    pub fn detach(&self) -> RequestPacket {
        let mut copy = self.clone();
        copy.flags.set(PacketFlags::DETACHED);
        copy.flags.clear_transient();
        copy
    }
}

/// Decoded response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode_raw: u8,
    pub datatype: u8,
    pub status: Status,
    pub keylen: u16,
    pub extlen: u8,
    pub bodylen: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Decode 24 header bytes. The slice must be exactly `HEADER_LEN` long.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(CouchError::Internal(
                "response header decode on short buffer".to_string(),
            ));
        }
        let mut b = buf;
        let magic = b.get_u8();
        if magic != MAGIC_RESPONSE {
            return Err(CouchError::Protocol(format!(
                "bad response magic {magic:#04x}"
            )));
        }
        let opcode_raw = b.get_u8();
        let keylen = b.get_u16();
        let extlen = b.get_u8();
        let datatype = b.get_u8();
        let status = Status::from_u16(b.get_u16());
        let bodylen = b.get_u32();
        let opaque = b.get_u32_ne();
        let cas = b.get_u64();
        if (keylen as u32 + extlen as u32) > bodylen {
            return Err(CouchError::Protocol(format!(
                "key+extras ({}) exceed body length {}",
                keylen as u32 + extlen as u32,
                bodylen
            )));
        }
        Ok(Self {
            opcode_raw,
            datatype,
            status,
            keylen,
            extlen,
            bodylen,
            opaque,
            cas,
        })
    }

    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.opcode_raw)
    }
}

/// A complete response: decoded header plus the body slice, sectioned into
/// extras/key/value views without copying.
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    pub header: ResponseHeader,
    body: Bytes,
}

impl ResponsePacket {
    /// Assemble from a decoded header and its complete body. `body` must be
    /// exactly `header.bodylen` bytes; the read loop guarantees this by not
    /// dispatching until the rope holds the full frame.
    pub fn new(header: ResponseHeader, body: Bytes) -> Result<Self> {
        if body.len() != header.bodylen as usize {
            return Err(CouchError::Protocol(format!(
                "body length mismatch: header says {}, got {}",
                header.bodylen,
                body.len()
            )));
        }
        Ok(Self { header, body })
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.header.status
    }

    #[must_use]
    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    #[must_use]
    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    #[must_use]
    pub fn extras(&self) -> Bytes {
        self.body.slice(..self.header.extlen as usize)
    }

    #[must_use]
    pub fn key(&self) -> Bytes {
        let start = self.header.extlen as usize;
        self.body.slice(start..start + self.header.keylen as usize)
    }

    #[must_use]
    pub fn value(&self) -> Bytes {
        let start = self.header.extlen as usize + self.header.keylen as usize;
        self.body.slice(start..)
    }

    /// Whole body, `extras || key || value`.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

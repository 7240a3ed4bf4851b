//! Decode path.
//!
//! [`ProtoReader`] pulls bytes from any [`Read`] source in chunks of
//! `buffer_size` and decodes them one field at a time. Every sub-item pushes
//! a frame:
//!
//! - length-prefixed frames narrow the readable window to the declared end;
//!   `read_field_header` returns 0 when the window is exhausted
//! - group frames run until the matching `EndGroup` header, which also makes
//!   `read_field_header` return 0
//!
//! `end_sub_item` skips whatever the caller left unread, so unknown fields
//! never need explicit handling.

use crate::config::ReaderConfig;
use crate::error::ProtoError;
use crate::pool::{BufferPool, PooledBuffer};
use crate::wire::{
    decode_varint, zigzag_decode_32, zigzag_decode_64, FieldHeader, SubItemToken, WireType,
};
use bytes::{Buf, Bytes};
use protonet_cache::NetObjectCache;
use std::io::{ErrorKind, Read};
use tracing::{debug, warn};

const UNBOUNDED: u64 = u64::MAX;

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Length { end: u64, outer_end: u64 },
    Group { field_number: u32, ended: bool },
}

#[derive(Debug, Clone, Copy)]
struct ReadFrame {
    kind: FrameKind,
    token: SubItemToken,
    field_number: u32,
}

/// Protobuf wire reader over any [`Read`] source.
#[derive(Debug)]
pub struct ProtoReader<R> {
    source: R,
    /// Bytes pulled from the source but not yet consumed.
    buffer: PooledBuffer,
    eof: bool,
    position: u64,
    /// End of the innermost length-bounded window.
    block_end: u64,
    pending: Option<FieldHeader>,
    frames: Vec<ReadFrame>,
    config: ReaderConfig,
    net_cache: Option<NetObjectCache>,
}

impl<R: Read> ProtoReader<R> {
    pub fn new(source: R) -> Self {
        Self::with_config(source, ReaderConfig::default())
    }

    pub fn with_config(source: R, config: ReaderConfig) -> Self {
        let buffer = PooledBuffer::detached(config.buffer_size);
        Self::build(source, buffer, UNBOUNDED, config)
    }

    /// Reads exactly `length` bytes of top-level message from `source`;
    /// anything after that is left untouched by field reads.
    pub fn with_length(source: R, length: u64, config: ReaderConfig) -> Self {
        let buffer = PooledBuffer::detached(config.buffer_size);
        Self::build(source, buffer, length, config)
    }

    /// Creates a reader whose working buffer is checked out of `pool`.
    pub fn with_pool(source: R, config: ReaderConfig, pool: &BufferPool) -> Self {
        let buffer = pool.checkout(config.buffer_size);
        Self::build(source, buffer, UNBOUNDED, config)
    }

    fn build(source: R, buffer: PooledBuffer, block_end: u64, config: ReaderConfig) -> Self {
        Self {
            source,
            buffer,
            eof: false,
            position: 0,
            block_end,
            pending: None,
            frames: Vec::new(),
            config,
            net_cache: None,
        }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of open sub-items.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Field number of the header awaiting its value, if any.
    pub fn field_number(&self) -> Option<u32> {
        self.pending.map(|header| header.field_number)
    }

    /// Wire type of the header awaiting its value, if any.
    pub fn wire_type(&self) -> Option<WireType> {
        self.pending.map(|header| header.wire_type)
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Reads the next field header and returns its field number, or 0 at the
    /// end of the current sub-item or of the stream.
    ///
    /// An `EndGroup` header closing the innermost group yields 0; one that
    /// does not match it fails with [`ProtoError::GroupMismatch`].
    pub fn read_field_header(&mut self) -> Result<u32, ProtoError> {
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "the previous field was neither read nor skipped",
            ));
        }
        if self.group_ended() {
            return Ok(0);
        }
        if self.position >= self.block_end {
            return match self.frames.last() {
                Some(ReadFrame {
                    kind: FrameKind::Group { .. },
                    ..
                }) => Err(self.truncated()),
                _ => Ok(0),
            };
        }
        if !self.ensure(1)? {
            if self.frames.is_empty() && self.block_end == UNBOUNDED {
                return Ok(0);
            }
            return Err(self.truncated());
        }

        let tag = self.read_varint()?;
        let header = FieldHeader::from_tag(tag)?;

        if header.wire_type == WireType::EndGroup {
            return match self.frames.last_mut() {
                Some(ReadFrame {
                    kind: FrameKind::Group {
                        field_number,
                        ended,
                    },
                    ..
                }) => {
                    if *field_number != header.field_number {
                        return Err(ProtoError::GroupMismatch {
                            expected: *field_number,
                            actual: header.field_number,
                        });
                    }
                    *ended = true;
                    Ok(0)
                }
                _ => Err(ProtoError::UnexpectedEndGroup(header.field_number)),
            };
        }

        self.pending = Some(header);
        Ok(header.field_number)
    }

    /// Consumes the next field header only if it is for `field_number`.
    /// Used to gather consecutive repeated values.
    pub fn try_read_field_header(&mut self, field_number: u32) -> Result<bool, ProtoError> {
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "the previous field was neither read nor skipped",
            ));
        }
        if self.group_ended() || self.position >= self.block_end {
            return Ok(false);
        }
        loop {
            match decode_varint(&self.buffer) {
                Ok(Some((tag, len))) => {
                    let header = match FieldHeader::from_tag(tag) {
                        Ok(header) => header,
                        Err(_) => return Ok(false),
                    };
                    if header.field_number != field_number
                        || header.wire_type == WireType::EndGroup
                    {
                        return Ok(false);
                    }
                    self.check_limits(len as u64)?;
                    self.advance(len);
                    self.pending = Some(header);
                    return Ok(true);
                }
                Ok(None) => {
                    if !self.fill()? {
                        return Ok(false);
                    }
                }
                Err(_) => return Ok(false),
            }
        }
    }

    pub fn read_uint64(&mut self) -> Result<u64, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => self.read_varint(),
            WireType::Fixed32 => Ok(u64::from(u32::from_le_bytes(self.read_array()?))),
            WireType::Fixed64 => Ok(u64::from_le_bytes(self.read_array()?)),
            other => Err(mismatch("read uint64 from", other)),
        }
    }

    pub fn read_int64(&mut self) -> Result<i64, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => Ok(self.read_varint()? as i64),
            WireType::Fixed32 => Ok(i64::from(i32::from_le_bytes(self.read_array()?))),
            WireType::Fixed64 => Ok(i64::from_le_bytes(self.read_array()?)),
            other => Err(mismatch("read int64 from", other)),
        }
    }

    pub fn read_uint32(&mut self) -> Result<u32, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => {
                let value = self.read_varint()?;
                u32::try_from(value).map_err(|_| ProtoError::ValueOutOfRange { target: "uint32" })
            }
            WireType::Fixed32 => Ok(u32::from_le_bytes(self.read_array()?)),
            WireType::Fixed64 => {
                let value = u64::from_le_bytes(self.read_array()?);
                u32::try_from(value).map_err(|_| ProtoError::ValueOutOfRange { target: "uint32" })
            }
            other => Err(mismatch("read uint32 from", other)),
        }
    }

    /// Reads an `int32`. Varints keep their low 32 bits, so sign-extended
    /// negative values decode correctly.
    pub fn read_int32(&mut self) -> Result<i32, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => Ok(self.read_varint()? as i32),
            WireType::Fixed32 => Ok(i32::from_le_bytes(self.read_array()?)),
            WireType::Fixed64 => {
                let value = i64::from_le_bytes(self.read_array()?);
                i32::try_from(value).map_err(|_| ProtoError::ValueOutOfRange { target: "int32" })
            }
            other => Err(mismatch("read int32 from", other)),
        }
    }

    pub fn read_zigzag_int32(&mut self) -> Result<i32, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => {
                let value = u32::try_from(self.read_varint()?)
                    .map_err(|_| ProtoError::ValueOutOfRange { target: "sint32" })?;
                Ok(zigzag_decode_32(value))
            }
            other => Err(mismatch("read sint32 from", other)),
        }
    }

    pub fn read_zigzag_int64(&mut self) -> Result<i64, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => Ok(zigzag_decode_64(self.read_varint()?)),
            other => Err(mismatch("read sint64 from", other)),
        }
    }

    pub fn read_fixed32(&mut self) -> Result<u32, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed32 => Ok(u32::from_le_bytes(self.read_array()?)),
            other => Err(mismatch("read fixed32 from", other)),
        }
    }

    pub fn read_fixed64(&mut self) -> Result<u64, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed64 => Ok(u64::from_le_bytes(self.read_array()?)),
            other => Err(mismatch("read fixed64 from", other)),
        }
    }

    /// Any non-zero value is `true`.
    pub fn read_bool(&mut self) -> Result<bool, ProtoError> {
        Ok(self.read_uint64()? != 0)
    }

    pub fn read_float(&mut self) -> Result<f32, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed32 => Ok(f32::from_le_bytes(self.read_array()?)),
            WireType::Fixed64 => {
                let value = f64::from_le_bytes(self.read_array()?);
                if value.is_finite() && value.abs() > f64::from(f32::MAX) {
                    return Err(ProtoError::ValueOutOfRange { target: "float" });
                }
                Ok(value as f32)
            }
            other => Err(mismatch("read float from", other)),
        }
    }

    pub fn read_double(&mut self) -> Result<f64, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed64 => Ok(f64::from_le_bytes(self.read_array()?)),
            WireType::Fixed32 => Ok(f64::from(f32::from_le_bytes(self.read_array()?))),
            other => Err(mismatch("read double from", other)),
        }
    }

    pub fn read_string(&mut self) -> Result<String, ProtoError> {
        let position = self.position;
        let bytes = self.read_bytes()?;
        std::str::from_utf8(&bytes)
            .map(str::to_owned)
            .map_err(|_| ProtoError::InvalidUtf8 { position })
    }

    pub fn read_bytes(&mut self) -> Result<Bytes, ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::String => {
                let length = self.read_length()?;
                self.read_payload(length)
            }
            other => Err(mismatch("read bytes from", other)),
        }
    }

    /// Enters the sub-item for the pending `String` or `StartGroup` header.
    pub fn start_sub_item(&mut self) -> Result<SubItemToken, ProtoError> {
        let header = self.take_pending()?;
        let depth = self.frames.len() + 1;
        if depth > self.config.max_depth {
            warn!(depth, max = self.config.max_depth, "reader depth limit exceeded");
            return Err(ProtoError::RecursionLimitExceeded {
                depth,
                max: self.config.max_depth,
            });
        }

        let token = SubItemToken::new(depth, self.position);
        let kind = match header.wire_type {
            WireType::String => {
                let length = self.read_length()? as u64;
                let end = self.position + length;
                let outer_end = self.block_end;
                self.block_end = end;
                FrameKind::Length { end, outer_end }
            }
            WireType::StartGroup => FrameKind::Group {
                field_number: header.field_number,
                ended: false,
            },
            other => return Err(mismatch("start a sub-item from", other)),
        };
        self.frames.push(ReadFrame {
            kind,
            token,
            field_number: header.field_number,
        });
        Ok(token)
    }

    /// Leaves the sub-item identified by `token`, skipping anything the
    /// caller did not read.
    pub fn end_sub_item(&mut self, token: SubItemToken) -> Result<(), ProtoError> {
        let top = match self.frames.last() {
            Some(frame) => *frame,
            None => return Err(ProtoError::InvalidState("no sub-item is open")),
        };
        if top.token != token {
            return Err(ProtoError::FrameMismatch {
                expected: top.token.depth(),
                actual: token.depth(),
            });
        }
        if self.pending.is_some() {
            self.skip_field()?;
        }

        match top.kind {
            FrameKind::Length { end, outer_end } => {
                if self.position > end {
                    return Err(ProtoError::FrameOverrun {
                        position: self.position,
                        end,
                    });
                }
                let remaining = end - self.position;
                if remaining > 0 {
                    debug!(remaining, "skipping unread tail of sub-item");
                    self.skip_bytes(remaining)?;
                }
                self.block_end = outer_end;
            }
            FrameKind::Group { .. } => {
                while self.read_field_header()? != 0 {
                    self.skip_field()?;
                }
            }
        }
        self.frames.pop();
        Ok(())
    }

    /// Skips the value of the pending field, including whole sub-messages
    /// and groups.
    pub fn skip_field(&mut self) -> Result<(), ProtoError> {
        let header = self
            .pending
            .ok_or(ProtoError::InvalidState("no field header has been read"))?;
        match header.wire_type {
            WireType::Varint => {
                self.pending = None;
                self.read_varint()?;
            }
            WireType::Fixed32 => {
                self.pending = None;
                self.skip_bytes(4)?;
            }
            WireType::Fixed64 => {
                self.pending = None;
                self.skip_bytes(8)?;
            }
            WireType::String => {
                self.pending = None;
                let length = self.read_length()?;
                self.skip_bytes(length as u64)?;
            }
            WireType::StartGroup => {
                let token = self.start_sub_item()?;
                self.end_sub_item(token)?;
            }
            WireType::EndGroup => {
                return Err(ProtoError::InvalidState("an end-group marker cannot be skipped"))
            }
        }
        Ok(())
    }

    /// Inside a packed (length-prefixed) sub-item, prepares the next element
    /// for reading as `wire_type`. Returns `false` once the payload is
    /// exhausted.
    pub fn has_sub_value(&mut self, wire_type: WireType) -> Result<bool, ProtoError> {
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "the previous packed value was not read",
            ));
        }
        if !matches!(
            wire_type,
            WireType::Varint | WireType::Fixed32 | WireType::Fixed64
        ) {
            return Err(ProtoError::WireTypeMismatch {
                operation: "read packed values as",
                wire_type,
            });
        }
        match self.frames.last() {
            Some(ReadFrame {
                kind: FrameKind::Length { end, .. },
                field_number,
                ..
            }) => {
                if self.position >= *end {
                    return Ok(false);
                }
                self.pending = Some(FieldHeader::new(*field_number, wire_type)?);
                Ok(true)
            }
            _ => Err(ProtoError::InvalidState(
                "packed values must be read inside a length-prefixed sub-item",
            )),
        }
    }

    /// Finishes reading and returns the source. Every sub-item must have
    /// been ended.
    pub fn close(self) -> Result<R, ProtoError> {
        if !self.frames.is_empty() {
            return Err(ProtoError::UnbalancedFrames {
                open: self.frames.len(),
            });
        }
        debug!(bytes = self.position, "reader closed");
        let ProtoReader { source, .. } = self;
        Ok(source)
    }

    /// The per-operation object cache, created on first use.
    pub fn net_cache(&mut self) -> &mut NetObjectCache {
        let config = self.config.cache_config();
        self.net_cache
            .get_or_insert_with(|| NetObjectCache::with_config(&config))
    }

    fn take_pending(&mut self) -> Result<FieldHeader, ProtoError> {
        self.pending
            .take()
            .ok_or(ProtoError::InvalidState("no field header has been read"))
    }

    fn group_ended(&self) -> bool {
        matches!(
            self.frames.last(),
            Some(ReadFrame {
                kind: FrameKind::Group { ended: true, .. },
                ..
            })
        )
    }

    fn truncated(&self) -> ProtoError {
        let expected_end = match self.block_end {
            UNBOUNDED => self.position + 1,
            end => end,
        };
        ProtoError::TruncatedMessage {
            position: self.position,
            expected_end,
        }
    }

    /// Pulls one more chunk from the source. Returns `false` at end of input.
    fn fill(&mut self) -> Result<bool, ProtoError> {
        if self.eof {
            return Ok(false);
        }
        let start = self.buffer.len();
        self.buffer.resize(start + self.config.buffer_size.max(1), 0);
        let read = loop {
            match self.source.read(&mut self.buffer[start..]) {
                Ok(n) => break n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.buffer.truncate(start);
                    return Err(err.into());
                }
            }
        };
        self.buffer.truncate(start + read);
        if read == 0 {
            self.eof = true;
            return Ok(false);
        }
        Ok(true)
    }

    /// Makes at least `count` unconsumed bytes available, if the source has
    /// them.
    fn ensure(&mut self, count: usize) -> Result<bool, ProtoError> {
        while self.buffer.len() < count {
            if !self.fill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_limits(&self, count: u64) -> Result<(), ProtoError> {
        let end = self.position + count;
        if end > self.block_end {
            return Err(ProtoError::FrameOverrun {
                position: self.position,
                end: self.block_end,
            });
        }
        if end > self.config.max_message_size {
            return Err(ProtoError::MessageTooLarge {
                size: end,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn advance(&mut self, count: usize) {
        self.buffer.advance(count);
        self.position += count as u64;
    }

    fn read_varint(&mut self) -> Result<u64, ProtoError> {
        let position = self.position;
        loop {
            match decode_varint(&self.buffer) {
                Ok(Some((value, len))) => {
                    self.check_limits(len as u64)?;
                    self.advance(len);
                    return Ok(value);
                }
                Ok(None) => {
                    if !self.fill()? {
                        return Err(self.truncated());
                    }
                }
                Err(_) => return Err(ProtoError::MalformedVarint { position }),
            }
        }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        self.check_limits(N as u64)?;
        if !self.ensure(N)? {
            return Err(self.truncated());
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[..N]);
        self.advance(N);
        Ok(out)
    }

    /// Reads a length prefix and checks it against the current window.
    fn read_length(&mut self) -> Result<usize, ProtoError> {
        let length = self.read_varint()?;
        let remaining = self.block_end.saturating_sub(self.position);
        if length > remaining {
            return Err(ProtoError::LengthOutOfRange { length, remaining });
        }
        self.check_limits(length)?;
        usize::try_from(length).map_err(|_| ProtoError::LengthOutOfRange { length, remaining })
    }

    fn read_payload(&mut self, length: usize) -> Result<Bytes, ProtoError> {
        if !self.ensure(length)? {
            return Err(self.truncated());
        }
        let payload = Bytes::copy_from_slice(&self.buffer[..length]);
        self.advance(length);
        Ok(payload)
    }

    fn skip_bytes(&mut self, mut count: u64) -> Result<(), ProtoError> {
        self.check_limits(count)?;
        while count > 0 {
            if self.buffer.is_empty() && !self.fill()? {
                return Err(self.truncated());
            }
            let step = count.min(self.buffer.len() as u64) as usize;
            self.advance(step);
            count -= step as u64;
        }
        Ok(())
    }
}

fn mismatch(operation: &'static str, wire_type: WireType) -> ProtoError {
    ProtoError::UnexpectedWireType {
        operation,
        wire_type,
    }
}

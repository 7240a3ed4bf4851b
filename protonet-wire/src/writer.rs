//! Encode path.
//!
//! A [`ProtoWriter`] emits one field at a time: a header via
//! [`ProtoWriter::write_field_header`], then exactly one value whose encoding
//! is chosen by the pending header's wire type. Nested messages and groups are
//! bracketed by [`ProtoWriter::start_sub_item`] / [`ProtoWriter::end_sub_item`].
//!
//! Length-prefixed sub-items are framed according to the writer's mode:
//!
//! ```text
//! Buffered   [tag][0x00 placeholder][payload ...]   patched on end_sub_item,
//!                                                    payload shifted when the
//!                                                    length needs > 1 byte
//! Streaming  [tag][declared length][payload ...]    length supplied up front
//! Measure    nothing is stored; only the byte count advances
//! ```

use crate::config::{WriteMode, WriterConfig};
use crate::error::ProtoError;
use crate::pool::{BufferPool, PooledBuffer};
use crate::wire::{
    encode_varint, varint_len, zigzag_encode_32, zigzag_encode_64, FieldHeader, SubItemToken,
    WireType, MAX_VARINT_LEN,
};
use bytes::BufMut;
use protonet_cache::{CachedValue, NetObjectCache, ROOT_KEY};
use std::io::{self, Write};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkMode {
    Buffered,
    Streaming,
    Measure,
}

impl From<WriteMode> for SinkMode {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Buffered => SinkMode::Buffered,
            WriteMode::Streaming => SinkMode::Streaming,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    /// One placeholder byte at `patch_offset` in the buffer.
    LengthPrefixed { patch_offset: usize },
    /// Length already written; checked when the frame closes.
    Declared { length: u64 },
    /// Measure mode: the prefix is accounted for when the frame closes.
    Measured,
    Group { field_number: u32 },
}

impl FrameKind {
    fn is_length_delimited(&self) -> bool {
        !matches!(self, FrameKind::Group { .. })
    }
}

#[derive(Debug)]
struct OpenFrame {
    kind: FrameKind,
    token: SubItemToken,
    /// Address of the instance being written, for cycle detection.
    identity: Option<usize>,
}

/// Protobuf wire writer over any [`Write`] sink.
#[derive(Debug)]
pub struct ProtoWriter<W> {
    sink: W,
    buffer: PooledBuffer,
    mode: SinkMode,
    /// Bytes emitted so far, flushed or not.
    position: u64,
    /// Open placeholder frames; the buffer is pinned while non-zero.
    flush_lock: usize,
    pending: Option<FieldHeader>,
    frames: Vec<OpenFrame>,
    packed_field: Option<u32>,
    config: WriterConfig,
    net_cache: Option<NetObjectCache>,
}

impl<W: Write> ProtoWriter<W> {
    pub fn new(sink: W) -> Self {
        Self::with_config(sink, WriterConfig::default())
    }

    pub fn with_config(sink: W, config: WriterConfig) -> Self {
        let buffer = PooledBuffer::detached(config.flush_threshold);
        let mode = SinkMode::from(config.mode);
        Self::build(sink, buffer, mode, config)
    }

    /// Creates a writer whose working buffer is checked out of `pool`.
    pub fn with_pool(sink: W, config: WriterConfig, pool: &BufferPool) -> Self {
        let buffer = pool.checkout(config.flush_threshold);
        let mode = SinkMode::from(config.mode);
        Self::build(sink, buffer, mode, config)
    }

    fn build(sink: W, buffer: PooledBuffer, mode: SinkMode, config: WriterConfig) -> Self {
        Self {
            sink,
            buffer,
            mode,
            position: 0,
            flush_lock: 0,
            pending: None,
            frames: Vec::new(),
            packed_field: None,
            config,
            net_cache: None,
        }
    }

    /// Total bytes written so far, including bytes still buffered.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of open sub-items.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Wire type of the header awaiting its value, if any.
    pub fn pending_wire_type(&self) -> Option<WireType> {
        self.pending.map(|header| header.wire_type)
    }

    pub fn get_ref(&self) -> &W {
        &self.sink
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Writes a field header. The next call must write its value (or open a
    /// sub-item for `String` / `StartGroup`).
    ///
    /// `EndGroup` headers are emitted by [`end_sub_item`](Self::end_sub_item)
    /// and cannot be written directly. Inside a packed field, headers for the
    /// packed field number emit nothing.
    pub fn write_field_header(
        &mut self,
        field_number: u32,
        wire_type: WireType,
    ) -> Result<(), ProtoError> {
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "a field header is already pending; write its value first",
            ));
        }
        let header = FieldHeader::new(field_number, wire_type)?;
        if wire_type == WireType::EndGroup {
            return Err(ProtoError::InvalidState(
                "end-group markers are written by end_sub_item",
            ));
        }

        if let Some(packed) = self.packed_field {
            if field_number != packed {
                return Err(ProtoError::InvalidState(
                    "only the packed field may be written inside a packed sub-item",
                ));
            }
            return match wire_type {
                WireType::Varint | WireType::Fixed32 | WireType::Fixed64 => {
                    self.pending = Some(header);
                    Ok(())
                }
                other => Err(mismatch("pack", other)),
            };
        }

        self.put_varint(u64::from(header.tag()));
        self.pending = Some(header);
        Ok(())
    }

    pub fn write_int32(&mut self, value: i32) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            // Sign-extended to 64 bits: negative values take ten bytes.
            WireType::Varint => self.put_varint(value as i64 as u64),
            WireType::Fixed32 => self.put(&value.to_le_bytes()),
            WireType::Fixed64 => self.put(&i64::from(value).to_le_bytes()),
            other => return Err(mismatch("write int32 to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_int64(&mut self, value: i64) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => self.put_varint(value as u64),
            WireType::Fixed32 => {
                let narrow = i32::try_from(value)
                    .map_err(|_| ProtoError::ValueOutOfRange { target: "fixed32" })?;
                self.put(&narrow.to_le_bytes());
            }
            WireType::Fixed64 => self.put(&value.to_le_bytes()),
            other => return Err(mismatch("write int64 to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_uint32(&mut self, value: u32) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => self.put_varint(u64::from(value)),
            WireType::Fixed32 => self.put(&value.to_le_bytes()),
            WireType::Fixed64 => self.put(&u64::from(value).to_le_bytes()),
            other => return Err(mismatch("write uint32 to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_uint64(&mut self, value: u64) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => self.put_varint(value),
            WireType::Fixed32 => {
                let narrow = u32::try_from(value)
                    .map_err(|_| ProtoError::ValueOutOfRange { target: "fixed32" })?;
                self.put(&narrow.to_le_bytes());
            }
            WireType::Fixed64 => self.put(&value.to_le_bytes()),
            other => return Err(mismatch("write uint64 to", other)),
        }
        self.maybe_flush()
    }

    /// Writes a zig-zag encoded `sint32`. Requires a `Varint` header.
    pub fn write_zigzag_int32(&mut self, value: i32) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => self.put_varint(u64::from(zigzag_encode_32(value))),
            other => return Err(mismatch("write sint32 to", other)),
        }
        self.maybe_flush()
    }

    /// Writes a zig-zag encoded `sint64`. Requires a `Varint` header.
    pub fn write_zigzag_int64(&mut self, value: i64) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Varint => self.put_varint(zigzag_encode_64(value)),
            other => return Err(mismatch("write sint64 to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_fixed32(&mut self, value: u32) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed32 => self.put(&value.to_le_bytes()),
            other => return Err(mismatch("write fixed32 to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_fixed64(&mut self, value: u64) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed64 => self.put(&value.to_le_bytes()),
            other => return Err(mismatch("write fixed64 to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_bool(&mut self, value: bool) -> Result<(), ProtoError> {
        self.write_uint32(u32::from(value))
    }

    pub fn write_float(&mut self, value: f32) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed32 => self.put(&value.to_le_bytes()),
            WireType::Fixed64 => self.put(&f64::from(value).to_le_bytes()),
            other => return Err(mismatch("write float to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_double(&mut self, value: f64) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::Fixed64 => self.put(&value.to_le_bytes()),
            WireType::Fixed32 => {
                if value.is_finite() && value.abs() > f64::from(f32::MAX) {
                    return Err(ProtoError::ValueOutOfRange { target: "float" });
                }
                self.put(&(value as f32).to_le_bytes());
            }
            other => return Err(mismatch("write double to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_string(&mut self, value: &str) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::String => self.put_length_delimited(value.as_bytes())?,
            other => return Err(mismatch("write string to", other)),
        }
        self.maybe_flush()
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<(), ProtoError> {
        match self.take_pending()?.wire_type {
            WireType::String => self.put_length_delimited(value)?,
            other => return Err(mismatch("write bytes to", other)),
        }
        self.maybe_flush()
    }

    /// Opens a sub-item for the pending `String` or `StartGroup` header.
    ///
    /// Passing the instance being written enables cycle detection: once the
    /// depth exceeds `recursion_check_depth`, an instance already open
    /// further up the stack fails with [`ProtoError::RecursionDetected`].
    ///
    /// Length-prefixed sub-items on a streaming writer must use
    /// [`start_sub_item_with_length`](Self::start_sub_item_with_length).
    pub fn start_sub_item<T: ?Sized>(
        &mut self,
        instance: Option<&T>,
    ) -> Result<SubItemToken, ProtoError> {
        let header = self.take_pending()?;
        let identity = instance.and_then(address_of);
        self.check_depth(identity)?;

        let kind = match header.wire_type {
            WireType::StartGroup => FrameKind::Group {
                field_number: header.field_number,
            },
            WireType::String => match self.mode {
                SinkMode::Buffered => {
                    let patch_offset = self.buffer.len();
                    self.put(&[0]);
                    self.flush_lock += 1;
                    FrameKind::LengthPrefixed { patch_offset }
                }
                SinkMode::Measure => FrameKind::Measured,
                SinkMode::Streaming => {
                    return Err(ProtoError::InvalidState(
                        "streaming writers need the sub-item length up front",
                    ))
                }
            },
            other => return Err(mismatch("start a sub-item in", other)),
        };
        Ok(self.push_frame(kind, identity))
    }

    /// Opens a length-prefixed sub-item whose payload length is already
    /// known, typically from a [`measure`](ProtoWriter::measure) pass. Works
    /// in every mode; the length is verified when the sub-item closes.
    pub fn start_sub_item_with_length<T: ?Sized>(
        &mut self,
        length: u64,
        instance: Option<&T>,
    ) -> Result<SubItemToken, ProtoError> {
        let header = self.take_pending()?;
        if header.wire_type != WireType::String {
            return Err(mismatch("start a length-prefixed sub-item in", header.wire_type));
        }
        if length > self.config.max_message_size {
            return Err(ProtoError::MessageTooLarge {
                size: length,
                max: self.config.max_message_size,
            });
        }
        let identity = instance.and_then(address_of);
        self.check_depth(identity)?;

        self.put_varint(length);
        Ok(self.push_frame(FrameKind::Declared { length }, identity))
    }

    /// Closes the sub-item identified by `token`, which must be the most
    /// recently opened one.
    pub fn end_sub_item(&mut self, token: SubItemToken) -> Result<(), ProtoError> {
        let top = match self.frames.last() {
            Some(frame) => frame,
            None => return Err(ProtoError::InvalidState("no sub-item is open")),
        };
        if top.token != token {
            return Err(ProtoError::FrameMismatch {
                expected: top.token.depth(),
                actual: token.depth(),
            });
        }
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "a field header inside the sub-item has no value",
            ));
        }
        let kind = top.kind;
        let start = top.token.start();
        self.frames.pop();
        self.packed_field = None;

        match kind {
            FrameKind::Group { field_number } => {
                let header = FieldHeader::new(field_number, WireType::EndGroup)?;
                self.put_varint(u64::from(header.tag()));
            }
            FrameKind::LengthPrefixed { patch_offset } => {
                self.backpatch(patch_offset, start)?;
            }
            FrameKind::Measured => {
                let length = self.payload_length(start)?;
                self.position += varint_len(length) as u64;
            }
            FrameKind::Declared { length } => {
                let actual = self.position - start;
                if actual != length {
                    return Err(ProtoError::LengthMismatch {
                        declared: length,
                        actual,
                    });
                }
            }
        }
        self.maybe_flush()
    }

    /// Marks `field_number` as a packed repeated field inside the current
    /// length-prefixed sub-item: its headers emit nothing and only the raw
    /// values are written.
    pub fn set_packed_field(&mut self, field_number: u32) -> Result<(), ProtoError> {
        FieldHeader::new(field_number, WireType::Varint)?;
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "a field header is pending; write its value first",
            ));
        }
        match self.frames.last() {
            Some(frame) if frame.kind.is_length_delimited() => {}
            _ => {
                return Err(ProtoError::InvalidState(
                    "packed fields must be written inside a length-prefixed sub-item",
                ))
            }
        }
        self.packed_field = Some(field_number);
        Ok(())
    }

    pub fn clear_packed_field(&mut self, field_number: u32) -> Result<(), ProtoError> {
        if self.packed_field != Some(field_number) {
            return Err(ProtoError::InvalidState("field is not the current packed field"));
        }
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "a field header is pending; write its value first",
            ));
        }
        self.packed_field = None;
        Ok(())
    }

    /// Pushes buffered bytes to the sink. Does nothing while a backpatched
    /// sub-item is open.
    pub fn flush(&mut self) -> Result<(), ProtoError> {
        if self.flush_lock > 0 {
            return Ok(());
        }
        self.flush_buffer()?;
        self.sink.flush()?;
        Ok(())
    }

    /// Finishes writing and returns the sink. Every sub-item must be closed
    /// and no header may be left without its value.
    pub fn close(mut self) -> Result<W, ProtoError> {
        if !self.frames.is_empty() {
            return Err(ProtoError::UnbalancedFrames {
                open: self.frames.len(),
            });
        }
        if self.pending.is_some() {
            return Err(ProtoError::InvalidState(
                "a field header was written without a value",
            ));
        }
        self.flush_buffer()?;
        self.sink.flush()?;
        debug!(bytes = self.position, "writer closed");

        let ProtoWriter { sink, .. } = self;
        Ok(sink)
    }

    /// The per-operation object cache, created on first use.
    pub fn net_cache(&mut self) -> &mut NetObjectCache {
        let config = self.config.cache_config();
        self.net_cache
            .get_or_insert_with(|| NetObjectCache::with_config(&config))
    }

    /// Binds `value` as the root object (key 0) of this operation's cache.
    pub fn set_root_object(&mut self, value: &CachedValue) -> Result<(), ProtoError> {
        self.net_cache().set_keyed_object(ROOT_KEY, value.clone())?;
        Ok(())
    }

    fn take_pending(&mut self) -> Result<FieldHeader, ProtoError> {
        self.pending
            .take()
            .ok_or(ProtoError::InvalidState("no field header has been written"))
    }

    fn check_depth(&self, identity: Option<usize>) -> Result<(), ProtoError> {
        let depth = self.frames.len() + 1;
        if depth > self.config.max_depth {
            warn!(depth, max = self.config.max_depth, "writer depth limit exceeded");
            return Err(ProtoError::RecursionLimitExceeded {
                depth,
                max: self.config.max_depth,
            });
        }
        if let Some(identity) = identity {
            if depth > self.config.recursion_check_depth {
                if let Some(index) = self
                    .frames
                    .iter()
                    .rposition(|frame| frame.identity == Some(identity))
                {
                    let offset = self.frames.len() - index;
                    warn!(depth, offset, "instance is already being written");
                    return Err(ProtoError::RecursionDetected { offset });
                }
            }
        }
        Ok(())
    }

    fn push_frame(&mut self, kind: FrameKind, identity: Option<usize>) -> SubItemToken {
        let token = SubItemToken::new(self.frames.len() + 1, self.position);
        self.frames.push(OpenFrame {
            kind,
            token,
            identity,
        });
        token
    }

    fn payload_length(&self, start: u64) -> Result<u64, ProtoError> {
        let length = self.position - start;
        if length > self.config.max_message_size {
            return Err(ProtoError::MessageTooLarge {
                size: length,
                max: self.config.max_message_size,
            });
        }
        Ok(length)
    }

    /// Replaces the placeholder at `patch_offset` with the real length,
    /// shifting the payload right when the prefix needs more than one byte.
    fn backpatch(&mut self, patch_offset: usize, start: u64) -> Result<(), ProtoError> {
        self.flush_lock -= 1;
        let length = self.payload_length(start)?;
        let mut prefix = [0u8; MAX_VARINT_LEN];
        let needed = encode_varint(length, &mut prefix);

        if needed > 1 {
            let extra = needed - 1;
            let end = self.buffer.len();
            self.buffer.resize(end + extra, 0);
            self.buffer
                .copy_within(patch_offset + 1..end, patch_offset + needed);
            self.position += extra as u64;
            trace!(length, extra, "shifted sub-item payload for length prefix");
        }
        self.buffer[patch_offset..patch_offset + needed].copy_from_slice(&prefix[..needed]);
        Ok(())
    }

    fn put(&mut self, bytes: &[u8]) {
        if self.mode != SinkMode::Measure {
            self.buffer.put_slice(bytes);
        }
        self.position += bytes.len() as u64;
    }

    fn put_varint(&mut self, value: u64) {
        let mut buf = [0u8; MAX_VARINT_LEN];
        let len = encode_varint(value, &mut buf);
        self.put(&buf[..len]);
    }

    fn put_length_delimited(&mut self, payload: &[u8]) -> Result<(), ProtoError> {
        let length = payload.len() as u64;
        if length > self.config.max_message_size {
            return Err(ProtoError::MessageTooLarge {
                size: length,
                max: self.config.max_message_size,
            });
        }
        self.put_varint(length);
        self.put(payload);
        Ok(())
    }

    fn maybe_flush(&mut self) -> Result<(), ProtoError> {
        if self.flush_lock == 0 && self.buffer.len() >= self.config.flush_threshold {
            self.flush_buffer()?;
        }
        Ok(())
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        trace!(bytes = self.buffer.len(), "flushing writer buffer");
        self.sink.write_all(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }
}

impl ProtoWriter<io::Sink> {
    /// A writer that stores nothing and only counts the bytes that would be
    /// written, nested length prefixes included.
    pub fn measure() -> Self {
        let config = WriterConfig::default();
        Self::build(
            io::sink(),
            PooledBuffer::detached(0),
            SinkMode::Measure,
            config,
        )
    }

    /// Runs `f` against a measuring writer and returns the encoded size.
    pub fn measure_with<F>(f: F) -> Result<u64, ProtoError>
    where
        F: FnOnce(&mut ProtoWriter<io::Sink>) -> Result<(), ProtoError>,
    {
        let mut writer = Self::measure();
        f(&mut writer)?;
        let length = writer.position();
        writer.close()?;
        Ok(length)
    }
}

fn mismatch(operation: &'static str, wire_type: WireType) -> ProtoError {
    ProtoError::WireTypeMismatch {
        operation,
        wire_type,
    }
}

/// Zero-sized values share addresses, so they are never tracked.
fn address_of<T: ?Sized>(instance: &T) -> Option<usize> {
    if std::mem::size_of_val(instance) == 0 {
        return None;
    }
    Some(instance as *const T as *const () as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    const NO_INSTANCE: Option<&()> = None;

    fn encode<F>(f: F) -> Vec<u8>
    where
        F: FnOnce(&mut ProtoWriter<Vec<u8>>) -> Result<(), ProtoError>,
    {
        let mut writer = ProtoWriter::new(Vec::new());
        f(&mut writer).unwrap();
        writer.close().unwrap()
    }

    #[test]
    fn test_small_varints_exact_bytes() {
        let bytes = encode(|w| {
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(0)
        });
        assert_eq!(bytes, vec![0x08, 0x00]);

        let bytes = encode(|w| {
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(127)
        });
        assert_eq!(bytes, vec![0x08, 0x7F]);

        let bytes = encode(|w| {
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(128)
        });
        assert_eq!(bytes, vec![0x08, 0x80, 0x01]);
    }

    #[test]
    fn test_negative_int32_is_ten_bytes() {
        let bytes = encode(|w| {
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(-1)
        });
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[0], 0x08);
        assert_eq!(bytes[10], 0x01);
        assert!(bytes[1..10].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_zigzag_minus_one() {
        let bytes = encode(|w| {
            w.write_field_header(1, WireType::Varint)?;
            w.write_zigzag_int32(-1)
        });
        assert_eq!(bytes, vec![0x08, 0x01]);
    }

    #[test]
    fn test_fixed_width_values() {
        let bytes = encode(|w| {
            w.write_field_header(1, WireType::Fixed32)?;
            w.write_int32(-2)?;
            w.write_field_header(2, WireType::Fixed64)?;
            w.write_fixed64(1)?;
            w.write_field_header(3, WireType::Fixed32)?;
            w.write_float(1.0)
        });
        assert_eq!(
            bytes,
            vec![
                0x0D, 0xFE, 0xFF, 0xFF, 0xFF, // field 1 sfixed32 -2
                0x11, 0x01, 0, 0, 0, 0, 0, 0, 0, // field 2 fixed64 1
                0x1D, 0x00, 0x00, 0x80, 0x3F, // field 3 float 1.0
            ]
        );
    }

    #[test]
    fn test_fixed32_narrowing_is_range_checked() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write_field_header(1, WireType::Fixed32).unwrap();
        let err = writer.write_int64(i64::from(i32::MAX) + 1).unwrap_err();
        assert!(matches!(err, ProtoError::ValueOutOfRange { target: "fixed32" }));
    }

    #[test]
    fn test_double_narrowing_to_fixed32_is_range_checked() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write_field_header(1, WireType::Fixed32).unwrap();
        let err = writer.write_double(f64::MAX).unwrap_err();
        assert!(matches!(err, ProtoError::ValueOutOfRange { target: "float" }));

        writer.write_field_header(1, WireType::Fixed32).unwrap();
        writer.write_double(1.5).unwrap();
        assert_eq!(writer.close().unwrap(), vec![0x0D, 0x00, 0x00, 0xC0, 0x3F]);
    }

    #[test]
    fn test_string_field() {
        let bytes = encode(|w| {
            w.write_field_header(2, WireType::String)?;
            w.write_string("testing")
        });
        assert_eq!(
            bytes,
            vec![0x12, 0x07, b't', b'e', b's', b't', b'i', b'n', b'g']
        );
    }

    #[test]
    fn test_nested_message() {
        let bytes = encode(|w| {
            w.write_field_header(3, WireType::String)?;
            let token = w.start_sub_item(NO_INSTANCE)?;
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(150)?;
            w.end_sub_item(token)
        });
        assert_eq!(bytes, vec![0x1A, 0x03, 0x08, 0x96, 0x01]);
    }

    #[test]
    fn test_long_sub_item_shifts_payload() {
        let payload = vec![0xABu8; 200];
        let bytes = encode(|w| {
            w.write_field_header(1, WireType::String)?;
            let outer = w.start_sub_item(NO_INSTANCE)?;
            w.write_field_header(2, WireType::String)?;
            let inner = w.start_sub_item(NO_INSTANCE)?;
            w.write_field_header(3, WireType::String)?;
            w.write_bytes(&payload)?;
            w.end_sub_item(inner)?;
            w.end_sub_item(outer)
        });

        // inner payload: tag(1) + len(2) + 200 = 203 -> prefix CB 01
        // outer payload: tag(1) + prefix(2) + 203 = 206 -> prefix CE 01
        assert_eq!(&bytes[..3], &[0x0A, 0xCE, 0x01]);
        assert_eq!(&bytes[3..6], &[0x12, 0xCB, 0x01]);
        assert_eq!(&bytes[6..9], &[0x1A, 0xC8, 0x01]);
        assert_eq!(&bytes[9..], &payload[..]);
        assert_eq!(bytes.len(), 3 + 206);
    }

    #[test]
    fn test_group() {
        let bytes = encode(|w| {
            w.write_field_header(3, WireType::StartGroup)?;
            let token = w.start_sub_item(NO_INSTANCE)?;
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(150)?;
            w.end_sub_item(token)
        });
        assert_eq!(bytes, vec![0x1B, 0x08, 0x96, 0x01, 0x1C]);
    }

    #[test]
    fn test_packed_field() {
        let bytes = encode(|w| {
            w.write_field_header(4, WireType::String)?;
            let token = w.start_sub_item(NO_INSTANCE)?;
            w.set_packed_field(4)?;
            for value in [3u32, 270, 86942] {
                w.write_field_header(4, WireType::Varint)?;
                w.write_uint32(value)?;
            }
            w.clear_packed_field(4)?;
            w.end_sub_item(token)
        });
        assert_eq!(
            bytes,
            vec![0x22, 0x06, 0x03, 0x8E, 0x02, 0x9E, 0xA7, 0x05]
        );
    }

    #[test]
    fn test_packed_field_rules() {
        let mut writer = ProtoWriter::new(Vec::new());
        assert!(matches!(
            writer.set_packed_field(4),
            Err(ProtoError::InvalidState(_))
        ));

        writer.write_field_header(4, WireType::String).unwrap();
        let token = writer.start_sub_item(NO_INSTANCE).unwrap();
        writer.set_packed_field(4).unwrap();
        assert!(matches!(
            writer.write_field_header(5, WireType::Varint),
            Err(ProtoError::InvalidState(_))
        ));
        assert!(matches!(
            writer.write_field_header(4, WireType::String),
            Err(ProtoError::WireTypeMismatch { .. })
        ));
        assert!(matches!(
            writer.clear_packed_field(5),
            Err(ProtoError::InvalidState(_))
        ));
        writer.end_sub_item(token).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_state_machine_errors() {
        let mut writer = ProtoWriter::new(Vec::new());
        assert!(matches!(
            writer.write_int32(1),
            Err(ProtoError::InvalidState(_))
        ));
        assert!(matches!(
            writer.write_field_header(0, WireType::Varint),
            Err(ProtoError::InvalidFieldNumber(0))
        ));
        assert!(matches!(
            writer.write_field_header(1, WireType::EndGroup),
            Err(ProtoError::InvalidState(_))
        ));

        writer.write_field_header(1, WireType::Varint).unwrap();
        assert!(matches!(
            writer.write_field_header(2, WireType::Varint),
            Err(ProtoError::InvalidState(_))
        ));
        let err = writer.write_string("x").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Contract);
        assert_eq!(err.to_string(), "cannot write string to a varint field");
    }

    #[test]
    fn test_close_rejects_pending_header() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write_field_header(1, WireType::Varint).unwrap();
        assert!(matches!(writer.close(), Err(ProtoError::InvalidState(_))));
    }

    #[test]
    fn test_frame_mismatch_and_unbalanced() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write_field_header(1, WireType::String).unwrap();
        let outer = writer.start_sub_item(NO_INSTANCE).unwrap();
        writer.write_field_header(2, WireType::StartGroup).unwrap();
        let inner = writer.start_sub_item(NO_INSTANCE).unwrap();

        let err = writer.end_sub_item(outer).unwrap_err();
        assert!(matches!(
            err,
            ProtoError::FrameMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert_eq!(err.category(), ErrorCategory::Framing);

        writer.end_sub_item(inner).unwrap();
        assert!(matches!(
            writer.close(),
            Err(ProtoError::UnbalancedFrames { open: 1 })
        ));
    }

    #[test]
    fn test_streaming_requires_declared_length() {
        let config = WriterConfig::new().with_mode(WriteMode::Streaming);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);
        writer.write_field_header(3, WireType::String).unwrap();
        assert!(matches!(
            writer.start_sub_item(NO_INSTANCE),
            Err(ProtoError::InvalidState(_))
        ));
    }

    #[test]
    fn test_streaming_with_measured_length() {
        let length = ProtoWriter::measure_with(|w| {
            w.write_field_header(1, WireType::Varint)?;
            w.write_int32(150)
        })
        .unwrap();
        assert_eq!(length, 3);

        let config = WriterConfig::new().with_mode(WriteMode::Streaming);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);
        writer.write_field_header(3, WireType::String).unwrap();
        let token = writer
            .start_sub_item_with_length(length, NO_INSTANCE)
            .unwrap();
        writer.write_field_header(1, WireType::Varint).unwrap();
        writer.write_int32(150).unwrap();
        writer.end_sub_item(token).unwrap();
        assert_eq!(
            writer.close().unwrap(),
            vec![0x1A, 0x03, 0x08, 0x96, 0x01]
        );
    }

    #[test]
    fn test_declared_length_mismatch() {
        let mut writer = ProtoWriter::new(Vec::new());
        writer.write_field_header(3, WireType::String).unwrap();
        let token = writer.start_sub_item_with_length(5, NO_INSTANCE).unwrap();
        writer.write_field_header(1, WireType::Varint).unwrap();
        writer.write_int32(1).unwrap();
        assert!(matches!(
            writer.end_sub_item(token),
            Err(ProtoError::LengthMismatch {
                declared: 5,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_measure_matches_buffered_output() {
        fn write_tree<W: Write>(w: &mut ProtoWriter<W>) -> Result<(), ProtoError> {
            w.write_field_header(1, WireType::String)?;
            let outer = w.start_sub_item(NO_INSTANCE)?;
            for i in 0..40 {
                w.write_field_header(2, WireType::String)?;
                let inner = w.start_sub_item(NO_INSTANCE)?;
                w.write_field_header(1, WireType::Varint)?;
                w.write_int64(-i)?;
                w.write_field_header(2, WireType::String)?;
                w.write_string("node")?;
                w.end_sub_item(inner)?;
            }
            w.end_sub_item(outer)
        }

        let measured = ProtoWriter::measure_with(write_tree).unwrap();
        let mut writer = ProtoWriter::new(Vec::new());
        write_tree(&mut writer).unwrap();
        let bytes = writer.close().unwrap();
        assert_eq!(measured, bytes.len() as u64);
        assert!(measured > 127);
    }

    #[test]
    fn test_recursion_detected_past_check_depth() {
        let config = WriterConfig::new().with_recursion_check_depth(2);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);
        let node = String::from("self-referencing");

        let mut result = Ok(());
        for _ in 0..4 {
            writer.write_field_header(1, WireType::String).unwrap();
            match writer.start_sub_item(Some(&node)) {
                Ok(_) => {}
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        let err = result.unwrap_err();
        assert!(matches!(err, ProtoError::RecursionDetected { offset: 1 }));
        assert_eq!(err.category(), ErrorCategory::ResourceLimit);
        assert_eq!(writer.depth(), 2);
    }

    #[test]
    fn test_distinct_instances_are_not_recursion() {
        let config = WriterConfig::new().with_recursion_check_depth(0);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);
        let nodes: Vec<u64> = (0..5).collect();
        let mut tokens = Vec::new();
        for node in &nodes {
            writer.write_field_header(1, WireType::StartGroup).unwrap();
            tokens.push(writer.start_sub_item(Some(node)).unwrap());
        }
        for token in tokens.into_iter().rev() {
            writer.end_sub_item(token).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_zero_sized_instances_are_untracked() {
        #[derive(Debug)]
        struct Empty;

        let config = WriterConfig::new().with_recursion_check_depth(0);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);
        let nodes = vec![Empty, Empty];
        let mut tokens = Vec::new();
        for node in nodes.iter().chain(nodes.iter()) {
            writer.write_field_header(1, WireType::StartGroup).unwrap();
            tokens.push(writer.start_sub_item(Some(node)).unwrap());
        }
        for token in tokens.into_iter().rev() {
            writer.end_sub_item(token).unwrap();
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_oversized_sub_item_releases_flush_lock() {
        let config = WriterConfig::new()
            .with_flush_threshold(1)
            .with_max_message_size(4);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);

        writer.write_field_header(1, WireType::String).unwrap();
        let token = writer.start_sub_item(NO_INSTANCE).unwrap();
        writer.write_field_header(1, WireType::Varint).unwrap();
        writer.write_uint64(u64::MAX).unwrap();
        assert!(writer.get_ref().is_empty());

        let err = writer.end_sub_item(token).unwrap_err();
        assert!(matches!(err, ProtoError::MessageTooLarge { size: 11, max: 4 }));
        assert_eq!(writer.flush_lock, 0);

        writer.flush().unwrap();
        assert_eq!(writer.get_ref().len(), 13);
    }

    #[test]
    fn test_depth_limit() {
        let config = WriterConfig::new().with_max_depth(3);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);
        for _ in 0..3 {
            writer.write_field_header(1, WireType::StartGroup).unwrap();
            let _ = writer.start_sub_item(NO_INSTANCE).unwrap();
        }
        writer.write_field_header(1, WireType::StartGroup).unwrap();
        assert!(matches!(
            writer.start_sub_item(NO_INSTANCE),
            Err(ProtoError::RecursionLimitExceeded { depth: 4, max: 3 })
        ));
    }

    #[test]
    fn test_flush_suspended_while_backpatching() {
        let config = WriterConfig::new().with_flush_threshold(4);
        let mut writer = ProtoWriter::with_config(Vec::new(), config);

        writer.write_field_header(1, WireType::String).unwrap();
        writer.write_string("hello").unwrap();
        assert_eq!(writer.get_ref().len(), 7);

        writer.write_field_header(2, WireType::String).unwrap();
        let token = writer.start_sub_item(NO_INSTANCE).unwrap();
        writer.write_field_header(1, WireType::String).unwrap();
        writer.write_string("world").unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.get_ref().len(), 7);

        writer.end_sub_item(token).unwrap();
        assert_eq!(writer.get_ref().len(), 7 + 2 + 7);
        assert_eq!(writer.position(), 16);
    }

    #[test]
    fn test_pooled_buffer_returns_on_close() {
        let pool = BufferPool::new();
        let mut writer = ProtoWriter::with_pool(Vec::new(), WriterConfig::default(), &pool);
        writer.write_field_header(1, WireType::Varint).unwrap();
        writer.write_bool(true).unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(writer.close().unwrap(), vec![0x08, 0x01]);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_root_object_binding() {
        let mut writer = ProtoWriter::new(Vec::new());
        let root = CachedValue::object(42u32);
        writer.set_root_object(&root).unwrap();
        assert_eq!(writer.net_cache().add_object_key(&root).unwrap(), (0, true));

        let other = CachedValue::object(7u32);
        let err = writer.set_root_object(&other).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CacheConsistency);
    }
}

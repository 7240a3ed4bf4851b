//! Schema-less decoding.
//!
//! Without a schema the wire format only says how each value is framed, not
//! what it means. Length-delimited payloads are interpreted greedily: as a
//! nested message if they parse completely, otherwise as UTF-8 text,
//! otherwise as raw bytes.

use bytes::Bytes;
use colored::Colorize;
use protonet_wire::{ProtoError, ProtoReader, ReaderConfig, WireType};
use std::fmt::Write as _;
use std::io::Read;

/// A decoded field.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub number: u32,
    pub value: FieldValue,
}

/// A field value as far as the wire format can tell.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Varint(u64),
    Fixed32(u32),
    Fixed64(u64),
    Message(Vec<Field>),
    Group(Vec<Field>),
    Text(String),
    Bytes(Bytes),
}

/// Totals gathered over a decoded tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub fields: usize,
    pub messages: usize,
    pub max_depth: usize,
}

/// Decodes an entire stream into a field tree.
pub fn decode<R: Read>(source: R, config: &ReaderConfig) -> Result<(Vec<Field>, u64), ProtoError> {
    let mut reader = ProtoReader::with_config(source, config.clone());
    let fields = decode_fields(&mut reader, config, 0)?;
    let size = reader.position();
    reader.close()?;
    Ok((fields, size))
}

fn decode_fields<R: Read>(
    reader: &mut ProtoReader<R>,
    config: &ReaderConfig,
    depth: usize,
) -> Result<Vec<Field>, ProtoError> {
    let mut fields = Vec::new();
    loop {
        let number = reader.read_field_header()?;
        if number == 0 {
            return Ok(fields);
        }
        let value = match reader.wire_type() {
            Some(WireType::Varint) => FieldValue::Varint(reader.read_uint64()?),
            Some(WireType::Fixed32) => FieldValue::Fixed32(reader.read_fixed32()?),
            Some(WireType::Fixed64) => FieldValue::Fixed64(reader.read_fixed64()?),
            Some(WireType::String) => classify(reader.read_bytes()?, config, depth + reader.depth()),
            Some(WireType::StartGroup) => {
                let token = reader.start_sub_item()?;
                let inner = decode_fields(reader, config, depth)?;
                reader.end_sub_item(token)?;
                FieldValue::Group(inner)
            }
            Some(WireType::EndGroup) | None => {
                return Err(ProtoError::InvalidState("field header without a value"))
            }
        };
        fields.push(Field { number, value });
    }
}

/// Interprets a length-delimited payload found at nesting `depth`.
fn classify(payload: Bytes, config: &ReaderConfig, depth: usize) -> FieldValue {
    if !payload.is_empty() && depth + 1 < config.max_depth {
        if let Ok(fields) = parse_nested(&payload, config, depth + 1) {
            return FieldValue::Message(fields);
        }
    }
    match std::str::from_utf8(&payload) {
        Ok(text) => FieldValue::Text(text.to_owned()),
        Err(_) => FieldValue::Bytes(payload),
    }
}

fn parse_nested(
    payload: &[u8],
    config: &ReaderConfig,
    depth: usize,
) -> Result<Vec<Field>, ProtoError> {
    let nested = config
        .clone()
        .with_max_depth(config.max_depth.saturating_sub(depth));
    let mut reader = ProtoReader::with_length(payload, payload.len() as u64, nested);
    let fields = decode_fields(&mut reader, config, depth)?;
    if reader.position() != payload.len() as u64 {
        return Err(ProtoError::LengthMismatch {
            declared: payload.len() as u64,
            actual: reader.position(),
        });
    }
    reader.close()?;
    Ok(fields)
}

/// Counts fields, nested messages and the deepest nesting level.
pub fn summarize(fields: &[Field]) -> Summary {
    fn walk(fields: &[Field], depth: usize, summary: &mut Summary) {
        summary.max_depth = summary.max_depth.max(depth);
        for field in fields {
            summary.fields += 1;
            match &field.value {
                FieldValue::Message(inner) | FieldValue::Group(inner) => {
                    summary.messages += 1;
                    walk(inner, depth + 1, summary);
                }
                _ => {}
            }
        }
    }

    let mut summary = Summary::default();
    walk(fields, 0, &mut summary);
    summary
}

/// Renders a field tree, one field per line.
pub fn render(fields: &[Field], bytes_preview: usize) -> String {
    let mut out = String::new();
    render_into(&mut out, fields, 0, bytes_preview);
    out
}

fn render_into(out: &mut String, fields: &[Field], indent: usize, bytes_preview: usize) {
    let pad = "  ".repeat(indent);
    for field in fields {
        let number = field.number.to_string().cyan();
        let _ = match &field.value {
            FieldValue::Varint(v) => {
                let signed = *v as i64;
                if signed < 0 {
                    writeln!(out, "{}{}: {} = {} ({})", pad, number, "varint".dimmed(), v, signed)
                } else {
                    writeln!(out, "{}{}: {} = {}", pad, number, "varint".dimmed(), v)
                }
            }
            FieldValue::Fixed32(v) => writeln!(
                out,
                "{}{}: {} = {} (0x{:08x}, float {})",
                pad,
                number,
                "fixed32".dimmed(),
                v,
                v,
                f32::from_bits(*v)
            ),
            FieldValue::Fixed64(v) => writeln!(
                out,
                "{}{}: {} = {} (0x{:016x}, double {})",
                pad,
                number,
                "fixed64".dimmed(),
                v,
                v,
                f64::from_bits(*v)
            ),
            FieldValue::Text(text) => writeln!(
                out,
                "{}{}: {} = {}",
                pad,
                number,
                "string".dimmed(),
                format!("{:?}", text).green()
            ),
            FieldValue::Bytes(bytes) => {
                let shown = &bytes[..bytes.len().min(bytes_preview)];
                let ellipsis = if bytes.len() > shown.len() { "..." } else { "" };
                writeln!(
                    out,
                    "{}{}: {} = {}{} ({} bytes)",
                    pad,
                    number,
                    "bytes".dimmed(),
                    hex::encode(shown).yellow(),
                    ellipsis,
                    bytes.len()
                )
            }
            FieldValue::Message(inner) | FieldValue::Group(inner) => {
                let kind = match field.value {
                    FieldValue::Group(_) => "group",
                    _ => "message",
                };
                let _ = writeln!(out, "{}{}: {} {{", pad, number, kind.dimmed());
                render_into(out, inner, indent + 1, bytes_preview);
                writeln!(out, "{}}}", pad)
            }
        };
    }
}

//! Command execution.

use crate::config::Config;
use crate::dump;
use crate::Commands;
use colored::Colorize;
use protonet_wire::{ProtoError, ProtoWriter, WireType};
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;

/// Executes a command and returns the formatted output.
pub fn execute(cmd: Commands, config: &Config) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Dump { input, hex } => {
            let source = open_input(&input, hex)?;
            let (fields, _) = dump::decode(source, &config.reader)?;
            Ok(dump::render(&fields, config.output.bytes_preview)
                .trim_end()
                .to_string())
        }

        Commands::Check { input, hex } => {
            let source = open_input(&input, hex)?;
            let (fields, size) = dump::decode(source, &config.reader)?;
            let summary = dump::summarize(&fields);
            tracing::debug!(?summary, size, "check passed");
            Ok(format!(
                "{}: {} fields ({} nested, max depth {}), {} bytes",
                "OK".green(),
                summary.fields,
                summary.messages,
                summary.max_depth,
                size
            ))
        }

        Commands::Varint { value } => Ok(describe_integer(value)?),
    }
}

/// Opens `input` (a path, or `-` for stdin). With `hex`, the input is hex
/// text and is decoded first; whitespace is ignored.
fn open_input(input: &Path, hex: bool) -> io::Result<Box<dyn Read>> {
    let source: Box<dyn Read> = if input == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        Box::new(File::open(input)?)
    };
    if !hex {
        return Ok(source);
    }

    let mut text = String::new();
    let mut source = source;
    source.read_to_string(&mut text)?;
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(digits).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Box::new(Cursor::new(bytes)))
}

/// Shows every wire encoding of `value`.
fn describe_integer(value: i64) -> Result<String, ProtoError> {
    let rows = [
        ("varint", encode_value(WireType::Varint, |w| w.write_int64(value))?),
        ("zigzag", encode_value(WireType::Varint, |w| w.write_zigzag_int64(value))?),
        ("fixed32", encode_value(WireType::Fixed32, |w| w.write_int64(value))?),
        ("fixed64", encode_value(WireType::Fixed64, |w| w.write_int64(value))?),
    ];

    let mut lines = vec![format!("{:<8} {}", "value".bold(), value)];
    for (name, encoded) in rows {
        let line = match encoded {
            Some(bytes) => format!(
                "{:<8} {} ({} byte{})",
                name.bold(),
                spaced_hex(&bytes).yellow(),
                bytes.len(),
                if bytes.len() == 1 { "" } else { "s" }
            ),
            None => format!("{:<8} {}", name.bold(), "out of range".red()),
        };
        lines.push(line);
    }
    Ok(lines.join("\n"))
}

/// Encodes one field 1 value and returns it without its one-byte header,
/// or `None` when the value does not fit the wire type.
fn encode_value<F>(wire_type: WireType, write: F) -> Result<Option<Vec<u8>>, ProtoError>
where
    F: FnOnce(&mut ProtoWriter<Vec<u8>>) -> Result<(), ProtoError>,
{
    let mut writer = ProtoWriter::new(Vec::new());
    writer.write_field_header(1, wire_type)?;
    match write(&mut writer) {
        Ok(()) => {}
        Err(ProtoError::ValueOutOfRange { .. }) => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut bytes = writer.close()?;
    bytes.remove(0);
    Ok(Some(bytes))
}

fn spaced_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

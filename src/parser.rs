//! Raw text to [`Message`].

use log::trace;

use crate::codec;
use crate::datetime::parse_hl7_datetime;
use crate::error::{Hl7Error, Result};
use crate::message::{non_empty, Delimiters, Field, Message, Segment, SEGMENT_SEPARATOR};

/// Parses an HL7 v2.x message.
///
/// Line endings are normalised to `\r` and any MLLP envelope is stripped first, so
/// this accepts text straight off the wire as well as text typed into a test.
/// Empty input is an error, and so is an MSH that isn't the first segment. A message
/// without any MSH parses, it just has no header values.
///
/// ```
/// let message = hl7_mllp_engine::parse(
///     "MSH|^~\\&|LIS|LAB|HIS|HOSPITAL|20240101120000||ORU^R01|MSG001|P|2.5",
/// ).unwrap();
/// assert_eq!(message.message_type(), Some("ORU"));
/// assert_eq!(message.trigger_event(), Some("R01"));
/// ```
pub fn parse(raw: &str) -> Result<Message> {
    if raw.trim().is_empty() {
        return Err(Hl7Error::parse("HL7 message cannot be empty"));
    }

    let normalized = raw.replace("\r\n", "\r").replace('\n', "\r");
    let body = codec::strip(&normalized);

    let delimiters = body
        .split(SEGMENT_SEPARATOR)
        .map(str::trim)
        .find(|line| line.starts_with("MSH"))
        .map(Delimiters::from_header)
        .unwrap_or_default();

    let segments: Vec<Segment> = body
        .split(SEGMENT_SEPARATOR)
        .map(|line| {
            // trailing spaces can be data (a padded OBX-5), so only framing comes off the end
            line.trim_start_matches(|c: char| c.is_whitespace() || c == '\x0B' || c == '\x1C')
                .trim_end_matches(|c: char| matches!(c, '\r' | '\n' | '\x0B' | '\x1C'))
        })
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_segment(line, delimiters))
        .collect();

    if segments.is_empty() {
        return Err(Hl7Error::parse("HL7 message contains no segments"));
    }
    if let Some(position) = segments.iter().position(|s| s.name() == "MSH") {
        if position > 0 {
            return Err(Hl7Error::parse(format!(
                "MSH must be the first segment, found {} before it",
                segments[0].name()
            )));
        }
    }

    let mut message = Message {
        raw: raw.to_string(),
        delimiters,
        message_type: None,
        trigger_event: None,
        control_id: None,
        processing_id: None,
        version_id: None,
        timestamp: None,
        segments,
    };

    if let Some(msh) = message.segments.iter().find(|s| s.name() == "MSH") {
        message.message_type = non_empty(msh.component(9, 1));
        message.trigger_event = non_empty(msh.component(9, 2));
        message.control_id = non_empty(msh.field(10));
        message.processing_id = non_empty(msh.field(11));
        message.version_id = non_empty(msh.field(12));
        message.timestamp = msh.field(7).and_then(parse_hl7_datetime);
    }

    trace!(
        "Parsed {} with {} segments",
        message,
        message.segments.len()
    );
    Ok(message)
}

fn parse_segment(line: &str, delimiters: Delimiters) -> Segment {
    let mut parts = line.split(delimiters.field);
    let name = parts.next().unwrap_or_default().to_string();

    let mut fields = Vec::new();
    if name == "MSH" {
        // MSH-1 is the separator itself, MSH-2 the encoding characters; neither gets split
        fields.push(Field::literal(&delimiters.field.to_string(), delimiters));
        if let Some(encoding) = parts.next() {
            fields.push(Field::literal(encoding, delimiters));
        }
    }
    fields.extend(parts.map(|value| Field::new(value, delimiters)));

    Segment::new(name, line.to_string(), fields)
}

/// Digs MSH-10 out of text that wouldn't parse, so a NACK can still reference it.
pub fn salvage_control_id(raw: &str) -> Option<String> {
    let normalized = raw.replace("\r\n", "\r").replace('\n', "\r");
    let header = codec::strip(&normalized)
        .split(SEGMENT_SEPARATOR)
        .map(|line| line.trim_start_matches(|c: char| c.is_whitespace() || c == '\x0B'))
        .find(|line| line.starts_with("MSH"))?;

    let delimiters = Delimiters::from_header(header);
    // split index 9 is MSH-10, the separator being MSH-1
    header
        .split(delimiters.field)
        .nth(9)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

//! In-memory HL7 v2.x message model.
//!
//! Field and component indexes are 1-based, as they are written in the HL7 standard
//! (`OBX-5`, `MSH-9.2`). On the MSH segment the field separator itself is field 1, so
//! `MSH-3` really is the sending application.
//!
//! Every accessor returns `None` when asked for something that isn't there. Optional
//! fields go missing all the time in real traffic; that's not an error.

use std::borrow::Cow;
use std::fmt;

use chrono::NaiveDateTime;

use crate::results::{LabResults, Orders};

pub const SEGMENT_SEPARATOR: char = '\r';

/// The five encoding characters declared in MSH-1/MSH-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
        }
    }
}

impl Delimiters {
    /// Reads the delimiters out of a raw `MSH|^~\&|...` line, falling back to the
    /// defaults for anything the header doesn't declare.
    pub fn from_header(line: &str) -> Self {
        let mut delimiters = Delimiters::default();
        let mut chars = match line.strip_prefix("MSH") {
            Some(rest) => rest.chars(),
            None => return delimiters,
        };

        match chars.next() {
            Some(field) => delimiters.field = field,
            None => return delimiters,
        }

        let declared: Vec<char> = chars.take_while(|c| *c != delimiters.field).collect();
        if let Some(c) = declared.first() {
            delimiters.component = *c;
        }
        if let Some(c) = declared.get(1) {
            delimiters.repetition = *c;
        }
        if let Some(c) = declared.get(2) {
            delimiters.escape = *c;
        }
        if let Some(c) = declared.get(3) {
            delimiters.subcomponent = *c;
        }
        delimiters
    }

    /// The MSH-2 encoding characters, e.g. `^~\&`
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    /// Makes `text` safe to put in a field: delimiters become `\F\`, `\S\`, `\T\`,
    /// `\R\` and `\E\`, line breaks become `\X0D\` and `\X0A\`.
    pub fn escape(&self, text: &str) -> String {
        let mut escaped = String::with_capacity(text.len());
        for c in text.chars() {
            let sequence = if c == self.escape {
                "E"
            } else if c == self.field {
                "F"
            } else if c == self.component {
                "S"
            } else if c == self.subcomponent {
                "T"
            } else if c == self.repetition {
                "R"
            } else if c == '\r' {
                "X0D"
            } else if c == '\n' {
                "X0A"
            } else {
                escaped.push(c);
                continue;
            };
            escaped.push(self.escape);
            escaped.push_str(sequence);
            escaped.push(self.escape);
        }
        escaped
    }

    /// Reverses [`escape`](Self::escape). Sequences it doesn't know (`\H\`, `\.br\`)
    /// and a lone escape character are left as they are.
    pub fn unescape<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !text.contains(self.escape) {
            return Cow::Borrowed(text);
        }

        let width = self.escape.len_utf8();
        let mut unescaped = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find(self.escape) {
            unescaped.push_str(&rest[..start]);
            let after = &rest[start + width..];
            match after.find(self.escape) {
                Some(end) => {
                    let sequence = &after[..end];
                    match self.decode_sequence(sequence) {
                        Some(decoded) => unescaped.push_str(&decoded),
                        None => {
                            unescaped.push(self.escape);
                            unescaped.push_str(sequence);
                            unescaped.push(self.escape);
                        }
                    }
                    rest = &after[end + width..];
                }
                None => {
                    unescaped.push(self.escape);
                    rest = after;
                }
            }
        }
        unescaped.push_str(rest);
        Cow::Owned(unescaped)
    }

    fn decode_sequence(&self, sequence: &str) -> Option<String> {
        let delimiter = match sequence {
            "F" => self.field,
            "S" => self.component,
            "T" => self.subcomponent,
            "R" => self.repetition,
            "E" => self.escape,
            _ => return decode_hex(sequence.strip_prefix('X')?),
        };
        Some(delimiter.to_string())
    }
}

// `\Xhhhh\`: pairs of hex digits, read as UTF-8
fn decode_hex(hex: &str) -> Option<String> {
    if hex.is_empty() || hex.len() % 2 != 0 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

/// One field of a segment, with its components already split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    value: String,
    components: Vec<String>,
    delimiters: Delimiters,
}

impl Field {
    pub(crate) fn new(value: &str, delimiters: Delimiters) -> Self {
        Field {
            value: value.to_string(),
            components: value
                .split(delimiters.component)
                .map(str::to_string)
                .collect(),
            delimiters,
        }
    }

    /// A field whose value is never split, like MSH-1 and MSH-2.
    pub(crate) fn literal(value: &str, delimiters: Delimiters) -> Self {
        Field {
            value: value.to_string(),
            components: vec![value.to_string()],
            delimiters,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// 1-based component lookup
    pub fn component(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.components.get(i))
            .map(String::as_str)
    }

    /// The field split on the repetition separator (`~`).
    pub fn repetitions(&self) -> impl Iterator<Item = &str> {
        self.value.split(self.delimiters.repetition)
    }

    /// 1-based subcomponents of a 1-based component (`&`-separated).
    pub fn subcomponent(&self, component: usize, index: usize) -> Option<&str> {
        let component = self.component(component)?;
        index
            .checked_sub(1)
            .and_then(|i| component.split(self.delimiters.subcomponent).nth(i))
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// One line of a message, e.g. `PID|1||12345^^^MRN||DOE^JOHN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    name: String,
    raw: String,
    fields: Vec<Field>,
}

impl Segment {
    pub(crate) fn new(name: String, raw: String, fields: Vec<Field>) -> Self {
        Segment { name, raw, fields }
    }

    /// The three letter segment id
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The segment exactly as it appeared in the message
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// 1-based field lookup. `Some("")` means the field was present but empty.
    pub fn field(&self, index: usize) -> Option<&str> {
        self.field_at(index).map(Field::value)
    }

    pub fn field_at(&self, index: usize) -> Option<&Field> {
        index.checked_sub(1).and_then(|i| self.fields.get(i))
    }

    /// 1-based `field.component` lookup, `component(9, 2)` is MSH-9.2.
    pub fn component(&self, field: usize, component: usize) -> Option<&str> {
        self.field_at(field).and_then(|f| f.component(component))
    }

    /// Like [`field`](Self::field), but unescaped, and an empty value counts as missing.
    pub fn value(&self, index: usize) -> Option<String> {
        let field = self.field_at(index)?;
        decoded(field.delimiters, Some(field.value()))
    }

    /// Like [`component`](Self::component), but unescaped, and an empty value counts as
    /// missing.
    pub fn component_value(&self, field: usize, component: usize) -> Option<String> {
        let field = self.field_at(field)?;
        decoded(field.delimiters, field.component(component))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A parsed HL7 message.
///
/// Built once by [`parse`](crate::parse) and never changed afterwards. Header values are
/// pulled out of MSH up front; anything else is reached through [`segments`](Self::segments).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) raw: String,
    pub(crate) delimiters: Delimiters,
    pub(crate) message_type: Option<String>,
    pub(crate) trigger_event: Option<String>,
    pub(crate) control_id: Option<String>,
    pub(crate) processing_id: Option<String>,
    pub(crate) version_id: Option<String>,
    pub(crate) timestamp: Option<NaiveDateTime>,
    pub(crate) segments: Vec<Segment>,
}

impl Message {
    /// The text handed to the parser, framing and all
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn delimiters(&self) -> Delimiters {
        self.delimiters
    }

    /// MSH-9.1, e.g. `ORU`
    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    /// MSH-9.2, e.g. `R01`
    pub fn trigger_event(&self) -> Option<&str> {
        self.trigger_event.as_deref()
    }

    /// MSH-10, exactly as written. Replies quote it back verbatim in MSA-2, so it is
    /// never unescaped.
    pub fn control_id(&self) -> Option<&str> {
        self.control_id.as_deref()
    }

    /// MSH-11
    pub fn processing_id(&self) -> Option<&str> {
        self.processing_id.as_deref()
    }

    /// MSH-12
    pub fn version_id(&self) -> Option<&str> {
        self.version_id.as_deref()
    }

    /// MSH-7, when it could be read
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamp
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn header(&self) -> Option<&Segment> {
        self.segment("MSH")
    }

    /// First segment with the given name
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name == name)
    }

    pub fn is_type(&self, message_type: &str) -> bool {
        self.message_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case(message_type))
    }

    /// The MSA segment of an acknowledgment, if this is one
    pub fn acknowledgment(&self) -> Option<Acknowledgment> {
        let msa = self.segment("MSA")?;
        Some(Acknowledgment {
            code: AckCode::from_code(msa.field(1).unwrap_or_default()),
            raw_code: msa.field(1).unwrap_or_default().to_string(),
            control_id: msa.value(2),
            text: msa.value(3),
        })
    }

    /// The control id a reply to us refers to: MSA-2 on an acknowledgment,
    /// otherwise the message's own MSH-10.
    pub fn correlation_id(&self) -> Option<&str> {
        self.segment("MSA")
            .and_then(|msa| msa.field(2))
            .filter(|id| !id.is_empty())
            .or_else(|| self.control_id())
    }

    /// Lab results carried by the OBX segments, see [`LabResults`].
    pub fn lab_results(&self) -> LabResults<'_> {
        LabResults::new(self)
    }

    /// Orders carried by the ORC segments, see [`Orders`].
    pub fn orders(&self) -> Orders<'_> {
        Orders::new(self)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}^{} ({})",
            self.message_type().unwrap_or("?"),
            self.trigger_event().unwrap_or("?"),
            self.control_id().unwrap_or("no control id")
        )
    }
}

/// MSA-1 acknowledgment codes, original and enhanced mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    /// AA
    Accept,
    /// AE
    Error,
    /// AR
    Reject,
    /// CA
    CommitAccept,
    /// CE
    CommitError,
    /// CR
    CommitReject,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Accept => "AA",
            AckCode::Error => "AE",
            AckCode::Reject => "AR",
            AckCode::CommitAccept => "CA",
            AckCode::CommitError => "CE",
            AckCode::CommitReject => "CR",
        }
    }

    pub fn from_code(code: &str) -> Option<AckCode> {
        match code.trim().to_ascii_uppercase().as_str() {
            "AA" => Some(AckCode::Accept),
            "AE" => Some(AckCode::Error),
            "AR" => Some(AckCode::Reject),
            "CA" => Some(AckCode::CommitAccept),
            "CE" => Some(AckCode::CommitError),
            "CR" => Some(AckCode::CommitReject),
            _ => None,
        }
    }

    pub fn is_accept(&self) -> bool {
        matches!(self, AckCode::Accept | AckCode::CommitAccept)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed view of an MSA segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    /// `None` when the peer sent a code we don't know
    pub code: Option<AckCode>,
    pub raw_code: String,
    /// MSA-2, the control id being acknowledged
    pub control_id: Option<String>,
    pub text: Option<String>,
}

impl Acknowledgment {
    pub fn is_accept(&self) -> bool {
        self.code.map_or(false, |c| c.is_accept())
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

fn decoded(delimiters: Delimiters, value: Option<&str>) -> Option<String> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| delimiters.unescape(v).into_owned())
}

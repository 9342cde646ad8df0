//! Outgoing messages: acknowledgments and ORM^O01 worklists.

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::datetime::{format_hl7_date, format_hl7_datetime, now_hl7};
use crate::error::{Hl7Error, Result};
use crate::message::{AckCode, Delimiters, Message, SEGMENT_SEPARATOR};
use crate::parser::salvage_control_id;

const CONTROL_ID_LEN: usize = 20;
const DEFAULT_VERSION: &str = "2.5";
const DEFAULT_PROCESSING_ID: &str = "P";

/// A fresh 20 character message control id.
pub fn new_control_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(CONTROL_ID_LEN);
    id
}

/// Assembles one segment field by field. Fields are addressed by their HL7 number, gaps
/// are left empty and trailing empty fields are dropped. Values are escaped on the way
/// in, so a `|` or `^` in free text can't shift the fields after it.
#[derive(Debug, Clone)]
pub struct SegmentWriter {
    name: &'static str,
    fields: Vec<String>,
}

impl SegmentWriter {
    pub fn new(name: &'static str) -> Self {
        SegmentWriter {
            name,
            fields: Vec::new(),
        }
    }

    /// Sets field `index` (1-based). Later calls for the same index win.
    pub fn set(self, index: usize, value: impl AsRef<str>) -> Self {
        let escaped = Delimiters::default().escape(value.as_ref());
        self.put(index, escaped)
    }

    /// Sets field `index` from its components, each escaped and joined with `^`.
    pub fn set_components(self, index: usize, components: &[&str]) -> Self {
        let delimiters = Delimiters::default();
        let mut value = components
            .iter()
            .map(|component| delimiters.escape(component))
            .collect::<Vec<_>>()
            .join(delimiters.component.to_string().as_str());
        while value.ends_with(delimiters.component) {
            value.pop();
        }
        self.put(index, value)
    }

    fn put(mut self, index: usize, value: String) -> Self {
        if index == 0 {
            return self;
        }
        if self.fields.len() < index {
            self.fields.resize(index, String::new());
        }
        self.fields[index - 1] = value;
        self
    }

    pub fn finish(mut self) -> String {
        while self.fields.last().map_or(false, String::is_empty) {
            self.fields.pop();
        }
        let mut segment = String::from(self.name);
        for field in &self.fields {
            segment.push('|');
            segment.push_str(field);
        }
        segment
    }
}

// MSH can't go through SegmentWriter: MSH-1 is the separator, not a field after it.
// Values go in as they are, callers escape.
fn header(
    sending: (&str, &str),
    receiving: (&str, &str),
    timestamp: &str,
    message_type: &str,
    control_id: &str,
    processing_id: &str,
    version: &str,
) -> String {
    format!(
        "MSH|^~\\&|{}|{}|{}|{}|{}||{}|{}|{}|{}",
        sending.0,
        sending.1,
        receiving.0,
        receiving.1,
        timestamp,
        message_type,
        control_id,
        processing_id,
        version
    )
}

fn join_segments(segments: Vec<String>) -> String {
    let mut message = String::new();
    for segment in segments {
        message.push_str(&segment);
        message.push(SEGMENT_SEPARATOR);
    }
    message
}

/// Builds the acknowledgment for `original`.
///
/// The sending and receiving application/facility are swapped relative to the original
/// header, MSA-2 carries the original control id, and when the code isn't `AA` and
/// there's error text, an ERR segment is appended. Header values and the control id are
/// copied as written; `text` is escaped.
pub fn build_ack(original: &Message, code: AckCode, text: Option<&str>) -> Result<String> {
    let msh = original
        .header()
        .ok_or_else(|| Hl7Error::parse("Original message must contain an MSH segment"))?;

    let text = Delimiters::default().escape(text.unwrap_or_default());
    let message_type = format!("ACK^{}", original.trigger_event().unwrap_or("R01"));

    let mut segments = vec![
        header(
            (msh.field(5).unwrap_or_default(), msh.field(6).unwrap_or_default()),
            (msh.field(3).unwrap_or_default(), msh.field(4).unwrap_or_default()),
            &now_hl7(),
            &message_type,
            &new_control_id(),
            msh.field(11).unwrap_or_default(),
            msh.field(12).unwrap_or_default(),
        ),
        format!(
            "MSA|{}|{}|{}",
            code,
            original.control_id().unwrap_or_default(),
            text
        ),
    ];

    if code != AckCode::Accept && !text.is_empty() {
        segments.push(format!("ERR|^^^{}||{}", code, text));
    }

    Ok(join_segments(segments))
}

/// A bare negative acknowledgment for text that couldn't be parsed. MSA-2 is filled in
/// when a control id can still be dug out of the raw text.
pub fn build_nack(raw: &str, code: AckCode, text: &str) -> String {
    let control_id = salvage_control_id(raw).unwrap_or_default();
    let text = Delimiters::default().escape(text);
    join_segments(vec![
        header(
            ("", ""),
            ("", ""),
            &now_hl7(),
            "ACK",
            &new_control_id(),
            DEFAULT_PROCESSING_ID,
            DEFAULT_VERSION,
        ),
        format!("MSA|{}|{}|{}", code, control_id, text),
    ])
}

/// One test on a worklist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestRequest {
    pub test_code: String,
    pub test_name: String,
    pub filler_order_number: Option<String>,
}

impl TestRequest {
    pub fn new(test_code: impl Into<String>, test_name: impl Into<String>) -> Self {
        TestRequest {
            test_code: test_code.into(),
            test_name: test_name.into(),
            filler_order_number: None,
        }
    }
}

/// Everything needed to push one sample's worklist to an analyzer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorklistRequest {
    /// Generated when not set
    pub control_id: Option<String>,
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub receiving_application: Option<String>,
    pub receiving_facility: Option<String>,

    pub patient_id: String,
    pub patient_family_name: Option<String>,
    pub patient_given_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<String>,
    /// O outpatient, I inpatient
    pub patient_class: Option<String>,
    pub location: Option<String>,
    pub attending_doctor: Option<String>,

    /// Barcode on the tube
    pub sample_id: String,
    pub placer_order_number: Option<String>,
    pub ordering_provider: Option<String>,
    pub ordering_facility: Option<String>,
    pub specimen_source: Option<String>,
    pub requested_at: Option<NaiveDateTime>,
    pub collected_at: Option<NaiveDateTime>,
    pub is_priority: bool,

    pub tests: Vec<TestRequest>,
}

impl WorklistRequest {
    pub fn new(patient_id: impl Into<String>, sample_id: impl Into<String>) -> Self {
        WorklistRequest {
            patient_id: patient_id.into(),
            sample_id: sample_id.into(),
            ..WorklistRequest::default()
        }
    }

    pub fn with_test(mut self, test: TestRequest) -> Self {
        self.tests.push(test);
        self
    }
}

/// Builds an ORM^O01 worklist: MSH, PID, PV1, then an ORC/OBR pair per test.
///
/// Every value from the request is escaped, including the control id, so the
/// [`control_id`](Message::control_id) of the parsed result is its escaped form.
pub fn build_order(request: &WorklistRequest) -> String {
    let delimiters = Delimiters::default();
    let timestamp = now_hl7();
    let control_id = delimiters.escape(
        &request.control_id.clone().unwrap_or_else(new_control_id),
    );
    let or_default = |value: &Option<String>, default: &str| {
        delimiters.escape(value.as_deref().unwrap_or(default))
    };
    let placer = request
        .placer_order_number
        .as_deref()
        .unwrap_or(&request.sample_id);
    let priority = if request.is_priority { "S" } else { "R" };
    let opt = |value: &Option<String>| value.clone().unwrap_or_default();
    let sending = (
        or_default(&request.sending_application, "HIS"),
        or_default(&request.sending_facility, "HOSPITAL"),
    );
    let receiving = (
        or_default(&request.receiving_application, "LIS"),
        or_default(&request.receiving_facility, "LAB"),
    );

    let mut segments = vec![
        header(
            (sending.0.as_str(), sending.1.as_str()),
            (receiving.0.as_str(), receiving.1.as_str()),
            &timestamp,
            "ORM^O01",
            &control_id,
            DEFAULT_PROCESSING_ID,
            DEFAULT_VERSION,
        ),
        SegmentWriter::new("PID")
            .set(1, "1")
            .set_components(3, &[request.patient_id.as_str(), "", "", "MRN"])
            .set_components(
                5,
                &[
                    opt(&request.patient_family_name).as_str(),
                    opt(&request.patient_given_name).as_str(),
                ],
            )
            .set(7, request.date_of_birth.as_ref().map(format_hl7_date).unwrap_or_default())
            .set(8, request.sex.as_deref().unwrap_or("U"))
            .finish(),
        SegmentWriter::new("PV1")
            .set(1, "1")
            .set(2, request.patient_class.as_deref().unwrap_or("O"))
            .set(3, opt(&request.location))
            .set(7, opt(&request.attending_doctor))
            .finish(),
    ];

    let requested_at = request
        .requested_at
        .as_ref()
        .map(format_hl7_datetime)
        .unwrap_or_else(|| timestamp.clone());
    let collected_at = request
        .collected_at
        .as_ref()
        .map(format_hl7_datetime)
        .unwrap_or_default();

    for (set_id, test) in (1..).zip(&request.tests) {
        segments.push(
            SegmentWriter::new("ORC")
                .set(1, "NW")
                .set(2, placer)
                .set(3, opt(&test.filler_order_number))
                .set(5, "SC")
                .set(9, timestamp.as_str())
                .set(12, opt(&request.ordering_provider))
                .set(21, opt(&request.ordering_facility))
                .finish(),
        );
        segments.push(
            SegmentWriter::new("OBR")
                .set(1, set_id.to_string())
                .set(2, placer)
                .set(3, request.sample_id.as_str())
                .set_components(4, &[test.test_code.as_str(), test.test_name.as_str()])
                .set(5, priority)
                .set(6, requested_at.as_str())
                .set(7, collected_at.as_str())
                .set(15, opt(&request.specimen_source))
                .set(16, opt(&request.ordering_provider))
                .set(27, priority)
                .finish(),
        );
    }

    join_segments(segments)
}

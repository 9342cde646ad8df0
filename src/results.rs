//! Denormalised views over a parsed message: one [`LabResult`] per OBX, one [`Order`] per ORC.
//!
//! Both walks go through the segments in order and carry the most recent PID (and, for
//! results, OBR) forward onto everything below it. A result with no PID or OBR above it
//! simply has no patient or order details.

use std::iter::FusedIterator;
use std::slice;

use chrono::NaiveDateTime;

use crate::datetime::parse_hl7_datetime;
use crate::message::{Message, Segment};

/// One observation (OBX) with its patient and order context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabResult {
    // OBX
    pub set_id: Option<String>,
    /// NM, ST, CE, TX, ...
    pub value_type: Option<String>,
    pub test_code: Option<String>,
    pub test_name: Option<String>,
    pub test_coding_system: Option<String>,
    pub sub_id: Option<String>,
    pub value: Option<String>,
    pub units: Option<String>,
    pub reference_range: Option<String>,
    /// H, L, HH, LL, N, A, ...
    pub abnormal_flag: Option<String>,
    pub probability: Option<String>,
    pub nature_of_abnormal_test: Option<String>,
    /// F final, P preliminary, C corrected
    pub result_status: Option<String>,
    pub date_of_last_change: Option<NaiveDateTime>,
    pub user_defined_access_checks: Option<String>,
    pub observed_at: Option<NaiveDateTime>,
    pub producer_id: Option<String>,
    pub responsible_observer: Option<String>,
    pub observation_method: Option<String>,

    // PID
    pub patient: PatientContext,

    // OBR
    pub sample_id: Option<String>,
    pub placer_order_number: Option<String>,
    pub order_code: Option<String>,
    pub order_name: Option<String>,
    pub collected_at: Option<NaiveDateTime>,
    pub specimen_received_at: Option<NaiveDateTime>,
    pub resulted_at: Option<NaiveDateTime>,
}

impl LabResult {
    /// Flagged as anything other than normal
    pub fn is_abnormal(&self) -> bool {
        match self.abnormal_flag.as_deref() {
            Some(flag) if !flag.is_empty() => {
                let flag = flag.to_ascii_uppercase();
                flag != "N" && flag != "NORMAL"
            }
            _ => false,
        }
    }

    /// Flagged critical high/low, panic or critical
    pub fn is_critical(&self) -> bool {
        match self.abnormal_flag.as_deref() {
            Some(flag) => {
                let flag = flag.to_ascii_uppercase();
                ["HH", "LL", "PANIC", "CRIT"]
                    .iter()
                    .any(|marker| flag.contains(marker))
            }
            None => false,
        }
    }

    fn from_segments(obx: &Segment, pid: Option<&Segment>, obr: Option<&Segment>) -> Self {
        let mut result = LabResult {
            set_id: obx.value(1),
            value_type: obx.value(2),
            test_code: obx.component_value(3, 1),
            test_name: obx.component_value(3, 2),
            test_coding_system: obx.component_value(3, 3),
            sub_id: obx.value(4),
            value: obx.value(5),
            units: obx.component_value(6, 1),
            reference_range: obx.value(7),
            abnormal_flag: obx.value(8),
            probability: obx.value(9),
            nature_of_abnormal_test: obx.value(10),
            result_status: obx.value(11),
            date_of_last_change: timestamp(obx, 12),
            user_defined_access_checks: obx.value(13),
            observed_at: timestamp(obx, 14),
            producer_id: obx.component_value(15, 1),
            responsible_observer: obx.component_value(16, 1),
            observation_method: obx.component_value(17, 1),
            ..LabResult::default()
        };

        if let Some(pid) = pid {
            result.patient = PatientContext::from_pid(pid);
        }

        if let Some(obr) = obr {
            result.placer_order_number = obr.component_value(2, 1);
            result.sample_id = obr.component_value(3, 1);
            result.order_code = obr.component_value(4, 1);
            result.order_name = obr.component_value(4, 2);
            result.collected_at = timestamp(obr, 7);
            result.specimen_received_at = timestamp(obr, 14);
            result.resulted_at = timestamp(obr, 22);
        }

        result
    }
}

/// Patient details lifted from the PID segment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatientContext {
    pub patient_id: Option<String>,
    /// `family given`
    pub patient_name: Option<String>,
    pub date_of_birth: Option<NaiveDateTime>,
    pub sex: Option<String>,
}

impl PatientContext {
    fn from_pid(pid: &Segment) -> Self {
        PatientContext {
            patient_id: pid.component_value(3, 1),
            patient_name: format_name(
                pid.component_value(5, 1).as_deref(),
                pid.component_value(5, 2).as_deref(),
            ),
            date_of_birth: timestamp(pid, 7),
            sex: pid.value(8),
        }
    }
}

/// One order (ORC) paired with its observation request (OBR).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    // ORC
    /// NW new, CA cancel, ...
    pub order_control: Option<String>,
    pub placer_order_number: Option<String>,
    pub filler_order_number: Option<String>,
    pub placer_group_number: Option<String>,
    pub order_status: Option<String>,
    pub transaction_at: Option<NaiveDateTime>,
    pub entered_by: Option<String>,
    pub ordering_provider: Option<String>,
    pub entering_device: Option<String>,
    pub action_by: Option<String>,

    // OBR
    pub test_code: Option<String>,
    pub test_name: Option<String>,
    pub priority: Option<String>,
    pub requested_at: Option<NaiveDateTime>,
    pub collected_at: Option<NaiveDateTime>,
    pub specimen_source: Option<String>,

    // PID
    pub patient: PatientContext,
}

impl Order {
    fn from_segments(orc: &Segment, obr: Option<&Segment>, pid: Option<&Segment>) -> Self {
        let mut order = Order {
            order_control: orc.value(1),
            placer_order_number: orc.component_value(2, 1),
            filler_order_number: orc.component_value(3, 1),
            placer_group_number: orc.component_value(4, 1),
            order_status: orc.value(5),
            transaction_at: timestamp(orc, 9),
            entered_by: orc.component_value(10, 1),
            ordering_provider: orc.component_value(12, 1),
            entering_device: orc.component_value(18, 1),
            action_by: orc.component_value(19, 1),
            ..Order::default()
        };

        if let Some(obr) = obr {
            order.test_code = obr.component_value(4, 1);
            order.test_name = obr.component_value(4, 2);
            order.priority = obr.value(5);
            order.requested_at = timestamp(obr, 6);
            order.collected_at = timestamp(obr, 7);
            order.specimen_source = obr.component_value(15, 1);
            if order.ordering_provider.is_none() {
                order.ordering_provider = obr.component_value(16, 1);
            }
        }

        if let Some(pid) = pid {
            order.patient = PatientContext::from_pid(pid);
        }

        order
    }
}

/// Iterator over the OBX segments of a message, see [`Message::lab_results`].
#[derive(Debug, Clone)]
pub struct LabResults<'a> {
    segments: slice::Iter<'a, Segment>,
    pid: Option<&'a Segment>,
    obr: Option<&'a Segment>,
}

impl<'a> LabResults<'a> {
    pub(crate) fn new(message: &'a Message) -> Self {
        LabResults {
            segments: message.segments().iter(),
            pid: None,
            obr: None,
        }
    }
}

impl<'a> Iterator for LabResults<'a> {
    type Item = LabResult;

    fn next(&mut self) -> Option<LabResult> {
        for segment in self.segments.by_ref() {
            match segment.name() {
                "PID" => self.pid = Some(segment),
                "OBR" => self.obr = Some(segment),
                "OBX" => return Some(LabResult::from_segments(segment, self.pid, self.obr)),
                _ => {}
            }
        }
        None
    }
}

impl FusedIterator for LabResults<'_> {}

/// Iterator over the ORC segments of a message, see [`Message::orders`].
///
/// Each ORC is paired with the first OBR after it, as long as no other ORC comes first.
#[derive(Debug, Clone)]
pub struct Orders<'a> {
    segments: &'a [Segment],
    position: usize,
    pid: Option<&'a Segment>,
}

impl<'a> Orders<'a> {
    pub(crate) fn new(message: &'a Message) -> Self {
        Orders {
            segments: message.segments(),
            position: 0,
            pid: None,
        }
    }
}

impl<'a> Iterator for Orders<'a> {
    type Item = Order;

    fn next(&mut self) -> Option<Order> {
        while let Some(segment) = self.segments.get(self.position) {
            self.position += 1;
            match segment.name() {
                "PID" => self.pid = Some(segment),
                "ORC" => {
                    let obr = self.segments[self.position..]
                        .iter()
                        .take_while(|s| s.name() != "ORC")
                        .find(|s| s.name() == "OBR");
                    return Some(Order::from_segments(segment, obr, self.pid));
                }
                _ => {}
            }
        }
        None
    }
}

impl FusedIterator for Orders<'_> {}

fn timestamp(segment: &Segment, field: usize) -> Option<NaiveDateTime> {
    segment.field(field).and_then(parse_hl7_datetime)
}

fn format_name(family: Option<&str>, given: Option<&str>) -> Option<String> {
    let family = family.unwrap_or_default().trim();
    let given = given.unwrap_or_default().trim();
    if family.is_empty() && given.is_empty() {
        return None;
    }
    Some(format!("{} {}", family, given).trim().to_string())
}

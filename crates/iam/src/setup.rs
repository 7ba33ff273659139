//! Instance setup events: setup steps, global organisation, IAM project.

use std::any::Any;

use eventstore::{DomainEvent, Editor, EventHeader, StoredEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::decode_payload;

pub const GLOBAL_ORG_SET: &str = "iam.global.org.set";
pub const IAM_PROJECT_SET: &str = "iam.project.iam.set";
pub const SETUP_STARTED: &str = "iam.setup.started";
pub const SETUP_DONE: &str = "iam.setup.done";

/// A stage of the instance setup sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Step {
    #[default]
    Unspecified = 0,
    Step1 = 1,
    Step2 = 2,
    Step3 = 3,
    Step4 = 4,
}

impl From<Step> for u8 {
    fn from(step: Step) -> Self {
        step as u8
    }
}

impl TryFrom<u8> for Step {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Step::Unspecified),
            1 => Ok(Step::Step1),
            2 => Ok(Step::Step2),
            3 => Ok(Step::Step3),
            4 => Ok(Step::Step4),
            other => Err(format!("unknown setup step {other}")),
        }
    }
}

/// A setup step was started or finished; `done` is derived from the
/// event type, not the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupStepEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    pub step: Step,
    #[serde(skip)]
    pub done: bool,
}

impl SetupStepEvent {
    pub fn started(editor: &Editor, step: Step) -> Self {
        Self {
            header: EventHeader::for_push(SETUP_STARTED, editor),
            step,
            done: false,
        }
    }

    pub fn done(editor: &Editor, step: Step) -> Self {
        Self {
            header: EventHeader::for_push(SETUP_DONE, editor),
            step,
            done: true,
        }
    }
}

impl DomainEvent for SetupStepEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn payload(&self) -> serde_json::Result<Option<Value>> {
        serde_json::to_value(self).map(Some)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn setup_step_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: SetupStepEvent = decode_payload("IAM-d4Wnq", stored)?;
    event.header = EventHeader::from_stored(stored);
    event.done = stored.event_type == SETUP_DONE;
    Ok(Box::new(event))
}

/// The organisation owning default resources was chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalOrgSetEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "orgId")]
    pub org_id: String,
}

impl GlobalOrgSetEvent {
    pub fn new(editor: &Editor, org_id: impl Into<String>) -> Self {
        Self {
            header: EventHeader::for_push(GLOBAL_ORG_SET, editor),
            org_id: org_id.into(),
        }
    }
}

impl DomainEvent for GlobalOrgSetEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn payload(&self) -> serde_json::Result<Option<Value>> {
        serde_json::to_value(self).map(Some)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn global_org_set_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: GlobalOrgSetEvent = decode_payload("IAM-s3Zkd", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// The project carrying the IAM applications was chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IamProjectSetEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "iamProjectId")]
    pub iam_project_id: String,
}

impl IamProjectSetEvent {
    pub fn new(editor: &Editor, iam_project_id: impl Into<String>) -> Self {
        Self {
            header: EventHeader::for_push(IAM_PROJECT_SET, editor),
            iam_project_id: iam_project_id.into(),
        }
    }
}

impl DomainEvent for IamProjectSetEvent {
    fn header(&self) -> &EventHeader {
        &self.header
    }

    fn payload(&self) -> serde_json::Result<Option<Value>> {
        serde_json::to_value(self).map(Some)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn iam_project_set_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: IamProjectSetEvent = decode_payload("IAM-h7Rbx", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn stored(event_type: &str, data: Value) -> StoredEvent {
        StoredEvent {
            aggregate_id: "iam-1".to_owned(),
            aggregate_type: crate::AGGREGATE_TYPE.to_owned(),
            aggregate_version: "v1".to_owned(),
            event_type: event_type.to_owned(),
            sequence: 1,
            previous_sequence: 0,
            event_date: Utc::now(),
            resource_owner: "iam-1".to_owned(),
            editor_service: "setup".to_owned(),
            editor_user: "system".to_owned(),
            data: Some(data),
        }
    }

    #[test]
    fn step_serializes_as_a_number() {
        let editor = Editor::new("setup", "system");
        let event = SetupStepEvent::started(&editor, Step::Step2);
        assert_eq!(event.payload().unwrap().unwrap(), json!({"step": 2}));
    }

    #[test]
    fn done_flag_comes_from_the_event_type() {
        let started = setup_step_decoder(&stored(SETUP_STARTED, json!({"step": 1}))).unwrap();
        let started = started.as_any().downcast_ref::<SetupStepEvent>().unwrap();
        assert!(!started.done);
        assert_eq!(started.step, Step::Step1);

        let done = setup_step_decoder(&stored(SETUP_DONE, json!({"step": 1}))).unwrap();
        let done = done.as_any().downcast_ref::<SetupStepEvent>().unwrap();
        assert!(done.done);
    }

    #[test]
    fn unknown_step_fails_to_decode() {
        let err = setup_step_decoder(&stored(SETUP_STARTED, json!({"step": 99}))).unwrap_err();
        assert!(matches!(err, eventstore::EventStoreError::Decode { .. }));
    }

    #[test]
    fn global_org_payload_uses_the_wire_key() {
        let editor = Editor::new("setup", "system");
        let event = GlobalOrgSetEvent::new(&editor, "org-1");
        assert_eq!(event.payload().unwrap().unwrap(), json!({"orgId": "org-1"}));
    }
}

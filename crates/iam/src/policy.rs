//! Instance-level policies: label (branding) and password lockout.

use std::any::Any;

use eventstore::{
    DomainEvent, Editor, EventHeader, Fold, QueryFold, ReadModel, SearchQueryBuilder, StoredEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AGGREGATE_TYPE, decode_payload};

pub const LABEL_POLICY_ADDED: &str = "iam.policy.label.added";
pub const LABEL_POLICY_CHANGED: &str = "iam.policy.label.changed";
pub const PASSWORD_LOCKOUT_POLICY_ADDED: &str = "iam.policy.password.lockout.added";
pub const PASSWORD_LOCKOUT_POLICY_CHANGED: &str = "iam.policy.password.lockout.changed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyState {
    #[default]
    Unspecified,
    Active,
}

/// The instance branding policy was created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelPolicyAddedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "primaryColor")]
    pub primary_color: String,
    #[serde(rename = "secondaryColor")]
    pub secondary_color: String,
}

impl LabelPolicyAddedEvent {
    pub fn new(
        editor: &Editor,
        primary_color: impl Into<String>,
        secondary_color: impl Into<String>,
    ) -> Self {
        Self {
            header: EventHeader::for_push(LABEL_POLICY_ADDED, editor),
            primary_color: primary_color.into(),
            secondary_color: secondary_color.into(),
        }
    }
}

impl DomainEvent for LabelPolicyAddedEvent {
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

pub(crate) fn label_policy_added_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: LabelPolicyAddedEvent = decode_payload("IAM-r5Gte", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// Branding colours changed; only differing fields are carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelPolicyChangedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "primaryColor", skip_serializing_if = "Option::is_none")]
    pub primary_color: Option<String>,
    #[serde(rename = "secondaryColor", skip_serializing_if = "Option::is_none")]
    pub secondary_color: Option<String>,
}

impl LabelPolicyChangedEvent {
    /// Diffs the target colours against the loaded policy; `None` when
    /// nothing differs.
    pub fn from_existing(
        editor: &Editor,
        current: &LabelPolicyReadModel,
        primary_color: &str,
        secondary_color: &str,
    ) -> Option<Self> {
        let mut event = Self {
            header: EventHeader::for_push(LABEL_POLICY_CHANGED, editor),
            primary_color: None,
            secondary_color: None,
        };

        let mut changed = false;
        if current.primary_color != primary_color {
            event.primary_color = Some(primary_color.to_owned());
            changed = true;
        }
        if current.secondary_color != secondary_color {
            event.secondary_color = Some(secondary_color.to_owned());
            changed = true;
        }

        changed.then_some(event)
    }
}

impl DomainEvent for LabelPolicyChangedEvent {
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

pub(crate) fn label_policy_changed_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: LabelPolicyChangedEvent = decode_payload("IAM-b1Ojc", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// Branding policy of the instance, folded from its label events.
#[derive(Default)]
pub struct LabelPolicyReadModel {
    pub read_model: ReadModel,
    pub primary_color: String,
    pub secondary_color: String,
    pub state: PolicyState,
}

impl LabelPolicyReadModel {
    pub fn new(iam_id: impl Into<String>) -> Self {
        Self {
            read_model: ReadModel::new(iam_id),
            ..Self::default()
        }
    }
}

impl Fold for LabelPolicyReadModel {
    fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> eventstore::Result<()> {
        self.read_model.append_events(events);
        Ok(())
    }

    fn reduce(&mut self) -> eventstore::Result<()> {
        for event in &self.read_model.events {
            let any = event.as_any();
            if let Some(e) = any.downcast_ref::<LabelPolicyAddedEvent>() {
                self.primary_color = e.primary_color.clone();
                self.secondary_color = e.secondary_color.clone();
                self.state = PolicyState::Active;
            } else if let Some(e) = any.downcast_ref::<LabelPolicyChangedEvent>() {
                if let Some(primary) = &e.primary_color {
                    self.primary_color = primary.clone();
                }
                if let Some(secondary) = &e.secondary_color {
                    self.secondary_color = secondary.clone();
                }
            }
        }
        self.read_model.reduce()
    }
}

impl QueryFold for LabelPolicyReadModel {
    fn query(&self) -> SearchQueryBuilder {
        SearchQueryBuilder::new([AGGREGATE_TYPE])
            .aggregate_ids([self.read_model.aggregate_id.clone()])
            .event_types([LABEL_POLICY_ADDED, LABEL_POLICY_CHANGED])
            .sequence_greater(self.read_model.processed_sequence)
    }
}

/// The lockout rules for failed password checks were created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordLockoutPolicyAddedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "maxAttempts")]
    pub max_attempts: u64,
    #[serde(rename = "showLockOutFailures")]
    pub show_lockout_failures: bool,
}

impl PasswordLockoutPolicyAddedEvent {
    pub fn new(editor: &Editor, max_attempts: u64, show_lockout_failures: bool) -> Self {
        Self {
            header: EventHeader::for_push(PASSWORD_LOCKOUT_POLICY_ADDED, editor),
            max_attempts,
            show_lockout_failures,
        }
    }
}

impl DomainEvent for PasswordLockoutPolicyAddedEvent {
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

pub(crate) fn password_lockout_policy_added_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: PasswordLockoutPolicyAddedEvent = decode_payload("IAM-t8Klv", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// Lockout rules changed; only differing fields are carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordLockoutPolicyChangedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "maxAttempts", skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u64>,
    #[serde(rename = "showLockOutFailures", skip_serializing_if = "Option::is_none")]
    pub show_lockout_failures: Option<bool>,
}

impl PasswordLockoutPolicyChangedEvent {
    /// Diffs the target rules against the loaded policy; `None` when
    /// nothing differs.
    pub fn from_existing(
        editor: &Editor,
        current: &PasswordLockoutPolicyReadModel,
        max_attempts: u64,
        show_lockout_failures: bool,
    ) -> Option<Self> {
        let mut event = Self {
            header: EventHeader::for_push(PASSWORD_LOCKOUT_POLICY_CHANGED, editor),
            max_attempts: None,
            show_lockout_failures: None,
        };

        let mut changed = false;
        if current.max_attempts != max_attempts {
            event.max_attempts = Some(max_attempts);
            changed = true;
        }
        if current.show_lockout_failures != show_lockout_failures {
            event.show_lockout_failures = Some(show_lockout_failures);
            changed = true;
        }

        changed.then_some(event)
    }
}

impl DomainEvent for PasswordLockoutPolicyChangedEvent {
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

pub(crate) fn password_lockout_policy_changed_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: PasswordLockoutPolicyChangedEvent = decode_payload("IAM-v3Hnd", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// Lockout policy of the instance, folded from its lockout events.
#[derive(Default)]
pub struct PasswordLockoutPolicyReadModel {
    pub read_model: ReadModel,
    pub max_attempts: u64,
    pub show_lockout_failures: bool,
    pub state: PolicyState,
}

impl PasswordLockoutPolicyReadModel {
    pub fn new(iam_id: impl Into<String>) -> Self {
        Self {
            read_model: ReadModel::new(iam_id),
            ..Self::default()
        }
    }
}

impl Fold for PasswordLockoutPolicyReadModel {
    fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> eventstore::Result<()> {
        self.read_model.append_events(events);
        Ok(())
    }

    fn reduce(&mut self) -> eventstore::Result<()> {
        for event in &self.read_model.events {
            let any = event.as_any();
            if let Some(e) = any.downcast_ref::<PasswordLockoutPolicyAddedEvent>() {
                self.max_attempts = e.max_attempts;
                self.show_lockout_failures = e.show_lockout_failures;
                self.state = PolicyState::Active;
            } else if let Some(e) = any.downcast_ref::<PasswordLockoutPolicyChangedEvent>() {
                if let Some(max_attempts) = e.max_attempts {
                    self.max_attempts = max_attempts;
                }
                if let Some(show) = e.show_lockout_failures {
                    self.show_lockout_failures = show;
                }
            }
        }
        self.read_model.reduce()
    }
}

impl QueryFold for PasswordLockoutPolicyReadModel {
    fn query(&self) -> SearchQueryBuilder {
        SearchQueryBuilder::new([AGGREGATE_TYPE])
            .aggregate_ids([self.read_model.aggregate_id.clone()])
            .event_types([
                PASSWORD_LOCKOUT_POLICY_ADDED,
                PASSWORD_LOCKOUT_POLICY_CHANGED,
            ])
            .sequence_greater(self.read_model.processed_sequence)
    }
}

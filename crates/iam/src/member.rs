//! IAM member events and models.

use std::any::Any;

use eventstore::{
    DomainEvent, Editor, EventHeader, Fold, QueryFold, SearchQueryBuilder, StoredEvent, WriteModel,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AGGREGATE_TYPE, decode_payload};

pub const MEMBER_ADDED: &str = "iam.member.added";
pub const MEMBER_CHANGED: &str = "iam.member.changed";
pub const MEMBER_REMOVED: &str = "iam.member.removed";

/// A member of the IAM instance as seen by read models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub user_id: String,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberState {
    #[default]
    Unspecified,
    Active,
    Removed,
}

/// A user was granted IAM roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberAddedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl MemberAddedEvent {
    pub fn new(editor: &Editor, user_id: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            header: EventHeader::for_push(MEMBER_ADDED, editor),
            user_id: user_id.into(),
            roles,
        }
    }
}

impl DomainEvent for MemberAddedEvent {
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

pub(crate) fn member_added_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: MemberAddedEvent = decode_payload("IAM-pR2cd", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// The role set of a member was replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberChangedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl MemberChangedEvent {
    /// Derives the change against the currently loaded member. Returns
    /// `None` when the target roles equal the current ones, making the
    /// command a no-op.
    pub fn from_existing(
        editor: &Editor,
        current: &MemberWriteModel,
        roles: Vec<String>,
    ) -> Option<Self> {
        if current.roles == roles {
            return None;
        }
        Some(Self {
            header: EventHeader::for_push(MEMBER_CHANGED, editor),
            user_id: current.user_id.clone(),
            roles,
        })
    }
}

impl DomainEvent for MemberChangedEvent {
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

pub(crate) fn member_changed_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: MemberChangedEvent = decode_payload("IAM-uF8vm", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// A member lost all access to the IAM instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberRemovedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "userId")]
    pub user_id: String,
}

impl MemberRemovedEvent {
    pub fn new(editor: &Editor, user_id: impl Into<String>) -> Self {
        Self {
            header: EventHeader::for_push(MEMBER_REMOVED, editor),
            user_id: user_id.into(),
        }
    }
}

impl DomainEvent for MemberRemovedEvent {
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

pub(crate) fn member_removed_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: MemberRemovedEvent = decode_payload("IAM-q0Tle", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// Write model of a single member, used to validate and derive member
/// changes. Events of other members are dropped on append.
#[derive(Default)]
pub struct MemberWriteModel {
    pub write_model: WriteModel,
    pub user_id: String,
    pub roles: Vec<String>,
    pub state: MemberState,
}

impl MemberWriteModel {
    pub fn new(iam_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            write_model: WriteModel::new(iam_id),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    fn is_own_event(&self, event: &dyn DomainEvent) -> bool {
        let any = event.as_any();
        if let Some(e) = any.downcast_ref::<MemberAddedEvent>() {
            e.user_id == self.user_id
        } else if let Some(e) = any.downcast_ref::<MemberChangedEvent>() {
            e.user_id == self.user_id
        } else if let Some(e) = any.downcast_ref::<MemberRemovedEvent>() {
            e.user_id == self.user_id
        } else {
            false
        }
    }
}

impl Fold for MemberWriteModel {
    fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> eventstore::Result<()> {
        let events = events
            .into_iter()
            .filter(|event| self.is_own_event(event.as_ref()))
            .collect();
        self.write_model.append_events(events);
        Ok(())
    }

    fn reduce(&mut self) -> eventstore::Result<()> {
        for event in &self.write_model.events {
            let any = event.as_any();
            if let Some(e) = any.downcast_ref::<MemberAddedEvent>() {
                self.roles = e.roles.clone();
                self.state = MemberState::Active;
            } else if let Some(e) = any.downcast_ref::<MemberChangedEvent>() {
                self.roles = e.roles.clone();
            } else if any.downcast_ref::<MemberRemovedEvent>().is_some() {
                self.roles.clear();
                self.state = MemberState::Removed;
            }
        }
        self.write_model.reduce()
    }
}

impl QueryFold for MemberWriteModel {
    fn query(&self) -> SearchQueryBuilder {
        let mut data = serde_json::Map::new();
        data.insert("userId".to_owned(), Value::String(self.user_id.clone()));
        SearchQueryBuilder::new([AGGREGATE_TYPE])
            .aggregate_ids([self.write_model.aggregate_id.clone()])
            .event_data(data)
            .sequence_greater(self.write_model.processed_sequence)
    }
}

/// Read model of a single member, driven by an explicit data-predicate
/// query (`userId == …`).
#[derive(Default)]
pub struct MemberReadModel {
    pub read_model: eventstore::ReadModel,
    pub user_id: String,
    pub roles: Vec<String>,
    pub state: MemberState,
}

impl MemberReadModel {
    pub fn new(iam_id: impl Into<String>) -> Self {
        Self {
            read_model: eventstore::ReadModel::new(iam_id),
            ..Self::default()
        }
    }
}

impl Fold for MemberReadModel {
    fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> eventstore::Result<()> {
        self.read_model.append_events(events);
        Ok(())
    }

    fn reduce(&mut self) -> eventstore::Result<()> {
        for event in &self.read_model.events {
            let any = event.as_any();
            if let Some(e) = any.downcast_ref::<MemberAddedEvent>() {
                self.user_id = e.user_id.clone();
                self.roles = e.roles.clone();
                self.state = MemberState::Active;
            } else if let Some(e) = any.downcast_ref::<MemberChangedEvent>() {
                self.roles = e.roles.clone();
            } else if any.downcast_ref::<MemberRemovedEvent>().is_some() {
                self.roles.clear();
                self.state = MemberState::Removed;
            }
        }
        self.read_model.reduce()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn stored_member_event(event_type: &str, sequence: u64, data: Value) -> StoredEvent {
        StoredEvent {
            aggregate_id: "iam-1".to_owned(),
            aggregate_type: AGGREGATE_TYPE.to_owned(),
            aggregate_version: "v1".to_owned(),
            event_type: event_type.to_owned(),
            sequence,
            previous_sequence: sequence.saturating_sub(1),
            event_date: Utc::now(),
            resource_owner: "iam-1".to_owned(),
            editor_service: "mgmt-api".to_owned(),
            editor_user: "admin".to_owned(),
            data: Some(data),
        }
    }

    #[test]
    fn added_event_round_trips_through_the_payload() {
        let editor = Editor::new("mgmt-api", "admin");
        let event = MemberAddedEvent::new(&editor, "u1", vec!["A".to_owned()]);
        let payload = event.payload().unwrap().unwrap();
        assert_eq!(payload, json!({"userId": "u1", "roles": ["A"]}));

        let stored = stored_member_event(MEMBER_ADDED, 1, payload);
        let decoded = member_added_decoder(&stored).unwrap();
        let decoded = decoded.as_any().downcast_ref::<MemberAddedEvent>().unwrap();
        assert_eq!(decoded.user_id, "u1");
        assert_eq!(decoded.roles, vec!["A"]);
        assert_eq!(decoded.header.sequence, 1);
    }

    #[test]
    fn changed_from_existing_is_none_for_equal_roles() {
        let editor = Editor::new("mgmt-api", "admin");
        let mut current = MemberWriteModel::new("iam-1", "u1");
        current.roles = vec!["A".to_owned()];

        assert!(MemberChangedEvent::from_existing(&editor, &current, vec!["A".to_owned()]).is_none());

        let changed =
            MemberChangedEvent::from_existing(&editor, &current, vec!["B".to_owned()]).unwrap();
        assert_eq!(changed.user_id, "u1");
        assert_eq!(changed.roles, vec!["B"]);
    }

    #[test]
    fn write_model_ignores_other_members() {
        let mut model = MemberWriteModel::new("iam-1", "u1");

        let own = member_added_decoder(&stored_member_event(
            MEMBER_ADDED,
            1,
            json!({"userId": "u1", "roles": ["A"]}),
        ))
        .unwrap();
        let other = member_added_decoder(&stored_member_event(
            MEMBER_ADDED,
            2,
            json!({"userId": "u2", "roles": ["B"]}),
        ))
        .unwrap();

        model.append_events(vec![own, other]).unwrap();
        model.reduce().unwrap();

        assert_eq!(model.state, MemberState::Active);
        assert_eq!(model.roles, vec!["A"]);
        // The foreign event was dropped before the base model saw it.
        assert_eq!(model.write_model.processed_sequence, 1);
    }

    #[test]
    fn removal_clears_the_role_set() {
        let mut model = MemberReadModel::new("iam-1");

        let added = member_added_decoder(&stored_member_event(
            MEMBER_ADDED,
            1,
            json!({"userId": "u1", "roles": ["A", "B"]}),
        ))
        .unwrap();
        let removed = member_removed_decoder(&stored_member_event(
            MEMBER_REMOVED,
            2,
            json!({"userId": "u1"}),
        ))
        .unwrap();

        model.append_events(vec![added, removed]).unwrap();
        model.reduce().unwrap();

        assert_eq!(model.state, MemberState::Removed);
        assert!(model.roles.is_empty());
        assert_eq!(model.read_model.processed_sequence, 2);
    }

    #[test]
    fn write_model_query_filters_by_user_id() {
        let model = MemberWriteModel::new("iam-1", "u1");
        let query = model.query().build().unwrap();
        assert_eq!(query.aggregate_types, vec![AGGREGATE_TYPE]);
        assert_eq!(query.aggregate_ids, vec!["iam-1"]);
        assert_eq!(
            query.event_data.unwrap().get("userId"),
            Some(&json!("u1"))
        );
    }
}

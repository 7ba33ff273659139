//! Full state of one IAM aggregate, folded from its event stream.

use eventstore::{DomainEvent, Fold, QueryFold, ReadModel, SearchQueryBuilder};

use crate::AGGREGATE_TYPE;
use crate::member::{Member, MemberAddedEvent, MemberChangedEvent, MemberRemovedEvent};
use crate::setup::{GlobalOrgSetEvent, IamProjectSetEvent, SetupStepEvent, Step};

/// The complete IAM instance state used by command handlers and reads:
/// members, setup progress, global organisation and IAM project.
#[derive(Debug, Default)]
pub struct IamReadModel {
    pub read_model: ReadModel,
    pub members: Vec<Member>,
    pub setup_started: Step,
    pub setup_done: Step,
    pub global_org_id: String,
    pub iam_project_id: String,
}

impl IamReadModel {
    pub fn new(iam_id: impl Into<String>) -> Self {
        Self {
            read_model: ReadModel::new(iam_id),
            ..Self::default()
        }
    }

    pub fn member_by_user_id(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|member| member.user_id == user_id)
    }

    /// Folds freshly committed events into the model, the step after a
    /// successful push.
    pub fn append_and_reduce(&mut self, events: Vec<Box<dyn DomainEvent>>) -> eventstore::Result<()> {
        self.append_events(events)?;
        self.reduce()
    }
}

impl Fold for IamReadModel {
    fn append_events(&mut self, events: Vec<Box<dyn DomainEvent>>) -> eventstore::Result<()> {
        self.read_model.append_events(events);
        Ok(())
    }

    fn reduce(&mut self) -> eventstore::Result<()> {
        for event in &self.read_model.events {
            let any = event.as_any();
            if let Some(e) = any.downcast_ref::<MemberAddedEvent>() {
                if self.members.iter().all(|m| m.user_id != e.user_id) {
                    self.members.push(Member {
                        user_id: e.user_id.clone(),
                        roles: e.roles.clone(),
                    });
                }
            } else if let Some(e) = any.downcast_ref::<MemberChangedEvent>() {
                if let Some(member) = self.members.iter_mut().find(|m| m.user_id == e.user_id) {
                    member.roles = e.roles.clone();
                }
            } else if let Some(e) = any.downcast_ref::<MemberRemovedEvent>() {
                self.members.retain(|m| m.user_id != e.user_id);
            } else if let Some(e) = any.downcast_ref::<GlobalOrgSetEvent>() {
                self.global_org_id = e.org_id.clone();
            } else if let Some(e) = any.downcast_ref::<IamProjectSetEvent>() {
                self.iam_project_id = e.iam_project_id.clone();
            } else if let Some(e) = any.downcast_ref::<SetupStepEvent>() {
                if e.done {
                    self.setup_done = e.step;
                } else {
                    self.setup_started = e.step;
                }
            }
        }
        self.read_model.reduce()
    }
}

impl QueryFold for IamReadModel {
    fn query(&self) -> SearchQueryBuilder {
        SearchQueryBuilder::new([AGGREGATE_TYPE])
            .aggregate_ids([self.read_model.aggregate_id.clone()])
            .sequence_greater(self.read_model.processed_sequence)
    }
}

//! Command handlers and reads of the IAM aggregate.

use eventstore::{Aggregate, Editor, EventStoreError, Eventstore, Fold};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::idp::{OidcConfigAddedEvent, OidcConfigChangedEvent, OidcConfigState, OidcConfigWriteModel, OidcMappingField};
use crate::member::{
    Member, MemberAddedEvent, MemberChangedEvent, MemberReadModel, MemberRemovedEvent, MemberState,
    MemberWriteModel,
};
use crate::policy::{
    LabelPolicyAddedEvent, LabelPolicyChangedEvent, LabelPolicyReadModel,
    PasswordLockoutPolicyAddedEvent, PasswordLockoutPolicyChangedEvent,
    PasswordLockoutPolicyReadModel, PolicyState,
};
use crate::read_model::IamReadModel;
use crate::setup::{GlobalOrgSetEvent, IamProjectSetEvent, SetupStepEvent, Step};
use crate::{AGGREGATE_TYPE, AGGREGATE_VERSION, register_event_mappers};

/// Repository of the IAM aggregate.
///
/// Every command follows the same shape: load a model, validate, derive
/// events, push. Commands that would produce no events return success
/// without touching the log.
pub struct Repository {
    eventstore: Eventstore,
}

impl Repository {
    /// Wires the repository and registers the IAM event decoders on the
    /// given eventstore.
    pub fn new(eventstore: Eventstore) -> Self {
        register_event_mappers(&eventstore);
        Self { eventstore }
    }

    pub fn eventstore(&self) -> &Eventstore {
        &self.eventstore
    }

    /// Reconstructs the full IAM state.
    #[instrument(skip(self, cancel))]
    pub async fn iam_by_id(
        &self,
        cancel: &CancellationToken,
        iam_id: &str,
    ) -> eventstore::Result<IamReadModel> {
        let mut iam = IamReadModel::new(iam_id);
        self.eventstore
            .filter_to_query_reducer(cancel, &mut iam)
            .await?;
        Ok(iam)
    }

    /// Finds one member through the payload predicate `userId == …`.
    #[instrument(skip(self, cancel))]
    pub async fn member_by_id(
        &self,
        cancel: &CancellationToken,
        iam_id: &str,
        user_id: &str,
    ) -> eventstore::Result<MemberReadModel> {
        let mut data = serde_json::Map::new();
        data.insert(
            "userId".to_owned(),
            serde_json::Value::String(user_id.to_owned()),
        );
        let query = eventstore::SearchQueryBuilder::new([AGGREGATE_TYPE])
            .aggregate_ids([iam_id])
            .event_data(data);

        let mut member = MemberReadModel::new(iam_id);
        self.eventstore
            .filter_to_reducer(cancel, query, &mut member)
            .await?;
        Ok(member)
    }

    /// Grants IAM roles to a user.
    #[instrument(skip(self, cancel, editor))]
    pub async fn add_member(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        user_id: &str,
        roles: Vec<String>,
    ) -> eventstore::Result<Member> {
        if user_id.is_empty() || roles.is_empty() {
            return Err(EventStoreError::precondition_failed(
                "IAM-W8m4l",
                "Errors.Iam.MemberInvalid",
            ));
        }

        let mut iam = self.iam_by_id(cancel, iam_id).await?;
        if iam.member_by_user_id(user_id).is_some() {
            return Err(EventStoreError::precondition_failed(
                "IAM-GPhuz",
                "Errors.Iam.MemberAlreadyExisting",
            ));
        }

        let aggregate = self
            .iam_aggregate(&iam)
            .push_event(MemberAddedEvent::new(editor, user_id, roles));
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        iam.append_and_reduce(events)?;

        iam.member_by_user_id(user_id)
            .cloned()
            .ok_or_else(|| EventStoreError::internal("IAM-nuoDN", "member not saved"))
    }

    /// Replaces the role set of an existing member.
    #[instrument(skip(self, cancel, editor))]
    pub async fn change_member(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        user_id: &str,
        roles: Vec<String>,
    ) -> eventstore::Result<Member> {
        if user_id.is_empty() || roles.is_empty() {
            return Err(EventStoreError::precondition_failed(
                "IAM-LiaZi",
                "Errors.Iam.MemberInvalid",
            ));
        }

        let mut member = MemberWriteModel::new(iam_id, user_id);
        self.eventstore
            .filter_to_query_reducer(cancel, &mut member)
            .await?;
        if member.state != MemberState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-D8iep",
                "Errors.Iam.MemberNotExisting",
            ));
        }

        let Some(event) = MemberChangedEvent::from_existing(editor, &member, roles) else {
            // Already in the target state.
            return Ok(Member {
                user_id: member.user_id.clone(),
                roles: member.roles.clone(),
            });
        };

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &member.write_model.resource_owner)
            .await?
            .push_event(event);
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        member.append_events(events)?;
        member.reduce()?;

        Ok(Member {
            user_id: member.user_id.clone(),
            roles: member.roles.clone(),
        })
    }

    /// Revokes all IAM roles of a user. Removing a member that does not
    /// exist is a no-op, not an error.
    #[instrument(skip(self, cancel, editor))]
    pub async fn remove_member(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        user_id: &str,
    ) -> eventstore::Result<()> {
        let mut iam = self.iam_by_id(cancel, iam_id).await?;
        if iam.member_by_user_id(user_id).is_none() {
            return Ok(());
        }

        let aggregate = self
            .iam_aggregate(&iam)
            .push_event(MemberRemovedEvent::new(editor, user_id));
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        iam.append_and_reduce(events)
    }

    /// Chooses the organisation owning default resources.
    #[instrument(skip(self, cancel, editor))]
    pub async fn set_global_org(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        org_id: &str,
    ) -> eventstore::Result<()> {
        if org_id.is_empty() {
            return Err(EventStoreError::precondition_failed(
                "IAM-8Wqa3",
                "Errors.Iam.GlobalOrgMissing",
            ));
        }

        let mut iam = self.iam_by_id(cancel, iam_id).await?;
        if iam.global_org_id == org_id {
            return Ok(());
        }

        let aggregate = self
            .iam_aggregate(&iam)
            .push_event(GlobalOrgSetEvent::new(editor, org_id));
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        iam.append_and_reduce(events)
    }

    /// Chooses the project carrying the IAM applications.
    #[instrument(skip(self, cancel, editor))]
    pub async fn set_iam_project(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        project_id: &str,
    ) -> eventstore::Result<()> {
        if project_id.is_empty() {
            return Err(EventStoreError::precondition_failed(
                "IAM-k2Prf",
                "Errors.Iam.IamProjectMissing",
            ));
        }

        let mut iam = self.iam_by_id(cancel, iam_id).await?;
        if iam.iam_project_id == project_id {
            return Ok(());
        }

        let aggregate = self
            .iam_aggregate(&iam)
            .push_event(IamProjectSetEvent::new(editor, project_id));
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        iam.append_and_reduce(events)
    }

    /// Marks a setup step as started. Re-starting an already started (or
    /// passed) step is a no-op.
    #[instrument(skip(self, cancel, editor))]
    pub async fn start_setup(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        step: Step,
    ) -> eventstore::Result<()> {
        let mut iam = self.iam_by_id(cancel, iam_id).await?;
        if step <= iam.setup_started {
            return Ok(());
        }

        let aggregate = self
            .iam_aggregate(&iam)
            .push_event(SetupStepEvent::started(editor, step));
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        iam.append_and_reduce(events)
    }

    /// Marks a setup step as done. A step can only finish once it was
    /// started.
    #[instrument(skip(self, cancel, editor))]
    pub async fn setup_done(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        step: Step,
    ) -> eventstore::Result<()> {
        let mut iam = self.iam_by_id(cancel, iam_id).await?;
        if step <= iam.setup_done {
            return Ok(());
        }
        if step > iam.setup_started {
            return Err(EventStoreError::precondition_failed(
                "IAM-9fVbc",
                "Errors.Iam.SetupNotStarted",
            ));
        }

        let aggregate = self
            .iam_aggregate(&iam)
            .push_event(SetupStepEvent::done(editor, step));
        let events = self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        iam.append_and_reduce(events)
    }

    /// Adds an OIDC IDP configuration.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, cancel, editor))]
    pub async fn add_idp_oidc_config(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        idp_config_id: &str,
        client_id: &str,
        issuer: &str,
        scopes: Vec<String>,
        display_name_mapping: OidcMappingField,
        user_name_mapping: OidcMappingField,
    ) -> eventstore::Result<()> {
        if idp_config_id.is_empty() || client_id.is_empty() || issuer.is_empty() {
            return Err(EventStoreError::precondition_failed(
                "IAM-fQw2e",
                "Errors.Iam.IdpConfigInvalid",
            ));
        }

        let mut config = OidcConfigWriteModel::new(iam_id, idp_config_id);
        self.eventstore
            .filter_to_query_reducer(cancel, &mut config)
            .await?;
        if config.state == OidcConfigState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-0pQr4",
                "Errors.Iam.IdpConfigAlreadyExisting",
            ));
        }

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &config.write_model.resource_owner)
            .await?
            .push_event(OidcConfigAddedEvent::new(
                editor,
                idp_config_id,
                client_id,
                issuer,
                scopes,
                display_name_mapping,
                user_name_mapping,
            ));
        self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        Ok(())
    }

    /// Updates an OIDC IDP configuration; pushing only the diff. An
    /// unchanged configuration is a no-op.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, cancel, editor))]
    pub async fn change_idp_oidc_config(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        idp_config_id: &str,
        client_id: &str,
        issuer: &str,
        scopes: Vec<String>,
        display_name_mapping: OidcMappingField,
        user_name_mapping: OidcMappingField,
    ) -> eventstore::Result<()> {
        let mut config = OidcConfigWriteModel::new(iam_id, idp_config_id);
        self.eventstore
            .filter_to_query_reducer(cancel, &mut config)
            .await?;
        if config.state != OidcConfigState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-2n8Fh",
                "Errors.Iam.IdpConfigNotExisting",
            ));
        }

        let Some(event) = OidcConfigChangedEvent::from_existing(
            editor,
            &config,
            client_id,
            issuer,
            &scopes,
            display_name_mapping,
            user_name_mapping,
        ) else {
            return Ok(());
        };

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &config.write_model.resource_owner)
            .await?
            .push_event(event);
        self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        Ok(())
    }

    /// Reads the branding policy.
    #[instrument(skip(self, cancel))]
    pub async fn label_policy(
        &self,
        cancel: &CancellationToken,
        iam_id: &str,
    ) -> eventstore::Result<LabelPolicyReadModel> {
        let mut policy = LabelPolicyReadModel::new(iam_id);
        self.eventstore
            .filter_to_query_reducer(cancel, &mut policy)
            .await?;
        Ok(policy)
    }

    /// Creates the branding policy.
    #[instrument(skip(self, cancel, editor))]
    pub async fn add_label_policy(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        primary_color: &str,
        secondary_color: &str,
    ) -> eventstore::Result<()> {
        let policy = self.label_policy(cancel, iam_id).await?;
        if policy.state == PolicyState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-1yNpb",
                "Errors.Iam.LabelPolicyAlreadyExisting",
            ));
        }

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &policy.read_model.resource_owner)
            .await?
            .push_event(LabelPolicyAddedEvent::new(
                editor,
                primary_color,
                secondary_color,
            ));
        self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        Ok(())
    }

    /// Updates the branding policy; an unchanged policy is a no-op.
    #[instrument(skip(self, cancel, editor))]
    pub async fn change_label_policy(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        primary_color: &str,
        secondary_color: &str,
    ) -> eventstore::Result<()> {
        let policy = self.label_policy(cancel, iam_id).await?;
        if policy.state != PolicyState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-6sHmc",
                "Errors.Iam.LabelPolicyNotExisting",
            ));
        }

        let Some(event) =
            LabelPolicyChangedEvent::from_existing(editor, &policy, primary_color, secondary_color)
        else {
            return Ok(());
        };

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &policy.read_model.resource_owner)
            .await?
            .push_event(event);
        self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        Ok(())
    }

    /// Reads the password lockout policy.
    #[instrument(skip(self, cancel))]
    pub async fn password_lockout_policy(
        &self,
        cancel: &CancellationToken,
        iam_id: &str,
    ) -> eventstore::Result<PasswordLockoutPolicyReadModel> {
        let mut policy = PasswordLockoutPolicyReadModel::new(iam_id);
        self.eventstore
            .filter_to_query_reducer(cancel, &mut policy)
            .await?;
        Ok(policy)
    }

    /// Creates the password lockout policy.
    #[instrument(skip(self, cancel, editor))]
    pub async fn add_password_lockout_policy(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        max_attempts: u64,
        show_lockout_failures: bool,
    ) -> eventstore::Result<()> {
        let policy = self.password_lockout_policy(cancel, iam_id).await?;
        if policy.state == PolicyState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-3jMds",
                "Errors.Iam.PasswordLockoutPolicyAlreadyExisting",
            ));
        }

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &policy.read_model.resource_owner)
            .await?
            .push_event(PasswordLockoutPolicyAddedEvent::new(
                editor,
                max_attempts,
                show_lockout_failures,
            ));
        self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        Ok(())
    }

    /// Updates the password lockout policy; an unchanged policy is a
    /// no-op.
    #[instrument(skip(self, cancel, editor))]
    pub async fn change_password_lockout_policy(
        &self,
        cancel: &CancellationToken,
        editor: &Editor,
        iam_id: &str,
        max_attempts: u64,
        show_lockout_failures: bool,
    ) -> eventstore::Result<()> {
        let policy = self.password_lockout_policy(cancel, iam_id).await?;
        if policy.state != PolicyState::Active {
            return Err(EventStoreError::precondition_failed(
                "IAM-e7Wlz",
                "Errors.Iam.PasswordLockoutPolicyNotExisting",
            ));
        }

        let Some(event) = PasswordLockoutPolicyChangedEvent::from_existing(
            editor,
            &policy,
            max_attempts,
            show_lockout_failures,
        ) else {
            return Ok(());
        };

        let aggregate = self
            .aggregate_at_latest(cancel, iam_id, &policy.read_model.resource_owner)
            .await?
            .push_event(event);
        self.eventstore.push_aggregates(cancel, vec![aggregate]).await?;
        Ok(())
    }

    /// The IAM aggregate owns itself: a fresh stream defaults its
    /// resource owner to the instance id.
    fn iam_aggregate(&self, iam: &IamReadModel) -> Aggregate {
        if iam.read_model.resource_owner.is_empty() {
            Aggregate::new(
                iam.read_model.aggregate_id.clone(),
                AGGREGATE_TYPE,
                iam.read_model.aggregate_id.clone(),
                AGGREGATE_VERSION,
                iam.read_model.processed_sequence,
            )
        } else {
            Aggregate::from_read_model(&iam.read_model, AGGREGATE_TYPE, AGGREGATE_VERSION)
        }
    }

    /// Scoped write models only observe their slice of the stream, so
    /// the optimistic-concurrency token comes from the aggregate-wide
    /// max-sequence probe instead of the model watermark.
    async fn aggregate_at_latest(
        &self,
        cancel: &CancellationToken,
        iam_id: &str,
        resource_owner: &str,
    ) -> eventstore::Result<Aggregate> {
        let query =
            eventstore::SearchQueryBuilder::new([AGGREGATE_TYPE]).aggregate_ids([iam_id]);
        let latest = self.eventstore.latest_sequence(cancel, query).await?;

        let owner = if resource_owner.is_empty() {
            iam_id
        } else {
            resource_owner
        };
        Ok(Aggregate::new(
            iam_id,
            AGGREGATE_TYPE,
            owner,
            AGGREGATE_VERSION,
            latest,
        ))
    }
}

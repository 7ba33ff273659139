//! IAM domain built on the eventstore core.
//!
//! One well-known aggregate per tenant (type `iam`, version `v1`) holds
//! the instance's members, setup progress, global organisation, IAM
//! project and policies. Commands load a write- or read-model, validate,
//! derive events and push them; reads fold the event stream.

use eventstore::registry::{EventDecoder, decoder};
use eventstore::{Eventstore, StoredEvent};
use serde::de::DeserializeOwned;

pub mod idp;
pub mod member;
pub mod policy;
pub mod read_model;
pub mod repository;
pub mod setup;

pub use member::{Member, MemberReadModel, MemberState, MemberWriteModel};
pub use read_model::IamReadModel;
pub use repository::Repository;
pub use setup::Step;

/// Aggregate type of the IAM instance.
pub const AGGREGATE_TYPE: &str = "iam";

/// Version tag of the IAM event schema.
pub const AGGREGATE_VERSION: &str = "v1";

/// Registers the decoders for every IAM event type. Idempotent; safe to
/// call once per [`Eventstore`] instance during startup.
pub fn register_event_mappers(es: &Eventstore) {
    for (event_type, decoder) in event_decoders() {
        es.registry().register(event_type, decoder);
    }
}

fn event_decoders() -> Vec<(&'static str, Option<EventDecoder>)> {
    vec![
        (
            member::MEMBER_ADDED,
            Some(decoder(member::member_added_decoder)),
        ),
        (
            member::MEMBER_CHANGED,
            Some(decoder(member::member_changed_decoder)),
        ),
        (
            member::MEMBER_REMOVED,
            Some(decoder(member::member_removed_decoder)),
        ),
        (
            setup::GLOBAL_ORG_SET,
            Some(decoder(setup::global_org_set_decoder)),
        ),
        (
            setup::IAM_PROJECT_SET,
            Some(decoder(setup::iam_project_set_decoder)),
        ),
        (
            setup::SETUP_STARTED,
            Some(decoder(setup::setup_step_decoder)),
        ),
        (setup::SETUP_DONE, Some(decoder(setup::setup_step_decoder))),
        (
            idp::IDP_OIDC_CONFIG_ADDED,
            Some(decoder(idp::oidc_config_added_decoder)),
        ),
        (
            idp::IDP_OIDC_CONFIG_CHANGED,
            Some(decoder(idp::oidc_config_changed_decoder)),
        ),
        (
            policy::LABEL_POLICY_ADDED,
            Some(decoder(policy::label_policy_added_decoder)),
        ),
        (
            policy::LABEL_POLICY_CHANGED,
            Some(decoder(policy::label_policy_changed_decoder)),
        ),
        (
            policy::PASSWORD_LOCKOUT_POLICY_ADDED,
            Some(decoder(policy::password_lockout_policy_added_decoder)),
        ),
        (
            policy::PASSWORD_LOCKOUT_POLICY_CHANGED,
            Some(decoder(policy::password_lockout_policy_changed_decoder)),
        ),
    ]
}

/// Deserializes a stored payload into a typed event body. A NULL payload
/// decodes from an empty object, so events with all-optional fields stay
/// decodable.
pub(crate) fn decode_payload<T: DeserializeOwned>(
    code: &'static str,
    stored: &StoredEvent,
) -> eventstore::Result<T> {
    let data = stored
        .data
        .clone()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    serde_json::from_value(data)
        .map_err(|err| eventstore::EventStoreError::decode(code, &stored.event_type, err))
}

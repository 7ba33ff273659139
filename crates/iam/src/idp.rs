//! OIDC identity-provider configuration of the IAM instance.

use std::any::Any;

use eventstore::{
    DomainEvent, Editor, EventHeader, Fold, QueryFold, SearchQueryBuilder, StoredEvent, WriteModel,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{AGGREGATE_TYPE, decode_payload};

pub const IDP_OIDC_CONFIG_ADDED: &str = "iam.idp.oidc.config.added";
pub const IDP_OIDC_CONFIG_CHANGED: &str = "iam.idp.oidc.config.changed";

/// Claim used to derive a display name or username from the IDP.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum OidcMappingField {
    #[default]
    Unspecified = 0,
    PreferredLoginName = 1,
    Email = 2,
}

impl From<OidcMappingField> for u8 {
    fn from(field: OidcMappingField) -> Self {
        field as u8
    }
}

impl TryFrom<u8> for OidcMappingField {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OidcMappingField::Unspecified),
            1 => Ok(OidcMappingField::PreferredLoginName),
            2 => Ok(OidcMappingField::Email),
            other => Err(format!("unknown OIDC mapping field {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OidcConfigState {
    #[default]
    Unspecified,
    Active,
}

/// An OIDC IDP configuration was added to the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfigAddedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "idpConfigId")]
    pub idp_config_id: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    pub issuer: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(rename = "idpDisplayNameMapping", default)]
    pub display_name_mapping: OidcMappingField,
    #[serde(rename = "userNameMapping", default)]
    pub user_name_mapping: OidcMappingField,
}

impl OidcConfigAddedEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        editor: &Editor,
        idp_config_id: impl Into<String>,
        client_id: impl Into<String>,
        issuer: impl Into<String>,
        scopes: Vec<String>,
        display_name_mapping: OidcMappingField,
        user_name_mapping: OidcMappingField,
    ) -> Self {
        Self {
            header: EventHeader::for_push(IDP_OIDC_CONFIG_ADDED, editor),
            idp_config_id: idp_config_id.into(),
            client_id: client_id.into(),
            issuer: issuer.into(),
            scopes,
            display_name_mapping,
            user_name_mapping,
        }
    }
}

impl DomainEvent for OidcConfigAddedEvent {
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

pub(crate) fn oidc_config_added_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: OidcConfigAddedEvent = decode_payload("IAM-c6Snp", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// An OIDC IDP configuration changed; only differing fields are carried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OidcConfigChangedEvent {
    #[serde(skip, default = "EventHeader::empty")]
    pub header: EventHeader,
    #[serde(rename = "idpConfigId")]
    pub idp_config_id: String,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(rename = "idpDisplayNameMapping", skip_serializing_if = "Option::is_none")]
    pub display_name_mapping: Option<OidcMappingField>,
    #[serde(rename = "userNameMapping", skip_serializing_if = "Option::is_none")]
    pub user_name_mapping: Option<OidcMappingField>,
}

impl OidcConfigChangedEvent {
    /// Diffs the target configuration against the loaded one. Returns
    /// `None` when nothing differs, making the command a no-op.
    #[allow(clippy::too_many_arguments)]
    pub fn from_existing(
        editor: &Editor,
        current: &OidcConfigWriteModel,
        client_id: &str,
        issuer: &str,
        scopes: &[String],
        display_name_mapping: OidcMappingField,
        user_name_mapping: OidcMappingField,
    ) -> Option<Self> {
        let mut event = Self {
            header: EventHeader::for_push(IDP_OIDC_CONFIG_CHANGED, editor),
            idp_config_id: current.idp_config_id.clone(),
            client_id: None,
            issuer: None,
            scopes: None,
            display_name_mapping: None,
            user_name_mapping: None,
        };

        let mut changed = false;
        if current.client_id != client_id {
            event.client_id = Some(client_id.to_owned());
            changed = true;
        }
        if current.issuer != issuer {
            event.issuer = Some(issuer.to_owned());
            changed = true;
        }
        if current.scopes != scopes {
            event.scopes = Some(scopes.to_vec());
            changed = true;
        }
        if current.display_name_mapping != display_name_mapping {
            event.display_name_mapping = Some(display_name_mapping);
            changed = true;
        }
        if current.user_name_mapping != user_name_mapping {
            event.user_name_mapping = Some(user_name_mapping);
            changed = true;
        }

        changed.then_some(event)
    }
}

impl DomainEvent for OidcConfigChangedEvent {
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

pub(crate) fn oidc_config_changed_decoder(
    stored: &StoredEvent,
) -> eventstore::Result<Box<dyn DomainEvent>> {
    let mut event: OidcConfigChangedEvent = decode_payload("IAM-x9Dfu", stored)?;
    event.header = EventHeader::from_stored(stored);
    Ok(Box::new(event))
}

/// Write model of one OIDC configuration, identified by its config id.
/// Events of other configurations are dropped on append.
#[derive(Default)]
pub struct OidcConfigWriteModel {
    pub write_model: WriteModel,
    pub idp_config_id: String,
    pub client_id: String,
    pub issuer: String,
    pub scopes: Vec<String>,
    pub display_name_mapping: OidcMappingField,
    pub user_name_mapping: OidcMappingField,
    pub state: OidcConfigState,
}

impl OidcConfigWriteModel {
    pub fn new(iam_id: impl Into<String>, idp_config_id: impl Into<String>) -> Self {
        Self {
            write_model: WriteModel::new(iam_id),
            idp_config_id: idp_config_id.into(),
            ..Self::default()
        }
    }

    fn is_own_event(&self, event: &dyn DomainEvent) -> bool {
        let any = event.as_any();
        if let Some(e) = any.downcast_ref::<OidcConfigAddedEvent>() {
            e.idp_config_id == self.idp_config_id
        } else if let Some(e) = any.downcast_ref::<OidcConfigChangedEvent>() {
            e.idp_config_id == self.idp_config_id
        } else {
            false
        }
    }
}

impl Fold for OidcConfigWriteModel {
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
            if let Some(e) = any.downcast_ref::<OidcConfigAddedEvent>() {
                self.client_id = e.client_id.clone();
                self.issuer = e.issuer.clone();
                self.scopes = e.scopes.clone();
                self.display_name_mapping = e.display_name_mapping;
                self.user_name_mapping = e.user_name_mapping;
                self.state = OidcConfigState::Active;
            } else if let Some(e) = any.downcast_ref::<OidcConfigChangedEvent>() {
                if let Some(client_id) = &e.client_id {
                    self.client_id = client_id.clone();
                }
                if let Some(issuer) = &e.issuer {
                    self.issuer = issuer.clone();
                }
                if let Some(scopes) = &e.scopes {
                    self.scopes = scopes.clone();
                }
                if let Some(mapping) = e.display_name_mapping {
                    self.display_name_mapping = mapping;
                }
                if let Some(mapping) = e.user_name_mapping {
                    self.user_name_mapping = mapping;
                }
            }
        }
        self.write_model.reduce()
    }
}

impl QueryFold for OidcConfigWriteModel {
    fn query(&self) -> SearchQueryBuilder {
        SearchQueryBuilder::new([AGGREGATE_TYPE])
            .aggregate_ids([self.write_model.aggregate_id.clone()])
            .event_types([IDP_OIDC_CONFIG_ADDED, IDP_OIDC_CONFIG_CHANGED])
            .sequence_greater(self.write_model.processed_sequence)
    }
}

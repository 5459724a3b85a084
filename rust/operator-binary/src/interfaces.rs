//! Versioned, YAML encoded data exchange over the `ingress`, `ingress-auth` and `oidc-client`
//! relations.
//!
//! Both sides advertise the schema versions they understand in `_supported_versions`, the highest
//! version known to everyone is used, and the payload itself travels in the `data` field of each
//! application's data bag.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt, Snafu};

use crate::model::{self, Model, Relation};

pub const INGRESS_ENDPOINT: &str = "ingress";
pub const INGRESS_AUTH_ENDPOINT: &str = "ingress-auth";
pub const OIDC_CLIENT_ENDPOINT: &str = "oidc-client";

const SUPPORTED_VERSIONS_KEY: &str = "_supported_versions";
const DATA_KEY: &str = "data";
const SUPPORTED_VERSIONS: &[&str] = &["v1"];

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("List of {endpoint} versions not found for apps: {}", apps.join(", ")))]
    NoVersionsListed { endpoint: String, apps: Vec<String> },

    #[snafu(display("No compatible {endpoint} versions found for apps: {}", apps.join(", ")))]
    NoCompatibleVersions { endpoint: String, apps: Vec<String> },

    #[snafu(display("failed to list relations of {endpoint}"))]
    ListRelations {
        source: model::Error,
        endpoint: String,
    },

    #[snafu(display("failed to read remote data on {relation}"))]
    ReadRemoteData {
        source: model::Error,
        relation: Relation,
    },

    #[snafu(display("failed to advertise supported versions on {relation}"))]
    AdvertiseVersions {
        source: model::Error,
        relation: Relation,
    },

    #[snafu(display("failed to encode {endpoint} data"))]
    EncodeData {
        source: serde_yaml::Error,
        endpoint: String,
    },

    #[snafu(display("failed to send data on {relation}"))]
    SendData {
        source: model::Error,
        relation: Relation,
    },

    #[snafu(display("failed to decode data sent by {app} on {relation}"))]
    DecodeData {
        source: serde_yaml::Error,
        relation: Relation,
        app: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// The negotiated exchange endpoints of this charm.
///
/// An endpoint is `None` while nothing is related to it.
#[derive(Debug, Default)]
pub struct Interfaces {
    pub ingress: Option<Interface>,
    pub ingress_auth: Option<Interface>,
    pub oidc_client: Option<Interface>,
}

/// A negotiated exchange endpoint with at least one established relation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Interface {
    pub endpoint: String,
    pub version: String,
    pub relations: Vec<Relation>,
}

/// Negotiates a schema version for every exchange endpoint of the charm.
pub async fn get_interfaces(model: &impl Model) -> Result<Interfaces> {
    Ok(Interfaces {
        ingress: get_interface(model, INGRESS_ENDPOINT).await?,
        ingress_auth: get_interface(model, INGRESS_AUTH_ENDPOINT).await?,
        oidc_client: get_interface(model, OIDC_CLIENT_ENDPOINT).await?,
    })
}

async fn get_interface(model: &impl Model, endpoint: &str) -> Result<Option<Interface>> {
    let relations = model
        .relations(endpoint)
        .await
        .context(ListRelationsSnafu { endpoint })?;
    if relations.is_empty() {
        return Ok(None);
    }

    let advertised =
        serde_yaml::to_string(SUPPORTED_VERSIONS).context(EncodeDataSnafu { endpoint })?;
    let mut unlisted = Vec::new();
    let mut remote_versions = Vec::new();
    for relation in &relations {
        model
            .set_relation_data(relation, SUPPORTED_VERSIONS_KEY, &advertised)
            .await
            .with_context(|_| AdvertiseVersionsSnafu {
                relation: relation.clone(),
            })?;

        let Some(app) = &relation.remote_app else {
            continue;
        };
        let data = model
            .relation_data(relation, app)
            .await
            .with_context(|_| ReadRemoteDataSnafu {
                relation: relation.clone(),
            })?;
        match data
            .get(SUPPORTED_VERSIONS_KEY)
            .and_then(|versions| serde_yaml::from_str::<Vec<String>>(versions).ok())
        {
            Some(versions) if !versions.is_empty() => remote_versions.push((app.clone(), versions)),
            _ => unlisted.push(app.clone()),
        }
    }

    if !unlisted.is_empty() {
        return NoVersionsListedSnafu {
            endpoint,
            apps: unlisted,
        }
        .fail();
    }

    let version = SUPPORTED_VERSIONS
        .iter()
        .filter(|ours| {
            remote_versions
                .iter()
                .all(|(_, theirs)| theirs.iter().any(|v| v.as_str() == **ours))
        })
        .max_by_key(|version| version_number(version))
        .copied();
    match version {
        Some(version) => {
            tracing::debug!(endpoint, version, "negotiated relation schema version");
            Ok(Some(Interface {
                endpoint: endpoint.to_owned(),
                version: version.to_owned(),
                relations,
            }))
        }
        None => NoCompatibleVersionsSnafu {
            endpoint,
            apps: remote_versions
                .into_iter()
                .map(|(app, _)| app)
                .collect::<Vec<_>>(),
        }
        .fail(),
    }
}

/// Orders versions of the form `v<N>` numerically, so that `v10` sorts after `v9`.
fn version_number(version: &str) -> u32 {
    version
        .strip_prefix('v')
        .and_then(|number| number.parse().ok())
        .unwrap_or_default()
}

impl Interface {
    /// Publishes `data` in this application's data bag on every relation of the endpoint.
    pub async fn send_data<T: Serialize>(&self, model: &impl Model, data: &T) -> Result<()> {
        let encoded = serde_yaml::to_string(data).context(EncodeDataSnafu {
            endpoint: &self.endpoint,
        })?;
        for relation in &self.relations {
            model
                .set_relation_data(relation, DATA_KEY, &encoded)
                .await
                .with_context(|_| SendDataSnafu {
                    relation: relation.clone(),
                })?;
        }
        Ok(())
    }

    /// Reads the data published by each remote application, keyed by application name.
    ///
    /// Remote applications that did not publish anything yet are skipped.
    pub async fn get_data<T: DeserializeOwned>(
        &self,
        model: &impl Model,
    ) -> Result<BTreeMap<String, T>> {
        let mut received = BTreeMap::new();
        for relation in &self.relations {
            let Some(app) = &relation.remote_app else {
                continue;
            };
            let data = model
                .relation_data(relation, app)
                .await
                .with_context(|_| ReadRemoteDataSnafu {
                    relation: relation.clone(),
                })?;
            if let Some(encoded) = data.get(DATA_KEY) {
                let decoded = serde_yaml::from_str(encoded).with_context(|_| DecodeDataSnafu {
                    relation: relation.clone(),
                    app: app.clone(),
                })?;
                received.insert(app.clone(), decoded);
            }
        }
        Ok(received)
    }
}

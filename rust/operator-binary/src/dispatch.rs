//! Decides which hooks trigger a reconciliation pass.

use std::{fmt::Display, str::FromStr};

use strum::{Display as StrumDisplay, EnumString};

use crate::{
    config::{Generation, CONTAINER_NAME},
    dex_oidc_config,
    interfaces::{INGRESS_AUTH_ENDPOINT, INGRESS_ENDPOINT, OIDC_CLIENT_ENDPOINT},
    secret::PEER_ENDPOINT,
};

const WATCHED_ENDPOINTS: &[&str] = &[
    INGRESS_ENDPOINT,
    INGRESS_AUTH_ENDPOINT,
    OIDC_CLIENT_ENDPOINT,
    PEER_ENDPOINT,
];

#[derive(Clone, Copy, Debug, Eq, PartialEq, StrumDisplay, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum RelationHook {
    Created,
    Joined,
    Changed,
    Departed,
    Broken,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Hook {
    Install,
    Start,
    LeaderElected,
    UpgradeCharm,
    ConfigChanged,
    UpdateStatus,
    PebbleReady { container: String },
    Relation { endpoint: String, kind: RelationHook },
    Other(String),
}

impl Hook {
    /// Parses the runtime's dispatch path, e.g. `hooks/ingress-relation-changed`.
    pub fn from_dispatch_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        name.parse().unwrap_or_else(|_| Self::Other(name.to_owned()))
    }

    /// Whether the hook runs a reconciliation pass in the given generation.
    pub fn triggers_reconcile(&self, generation: Generation) -> bool {
        match self {
            Self::Start | Self::LeaderElected | Self::UpgradeCharm | Self::ConfigChanged => true,
            Self::Relation {
                endpoint,
                kind: RelationHook::Changed,
            } if WATCHED_ENDPOINTS.contains(&endpoint.as_str()) => true,
            Self::UpdateStatus => generation == Generation::Sidecar,
            Self::PebbleReady { container } => {
                generation == Generation::Sidecar && container == CONTAINER_NAME
            }
            Self::Relation {
                endpoint,
                kind: RelationHook::Changed | RelationHook::Broken,
            } => generation == Generation::Sidecar && endpoint == dex_oidc_config::ENDPOINT,
            Self::Install | Self::Relation { .. } | Self::Other(_) => false,
        }
    }
}

impl FromStr for Hook {
    type Err = ();

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Ok(match name {
            "install" => Self::Install,
            "start" => Self::Start,
            "leader-elected" => Self::LeaderElected,
            "upgrade-charm" => Self::UpgradeCharm,
            "config-changed" => Self::ConfigChanged,
            "update-status" => Self::UpdateStatus,
            _ => {
                if let Some(container) = name.strip_suffix("-pebble-ready") {
                    Self::PebbleReady {
                        container: container.to_owned(),
                    }
                } else if let Some((endpoint, kind)) = name.rsplit_once("-relation-") {
                    Self::Relation {
                        endpoint: endpoint.to_owned(),
                        kind: kind.parse().map_err(|_| ())?,
                    }
                } else {
                    return Err(());
                }
            }
        })
    }
}

impl Display for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::Start => f.write_str("start"),
            Self::LeaderElected => f.write_str("leader-elected"),
            Self::UpgradeCharm => f.write_str("upgrade-charm"),
            Self::ConfigChanged => f.write_str("config-changed"),
            Self::UpdateStatus => f.write_str("update-status"),
            Self::PebbleReady { container } => write!(f, "{container}-pebble-ready"),
            Self::Relation { endpoint, kind } => write!(f, "{endpoint}-relation-{kind}"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

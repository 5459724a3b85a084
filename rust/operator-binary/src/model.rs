//! The contract between the operator and the orchestration runtime that delivers hooks.
//!
//! Everything the reconciler knows about the outside world (leadership, configuration, relation
//! data bags, resources and the unit status) goes through [`Model`].

use std::{collections::BTreeMap, fmt::Display};

use snafu::Snafu;

use crate::config::GatekeeperConfig;

pub type RelationData = BTreeMap<String, String>;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to run hook tool {tool:?}"))]
    RunHookTool {
        source: std::io::Error,
        tool: &'static str,
    },

    #[snafu(display("hook tool {tool:?} failed: {stderr}"))]
    HookToolFailed { tool: &'static str, stderr: String },

    #[snafu(display("failed to parse output of hook tool {tool:?}"))]
    ParseHookToolOutput {
        source: serde_json::Error,
        tool: &'static str,
    },

    #[snafu(display("failed to serialize relation data for {relation}"))]
    SerializeRelationData {
        source: serde_yaml::Error,
        relation: Relation,
    },

    #[snafu(display("failed to read resource {name:?}"))]
    ReadResource {
        source: std::io::Error,
        name: String,
    },

    #[snafu(display("unit name {unit_name:?} is not of the form <application>/<number>"))]
    InvalidUnitName { unit_name: String },

    #[snafu(display("invalid relation id {relation_id:?}"))]
    InvalidRelationId { relation_id: String },
}

/// An established relation of one of the charm's endpoints.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Relation {
    pub id: u32,
    pub endpoint: String,
    /// `None` while the remote application is not known yet.
    pub remote_app: Option<String>,
}

impl Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.id)
    }
}

/// The externally visible outcome of a reconciliation pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Status {
    Active,
    Waiting(String),
    Blocked(String),
    Maintenance(String),
}

impl Status {
    pub fn waiting(message: impl Into<String>) -> Self {
        Self::Waiting(message.into())
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::Blocked(message.into())
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::Maintenance(message.into())
    }

    /// The state name understood by the runtime.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Waiting(_) => "waiting",
            Self::Blocked(_) => "blocked",
            Self::Maintenance(_) => "maintenance",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Active => "",
            Self::Waiting(message) | Self::Blocked(message) | Self::Maintenance(message) => {
                message
            }
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => f.write_str(self.name()),
            _ => write!(f, "{}: {}", self.name(), self.message()),
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Model {
    /// Name of the application this unit belongs to.
    fn app_name(&self) -> &str;

    async fn is_leader(&self) -> Result<bool, Error>;

    async fn config(&self) -> Result<GatekeeperConfig, Error>;

    /// All established relations of `endpoint`, in the order the runtime reports them.
    ///
    /// A relation that is being broken by the current hook is no longer established.
    async fn relations(&self, endpoint: &str) -> Result<Vec<Relation>, Error>;

    /// The application scoped data bag of `app` on `relation`.
    async fn relation_data(&self, relation: &Relation, app: &str) -> Result<RelationData, Error>;

    /// Writes `key` into this application's data bag on `relation`.
    ///
    /// Only the leader may write application scoped data.
    async fn set_relation_data(
        &self,
        relation: &Relation,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Contents of the resource `name`, or `None` if it has not been attached.
    async fn resource(&self, name: &str) -> Result<Option<String>, Error>;

    async fn set_status(&self, status: &Status) -> Result<(), Error>;
}

//! Requirer side of the `dex-oidc-config` relation, which provides the issuer URL of Dex.

use snafu::{OptionExt, ResultExt, Snafu};

use crate::model::{self, Model};

pub const ENDPOINT: &str = "dex-oidc-config";
pub const ISSUER_URL_KEY: &str = "issuer-url";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Missing relation with a {ENDPOINT} provider."))]
    RelationMissing,

    #[snafu(display("Empty or missing data in {ENDPOINT} relation. This may be transient, but if it persists it is likely an error."))]
    RelationDataMissing,

    #[snafu(display("failed to list {ENDPOINT} relations"))]
    ListRelations { source: model::Error },

    #[snafu(display("failed to read {ENDPOINT} relation data"))]
    ReadRelationData { source: model::Error },
}

/// Returns the issuer URL published by the related Dex application.
pub async fn get_issuer_url(model: &impl Model) -> Result<String, Error> {
    let relations = model
        .relations(ENDPOINT)
        .await
        .context(ListRelationsSnafu)?;
    let relation = relations.first().context(RelationMissingSnafu)?;
    let provider = relation
        .remote_app
        .as_deref()
        .context(RelationDataMissingSnafu)?;

    let data = model
        .relation_data(relation, provider)
        .await
        .context(ReadRelationDataSnafu)?;
    data.get(ISSUER_URL_KEY)
        .filter(|issuer_url| !issuer_url.is_empty())
        .cloned()
        .context(RelationDataMissingSnafu)
}

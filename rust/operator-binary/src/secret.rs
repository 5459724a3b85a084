//! The OIDC client secret, shared between all units of the application through the
//! `client-secret` peer relation.

use rand::Rng;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::model::{self, Model};

pub const PEER_ENDPOINT: &str = "client-secret";
pub const CLIENT_SECRET_KEY: &str = "client-secret";

const SECRET_LENGTH: usize = 30;
const SECRET_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("no {PEER_ENDPOINT} peer relation established"))]
    NoPeerRelation,

    #[snafu(display("failed to list {PEER_ENDPOINT} peer relations"))]
    ListPeerRelations { source: model::Error },

    #[snafu(display("failed to read the {PEER_ENDPOINT} data bag"))]
    ReadSecret { source: model::Error },

    #[snafu(display("failed to store the generated client secret"))]
    StoreSecret { source: model::Error },
}

/// Returns the shared client secret, generating and storing it on first access.
///
/// Must only be called by the leader, which is the only unit allowed to write application data.
pub async fn resolve_client_secret(model: &impl Model) -> Result<String, Error> {
    let relations = model
        .relations(PEER_ENDPOINT)
        .await
        .context(ListPeerRelationsSnafu)?;
    // A peer endpoint has at most one relation
    let peers = relations.first().context(NoPeerRelationSnafu)?;

    let data = model
        .relation_data(peers, model.app_name())
        .await
        .context(ReadSecretSnafu)?;
    if let Some(secret) = data.get(CLIENT_SECRET_KEY) {
        return Ok(secret.clone());
    }

    tracing::info!(relation = %peers, "generating new client secret");
    let secret = generate_secret();
    model
        .set_relation_data(peers, CLIENT_SECRET_KEY, &secret)
        .await
        .context(StoreSecretSnafu)?;
    Ok(secret)
}

fn generate_secret() -> String {
    let mut rng = rand::rng();
    (0..SECRET_LENGTH)
        .map(|_| char::from(SECRET_ALPHABET[rng.random_range(0..SECRET_ALPHABET.len())]))
        .collect()
}

//! Registers the gatekeeper with the service mesh and with the OIDC provider.

use std::collections::BTreeMap;

use serde::Serialize;
use snafu::{ResultExt, Snafu};

use crate::{
    interfaces::{self, Interfaces},
    model::Model,
    workload::USERID_HEADER,
};

const INGRESS_PREFIX: &str = "/authservice";
const INGRESS_REWRITE: &str = "/";
const OIDC_CALLBACK_PATH: &str = "/authservice/oidc/callback";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to publish the ingress route"))]
    PublishIngress { source: interfaces::Error },

    #[snafu(display("failed to publish the ingress-auth registration"))]
    PublishIngressAuth { source: interfaces::Error },

    #[snafu(display("failed to publish the OIDC client registration"))]
    PublishOidcClient { source: interfaces::Error },

    #[snafu(display("failed to read the ingress echo"))]
    ReadIngressEcho { source: interfaces::Error },
}

#[derive(Debug, Eq, PartialEq, Serialize)]
pub struct IngressRequest<'a> {
    pub prefix: &'a str,
    pub rewrite: &'a str,
    pub service: &'a str,
    pub port: u16,
}

#[derive(Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct IngressAuthRequest<'a> {
    pub service: &'a str,
    pub port: u16,
    pub allowed_request_headers: Vec<&'a str>,
    pub allowed_response_headers: Vec<&'a str>,
}

#[derive(Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcClientRequest<'a> {
    pub id: &'a str,
    pub name: &'a str,
    #[serde(rename = "redirectURIs")]
    pub redirect_uris: Vec<&'a str>,
    pub secret: &'a str,
}

/// Everything this unit announces about itself.
pub struct Registration<'a> {
    pub service: &'a str,
    pub port: u16,
    pub client_id: &'a str,
    pub client_name: &'a str,
    pub client_secret: &'a str,
}

/// Sends the registration over every connected endpoint.
pub async fn publish(
    model: &impl Model,
    interfaces: &Interfaces,
    registration: &Registration<'_>,
) -> Result<(), Error> {
    if let Some(ingress) = &interfaces.ingress {
        ingress
            .send_data(model, &ingress_request(registration))
            .await
            .context(PublishIngressSnafu)?;
    }
    if let Some(ingress_auth) = &interfaces.ingress_auth {
        ingress_auth
            .send_data(model, &ingress_auth_request(registration))
            .await
            .context(PublishIngressAuthSnafu)?;
    }
    if let Some(oidc_client) = &interfaces.oidc_client {
        oidc_client
            .send_data(model, &oidc_client_request(registration))
            .await
            .context(PublishOidcClientSnafu)?;
    }
    Ok(())
}

/// What each ingress provider reported back about the route, keyed by application.
///
/// The echo is opaque to the gatekeeper and only surfaces in the logs.
pub async fn ingress_echo(
    model: &impl Model,
    interfaces: &Interfaces,
) -> Result<BTreeMap<String, serde_yaml::Value>, Error> {
    match &interfaces.ingress {
        Some(ingress) => ingress.get_data(model).await.context(ReadIngressEchoSnafu),
        None => Ok(BTreeMap::new()),
    }
}

fn ingress_request<'a>(registration: &Registration<'a>) -> IngressRequest<'a> {
    IngressRequest {
        prefix: INGRESS_PREFIX,
        rewrite: INGRESS_REWRITE,
        service: registration.service,
        port: registration.port,
    }
}

fn ingress_auth_request<'a>(registration: &Registration<'a>) -> IngressAuthRequest<'a> {
    IngressAuthRequest {
        service: registration.service,
        port: registration.port,
        allowed_request_headers: vec!["cookie", "X-Auth-Token"],
        allowed_response_headers: vec![USERID_HEADER],
    }
}

fn oidc_client_request<'a>(registration: &Registration<'a>) -> OidcClientRequest<'a> {
    OidcClientRequest {
        id: registration.client_id,
        name: registration.client_name,
        redirect_uris: vec![OIDC_CALLBACK_PATH],
        secret: registration.client_secret,
    }
}

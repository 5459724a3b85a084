use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub const APP_NAME: &str = "oidc-gatekeeper";
pub const CONTAINER_NAME: &str = "oidc-gatekeeper";

/// The port the sidecar generation always listens on, regardless of configuration.
pub const HTTP_PORT: u16 = 8080;

/// Deployment generations of the gatekeeper operator.
///
/// The two generations are mutually exclusive. They differ in where the OIDC provider URL comes
/// from and in how the desired workload is handed to the workload supervisor.
#[derive(
    Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq, clap::ValueEnum, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Generation {
    /// Legacy generation: provider derived from the `public-url` option, image taken from the
    /// `oci-image` resource, workload applied as a pod spec.
    PodSpec,

    /// Provider issuer URL received over the `dex-oidc-config` relation, workload applied as a
    /// Pebble layer inside the sidecar container.
    #[default]
    Sidecar,
}

/// Charm configuration, as reported by the runtime for the current pass.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GatekeeperConfig {
    #[serde(default = "GatekeeperConfig::default_client_id")]
    pub client_id: String,

    #[serde(default = "GatekeeperConfig::default_client_name")]
    pub client_name: String,

    /// Only consulted by [`Generation::PodSpec`].
    #[serde(default)]
    pub public_url: String,

    #[serde(default = "GatekeeperConfig::default_oidc_scopes")]
    pub oidc_scopes: String,

    /// Comma separated list of paths that bypass authentication, in addition to `/dex/`.
    #[serde(default)]
    pub skip_auth_urls: String,

    /// PEM encoded CA bundle used to verify the OIDC provider.
    #[serde(default)]
    pub ca_bundle: String,

    #[serde(default = "GatekeeperConfig::default_userid_claim")]
    pub userid_claim: String,

    #[serde(default = "GatekeeperConfig::default_port", alias = "http-port")]
    pub port: u16,
}

impl GatekeeperConfig {
    fn default_client_id() -> String {
        "authservice-oidc".to_owned()
    }

    fn default_client_name() -> String {
        "Ambassador Auth OIDC".to_owned()
    }

    fn default_oidc_scopes() -> String {
        "profile email groups".to_owned()
    }

    fn default_userid_claim() -> String {
        "email".to_owned()
    }

    fn default_port() -> u16 {
        HTTP_PORT
    }

    /// The port the workload listens on, which is also advertised to the mesh.
    pub fn http_port(&self, generation: Generation) -> u16 {
        match generation {
            Generation::PodSpec => self.port,
            Generation::Sidecar => HTTP_PORT,
        }
    }
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            client_id: Self::default_client_id(),
            client_name: Self::default_client_name(),
            public_url: String::new(),
            oidc_scopes: Self::default_oidc_scopes(),
            skip_auth_urls: String::new(),
            ca_bundle: String::new(),
            userid_claim: Self::default_userid_claim(),
            port: Self::default_port(),
        }
    }
}

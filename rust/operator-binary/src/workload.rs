//! Derives the desired state of the gatekeeper workload from configuration, the shared client
//! secret and the OIDC provider URL.

use std::collections::BTreeMap;

use const_format::concatcp;
use serde::Serialize;
use snafu::Snafu;

use crate::{
    config::{GatekeeperConfig, Generation, CONTAINER_NAME},
    image::ImageDetails,
    model,
};

pub const WORKING_DIR: &str = "/home/authservice";
pub const COMMAND: &str = concatcp!(WORKING_DIR, "/oidc-authservice");
pub const PORT_NAME: &str = "http";

pub const CA_BUNDLE_VOLUME: &str = "oidc-gatekeeper-ca-bundle";
pub const CA_BUNDLE_DIR: &str = "/etc/certs/oidc/";
pub const CA_BUNDLE_FILE: &str = "root-ca.pem";
pub const CA_BUNDLE_PATH: &str = concatcp!(CA_BUNDLE_DIR, CA_BUNDLE_FILE);

pub const AUTHSERVICE_URL_PREFIX: &str = "/authservice/";
pub const USERID_HEADER: &str = "kubeflow-userid";

const DEX_SKIP_AUTH_URL: &str = "/dex/";
const SESSION_STORE_PATH: &str = "bolt.db";
const OIDC_STATE_STORE_PATH: &str = "oidc_state.db";
const OIDC_AUTH_URL: &str = "/dex/auth";
const AFTER_LOGIN_URL: &str = "/";
const AFTER_LOGOUT_URL: &str = "/authservice/site/after_logout";

/// Variables the pod spec carries as YAML booleans and integers rather than strings.
const TYPED_POD_SPEC_ENV: &[&str] = &["DISABLE_USERINFO", "SERVER_PORT"];

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to render the pod spec"))]
    RenderPodSpec { source: serde_yaml::Error },

    #[snafu(display("failed to render the Pebble layer"))]
    RenderLayer { source: serde_yaml::Error },

    #[snafu(display("failed to write the pod spec to a temporary file"))]
    WritePodSpec { source: std::io::Error },

    #[snafu(display("failed to set the pod spec"))]
    SetPodSpec { source: model::Error },

    #[snafu(display("failed to push {path:?} into the workload container"))]
    PushFile {
        source: crate::pebble::Error,
        path: String,
    },

    #[snafu(display("failed to add the Pebble layer"))]
    AddLayer { source: crate::pebble::Error },

    #[snafu(display("failed to replan the workload services"))]
    Replan { source: crate::pebble::Error },
}

/// The complete desired state of the gatekeeper container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WorkloadDescriptor {
    pub container: String,
    /// Only known up front in the pod spec generation. The sidecar image is part of the
    /// application deployment itself.
    pub image: Option<ImageDetails>,
    pub port: u16,
    pub command: String,
    pub working_dir: String,
    pub environment: BTreeMap<String, String>,
    pub files: Vec<MountedFile>,
}

/// A single file mounted into the workload container.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MountedFile {
    pub volume: String,
    pub mount_dir: String,
    pub file_name: String,
    pub content: String,
}

impl MountedFile {
    pub fn path(&self) -> String {
        format!("{}{}", self.mount_dir, self.file_name)
    }
}

/// Whether the supervisor actually applied the descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// The workload cannot be reached right now. A later hook applies the descriptor again.
    Deferred { reason: String },
}

/// Applies a [`WorkloadDescriptor`] to the running workload.
#[allow(async_fn_in_trait)]
pub trait WorkloadSupervisor {
    /// Maintenance message reported while the descriptor is being applied.
    fn applying_message(&self) -> &'static str;

    async fn apply(&self, descriptor: &WorkloadDescriptor) -> Result<ApplyOutcome, Error>;
}

/// `OIDC_PROVIDER` of the pod spec generation, derived from the `public-url` option.
///
/// URLs without an explicit `http://` or `https://` scheme are assumed to be plain HTTP.
pub fn oidc_provider_from_public_url(public_url: &str) -> String {
    if public_url.starts_with("http://") || public_url.starts_with("https://") {
        format!("{public_url}/dex")
    } else {
        format!("http://{public_url}/dex")
    }
}

/// Paths that bypass authentication. The Dex endpoints always do, the configured paths are
/// appended verbatim.
pub fn skip_auth_urls(configured: &str) -> String {
    if configured.is_empty() {
        DEX_SKIP_AUTH_URL.to_owned()
    } else {
        format!("{DEX_SKIP_AUTH_URL},{configured}")
    }
}

pub fn build_environment(
    config: &GatekeeperConfig,
    generation: Generation,
    client_secret: &str,
    oidc_provider: &str,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("CLIENT_ID", config.client_id.clone()),
        ("CLIENT_SECRET", client_secret.to_owned()),
        ("DISABLE_USERINFO", true.to_string()),
        ("OIDC_PROVIDER", oidc_provider.to_owned()),
        ("OIDC_SCOPES", config.oidc_scopes.clone()),
        ("SERVER_PORT", config.http_port(generation).to_string()),
        ("USERID_HEADER", USERID_HEADER.to_owned()),
        ("USERID_PREFIX", String::new()),
        ("SESSION_STORE_PATH", SESSION_STORE_PATH.to_owned()),
        ("OIDC_STATE_STORE_PATH", OIDC_STATE_STORE_PATH.to_owned()),
        ("SKIP_AUTH_URLS", skip_auth_urls(&config.skip_auth_urls)),
        ("AUTHSERVICE_URL_PREFIX", AUTHSERVICE_URL_PREFIX.to_owned()),
    ]);
    if generation == Generation::Sidecar {
        env.extend([
            ("OIDC_AUTH_URL", OIDC_AUTH_URL.to_owned()),
            ("USERID_CLAIM", config.userid_claim.clone()),
            ("AFTER_LOGIN_URL", AFTER_LOGIN_URL.to_owned()),
            ("AFTER_LOGOUT_URL", AFTER_LOGOUT_URL.to_owned()),
        ]);
    }
    if !config.ca_bundle.is_empty() {
        env.insert("CA_BUNDLE", CA_BUNDLE_PATH.to_owned());
    }
    env.into_iter()
        .map(|(name, value)| (name.to_owned(), value))
        .collect()
}

pub fn build_descriptor(
    config: &GatekeeperConfig,
    generation: Generation,
    client_secret: &str,
    oidc_provider: &str,
    image: Option<ImageDetails>,
) -> WorkloadDescriptor {
    let files = if config.ca_bundle.is_empty() {
        Vec::new()
    } else {
        vec![MountedFile {
            volume: CA_BUNDLE_VOLUME.to_owned(),
            mount_dir: CA_BUNDLE_DIR.to_owned(),
            file_name: CA_BUNDLE_FILE.to_owned(),
            content: config.ca_bundle.clone(),
        }]
    };

    WorkloadDescriptor {
        container: CONTAINER_NAME.to_owned(),
        image,
        port: config.http_port(generation),
        command: COMMAND.to_owned(),
        working_dir: WORKING_DIR.to_owned(),
        environment: build_environment(config, generation, client_secret, oidc_provider),
        files,
    }
}

/// Version 3 pod spec, as accepted by the runtime's `pod-spec-set`.
#[derive(Debug, Serialize)]
pub struct PodSpec {
    version: u8,
    containers: Vec<PodSpecContainer>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpecContainer {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_details: Option<ImageDetails>,
    ports: Vec<PodSpecPort>,
    env_config: BTreeMap<String, serde_yaml::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volume_config: Vec<PodSpecVolume>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpecPort {
    name: String,
    container_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PodSpecVolume {
    name: String,
    mount_path: String,
    files: Vec<PodSpecFile>,
}

#[derive(Debug, Serialize)]
struct PodSpecFile {
    path: String,
    content: String,
}

impl From<&WorkloadDescriptor> for PodSpec {
    fn from(descriptor: &WorkloadDescriptor) -> Self {
        PodSpec {
            version: 3,
            containers: vec![PodSpecContainer {
                name: descriptor.container.clone(),
                image_details: descriptor.image.clone(),
                ports: vec![PodSpecPort {
                    name: PORT_NAME.to_owned(),
                    container_port: descriptor.port,
                }],
                env_config: pod_spec_env(&descriptor.environment),
                volume_config: descriptor
                    .files
                    .iter()
                    .map(|file| PodSpecVolume {
                        name: file.volume.clone(),
                        mount_path: file.mount_dir.clone(),
                        files: vec![PodSpecFile {
                            path: file.file_name.clone(),
                            content: file.content.clone(),
                        }],
                    })
                    .collect(),
            }],
        }
    }
}

fn pod_spec_env(environment: &BTreeMap<String, String>) -> BTreeMap<String, serde_yaml::Value> {
    environment
        .iter()
        .map(|(name, value)| {
            let typed = TYPED_POD_SPEC_ENV
                .contains(&name.as_str())
                .then(|| serde_yaml::from_str(value).ok())
                .flatten()
                .unwrap_or_else(|| serde_yaml::Value::String(value.clone()));
            (name.clone(), typed)
        })
        .collect()
}

/// Pebble layer running the gatekeeper as the only service of the sidecar container.
#[derive(Debug, Serialize)]
pub struct Layer {
    summary: String,
    description: String,
    services: BTreeMap<String, LayerService>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct LayerService {
    #[serde(rename = "override")]
    override_mode: String,
    summary: String,
    command: String,
    startup: String,
    working_dir: String,
    environment: BTreeMap<String, String>,
}

impl From<&WorkloadDescriptor> for Layer {
    fn from(descriptor: &WorkloadDescriptor) -> Self {
        Layer {
            summary: "oidc-gatekeeper layer".to_owned(),
            description: "Pebble config layer for oidc-gatekeeper".to_owned(),
            services: BTreeMap::from([(
                descriptor.container.clone(),
                LayerService {
                    override_mode: "replace".to_owned(),
                    summary: "Entrypoint of the oidc-gatekeeper image".to_owned(),
                    command: descriptor.command.clone(),
                    startup: "enabled".to_owned(),
                    working_dir: descriptor.working_dir.clone(),
                    environment: descriptor.environment.clone(),
                },
            )]),
        }
    }
}

//! Reconciles the gatekeeper workload of this application.
//!
//! Every triggering hook runs one pass from scratch: the checks run in a fixed order, the first
//! failing check decides the unit status and aborts the pass, otherwise the desired workload is
//! derived, the registrations are published and the workload is applied.

use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use crate::{
    config::Generation,
    dex_oidc_config,
    image::{self, fetch_image_details},
    interfaces::{self, get_interfaces},
    mesh::{self, Registration},
    model::{self, Model, Status},
    secret::{self, resolve_client_secret},
    workload::{
        self, build_descriptor, oidc_provider_from_public_url, ApplyOutcome, WorkloadSupervisor,
    },
};

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("Waiting for leadership"))]
    NotLeader,

    #[snafu(display("failed to determine leadership"))]
    CheckLeadership { source: model::Error },

    #[snafu(display("failed to read the charm configuration"))]
    ReadConfig { source: model::Error },

    #[snafu(display("public-url config required"))]
    PublicUrlMissing,

    #[snafu(display("failed to resolve the OIDC provider"))]
    ResolveOidcProvider { source: dex_oidc_config::Error },

    #[snafu(display("failed to negotiate relation interfaces"))]
    ResolveInterfaces { source: interfaces::Error },

    #[snafu(display("failed to resolve the client secret"))]
    ResolveClientSecret { source: secret::Error },

    #[snafu(display("failed to resolve the workload image"))]
    ResolveImage { source: image::Error },

    #[snafu(display("failed to publish registrations"))]
    PublishRegistrations { source: mesh::Error },

    #[snafu(display("failed to apply the workload"))]
    ApplyWorkload { source: workload::Error },

    #[snafu(display("failed to set the unit status"))]
    SetStatus { source: model::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    /// The unit status explaining why the pass could not complete.
    ///
    /// Returns `None` for failures of the runtime or the workload supervisor itself, which are
    /// not something a status can explain.
    pub fn status(&self) -> Option<Status> {
        match self {
            Self::NotLeader => Some(Status::waiting(self.to_string())),
            Self::PublicUrlMissing => Some(Status::blocked(self.to_string())),
            Self::ResolveOidcProvider { source } => match source {
                dex_oidc_config::Error::RelationMissing => Some(Status::blocked(format!(
                    "{source} Please add the missing relation."
                ))),
                dex_oidc_config::Error::RelationDataMissing => {
                    Some(Status::waiting(source.to_string()))
                }
                _ => None,
            },
            Self::ResolveInterfaces { source } => match source {
                interfaces::Error::NoVersionsListed { .. } => {
                    Some(Status::waiting(source.to_string()))
                }
                interfaces::Error::NoCompatibleVersions { .. } => {
                    Some(Status::blocked(source.to_string()))
                }
                _ => None,
            },
            Self::ResolveClientSecret {
                source: secret::Error::NoPeerRelation,
            } => Some(Status::waiting("Waiting for Client Secret")),
            Self::ResolveImage { source } if source.is_user_error() => Some(Status::blocked(
                format!("{source}: {}", image::OCI_IMAGE_RESOURCE),
            )),
            _ => None,
        }
    }
}

/// Runs one reconciliation pass and reports its outcome as the unit status.
///
/// Failed checks are reported through the returned (and published) [`Status`]. An `Err` means
/// the runtime or the workload supervisor failed, and nothing sensible could be reported.
pub async fn reconcile(
    model: &impl Model,
    supervisor: &impl WorkloadSupervisor,
    generation: Generation,
) -> Result<Status> {
    tracing::info!(%generation, "Starting reconcile");
    let status = match reconcile_gatekeeper(model, supervisor, generation).await {
        Ok(()) => Status::Active,
        Err(error) => match error.status() {
            Some(status) => {
                tracing::info!(
                    category = error.category(),
                    %status,
                    "reconciliation cannot proceed"
                );
                status
            }
            None => return Err(error),
        },
    };
    model.set_status(&status).await.context(SetStatusSnafu)?;
    Ok(status)
}

async fn reconcile_gatekeeper(
    model: &impl Model,
    supervisor: &impl WorkloadSupervisor,
    generation: Generation,
) -> Result<()> {
    check_leader(model).await?;
    let config = model.config().await.context(ReadConfigSnafu)?;

    let oidc_provider = match generation {
        Generation::PodSpec => {
            if config.public_url.is_empty() {
                return PublicUrlMissingSnafu.fail();
            }
            oidc_provider_from_public_url(&config.public_url)
        }
        Generation::Sidecar => dex_oidc_config::get_issuer_url(model)
            .await
            .context(ResolveOidcProviderSnafu)?,
    };
    let interfaces = get_interfaces(model)
        .await
        .context(ResolveInterfacesSnafu)?;
    let client_secret = resolve_client_secret(model)
        .await
        .context(ResolveClientSecretSnafu)?;
    let image = match generation {
        Generation::PodSpec => Some(
            fetch_image_details(model)
                .await
                .context(ResolveImageSnafu)?,
        ),
        Generation::Sidecar => None,
    };

    let descriptor = build_descriptor(&config, generation, &client_secret, &oidc_provider, image);

    mesh::publish(
        model,
        &interfaces,
        &Registration {
            service: model.app_name(),
            port: descriptor.port,
            client_id: &config.client_id,
            client_name: &config.client_name,
            client_secret: &client_secret,
        },
    )
    .await
    .context(PublishRegistrationsSnafu)?;
    match mesh::ingress_echo(model, &interfaces).await {
        Ok(echo) => {
            for (app, data) in echo {
                tracing::debug!(%app, ?data, "ingress echo");
            }
        }
        Err(error) => tracing::warn!(%error, "ignoring unreadable ingress echo"),
    }

    model
        .set_status(&Status::maintenance(supervisor.applying_message()))
        .await
        .context(SetStatusSnafu)?;
    match supervisor
        .apply(&descriptor)
        .await
        .context(ApplyWorkloadSnafu)?
    {
        ApplyOutcome::Applied => {
            tracing::info!(container = %descriptor.container, "workload applied");
        }
        ApplyOutcome::Deferred { reason } => tracing::warn!(
            container = %descriptor.container,
            %reason,
            "workload not applied, retrying on the next hook"
        ),
    }
    Ok(())
}

async fn check_leader(model: &impl Model) -> Result<()> {
    if model.is_leader().await.context(CheckLeadershipSnafu)? {
        Ok(())
    } else {
        tracing::info!("not the leader, skipping reconciliation");
        NotLeaderSnafu.fail()
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;
    use crate::{
        dex_oidc_config::ISSUER_URL_KEY,
        image::OCI_IMAGE_RESOURCE,
        interfaces::{INGRESS_AUTH_ENDPOINT, INGRESS_ENDPOINT, OIDC_CLIENT_ENDPOINT},
        secret::{CLIENT_SECRET_KEY, PEER_ENDPOINT},
        testing::{FakeModel, FakeSupervisor},
        workload::WorkloadDescriptor,
    };

    const OCI_IMAGE: &str = indoc! {"
        registrypath: ci-test
        username: ''
        password: ''
    "};

    /// A leader of the pod spec generation with everything it needs to become active.
    fn pod_spec_model() -> FakeModel {
        let model = FakeModel::leader();
        model.add_peer_relation(PEER_ENDPOINT);
        model.add_resource(OCI_IMAGE_RESOURCE, OCI_IMAGE);
        model.update_config(|config| config.public_url = "10.64.140.43.nip.io".to_owned());
        model
    }

    /// A leader of the sidecar generation with everything it needs to become active.
    fn sidecar_model() -> FakeModel {
        let model = FakeModel::leader();
        model.add_peer_relation(PEER_ENDPOINT);
        let dex = model.add_relation(dex_oidc_config::ENDPOINT, "dex-auth");
        model.set_app_data(&dex, "dex-auth", ISSUER_URL_KEY, "http://dex.io/dex");
        model
    }

    async fn reconcile_ok(
        model: &FakeModel,
        generation: Generation,
    ) -> (Status, Option<WorkloadDescriptor>) {
        let supervisor = FakeSupervisor::new();
        let status = reconcile(model, &supervisor, generation).await.unwrap();
        assert_eq!(model.status().as_ref(), Some(&status));
        (status, supervisor.last_applied())
    }

    #[rstest]
    #[case(Generation::PodSpec)]
    #[case(Generation::Sidecar)]
    #[tokio::test]
    async fn test_not_leader(#[case] generation: Generation) {
        let model = FakeModel::new();
        let (status, applied) = reconcile_ok(&model, generation).await;
        assert_eq!(status, Status::waiting("Waiting for leadership"));
        assert!(applied.is_none());
    }

    #[rstest]
    #[case(Generation::PodSpec)]
    #[case(Generation::Sidecar)]
    #[tokio::test]
    async fn test_not_leader_never_writes(#[case] generation: Generation) {
        let model = match generation {
            Generation::PodSpec => pod_spec_model(),
            Generation::Sidecar => sidecar_model(),
        };
        let ingress = model.add_relation(INGRESS_ENDPOINT, "istio-pilot");
        model.set_app_data(&ingress, "istio-pilot", "_supported_versions", "- v1\n");
        model.set_leader(false);

        let (status, applied) = reconcile_ok(&model, generation).await;
        assert_eq!(status, Status::waiting("Waiting for leadership"));
        assert!(model.writes().is_empty());
        assert!(applied.is_none());
        assert_eq!(model.statuses(), vec![status]);
    }

    #[tokio::test]
    async fn test_leadership_is_checked_before_image() {
        let model = FakeModel::new();
        model.update_config(|config| config.public_url = "10.64.140.43.nip.io".to_owned());
        model.add_peer_relation(PEER_ENDPOINT);

        let (status, _) = reconcile_ok(&model, Generation::PodSpec).await;
        assert_eq!(status, Status::waiting("Waiting for leadership"));
    }

    #[tokio::test]
    async fn test_missing_image() {
        let model = FakeModel::leader();
        model.add_peer_relation(PEER_ENDPOINT);
        model.update_config(|config| config.public_url = "10.64.140.43.nip.io".to_owned());

        let (status, applied) = reconcile_ok(&model, Generation::PodSpec).await;
        assert_eq!(status, Status::blocked("Missing resource: oci-image"));
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn test_invalid_image() {
        let model = pod_spec_model();
        model.add_resource(OCI_IMAGE_RESOURCE, "username: nobody\n");

        let (status, _) = reconcile_ok(&model, Generation::PodSpec).await;
        assert_eq!(status, Status::blocked("Invalid resource: oci-image"));
    }

    #[tokio::test]
    async fn test_public_url_required() {
        let model = FakeModel::leader();
        model.add_resource(OCI_IMAGE_RESOURCE, OCI_IMAGE);

        let (status, applied) = reconcile_ok(&model, Generation::PodSpec).await;
        assert_eq!(status, Status::blocked("public-url config required"));
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn test_pod_spec_without_relations() {
        let model = pod_spec_model();
        let supervisor = FakeSupervisor::new();

        let status = reconcile(&model, &supervisor, Generation::PodSpec)
            .await
            .unwrap();
        assert_eq!(status, Status::Active);
        assert_eq!(
            model.statuses(),
            vec![Status::maintenance("Applying workload"), Status::Active]
        );

        let descriptor = supervisor.last_applied().unwrap();
        assert_eq!(descriptor.image.unwrap().image_path, "ci-test");
        assert_eq!(descriptor.port, 8080);
        assert_eq!(descriptor.environment["CLIENT_ID"], "authservice-oidc");
    }

    #[rstest]
    #[case("10.64.140.43.nip.io", "http://10.64.140.43.nip.io/dex")]
    #[case("https://10.64.140.43.nip.io", "https://10.64.140.43.nip.io/dex")]
    #[tokio::test]
    async fn test_public_url_scheme(#[case] public_url: &str, #[case] expected: &str) {
        let model = pod_spec_model();
        model.update_config(|config| config.public_url = public_url.to_owned());

        let (_, applied) = reconcile_ok(&model, Generation::PodSpec).await;
        assert_eq!(applied.unwrap().environment["OIDC_PROVIDER"], expected);
    }

    #[rstest]
    #[case("", "/dex/")]
    #[case("/test/,/path1/", "/dex/,/test/,/path1/")]
    #[tokio::test]
    async fn test_skip_auth_urls(#[case] configured: &str, #[case] expected: &str) {
        let model = sidecar_model();
        model.update_config(|config| config.skip_auth_urls = configured.to_owned());

        let (_, applied) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(applied.unwrap().environment["SKIP_AUTH_URLS"], expected);
    }

    #[rstest]
    #[case(Generation::PodSpec, "")]
    #[case(Generation::PodSpec, "aaa")]
    #[case(Generation::Sidecar, "")]
    #[case(Generation::Sidecar, "aaa")]
    #[tokio::test]
    async fn test_ca_bundle(#[case] generation: Generation, #[case] ca_bundle: &str) {
        let model = match generation {
            Generation::PodSpec => pod_spec_model(),
            Generation::Sidecar => sidecar_model(),
        };
        model.update_config(|config| config.ca_bundle = ca_bundle.to_owned());

        let descriptor = reconcile_ok(&model, generation).await.1.unwrap();
        if ca_bundle.is_empty() {
            assert!(!descriptor.environment.contains_key("CA_BUNDLE"));
            assert!(descriptor.files.is_empty());
        } else {
            assert_eq!(
                descriptor.environment["CA_BUNDLE"],
                "/etc/certs/oidc/root-ca.pem"
            );
            assert_eq!(descriptor.files.len(), 1);
            assert_eq!(descriptor.files[0].path(), "/etc/certs/oidc/root-ca.pem");
        }
    }

    #[rstest]
    #[case(Generation::PodSpec)]
    #[case(Generation::Sidecar)]
    #[tokio::test]
    async fn test_store_paths(#[case] generation: Generation) {
        let model = match generation {
            Generation::PodSpec => pod_spec_model(),
            Generation::Sidecar => sidecar_model(),
        };
        model.update_config(|config| {
            config.ca_bundle = "aaa".to_owned();
            config.skip_auth_urls = "/a/".to_owned();
            config.oidc_scopes = "openid".to_owned();
        });

        let env = reconcile_ok(&model, generation).await.1.unwrap().environment;
        assert_eq!(env["SESSION_STORE_PATH"], "bolt.db");
        assert_eq!(env["OIDC_STATE_STORE_PATH"], "oidc_state.db");
    }

    #[tokio::test]
    async fn test_sidecar_with_dex_oidc_config() {
        let model = sidecar_model();
        let (status, applied) = reconcile_ok(&model, Generation::Sidecar).await;

        assert_eq!(status, Status::Active);
        let descriptor = applied.unwrap();
        assert_eq!(descriptor.environment["OIDC_PROVIDER"], "http://dex.io/dex");
        assert_eq!(descriptor.environment["USERID_CLAIM"], "email");
        assert_eq!(descriptor.image, None);
    }

    #[tokio::test]
    async fn test_dex_oidc_config_missing() {
        let model = FakeModel::leader();
        model.add_peer_relation(PEER_ENDPOINT);

        let (status, applied) = reconcile_ok(&model, Generation::Sidecar).await;
        let Status::Blocked(message) = status else {
            panic!("expected blocked status, got {status:?}");
        };
        assert!(message.contains("Please add the missing relation."));
        assert_eq!(
            message,
            "Missing relation with a dex-oidc-config provider. Please add the missing relation."
        );
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn test_dex_oidc_config_broken() {
        let model = sidecar_model();
        let (status, _) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(status, Status::Active);

        let dex = model.relations(dex_oidc_config::ENDPOINT).await.unwrap().remove(0);
        model.break_relation(&dex);
        let supervisor = FakeSupervisor::new();
        let status = reconcile(&model, &supervisor, Generation::Sidecar)
            .await
            .unwrap();
        assert_eq!(
            status,
            Status::blocked(
                "Missing relation with a dex-oidc-config provider. Please add the missing relation."
            )
        );
        assert!(supervisor.applied().is_empty());
    }

    #[tokio::test]
    async fn test_dex_oidc_config_empty() {
        let model = FakeModel::leader();
        model.add_peer_relation(PEER_ENDPOINT);
        model.add_relation(dex_oidc_config::ENDPOINT, "dex-auth");

        let (status, _) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(
            status,
            Status::waiting(
                "Empty or missing data in dex-oidc-config relation. This may be transient, but if it persists it is likely an error."
            )
        );
    }

    #[tokio::test]
    async fn test_waiting_for_client_secret() {
        let model = FakeModel::leader();
        let dex = model.add_relation(dex_oidc_config::ENDPOINT, "dex-auth");
        model.set_app_data(&dex, "dex-auth", ISSUER_URL_KEY, "http://dex.io/dex");

        let (status, _) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(status, Status::waiting("Waiting for Client Secret"));
    }

    #[tokio::test]
    async fn test_interface_without_versions_is_waiting() {
        let model = sidecar_model();
        model.add_relation(INGRESS_ENDPOINT, "istio-pilot");

        let (status, applied) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(
            status,
            Status::waiting("List of ingress versions not found for apps: istio-pilot")
        );
        assert!(applied.is_none());
    }

    #[tokio::test]
    async fn test_incompatible_interface_is_blocked() {
        let model = sidecar_model();
        let relation = model.add_relation(OIDC_CLIENT_ENDPOINT, "dex-auth");
        model.set_app_data(&relation, "dex-auth", "_supported_versions", "- v0\n");

        let (status, _) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(
            status,
            Status::blocked("No compatible oidc-client versions found for apps: dex-auth")
        );
    }

    #[tokio::test]
    async fn test_with_relations() {
        let model = sidecar_model();
        let ingress = model.add_relation(INGRESS_ENDPOINT, "istio-pilot");
        model.set_app_data(&ingress, "istio-pilot", "_supported_versions", "- v1\n");
        model.set_app_data(
            &ingress,
            "istio-pilot",
            "data",
            "service-name: service-name\nservice-port: '6666'\n",
        );
        let ingress_auth = model.add_relation(INGRESS_AUTH_ENDPOINT, "istio-pilot");
        model.set_app_data(&ingress_auth, "istio-pilot", "_supported_versions", "- v1\n");
        let oidc_client = model.add_relation(OIDC_CLIENT_ENDPOINT, "dex-auth");
        model.set_app_data(&oidc_client, "dex-auth", "_supported_versions", "- v1\n");

        let (status, applied) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(status, Status::Active);
        let descriptor = applied.unwrap();

        let secret = descriptor.environment["CLIENT_SECRET"].clone();
        let published = model.app_data(&oidc_client, "oidc-gatekeeper");
        assert!(published["data"].contains(&format!("secret: {secret}")));
        assert!(model.app_data(&ingress, "oidc-gatekeeper")["data"].contains("port: 8080"));
        assert!(model.app_data(&ingress_auth, "oidc-gatekeeper")["data"]
            .contains("allowed-response-headers:\n- kubeflow-userid"));
    }

    #[tokio::test]
    async fn test_client_secret_is_stable_across_passes() {
        let model = sidecar_model();

        let first = reconcile_ok(&model, Generation::Sidecar).await.1.unwrap();
        let second = reconcile_ok(&model, Generation::Sidecar).await.1.unwrap();

        let secret = &first.environment["CLIENT_SECRET"];
        assert_eq!(secret, &second.environment["CLIENT_SECRET"]);
        assert_eq!(secret.len(), 30);
        assert!(secret
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));

        let peers = model.relations(PEER_ENDPOINT).await.unwrap().remove(0);
        assert_eq!(
            model.app_data(&peers, "oidc-gatekeeper")[CLIENT_SECRET_KEY],
            *secret
        );
    }

    #[tokio::test]
    async fn test_unreadable_ingress_echo_is_tolerated() {
        let model = sidecar_model();
        let ingress = model.add_relation(INGRESS_ENDPOINT, "istio-pilot");
        model.set_app_data(&ingress, "istio-pilot", "_supported_versions", "- v1\n");
        model.set_app_data(&ingress, "istio-pilot", "data", "service-name: [unclosed\n");

        let (status, applied) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(status, Status::Active);
        assert!(applied.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_workload_is_tolerated() {
        let model = sidecar_model();
        let supervisor = FakeSupervisor::unreachable();

        let status = reconcile(&model, &supervisor, Generation::Sidecar)
            .await
            .unwrap();
        assert_eq!(status, Status::Active);
        assert!(supervisor.applied().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_once_condition_clears() {
        let model = FakeModel::leader();
        model.add_peer_relation(PEER_ENDPOINT);
        let (status, _) = reconcile_ok(&model, Generation::Sidecar).await;
        assert!(matches!(status, Status::Blocked(_)));

        let dex = model.add_relation(dex_oidc_config::ENDPOINT, "dex-auth");
        model.set_app_data(&dex, "dex-auth", ISSUER_URL_KEY, "http://dex.io/dex");
        let (status, _) = reconcile_ok(&model, Generation::Sidecar).await;
        assert_eq!(status, Status::Active);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::NotLeader.category(), "NotLeader");
        assert_eq!(
            Error::PublicUrlMissing.status(),
            Some(Status::blocked("public-url config required"))
        );
    }
}

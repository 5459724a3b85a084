//! [`Model`] backed by the hook tool executables the orchestrator puts on `PATH` for every hook.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio};

use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    config::GatekeeperConfig,
    model::{
        self, HookToolFailedSnafu, InvalidRelationIdSnafu, InvalidUnitNameSnafu, Model,
        ParseHookToolOutputSnafu, ReadResourceSnafu, Relation, RelationData, RunHookToolSnafu,
        SerializeRelationDataSnafu, Status,
    },
    workload::{
        self, ApplyOutcome, PodSpec, RenderPodSpecSnafu, SetPodSpecSnafu, WorkloadDescriptor,
        WorkloadSupervisor, WritePodSpecSnafu,
    },
};

type Result<T, E = model::Error> = std::result::Result<T, E>;

pub struct HookTools {
    app_name: String,
    /// The relation the current `-relation-broken` hook is about.
    broken_relation: Option<u32>,
    /// Searched on `PATH` when unset.
    tools_dir: Option<PathBuf>,
}

impl HookTools {
    pub fn new(unit_name: &str) -> Result<Self> {
        Ok(Self {
            app_name: app_name_from_unit(unit_name)?.to_owned(),
            broken_relation: None,
            tools_dir: None,
        })
    }

    /// Hides `relation_id` (e.g. `dex-oidc-config:4`) from [`Model::relations`].
    ///
    /// The runtime keeps listing a relation until its `-relation-broken` hook has finished.
    pub fn with_broken_relation(mut self, relation_id: &str) -> Result<Self> {
        self.broken_relation = Some(parse_relation_id(relation_id)?);
        Ok(self)
    }

    pub fn with_tools_dir(mut self, tools_dir: impl Into<PathBuf>) -> Self {
        self.tools_dir = Some(tools_dir.into());
        self
    }

    async fn run(&self, tool: &'static str, args: &[&str], stdin: Option<&str>) -> Result<String> {
        tracing::trace!(tool, ?args, "running hook tool");
        let program = match &self.tools_dir {
            Some(tools_dir) => tools_dir.join(tool),
            None => PathBuf::from(tool),
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(RunHookToolSnafu { tool })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .context(RunHookToolSnafu { tool })?;
        }

        let output = child
            .wait_with_output()
            .await
            .context(RunHookToolSnafu { tool })?;
        if !output.status.success() {
            return HookToolFailedSnafu {
                tool,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .fail();
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn run_json<T: DeserializeOwned>(&self, tool: &'static str, args: &[&str]) -> Result<T> {
        let stdout = self.run(tool, args, None).await?;
        serde_json::from_str(&stdout).context(ParseHookToolOutputSnafu { tool })
    }
}

impl Model for HookTools {
    fn app_name(&self) -> &str {
        &self.app_name
    }

    async fn is_leader(&self) -> Result<bool> {
        self.run_json("is-leader", &["--format=json"]).await
    }

    async fn config(&self) -> Result<GatekeeperConfig> {
        self.run_json("config-get", &["--format=json"]).await
    }

    async fn relations(&self, endpoint: &str) -> Result<Vec<Relation>> {
        let relation_ids: Option<Vec<String>> = self
            .run_json("relation-ids", &[endpoint, "--format=json"])
            .await?;

        let mut relations = Vec::new();
        for relation_id in relation_ids.unwrap_or_default() {
            let id = parse_relation_id(&relation_id)?;
            if self.broken_relation == Some(id) {
                tracing::debug!(relation = %relation_id, "skipping relation that is being broken");
                continue;
            }
            let remote_app: Option<String> = self
                .run_json(
                    "relation-list",
                    &["-r", &id.to_string(), "--app", "--format=json"],
                )
                .await?;
            relations.push(Relation {
                id,
                endpoint: endpoint.to_owned(),
                remote_app: remote_app.filter(|app| !app.is_empty()),
            });
        }
        Ok(relations)
    }

    async fn relation_data(&self, relation: &Relation, app: &str) -> Result<RelationData> {
        let data: Option<RelationData> = self
            .run_json(
                "relation-get",
                &[
                    "-r",
                    &relation.id.to_string(),
                    "-",
                    app,
                    "--app",
                    "--format=json",
                ],
            )
            .await?;
        Ok(data.unwrap_or_default())
    }

    async fn set_relation_data(&self, relation: &Relation, key: &str, value: &str) -> Result<()> {
        let content = serde_yaml::to_string(&BTreeMap::from([(key, value)])).with_context(|_| {
            SerializeRelationDataSnafu {
                relation: relation.clone(),
            }
        })?;
        self.run(
            "relation-set",
            &["-r", &relation.id.to_string(), "--app", "--file", "-"],
            Some(&content),
        )
        .await?;
        Ok(())
    }

    async fn resource(&self, name: &str) -> Result<Option<String>> {
        // resource-get fails when nothing has been attached
        let path = match self.run("resource-get", &[name], None).await {
            Ok(path) => path,
            Err(model::Error::HookToolFailed { stderr, .. }) => {
                tracing::debug!(resource = name, %stderr, "resource is not available");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let content = tokio::fs::read_to_string(path.trim())
            .await
            .context(ReadResourceSnafu { name })?;
        Ok(Some(content))
    }

    async fn set_status(&self, status: &Status) -> Result<()> {
        self.run(
            "status-set",
            &["--application=False", status.name(), status.message()],
            None,
        )
        .await?;
        Ok(())
    }
}

/// Applies the workload by handing a pod spec to the orchestrator.
pub struct PodSpecSupervisor<'a> {
    tools: &'a HookTools,
}

impl<'a> PodSpecSupervisor<'a> {
    pub fn new(tools: &'a HookTools) -> Self {
        Self { tools }
    }
}

impl WorkloadSupervisor for PodSpecSupervisor<'_> {
    fn applying_message(&self) -> &'static str {
        "Setting pod spec"
    }

    async fn apply(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<ApplyOutcome, workload::Error> {
        let pod_spec =
            serde_yaml::to_string(&PodSpec::from(descriptor)).context(RenderPodSpecSnafu)?;

        let file = tempfile::Builder::new()
            .prefix("pod-spec-")
            .suffix(".yaml")
            .tempfile()
            .context(WritePodSpecSnafu)?;
        tokio::fs::write(file.path(), pod_spec)
            .await
            .context(WritePodSpecSnafu)?;

        let path = file.path().to_string_lossy();
        self.tools
            .run("pod-spec-set", &["--file", &path], None)
            .await
            .context(SetPodSpecSnafu)?;
        Ok(ApplyOutcome::Applied)
    }
}

/// `oidc-gatekeeper/0` → `oidc-gatekeeper`
fn app_name_from_unit(unit_name: &str) -> Result<&str> {
    unit_name
        .split_once('/')
        .filter(|(app, number)| {
            !app.is_empty() && !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
        })
        .map(|(app, _)| app)
        .context(InvalidUnitNameSnafu { unit_name })
}

/// `ingress:3` → `3`
fn parse_relation_id(relation_id: &str) -> Result<u32> {
    relation_id
        .rsplit_once(':')
        .and_then(|(_, id)| id.parse().ok())
        .context(InvalidRelationIdSnafu { relation_id })
}

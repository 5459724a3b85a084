use std::path::PathBuf;

use clap::{crate_description, crate_version, Parser};
use snafu::{ResultExt, Snafu};
use stackable_telemetry::{tracing::TelemetryOptions, Tracing};

use crate::{
    config::{Generation, APP_NAME},
    dispatch::{Hook, RelationHook},
    hook_tools::{HookTools, PodSpecSupervisor},
    pebble::{PebbleClient, PebbleSupervisor},
};

mod config;
mod controller;
mod dex_oidc_config;
mod dispatch;
mod hook_tools;
mod image;
mod interfaces;
mod mesh;
mod model;
mod pebble;
mod secret;
#[cfg(test)]
mod testing;
mod workload;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET_PLATFORM: Option<&str> = option_env!("TARGET");
}

const DEFAULT_PEBBLE_SOCKET: &str = "/charm/containers/oidc-gatekeeper/pebble.socket";

#[derive(Snafu, Debug)]
enum Error {
    #[snafu(display("failed to initialize tracing"))]
    InitTracing {
        source: stackable_telemetry::tracing::Error,
    },

    #[snafu(display("failed to set up the hook tool runtime"))]
    HookTools { source: model::Error },

    #[snafu(display("failed to reconcile on hook {hook}"))]
    Reconcile {
        source: controller::Error,
        hook: Hook,
    },
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Handle the hook the orchestrator is currently dispatching.
    Run(GatekeeperRun),
}

#[derive(clap::Args)]
struct GatekeeperRun {
    /// Which generation of the gatekeeper deployment this charm drives.
    #[clap(long, env = "GATEKEEPER_GENERATION", value_enum, default_value_t)]
    generation: Generation,

    /// Path of the hook being dispatched, e.g. `hooks/config-changed`.
    #[clap(long, env = "JUJU_DISPATCH_PATH")]
    hook: String,

    #[clap(long, env = "JUJU_UNIT_NAME")]
    unit_name: String,

    /// Relation the dispatched hook is about, e.g. `dex-oidc-config:4`.
    #[clap(long, env = "JUJU_RELATION_ID")]
    relation_id: Option<String>,

    /// Directory holding the hook tools. They are looked up on `PATH` when unset.
    #[clap(long, env = "HOOK_TOOLS_DIR")]
    hook_tools_dir: Option<PathBuf>,

    #[clap(long, env = "JUJU_CHARM_DIR")]
    charm_dir: Option<PathBuf>,

    /// Unix socket of the Pebble daemon in the workload container.
    #[clap(long, env = "PEBBLE_SOCKET", default_value = DEFAULT_PEBBLE_SOCKET)]
    pebble_socket: PathBuf,

    #[clap(flatten)]
    telemetry_arguments: TelemetryOptions,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run(GatekeeperRun {
            generation,
            hook,
            unit_name,
            relation_id,
            hook_tools_dir,
            charm_dir,
            pebble_socket,
            telemetry_arguments,
        }) => {
            let _tracing_guard = Tracing::pre_configured(APP_NAME, telemetry_arguments)
                .init()
                .context(InitTracingSnafu)?;

            tracing::info!(
                built_info.pkg_version = crate_version!(),
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET_PLATFORM.unwrap_or("unknown target"),
                built_info.built_time = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {}",
                crate_description!()
            );

            let hook = Hook::from_dispatch_path(&hook);
            if !hook.triggers_reconcile(generation) {
                tracing::debug!(%hook, %generation, "hook does not trigger a reconcile");
                return Ok(());
            }
            tracing::info!(%hook, unit = %unit_name, ?charm_dir, "handling hook");

            let mut tools = HookTools::new(&unit_name).context(HookToolsSnafu)?;
            if let Some(hook_tools_dir) = hook_tools_dir {
                tools = tools.with_tools_dir(hook_tools_dir);
            }
            if let (
                Hook::Relation {
                    kind: RelationHook::Broken,
                    ..
                },
                Some(relation_id),
            ) = (&hook, &relation_id)
            {
                tools = tools
                    .with_broken_relation(relation_id)
                    .context(HookToolsSnafu)?;
            }
            let status = match generation {
                Generation::PodSpec => {
                    controller::reconcile(&tools, &PodSpecSupervisor::new(&tools), generation)
                        .await
                }
                Generation::Sidecar => {
                    let supervisor = PebbleSupervisor::new(PebbleClient::new(pebble_socket));
                    controller::reconcile(&tools, &supervisor, generation).await
                }
            }
            .with_context(|_| ReconcileSnafu { hook: hook.clone() })?;
            tracing::info!(%hook, %status, "reconcile finished");
        }
    }

    Ok(())
}

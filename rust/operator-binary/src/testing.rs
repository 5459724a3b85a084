//! In-memory runtime and workload supervisor used by the unit tests.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use crate::{
    config::{GatekeeperConfig, APP_NAME},
    model::{self, Model, Relation, RelationData, Status},
    workload::{self, ApplyOutcome, WorkloadDescriptor, WorkloadSupervisor},
};

#[derive(Default)]
struct State {
    leader: bool,
    config: GatekeeperConfig,
    relations: Vec<Relation>,
    data: BTreeMap<(u32, String), RelationData>,
    resources: BTreeMap<String, String>,
    statuses: Vec<Status>,
    writes: Vec<(Relation, String, String)>,
    broken_relation: Option<u32>,
    next_relation_id: u32,
}

/// A unit of the `oidc-gatekeeper` application, with everything kept in memory.
#[derive(Default)]
pub struct FakeModel {
    state: Mutex<State>,
}

impl FakeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leader() -> Self {
        let model = Self::new();
        model.set_leader(true);
        model
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_leader(&self, leader: bool) {
        self.state().leader = leader;
    }

    pub fn update_config(&self, update: impl FnOnce(&mut GatekeeperConfig)) {
        update(&mut self.state().config);
    }

    pub fn add_relation(&self, endpoint: &str, remote_app: &str) -> Relation {
        let mut state = self.state();
        let relation = Relation {
            id: state.next_relation_id,
            endpoint: endpoint.to_owned(),
            remote_app: Some(remote_app.to_owned()),
        };
        state.next_relation_id += 1;
        state.relations.push(relation.clone());
        relation
    }

    /// Runs the following passes as part of the `-relation-broken` hook of `relation`.
    pub fn break_relation(&self, relation: &Relation) {
        self.state().broken_relation = Some(relation.id);
    }

    pub fn add_peer_relation(&self, endpoint: &str) -> Relation {
        self.add_relation(endpoint, APP_NAME)
    }

    /// Sets data directly, as if another party had written it. Not recorded as a write.
    pub fn set_app_data(&self, relation: &Relation, app: &str, key: &str, value: &str) {
        self.state()
            .data
            .entry((relation.id, app.to_owned()))
            .or_default()
            .insert(key.to_owned(), value.to_owned());
    }

    pub fn app_data(&self, relation: &Relation, app: &str) -> RelationData {
        self.state()
            .data
            .get(&(relation.id, app.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_resource(&self, name: &str, contents: &str) {
        self.state()
            .resources
            .insert(name.to_owned(), contents.to_owned());
    }

    /// Relation data written through [`Model::set_relation_data`].
    pub fn writes(&self) -> Vec<(Relation, String, String)> {
        self.state().writes.clone()
    }

    pub fn statuses(&self) -> Vec<Status> {
        self.state().statuses.clone()
    }

    pub fn status(&self) -> Option<Status> {
        self.state().statuses.last().cloned()
    }
}

impl Model for FakeModel {
    fn app_name(&self) -> &str {
        APP_NAME
    }

    async fn is_leader(&self) -> Result<bool, model::Error> {
        Ok(self.state().leader)
    }

    async fn config(&self) -> Result<GatekeeperConfig, model::Error> {
        Ok(self.state().config.clone())
    }

    async fn relations(&self, endpoint: &str) -> Result<Vec<Relation>, model::Error> {
        let state = self.state();
        Ok(state
            .relations
            .iter()
            .filter(|relation| relation.endpoint == endpoint)
            .filter(|relation| state.broken_relation != Some(relation.id))
            .cloned()
            .collect())
    }

    async fn relation_data(
        &self,
        relation: &Relation,
        app: &str,
    ) -> Result<RelationData, model::Error> {
        Ok(self.app_data(relation, app))
    }

    async fn set_relation_data(
        &self,
        relation: &Relation,
        key: &str,
        value: &str,
    ) -> Result<(), model::Error> {
        self.set_app_data(relation, APP_NAME, key, value);
        self.state()
            .writes
            .push((relation.clone(), key.to_owned(), value.to_owned()));
        Ok(())
    }

    async fn resource(&self, name: &str) -> Result<Option<String>, model::Error> {
        Ok(self.state().resources.get(name).cloned())
    }

    async fn set_status(&self, status: &Status) -> Result<(), model::Error> {
        self.state().statuses.push(status.clone());
        Ok(())
    }
}

/// Records every descriptor handed to it.
#[derive(Default)]
pub struct FakeSupervisor {
    applied: Mutex<Vec<WorkloadDescriptor>>,
    unreachable: bool,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::default()
        }
    }

    pub fn applied(&self) -> Vec<WorkloadDescriptor> {
        self.applied.lock().unwrap().clone()
    }

    pub fn last_applied(&self) -> Option<WorkloadDescriptor> {
        self.applied().last().cloned()
    }
}

impl WorkloadSupervisor for FakeSupervisor {
    fn applying_message(&self) -> &'static str {
        "Applying workload"
    }

    async fn apply(
        &self,
        descriptor: &WorkloadDescriptor,
    ) -> Result<ApplyOutcome, workload::Error> {
        if self.unreachable {
            return Ok(ApplyOutcome::Deferred {
                reason: "container not reachable".to_owned(),
            });
        }
        self.applied.lock().unwrap().push(descriptor.clone());
        Ok(ApplyOutcome::Applied)
    }
}

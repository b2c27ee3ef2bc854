//! Force sync: drive service instances back to their service template.
//!
//! A run is planned in full before anything is written. The plan is an
//! ordered list of mutations (deletes, then updates, then creates); execution
//! stops at the first failing write and reports how far it got, so the same
//! plan can be resumed from the first unexecuted mutation. Interrupted plans
//! are parked in [`InterruptedRuns`] under their run id until resumed.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::logic::{
    AttributeCatalog, RemoteCall, ServiceInstanceLocks, TemplateDiffEngine, TemplateIndex,
};
use crate::model::{
    generate_run_id, Anomaly, ChangedAttribute, Id, NewProcessInstance, Page, ProcessInstance,
    ProcessInstanceRelation, RelationFilter, ServiceInstance, ServiceInstanceFilter, OBJ_PROCESS,
};
use crate::store::traits::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncMutation {
    /// Template gone from the service template: drop the process and its relation
    DeleteProcess {
        service_instance_id: Id,
        process_id: Id,
        process_template_id: Id,
    },
    /// Template changed: overwrite the process with the template's values
    UpdateProcess {
        service_instance_id: Id,
        process_id: Id,
        process_template_id: Id,
        changed_attributes: Vec<ChangedAttribute>,
        target: NewProcessInstance,
    },
    /// Template not represented yet: create a process and bind it
    CreateProcess {
        service_instance_id: Id,
        host_id: Id,
        process_template_id: Id,
        seed: NewProcessInstance,
    },
}

impl SyncMutation {
    pub fn service_instance_id(&self) -> Id {
        match self {
            Self::DeleteProcess { service_instance_id, .. }
            | Self::UpdateProcess { service_instance_id, .. }
            | Self::CreateProcess { service_instance_id, .. } => *service_instance_id,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::DeleteProcess { .. } => 0,
            Self::UpdateProcess { .. } => 1,
            Self::CreateProcess { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub run_id: Uuid,
    pub business_id: Id,
    pub service_template_id: Id,
    /// Service instances the plan covers, after dropping unknown and foreign ids
    pub service_instance_ids: Vec<Id>,
    pub mutations: Vec<SyncMutation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

impl SyncPlan {
    pub fn is_noop(&self) -> bool {
        self.mutations.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub total: usize,
    /// Index of the first mutation executed by this call
    pub resumed_from: usize,
    pub deleted: usize,
    pub updated: usize,
    /// Ids of processes created by this call
    pub created: Vec<Id>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<Anomaly>,
}

impl SyncReport {
    pub fn applied(&self) -> usize {
        self.deleted + self.updated + self.created.len()
    }
}

/// Per-run view of the target service instances, built once and read only.
struct SyncIndex {
    processes: BTreeMap<Id, Vec<(ProcessInstance, Id)>>,
    represented: HashMap<Id, HashSet<Id>>,
}

impl SyncIndex {
    fn build(
        relations: &[ProcessInstanceRelation],
        processes: Vec<ProcessInstance>,
        anomalies: &mut Vec<Anomaly>,
    ) -> Self {
        let mut by_id: HashMap<Id, ProcessInstance> =
            processes.into_iter().map(|p| (p.id, p)).collect();
        let mut index = Self {
            processes: BTreeMap::new(),
            represented: HashMap::new(),
        };
        for relation in relations {
            let Some(process) = by_id.remove(&relation.process_id) else {
                log::warn!(
                    "service instance {} references process {} which cannot be found, skipping",
                    relation.service_instance_id,
                    relation.process_id
                );
                anomalies.push(Anomaly::missing_process(
                    relation.service_instance_id,
                    relation.process_id,
                    relation.process_template_id,
                ));
                continue;
            };
            index
                .processes
                .entry(relation.service_instance_id)
                .or_default()
                .push((process, relation.process_template_id));
            index
                .represented
                .entry(relation.service_instance_id)
                .or_default()
                .insert(relation.process_template_id);
        }
        index
    }

    fn processes_of(&self, service_instance_id: Id) -> &[(ProcessInstance, Id)] {
        self.processes
            .get(&service_instance_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn is_represented(&self, service_instance_id: Id, template_id: Id) -> bool {
        self.represented
            .get(&service_instance_id)
            .map_or(false, |templates| templates.contains(&template_id))
    }
}

#[derive(Debug, Clone)]
struct ParkedRun {
    plan: SyncPlan,
    resume_from: usize,
}

/// Plans of interrupted force sync runs, keyed by run id.
///
/// A run leaves the registry when a resume starts; an interrupted resume
/// parks it again at its new position.
#[derive(Debug, Default)]
pub struct InterruptedRuns {
    runs: Mutex<HashMap<Uuid, ParkedRun>>,
}

impl InterruptedRuns {
    pub fn new() -> Self {
        Self::default()
    }

    fn park(&self, plan: SyncPlan, resume_from: usize) {
        log::info!(
            "parking force sync run {} at mutation {}/{}",
            plan.run_id,
            resume_from,
            plan.mutations.len()
        );
        self.runs
            .lock()
            .insert(plan.run_id, ParkedRun { plan, resume_from });
    }

    fn take(&self, run_id: Uuid) -> Option<ParkedRun> {
        self.runs.lock().remove(&run_id)
    }

    /// Where a parked run would continue, if it is parked.
    pub fn resume_point(&self, run_id: Uuid) -> Option<usize> {
        self.runs.lock().get(&run_id).map(|run| run.resume_from)
    }
}

pub struct ForceSyncReconciler<'a, S: ?Sized> {
    store: &'a S,
    remote: RemoteCall,
    locks: &'a ServiceInstanceLocks,
    runs: Option<&'a InterruptedRuns>,
}

impl<'a, S: Store + ?Sized> ForceSyncReconciler<'a, S> {
    pub fn new(store: &'a S, remote: RemoteCall, locks: &'a ServiceInstanceLocks) -> Self {
        Self {
            store,
            remote,
            locks,
            runs: None,
        }
    }

    /// Park the plan of any interrupted run so it can be resumed by run id.
    pub fn with_interrupted_runs(mut self, runs: &'a InterruptedRuns) -> Self {
        self.runs = Some(runs);
        self
    }

    /// Plan and execute while holding the locks of every target.
    pub async fn force_sync(
        &self,
        business_id: Id,
        service_template_id: Id,
        service_instance_ids: &[Id],
    ) -> CoreResult<SyncReport> {
        let lease = self.locks.acquire(service_instance_ids).await;
        log::debug!("force sync holds locks for service instances {:?}", lease.ids());

        let plan = self
            .plan(business_id, service_template_id, service_instance_ids)
            .await?;
        self.run_parked(plan, 0).await
    }

    /// Continue a parked run, by default from its first unexecuted mutation.
    ///
    /// `from` may skip ahead but never go back over applied mutations.
    pub async fn resume_run(
        &self,
        business_id: Id,
        service_template_id: Id,
        run_id: Uuid,
        from: Option<usize>,
    ) -> CoreResult<SyncReport> {
        let runs = self
            .runs
            .ok_or_else(|| CoreError::invalid_input("interrupted force sync runs are not tracked"))?;
        let parked = runs.take(run_id).ok_or(CoreError::RunNotFound { run_id })?;
        if parked.plan.business_id != business_id
            || parked.plan.service_template_id != service_template_id
        {
            runs.park(parked.plan, parked.resume_from);
            return Err(CoreError::RunNotFound { run_id });
        }
        let from = from.unwrap_or(parked.resume_from);
        if from < parked.resume_from || from > parked.plan.mutations.len() {
            let message = format!(
                "run {} can resume from {} to {}, got {}",
                run_id,
                parked.resume_from,
                parked.plan.mutations.len(),
                from
            );
            runs.park(parked.plan, parked.resume_from);
            return Err(CoreError::invalid_input(message));
        }

        let lease = self.locks.acquire(&parked.plan.service_instance_ids).await;
        log::debug!(
            "resuming force sync run {} holding locks for service instances {:?}",
            run_id,
            lease.ids()
        );
        self.run_parked(parked.plan, from).await
    }

    async fn run_parked(&self, plan: SyncPlan, from: usize) -> CoreResult<SyncReport> {
        let result = self.resume(&plan, from).await;
        if let (Err(CoreError::SyncInterrupted { applied, .. }), Some(runs)) = (&result, self.runs) {
            runs.park(plan, *applied);
        }
        result
    }

    /// Derive every mutation the targets need, without writing anything.
    pub async fn plan(
        &self,
        business_id: Id,
        service_template_id: Id,
        service_instance_ids: &[Id],
    ) -> CoreResult<SyncPlan> {
        if service_instance_ids.is_empty() {
            return Err(CoreError::invalid_input(
                "force sync needs at least one service instance id",
            ));
        }
        if service_template_id <= 0 {
            return Err(CoreError::invalid_input(format!(
                "service template id must be positive, got {}",
                service_template_id
            )));
        }
        let requested: BTreeSet<Id> = service_instance_ids.iter().copied().collect();
        let key = format!(
            "business {}, service template {}",
            business_id, service_template_id
        );

        self.remote
            .read(
                "get service template",
                key.clone(),
                self.store.get_service_template(business_id, service_template_id),
            )
            .await?
            .ok_or(CoreError::NotFound {
                kind: "service template",
                id: service_template_id,
            })?;

        let templates = TemplateIndex::new(
            self.remote
                .read(
                    "list process templates",
                    key.clone(),
                    self.store.list_process_templates(business_id, service_template_id),
                )
                .await?,
        );
        let catalog = AttributeCatalog::load(self.store, &self.remote, OBJ_PROCESS).await?;

        let mut anomalies = Vec::new();
        let targets = self
            .load_targets(business_id, service_template_id, &requested, &mut anomalies)
            .await?;
        let target_ids: Vec<Id> = targets.keys().copied().collect();

        let relations = if target_ids.is_empty() {
            Vec::new()
        } else {
            self.remote
                .read(
                    "list process instance relations",
                    format!("{}, service instances {:?}", key, target_ids),
                    self.store.list_process_instance_relations(
                        business_id,
                        &RelationFilter::by_service_instances(&target_ids),
                    ),
                )
                .await?
        };
        let process_ids: Vec<Id> = relations.iter().map(|r| r.process_id).collect();
        let processes = if process_ids.is_empty() {
            Vec::new()
        } else {
            self.remote
                .read(
                    "list process instances",
                    format!("{}, processes {:?}", key, process_ids),
                    self.store.list_process_instances(&process_ids),
                )
                .await?
        };

        let index = SyncIndex::build(&relations, processes, &mut anomalies);
        let engine = TemplateDiffEngine::new(&catalog);
        let mut mutations = Vec::new();

        for (&service_instance_id, service_instance) in &targets {
            for (process, template_id) in index.processes_of(service_instance_id) {
                let Some(template) = templates.get(*template_id) else {
                    mutations.push(SyncMutation::DeleteProcess {
                        service_instance_id,
                        process_id: process.id,
                        process_template_id: *template_id,
                    });
                    continue;
                };
                // undefined templates have nothing to enforce
                let Some(property) = template.property.as_ref() else {
                    continue;
                };
                if let (changed, Some(target)) = engine.materialize(property, process) {
                    mutations.push(SyncMutation::UpdateProcess {
                        service_instance_id,
                        process_id: process.id,
                        process_template_id: template.id,
                        changed_attributes: changed,
                        target,
                    });
                }
            }

            for template in templates.iter().filter(|t| t.is_defined()) {
                if index.is_represented(service_instance_id, template.id) {
                    continue;
                }
                mutations.push(SyncMutation::CreateProcess {
                    service_instance_id,
                    host_id: service_instance.host_id,
                    process_template_id: template.id,
                    seed: NewProcessInstance::from_template(template.property.as_ref()),
                });
            }
        }
        // stable: keeps per-instance discovery order inside each group
        mutations.sort_by_key(SyncMutation::rank);

        let plan = SyncPlan {
            run_id: generate_run_id(),
            business_id,
            service_template_id,
            service_instance_ids: target_ids,
            mutations,
            anomalies,
        };
        log::info!(
            "force sync run {} planned {} mutations for {} service instances of template {}",
            plan.run_id,
            plan.mutations.len(),
            plan.service_instance_ids.len(),
            service_template_id
        );
        Ok(plan)
    }

    async fn load_targets(
        &self,
        business_id: Id,
        service_template_id: Id,
        requested: &BTreeSet<Id>,
        anomalies: &mut Vec<Anomaly>,
    ) -> CoreResult<BTreeMap<Id, ServiceInstance>> {
        let filter = ServiceInstanceFilter {
            service_instance_ids: Some(requested.iter().copied().collect()),
            ..Default::default()
        };
        let found: HashMap<Id, ServiceInstance> = self
            .remote
            .read(
                "list service instances",
                format!("business {}, service instances {:?}", business_id, requested),
                self.store
                    .list_service_instances(business_id, &filter, Page::unlimited()),
            )
            .await?
            .into_iter()
            .map(|s| (s.id, s))
            .collect();

        let mut targets = BTreeMap::new();
        for id in requested {
            match found.get(id) {
                None => {
                    log::warn!("force sync target service instance {} does not exist", id);
                    anomalies.push(Anomaly::unknown_service_instance(*id));
                }
                Some(instance) if instance.service_template_id != service_template_id => {
                    log::warn!(
                        "force sync target service instance {} belongs to template {}, not {}",
                        id,
                        instance.service_template_id,
                        service_template_id
                    );
                    anomalies.push(Anomaly::foreign_service_instance(
                        *id,
                        instance.service_template_id,
                    ));
                }
                Some(instance) => {
                    targets.insert(*id, instance.clone());
                }
            }
        }
        Ok(targets)
    }

    pub async fn execute(&self, plan: &SyncPlan) -> CoreResult<SyncReport> {
        self.resume(plan, 0).await
    }

    /// Execute the plan starting at mutation `from`.
    ///
    /// On a failed write nothing already applied is undone; the error carries
    /// the index to resume from.
    pub async fn resume(&self, plan: &SyncPlan, from: usize) -> CoreResult<SyncReport> {
        let total = plan.mutations.len();
        if from > total {
            return Err(CoreError::invalid_input(format!(
                "resume index {} is past the end of a {} mutation plan",
                from, total
            )));
        }
        let mut report = SyncReport {
            run_id: plan.run_id,
            total,
            resumed_from: from,
            anomalies: plan.anomalies.clone(),
            ..Default::default()
        };

        for (position, mutation) in plan.mutations.iter().enumerate().skip(from) {
            if let Err(source) = self.apply(plan, mutation, &mut report).await {
                log::error!(
                    "force sync run {} stopped at mutation {}/{}: {}",
                    plan.run_id,
                    position,
                    total,
                    source
                );
                return Err(CoreError::SyncInterrupted {
                    run_id: plan.run_id,
                    applied: position,
                    total,
                    source: Box::new(source),
                });
            }
        }

        log::info!(
            "force sync run {} done: {} deleted, {} updated, {} created",
            plan.run_id,
            report.deleted,
            report.updated,
            report.created.len()
        );
        Ok(report)
    }

    async fn apply(
        &self,
        plan: &SyncPlan,
        mutation: &SyncMutation,
        report: &mut SyncReport,
    ) -> CoreResult<()> {
        match mutation {
            SyncMutation::DeleteProcess {
                service_instance_id,
                process_id,
                process_template_id,
            } => {
                let key = format!(
                    "service instance {}, process {}, removed template {}",
                    service_instance_id, process_id, process_template_id
                );
                self.remote
                    .write(
                        "delete process instance",
                        key.clone(),
                        self.store.delete_process_instance(*process_id),
                    )
                    .await?;
                self.remote
                    .write(
                        "delete process instance relation",
                        key,
                        self.store.delete_process_instance_relation(*process_id),
                    )
                    .await?;
                report.deleted += 1;
            }
            SyncMutation::UpdateProcess {
                service_instance_id,
                process_id,
                process_template_id,
                target,
                ..
            } => {
                self.remote
                    .write(
                        "update process instance",
                        format!(
                            "service instance {}, process {}, template {}",
                            service_instance_id, process_id, process_template_id
                        ),
                        self.store
                            .update_process_instance(*process_id, target.clone()),
                    )
                    .await?;
                report.updated += 1;
            }
            SyncMutation::CreateProcess {
                service_instance_id,
                host_id,
                process_template_id,
                seed,
            } => {
                let key = format!(
                    "service instance {}, template {}",
                    service_instance_id, process_template_id
                );
                let process_id = self
                    .remote
                    .write(
                        "create process instance",
                        key.clone(),
                        self.store
                            .create_process_instance(plan.business_id, seed.clone()),
                    )
                    .await?;
                // a failure here leaves an unbound process behind
                self.remote
                    .write(
                        "create process instance relation",
                        format!("{}, process {}", key, process_id),
                        self.store
                            .create_process_instance_relation(ProcessInstanceRelation {
                                business_id: plan.business_id,
                                process_id,
                                service_instance_id: *service_instance_id,
                                process_template_id: *process_template_id,
                                host_id: *host_id,
                            }),
                    )
                    .await?;
                report.created.push(process_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AnomalyKind, AttributeDefinition, NewServiceInstance, ProcessProperty, ProcessTemplate,
        PropertyType, ServiceTemplate, TemplateValue,
    };
    use crate::model::{MainlineInstance, ModelTopologyNode};
    use crate::store::{
        AttributeStore, MemoryStore, ProcessStore, ServiceInstanceStore, TopologyStore,
    };
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BIZ: Id = 2;
    const MODULE: Id = 30;
    const SERVICE_TEMPLATE: Id = 7;

    fn property(a: Value) -> Option<ProcessProperty> {
        let mut property = ProcessProperty::new();
        property.insert("a".to_string(), TemplateValue::new(a));
        Some(property)
    }

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_attribute(AttributeDefinition::new(OBJ_PROCESS, "a", PropertyType::Int));
        store.insert_service_template(ServiceTemplate {
            id: SERVICE_TEMPLATE,
            business_id: BIZ,
            name: "web".to_string(),
            module_id: MODULE,
        });
        for (id, a) in [(101, json!(1)), (102, json!(2))] {
            store.insert_process_template(ProcessTemplate {
                id,
                business_id: BIZ,
                service_template_id: SERVICE_TEMPLATE,
                property: property(a),
            });
        }
        store
    }

    async fn service_instance(store: &MemoryStore, template_id: Id, host_id: Id) -> ServiceInstance {
        store
            .create_service_instance(
                BIZ,
                NewServiceInstance {
                    name: "svc".to_string(),
                    module_id: MODULE,
                    service_template_id: template_id,
                    host_id,
                },
            )
            .await
            .unwrap()
    }

    async fn attach(store: &MemoryStore, svc: &ServiceInstance, template_id: Id, a: Value) -> Id {
        let mut process = NewProcessInstance::default();
        process.attributes.insert("a".to_string(), a);
        process.attributes.insert("note".to_string(), json!("local"));
        let id = store.create_process_instance(BIZ, process).await.unwrap();
        store
            .create_process_instance_relation(ProcessInstanceRelation {
                business_id: BIZ,
                process_id: id,
                service_instance_id: svc.id,
                process_template_id: template_id,
                host_id: svc.host_id,
            })
            .await
            .unwrap();
        id
    }

    fn template_values(store: &MemoryStore, svc: Id) -> Vec<(Id, Value)> {
        let mut values: Vec<(Id, Value)> = store
            .relations_of(svc)
            .iter()
            .map(|r| {
                let process = store.process(r.process_id).unwrap();
                (r.process_template_id, process.attribute("a").clone())
            })
            .collect();
        values.sort_by_key(|(template_id, _)| *template_id);
        values
    }

    /// Wraps a memory store and rejects one write, counted from zero.
    struct FlakyStore {
        inner: MemoryStore,
        writes: AtomicUsize,
        fail_at: Mutex<Option<usize>>,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore, fail_at: usize) -> Self {
            Self {
                inner,
                writes: AtomicUsize::new(0),
                fail_at: Mutex::new(Some(fail_at)),
            }
        }

        fn disarm(&self) {
            *self.fail_at.lock() = None;
        }

        fn write(&self) -> anyhow::Result<()> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if *self.fail_at.lock() == Some(n) {
                anyhow::bail!("store rejected write {}", n);
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl AttributeStore for FlakyStore {
        async fn read_model_attributes(&self, object_id: &str) -> anyhow::Result<Vec<AttributeDefinition>> {
            self.inner.read_model_attributes(object_id).await
        }
    }

    #[async_trait::async_trait]
    impl ProcessStore for FlakyStore {
        async fn get_service_template(&self, business_id: Id, id: Id) -> anyhow::Result<Option<ServiceTemplate>> {
            self.inner.get_service_template(business_id, id).await
        }
        async fn list_process_templates(
            &self,
            business_id: Id,
            service_template_id: Id,
        ) -> anyhow::Result<Vec<ProcessTemplate>> {
            self.inner
                .list_process_templates(business_id, service_template_id)
                .await
        }
        async fn list_process_instance_relations(
            &self,
            business_id: Id,
            filter: &RelationFilter,
        ) -> anyhow::Result<Vec<ProcessInstanceRelation>> {
            self.inner
                .list_process_instance_relations(business_id, filter)
                .await
        }
        async fn get_process_instance(&self, id: Id) -> anyhow::Result<Option<ProcessInstance>> {
            self.inner.get_process_instance(id).await
        }
        async fn list_process_instances(&self, ids: &[Id]) -> anyhow::Result<Vec<ProcessInstance>> {
            self.inner.list_process_instances(ids).await
        }
        async fn create_process_instance(
            &self,
            business_id: Id,
            process: NewProcessInstance,
        ) -> anyhow::Result<Id> {
            self.write()?;
            self.inner.create_process_instance(business_id, process).await
        }
        async fn update_process_instance(&self, id: Id, process: NewProcessInstance) -> anyhow::Result<()> {
            self.write()?;
            self.inner.update_process_instance(id, process).await
        }
        async fn delete_process_instance(&self, id: Id) -> anyhow::Result<()> {
            self.write()?;
            self.inner.delete_process_instance(id).await
        }
        async fn delete_process_instances(&self, business_id: Id, ids: &[Id]) -> anyhow::Result<()> {
            self.write()?;
            self.inner.delete_process_instances(business_id, ids).await
        }
        async fn create_process_instance_relation(
            &self,
            relation: ProcessInstanceRelation,
        ) -> anyhow::Result<ProcessInstanceRelation> {
            self.write()?;
            self.inner.create_process_instance_relation(relation).await
        }
        async fn delete_process_instance_relation(&self, process_id: Id) -> anyhow::Result<()> {
            self.write()?;
            self.inner.delete_process_instance_relation(process_id).await
        }
    }

    #[async_trait::async_trait]
    impl ServiceInstanceStore for FlakyStore {
        async fn list_service_instances(
            &self,
            business_id: Id,
            filter: &ServiceInstanceFilter,
            page: Page,
        ) -> anyhow::Result<Vec<ServiceInstance>> {
            self.inner
                .list_service_instances(business_id, filter, page)
                .await
        }
        async fn create_service_instance(
            &self,
            business_id: Id,
            instance: NewServiceInstance,
        ) -> anyhow::Result<ServiceInstance> {
            self.write()?;
            self.inner.create_service_instance(business_id, instance).await
        }
        async fn delete_service_instance(&self, id: Id) -> anyhow::Result<()> {
            self.write()?;
            self.inner.delete_service_instance(id).await
        }
    }

    #[async_trait::async_trait]
    impl TopologyStore for FlakyStore {
        async fn load_model_topology(&self) -> anyhow::Result<ModelTopologyNode> {
            self.inner.load_model_topology().await
        }
        async fn load_instances_at_level(
            &self,
            business_id: Id,
            object_id: &str,
        ) -> anyhow::Result<Vec<MainlineInstance>> {
            self.inner.load_instances_at_level(business_id, object_id).await
        }
    }

    /// One stale process (delete), one drifted (update), one missing (create).
    /// Writes: delete 0-1, update 2, create 3-4.
    async fn drifted_store(fail_at: usize) -> (FlakyStore, ServiceInstance, Id, Id) {
        let store = seeded_store();
        let svc = service_instance(&store, SERVICE_TEMPLATE, 5).await;
        let stale = attach(&store, &svc, 55, json!(3)).await;
        let drifted = attach(&store, &svc, 101, json!(3)).await;
        (FlakyStore::new(store, fail_at), svc, stale, drifted)
    }

    #[tokio::test]
    async fn test_failed_write_stops_at_its_mutation() {
        let (store, svc, stale, drifted) = drifted_store(2).await;
        let locks = ServiceInstanceLocks::new();
        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let plan = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[svc.id])
            .await
            .unwrap();
        assert_eq!(plan.mutations.len(), 3);

        match reconciler.execute(&plan).await.unwrap_err() {
            CoreError::SyncInterrupted {
                run_id,
                applied,
                total,
                source,
            } => {
                assert_eq!(run_id, plan.run_id);
                assert_eq!(applied, 1);
                assert_eq!(total, 3);
                assert!(matches!(
                    *source,
                    CoreError::RemoteWrite { op: "update process instance", .. }
                ));
            }
            other => panic!("unexpected error: {}", other),
        }
        // the delete before the failure stays applied, nothing after it ran
        assert!(store.inner.process(stale).is_none());
        assert_eq!(store.inner.process(drifted).unwrap().attribute("a"), &json!(3));
        assert_eq!(template_values(&store.inner, svc.id), vec![(101, json!(3))]);

        store.disarm();
        let report = reconciler.resume(&plan, 1).await.unwrap();
        assert_eq!(report.resumed_from, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(report.created.len(), 1);
        assert_eq!(
            template_values(&store.inner, svc.id),
            vec![(101, json!(1)), (102, json!(2))]
        );
        let again = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[svc.id])
            .await
            .unwrap();
        assert!(again.is_noop());
    }

    #[tokio::test]
    async fn test_interrupted_run_is_resumed_by_id() {
        let (store, svc, _, _) = drifted_store(3).await;
        let locks = ServiceInstanceLocks::new();
        let runs = InterruptedRuns::new();
        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks)
            .with_interrupted_runs(&runs);

        let run_id = match reconciler.force_sync(BIZ, SERVICE_TEMPLATE, &[svc.id]).await {
            Err(CoreError::SyncInterrupted { run_id, applied, .. }) => {
                assert_eq!(applied, 2);
                run_id
            }
            other => panic!("unexpected result: {:?}", other),
        };
        assert_eq!(runs.resume_point(run_id), Some(2));

        assert!(matches!(
            reconciler.resume_run(3, SERVICE_TEMPLATE, run_id, None).await,
            Err(CoreError::RunNotFound { .. })
        ));
        assert!(matches!(
            reconciler.resume_run(BIZ, SERVICE_TEMPLATE, run_id, Some(1)).await,
            Err(CoreError::InvalidInput { .. })
        ));
        assert_eq!(runs.resume_point(run_id), Some(2));

        store.disarm();
        let report = reconciler
            .resume_run(BIZ, SERVICE_TEMPLATE, run_id, None)
            .await
            .unwrap();
        assert_eq!(report.resumed_from, 2);
        assert_eq!(report.created.len(), 1);
        assert_eq!(
            template_values(&store.inner, svc.id),
            vec![(101, json!(1)), (102, json!(2))]
        );
        assert_eq!(runs.resume_point(run_id), None);
        assert!(matches!(
            reconciler.resume_run(BIZ, SERVICE_TEMPLATE, run_id, None).await,
            Err(CoreError::RunNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_updates_changed_and_creates_missing() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let svc = service_instance(&store, SERVICE_TEMPLATE, 5).await;
        let bound = attach(&store, &svc, 101, json!(5)).await;

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let report = reconciler
            .force_sync(BIZ, SERVICE_TEMPLATE, &[svc.id])
            .await
            .unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(
            template_values(&store, svc.id),
            vec![(101, json!(1)), (102, json!(2))]
        );
        // full replacement drops attributes the template does not declare
        assert!(store.process(bound).unwrap().attributes.get("note").is_none());
        let created = &store.relations_of(svc.id);
        assert!(created.iter().all(|r| r.host_id == 5));
    }

    #[tokio::test]
    async fn test_deletes_processes_of_removed_templates() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let svc = service_instance(&store, SERVICE_TEMPLATE, 5).await;
        let stale = attach(&store, &svc, 101, json!(1)).await;
        attach(&store, &svc, 102, json!(2)).await;
        store.remove_process_template(101);

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let report = reconciler
            .force_sync(BIZ, SERVICE_TEMPLATE, &[svc.id])
            .await
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert!(store.process(stale).is_none());
        assert_eq!(template_values(&store, svc.id), vec![(102, json!(2))]);
    }

    #[tokio::test]
    async fn test_second_run_is_a_noop() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let first = service_instance(&store, SERVICE_TEMPLATE, 5).await;
        let second = service_instance(&store, SERVICE_TEMPLATE, 6).await;
        attach(&store, &first, 101, json!(9)).await;
        attach(&store, &first, 0, json!(9)).await;

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        reconciler
            .force_sync(BIZ, SERVICE_TEMPLATE, &[first.id, second.id])
            .await
            .unwrap();
        let mutations = store.mutation_count();

        let plan = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[first.id, second.id])
            .await
            .unwrap();
        assert!(plan.is_noop());
        let report = reconciler.execute(&plan).await.unwrap();
        assert_eq!(report.applied(), 0);
        assert_eq!(store.mutation_count(), mutations);
    }

    #[tokio::test]
    async fn test_instance_without_processes_gets_one_per_template() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let svc = service_instance(&store, SERVICE_TEMPLATE, 8).await;

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let plan = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[svc.id, svc.id])
            .await
            .unwrap();
        let created: Vec<Id> = plan
            .mutations
            .iter()
            .filter_map(|m| match m {
                SyncMutation::CreateProcess {
                    process_template_id,
                    host_id,
                    ..
                } => {
                    assert_eq!(*host_id, 8);
                    Some(*process_template_id)
                }
                _ => None,
            })
            .collect();
        assert_eq!(created, vec![101, 102]);

        reconciler.execute(&plan).await.unwrap();
        assert_eq!(store.relations_of(svc.id).len(), 2);
    }

    #[tokio::test]
    async fn test_plan_orders_deletes_updates_creates() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let svc = service_instance(&store, SERVICE_TEMPLATE, 5).await;
        attach(&store, &svc, 101, json!(3)).await;
        attach(&store, &svc, 55, json!(3)).await;

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let plan = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[svc.id])
            .await
            .unwrap();
        let ranks: Vec<u8> = plan.mutations.iter().map(SyncMutation::rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert!(plan.mutations.iter().all(|m| m.service_instance_id() == svc.id));
    }

    #[tokio::test]
    async fn test_resume_skips_applied_mutations() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let svc = service_instance(&store, SERVICE_TEMPLATE, 5).await;
        attach(&store, &svc, 101, json!(3)).await;

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let plan = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[svc.id])
            .await
            .unwrap();
        assert_eq!(plan.mutations.len(), 2);

        let report = reconciler.resume(&plan, 1).await.unwrap();
        assert_eq!(report.resumed_from, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.created.len(), 1);
        assert_eq!(
            template_values(&store, svc.id),
            vec![(101, json!(3)), (102, json!(2))]
        );

        assert!(matches!(
            reconciler.resume(&plan, 3).await,
            Err(CoreError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_targets_are_anomalies() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let foreign = service_instance(&store, 99, 5).await;
        let svc = service_instance(&store, SERVICE_TEMPLATE, 6).await;
        store.insert_relation(ProcessInstanceRelation {
            business_id: BIZ,
            process_id: 500,
            service_instance_id: svc.id,
            process_template_id: 101,
            host_id: 6,
        });

        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let plan = reconciler
            .plan(BIZ, SERVICE_TEMPLATE, &[foreign.id, svc.id, 4242])
            .await
            .unwrap();

        assert_eq!(plan.service_instance_ids, vec![svc.id]);
        let kinds: Vec<AnomalyKind> = plan.anomalies.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AnomalyKind::ForeignServiceInstance));
        assert!(kinds.contains(&AnomalyKind::UnknownServiceInstance));
        assert!(kinds.contains(&AnomalyKind::MissingProcessInstance));
        // the dangling relation does not count as representing template 101
        assert_eq!(plan.mutations.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_target_list_is_rejected() {
        let store = seeded_store();
        let locks = ServiceInstanceLocks::new();
        let reconciler = ForceSyncReconciler::new(&store, RemoteCall::default(), &locks);
        let err = reconciler.plan(BIZ, SERVICE_TEMPLATE, &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
        assert_eq!(store.mutation_count(), 0);
    }
}

use itertools::Itertools;
use std::collections::HashSet;

use crate::error::{CoreError, CoreResult};
use crate::logic::{RemoteCall, ServiceInstanceLease, ServiceInstanceLocks, TemplateIndex};
use crate::model::{
    CreateServiceInstancesInput, Id, NewServiceInstance, Page, ProcessInstanceRelation,
    RelationFilter, ServiceInstance, ServiceInstanceFilter,
};
use crate::store::traits::Store;

/// Lifecycle of service instances and the processes grouped under them.
pub struct ServiceInstanceOperations<'a, S: ?Sized> {
    store: &'a S,
    remote: RemoteCall,
    locks: &'a ServiceInstanceLocks,
}

impl<'a, S: Store + ?Sized> ServiceInstanceOperations<'a, S> {
    pub fn new(store: &'a S, remote: RemoteCall, locks: &'a ServiceInstanceLocks) -> Self {
        Self {
            store,
            remote,
            locks,
        }
    }

    /// Create one service instance per host, each with the supplied processes.
    ///
    /// Stops at the first failed write; instances created before it remain.
    pub async fn create_service_instances(
        &self,
        business_id: Id,
        input: CreateServiceInstancesInput,
    ) -> CoreResult<Vec<Id>> {
        if input.module_id <= 0 {
            return Err(CoreError::invalid_input(format!(
                "module id must be positive, got {}",
                input.module_id
            )));
        }
        if input.instances.is_empty() {
            return Err(CoreError::invalid_input("no service instances to create"));
        }
        if let Some(bad) = input.instances.iter().find(|i| i.host_id <= 0) {
            return Err(CoreError::invalid_input(format!(
                "host id must be positive, got {}",
                bad.host_id
            )));
        }

        let templates = self
            .template_index(business_id, input.service_template_id)
            .await?;
        for process in input.instances.iter().flat_map(|i| i.processes.iter()) {
            if process.process_template_id == 0 {
                continue;
            }
            let known = templates
                .as_ref()
                .map_or(false, |t| t.get(process.process_template_id).is_some());
            if !known {
                return Err(CoreError::invalid_input(format!(
                    "process template {} does not belong to service template {}",
                    process.process_template_id, input.service_template_id
                )));
            }
        }

        let mut created = Vec::with_capacity(input.instances.len());
        for on_host in input.instances {
            let service_instance = self
                .remote
                .write(
                    "create service instance",
                    format!("module {}, host {}", input.module_id, on_host.host_id),
                    self.store.create_service_instance(
                        business_id,
                        NewServiceInstance {
                            name: input.name.clone(),
                            module_id: input.module_id,
                            service_template_id: input.service_template_id,
                            host_id: on_host.host_id,
                        },
                    ),
                )
                .await?;

            for process in on_host.processes {
                let key = format!(
                    "service instance {}, template {}",
                    service_instance.id, process.process_template_id
                );
                let process_id = self
                    .remote
                    .write(
                        "create process instance",
                        key.clone(),
                        self.store
                            .create_process_instance(business_id, process.process_info),
                    )
                    .await?;
                self.remote
                    .write(
                        "create process instance relation",
                        key,
                        self.store
                            .create_process_instance_relation(ProcessInstanceRelation {
                                business_id,
                                process_id,
                                service_instance_id: service_instance.id,
                                process_template_id: process.process_template_id,
                                host_id: on_host.host_id,
                            }),
                    )
                    .await?;
            }
            log::info!(
                "created service instance {} on host {} in module {}",
                service_instance.id,
                service_instance.host_id,
                input.module_id
            );
            created.push(service_instance.id);
        }
        Ok(created)
    }

    async fn template_index(
        &self,
        business_id: Id,
        service_template_id: Id,
    ) -> CoreResult<Option<TemplateIndex>> {
        if service_template_id == 0 {
            return Ok(None);
        }
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
        let templates = self
            .remote
            .read(
                "list process templates",
                key,
                self.store.list_process_templates(business_id, service_template_id),
            )
            .await?;
        Ok(Some(TemplateIndex::new(templates)))
    }

    pub async fn list_service_instances_in_module(
        &self,
        business_id: Id,
        module_id: Id,
        page: Page,
    ) -> CoreResult<Vec<ServiceInstance>> {
        if module_id <= 0 {
            return Err(CoreError::invalid_input(format!(
                "module id must be positive, got {}",
                module_id
            )));
        }
        let filter = ServiceInstanceFilter {
            module_id: Some(module_id),
            ..Default::default()
        };
        self.remote
            .read(
                "list service instances",
                format!("business {}, module {}", business_id, module_id),
                self.store.list_service_instances(business_id, &filter, page),
            )
            .await
    }

    /// Delete processes by id: relations first, then the process rows.
    ///
    /// Every id must name a process of `business_id`; otherwise nothing is written.
    pub async fn delete_process_instances(&self, business_id: Id, process_ids: &[Id]) -> CoreResult<()> {
        if process_ids.is_empty() {
            return Err(CoreError::invalid_input("no process instance ids given"));
        }
        let process_ids: Vec<Id> = process_ids.iter().copied().unique().collect();
        let key = format!("business {}, processes {:?}", business_id, process_ids);
        let owned: HashSet<Id> = self
            .remote
            .read(
                "list process instances",
                key.clone(),
                self.store.list_process_instances(&process_ids),
            )
            .await?
            .into_iter()
            .filter(|p| p.business_id == business_id)
            .map(|p| p.id)
            .collect();
        if let Some(&missing) = process_ids.iter().find(|id| !owned.contains(id)) {
            return Err(CoreError::NotFound {
                kind: "process instance",
                id: missing,
            });
        }

        let (lease, relations) = self.lock_owners(business_id, &process_ids, &key).await?;
        for relation in &relations {
            self.remote
                .write(
                    "delete process instance relation",
                    format!(
                        "service instance {}, process {}",
                        relation.service_instance_id, relation.process_id
                    ),
                    self.store.delete_process_instance_relation(relation.process_id),
                )
                .await?;
        }
        self.remote
            .write(
                "delete process instances",
                key,
                self.store.delete_process_instances(business_id, &process_ids),
            )
            .await?;
        log::info!(
            "deleted {} process instances from service instances {:?}",
            process_ids.len(),
            lease.ids()
        );
        Ok(())
    }

    /// Lock the service instances owning `process_ids` and return their
    /// relations as read under that lease.
    async fn lock_owners(
        &self,
        business_id: Id,
        process_ids: &[Id],
        key: &str,
    ) -> CoreResult<(ServiceInstanceLease, Vec<ProcessInstanceRelation>)> {
        let filter = RelationFilter::by_processes(process_ids);
        let mut relations = self
            .remote
            .read(
                "list process instance relations",
                key.to_string(),
                self.store.list_process_instance_relations(business_id, &filter),
            )
            .await?;
        loop {
            let lease = self.locks.acquire(&owners(&relations)).await;
            let current = self
                .remote
                .read(
                    "list process instance relations",
                    key.to_string(),
                    self.store.list_process_instance_relations(business_id, &filter),
                )
                .await?;
            if owners(&current).iter().all(|id| lease.ids().contains(id)) {
                return Ok((lease, current));
            }
            log::debug!(
                "owners of processes {:?} changed while locking, retrying",
                process_ids
            );
            relations = current;
        }
    }

    /// Delete a service instance together with its relations and processes.
    pub async fn delete_service_instance(&self, business_id: Id, service_instance_id: Id) -> CoreResult<()> {
        let _lease = self.locks.acquire(&[service_instance_id]).await;
        let key = format!(
            "business {}, service instance {}",
            business_id, service_instance_id
        );
        let filter = ServiceInstanceFilter {
            service_instance_ids: Some(vec![service_instance_id]),
            ..Default::default()
        };
        let found = self
            .remote
            .read(
                "list service instances",
                key.clone(),
                self.store
                    .list_service_instances(business_id, &filter, Page::unlimited()),
            )
            .await?;
        if found.is_empty() {
            return Err(CoreError::NotFound {
                kind: "service instance",
                id: service_instance_id,
            });
        }

        let relations = self
            .remote
            .read(
                "list process instance relations",
                key.clone(),
                self.store.list_process_instance_relations(
                    business_id,
                    &RelationFilter::by_service_instances(&[service_instance_id]),
                ),
            )
            .await?;
        let process_ids: Vec<Id> = relations.iter().map(|r| r.process_id).collect();
        for process_id in &process_ids {
            self.remote
                .write(
                    "delete process instance relation",
                    format!("{}, process {}", key, process_id),
                    self.store.delete_process_instance_relation(*process_id),
                )
                .await?;
        }
        if !process_ids.is_empty() {
            self.remote
                .write(
                    "delete process instances",
                    key.clone(),
                    self.store.delete_process_instances(business_id, &process_ids),
                )
                .await?;
        }
        self.remote
            .write(
                "delete service instance",
                key,
                self.store.delete_service_instance(service_instance_id),
            )
            .await?;
        log::info!(
            "deleted service instance {} with {} processes",
            service_instance_id,
            process_ids.len()
        );
        Ok(())
    }
}

fn owners(relations: &[ProcessInstanceRelation]) -> Vec<Id> {
    relations
        .iter()
        .map(|r| r.service_instance_id)
        .unique()
        .collect()
}

use itertools::Itertools;
use std::collections::{HashMap, HashSet};

use crate::error::{CoreError, CoreResult};
use crate::logic::{AttributeCatalog, RemoteCall, TemplateDiffEngine};
use crate::model::{
    Anomaly, DifferenceDetail, DifferenceReport, Id, NewProcessInstance, Page,
    ProcessDifferenceDetail, ProcessInstanceRelation, ProcessTemplate, RelationFilter,
    ServiceInstance, ServiceInstanceFilter, ServiceProcessInstanceDifference, OBJ_PROCESS,
};
use crate::store::traits::Store;

/// Live process templates of one service template, indexed once per operation.
#[derive(Debug)]
pub struct TemplateIndex {
    ordered: Vec<ProcessTemplate>,
    by_id: HashMap<Id, usize>,
}

impl TemplateIndex {
    pub fn new(templates: Vec<ProcessTemplate>) -> Self {
        let by_id = templates
            .iter()
            .enumerate()
            .map(|(position, t)| (t.id, position))
            .collect();
        Self {
            ordered: templates,
            by_id,
        }
    }

    pub fn get(&self, id: Id) -> Option<&ProcessTemplate> {
        self.by_id.get(&id).map(|&position| &self.ordered[position])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessTemplate> {
        self.ordered.iter()
    }
}

/// Template ids matched by at least one process of a single service instance.
#[derive(Debug, Default, Clone)]
pub struct SeenTemplates {
    ids: HashSet<Id>,
}

impl SeenTemplates {
    pub fn mark(&mut self, template_id: Id) {
        self.ids.insert(template_id);
    }

    pub fn contains(&self, template_id: Id) -> bool {
        self.ids.contains(&template_id)
    }

    /// Defined templates no process of the service instance is bound to.
    pub fn unmatched<'t>(&'t self, templates: &'t TemplateIndex) -> impl Iterator<Item = &'t ProcessTemplate> + 't {
        templates
            .iter()
            .filter(move |t| t.is_defined() && !self.contains(t.id))
    }
}

/// Classifies every process of every service instance of a template and module.
pub struct ServiceDifferenceClassifier<'a, S: ?Sized> {
    store: &'a S,
    remote: RemoteCall,
}

impl<'a, S: Store + ?Sized> ServiceDifferenceClassifier<'a, S> {
    pub fn new(store: &'a S, remote: RemoteCall) -> Self {
        Self { store, remote }
    }

    pub async fn classify(
        &self,
        business_id: Id,
        service_template_id: Id,
        module_id: Id,
    ) -> CoreResult<DifferenceReport> {
        if service_template_id <= 0 || module_id <= 0 {
            return Err(CoreError::invalid_input(format!(
                "service template id and module id must be positive, got {} and {}",
                service_template_id, module_id
            )));
        }
        let key = format!(
            "business {}, service template {}, module {}",
            business_id, service_template_id, module_id
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

        let catalog = AttributeCatalog::load(self.store, &self.remote, OBJ_PROCESS).await?;
        let templates = TemplateIndex::new(
            self.remote
                .read(
                    "list process templates",
                    key.clone(),
                    self.store.list_process_templates(business_id, service_template_id),
                )
                .await?,
        );

        let filter = ServiceInstanceFilter {
            module_id: Some(module_id),
            service_template_id: Some(service_template_id),
            service_instance_ids: None,
        };
        let service_instances = self
            .remote
            .read(
                "list service instances",
                key.clone(),
                self.store
                    .list_service_instances(business_id, &filter, Page::unlimited()),
            )
            .await?;

        // Loaded by service instance so that relations to deleted templates show up as removed.
        let service_ids: Vec<Id> = service_instances.iter().map(|s| s.id).collect();
        let relations = if service_ids.is_empty() {
            Vec::new()
        } else {
            self.remote
                .read(
                    "list process instance relations",
                    key.clone(),
                    self.store.list_process_instance_relations(
                        business_id,
                        &RelationFilter::by_service_instances(&service_ids),
                    ),
                )
                .await?
        };
        let relations_by_service = relations
            .into_iter()
            .into_group_map_by(|r| r.service_instance_id);

        let engine = TemplateDiffEngine::new(&catalog);
        let mut report = DifferenceReport::default();
        for service_instance in &service_instances {
            let relations = relations_by_service
                .get(&service_instance.id)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let (detail, anomalies) = self
                .classify_service_instance(business_id, &engine, &templates, relations)
                .await?;
            if relations.is_empty() {
                log::warn!(
                    "service instance {} of service template {} has no processes",
                    service_instance.id,
                    service_template_id
                );
                report.anomalies.push(Anomaly::without_processes(service_instance.id));
            }
            report.anomalies.extend(anomalies);
            report
                .differences
                .push(difference_of(service_instance, detail));
        }

        log::debug!(
            "classified {} service instances of template {} in module {}, {} anomalies",
            report.differences.len(),
            service_template_id,
            module_id,
            report.anomalies.len()
        );
        Ok(report)
    }

    async fn classify_service_instance(
        &self,
        business_id: Id,
        engine: &TemplateDiffEngine<'_>,
        templates: &TemplateIndex,
        relations: &[ProcessInstanceRelation],
    ) -> CoreResult<(DifferenceDetail, Vec<Anomaly>)> {
        let mut detail = DifferenceDetail::new();
        let mut anomalies = Vec::new();
        // No processes at all is reported as an empty record plus an anomaly.
        if relations.is_empty() {
            return Ok((detail, anomalies));
        }

        let mut seen = SeenTemplates::default();
        for relation in relations {
            let process = self
                .remote
                .read(
                    "get process instance",
                    format!(
                        "process {}, service instance {}",
                        relation.process_id, relation.service_instance_id
                    ),
                    self.store.get_process_instance(relation.process_id),
                )
                .await?;
            let Some(process) = process else {
                log::warn!(
                    "relation of service instance {} points at missing process {}",
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

            let Some(template) = templates.get(relation.process_template_id) else {
                if !relation.is_templated() {
                    log::debug!(
                        "process {} of service instance {} is not bound to a template",
                        relation.process_id,
                        relation.service_instance_id
                    );
                }
                detail.removed.push(ProcessDifferenceDetail {
                    process_template_id: relation.process_template_id,
                    process_instance: process,
                    changed_attributes: Vec::new(),
                });
                continue;
            };
            seen.mark(template.id);

            let changed = template
                .property
                .as_ref()
                .map(|property| engine.diff(property, &process))
                .unwrap_or_default();
            let entry = ProcessDifferenceDetail {
                process_template_id: template.id,
                process_instance: process,
                changed_attributes: changed,
            };
            if entry.changed_attributes.is_empty() {
                detail.unchanged.push(entry);
            } else {
                detail.changed.push(entry);
            }
        }

        for template in seen.unmatched(templates) {
            detail.added.push(ProcessDifferenceDetail {
                process_template_id: template.id,
                process_instance: NewProcessInstance::from_template(template.property.as_ref())
                    .into_instance(0, business_id),
                changed_attributes: Vec::new(),
            });
        }

        Ok((detail, anomalies))
    }
}

fn difference_of(service_instance: &ServiceInstance, detail: DifferenceDetail) -> ServiceProcessInstanceDifference {
    ServiceProcessInstanceDifference {
        service_instance_id: service_instance.id,
        service_instance_name: service_instance.name.clone(),
        host_id: service_instance.host_id,
        differences: detail,
    }
}

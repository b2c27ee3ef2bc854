use anyhow::Result;
use serde_json::{json, Value};

use crate::model::{
    AttributeDefinition, Id, MainlineInstance, ModelTopologyNode, NewProcessInstance,
    NewServiceInstance, ProcessInstanceRelation, ProcessProperty, ProcessTemplate, PropertyType,
    ServiceTemplate, TemplateValue, OBJ_BUSINESS, OBJ_MODULE, OBJ_PROCESS, OBJ_SET,
};
use crate::store::traits::{ProcessStore, ServiceInstanceStore};
use crate::store::MemoryStore;

pub const DEMO_BUSINESS_ID: Id = 2;
pub const DEMO_SERVICE_TEMPLATE_ID: Id = 1;
pub const DEMO_MODULE_ID: Id = 20;

fn property(values: &[(&str, Value)]) -> ProcessProperty {
    values
        .iter()
        .map(|(id, value)| (id.to_string(), TemplateValue::new(value.clone())))
        .collect()
}

/// Populate a demo business: topology, process attributes, one service
/// template with two process templates and two service instances, one of
/// which has drifted from its template.
pub async fn load_seed_data(store: &MemoryStore) -> Result<()> {
    load_topology(store);
    load_attributes(store);
    load_templates(store);
    load_service_instances(store).await?;
    log::info!("Seed data loaded for business {}", DEMO_BUSINESS_ID);
    Ok(())
}

fn load_topology(store: &MemoryStore) {
    if let Some(model) = ModelTopologyNode::chain(&[OBJ_BUSINESS, OBJ_SET, OBJ_MODULE]) {
        store.set_model_topology(model);
    }
    let mut business = MainlineInstance::new(OBJ_BUSINESS, DEMO_BUSINESS_ID, "demo-shop", DEMO_BUSINESS_ID, 0);
    business.detail.insert("bk_biz_maintainer".to_string(), json!("admin"));
    store.insert_mainline_instance(business);
    store.insert_mainline_instance(MainlineInstance::new(OBJ_SET, 10, "frontend", DEMO_BUSINESS_ID, DEMO_BUSINESS_ID));
    store.insert_mainline_instance(MainlineInstance::new(OBJ_SET, 11, "storage", DEMO_BUSINESS_ID, DEMO_BUSINESS_ID));
    store.insert_mainline_instance(MainlineInstance::new(OBJ_MODULE, DEMO_MODULE_ID, "gateway", DEMO_BUSINESS_ID, 10));
    store.insert_mainline_instance(MainlineInstance::new(OBJ_MODULE, 21, "mysql", DEMO_BUSINESS_ID, 11));
}

fn load_attributes(store: &MemoryStore) {
    store.insert_attribute(
        AttributeDefinition::new(OBJ_PROCESS, "bk_func_name", PropertyType::Singlechar)
            .with_name("Process name"),
    );
    store.insert_attribute(AttributeDefinition::new(OBJ_PROCESS, "port", PropertyType::Int).with_name("Port"));
    store.insert_attribute(
        AttributeDefinition::new(OBJ_PROCESS, "bind_ip", PropertyType::Singlechar).with_name("Bind IP"),
    );
    store.insert_attribute(
        AttributeDefinition::new(OBJ_PROCESS, "auto_start", PropertyType::Bool).with_name("Auto start"),
    );
}

fn load_templates(store: &MemoryStore) {
    store.insert_service_template(ServiceTemplate {
        id: DEMO_SERVICE_TEMPLATE_ID,
        business_id: DEMO_BUSINESS_ID,
        name: "nginx".to_string(),
        module_id: DEMO_MODULE_ID,
    });
    store.insert_process_template(ProcessTemplate {
        id: 101,
        business_id: DEMO_BUSINESS_ID,
        service_template_id: DEMO_SERVICE_TEMPLATE_ID,
        property: Some(property(&[
            ("bk_func_name", json!("nginx")),
            ("port", json!(80)),
            ("bind_ip", json!("0.0.0.0")),
            ("auto_start", json!(true)),
        ])),
    });
    store.insert_process_template(ProcessTemplate {
        id: 102,
        business_id: DEMO_BUSINESS_ID,
        service_template_id: DEMO_SERVICE_TEMPLATE_ID,
        property: Some(property(&[
            ("bk_func_name", json!("nginx-exporter")),
            ("port", json!(9113)),
        ])),
    });
}

async fn load_service_instances(store: &MemoryStore) -> Result<()> {
    for (host_id, port) in [(1001, 80), (1002, 8080)] {
        let service_instance = store
            .create_service_instance(
                DEMO_BUSINESS_ID,
                NewServiceInstance {
                    name: format!("nginx-{}", host_id),
                    module_id: DEMO_MODULE_ID,
                    service_template_id: DEMO_SERVICE_TEMPLATE_ID,
                    host_id,
                },
            )
            .await?;

        // the second host runs on a hand-edited port and lacks the exporter
        let mut process = NewProcessInstance::default();
        process.attributes.insert("bk_func_name".to_string(), json!("nginx"));
        process.attributes.insert("port".to_string(), json!(port));
        process.attributes.insert("bind_ip".to_string(), json!("0.0.0.0"));
        process.attributes.insert("auto_start".to_string(), json!(true));
        let process_id = store.create_process_instance(DEMO_BUSINESS_ID, process).await?;
        store
            .create_process_instance_relation(ProcessInstanceRelation {
                business_id: DEMO_BUSINESS_ID,
                process_id,
                service_instance_id: service_instance.id,
                process_template_id: 101,
                host_id,
            })
            .await?;

        if port == 80 {
            let exporter = NewProcessInstance::from_template(Some(&property(&[
                ("bk_func_name", json!("nginx-exporter")),
                ("port", json!(9113)),
            ])));
            let exporter_id = store.create_process_instance(DEMO_BUSINESS_ID, exporter).await?;
            store
                .create_process_instance_relation(ProcessInstanceRelation {
                    business_id: DEMO_BUSINESS_ID,
                    process_id: exporter_id,
                    service_instance_id: service_instance.id,
                    process_template_id: 102,
                    host_id,
                })
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::{RemoteCall, ServiceDifferenceClassifier};

    #[tokio::test]
    async fn test_seed_has_one_drifted_instance() {
        let store = MemoryStore::new();
        load_seed_data(&store).await.unwrap();

        let report = ServiceDifferenceClassifier::new(&store, RemoteCall::default())
            .classify(DEMO_BUSINESS_ID, DEMO_SERVICE_TEMPLATE_ID, DEMO_MODULE_ID)
            .await
            .unwrap();
        assert_eq!(report.differences.len(), 2);
        let in_sync = report
            .differences
            .iter()
            .filter(|d| d.differences.is_in_sync())
            .count();
        assert_eq!(in_sync, 1);
        assert!(report.anomalies.is_empty());
    }
}

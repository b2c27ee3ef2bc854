use anyhow::{anyhow, Context, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::model::{
    model_tree_from_edges, AttributeDefinition, Id, MainlineInstance, ModelTopologyEdge,
    ModelTopologyNode, NewProcessInstance, NewServiceInstance, Page, ProcessInstance,
    ProcessInstanceRelation, ProcessProperty, ProcessTemplate, PropertyType, RelationFilter,
    ServiceInstance, ServiceInstanceFilter, ServiceTemplate, OBJ_BUSINESS,
};
use crate::store::traits::{AttributeStore, ProcessStore, ServiceInstanceStore, TopologyStore};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_property_type(raw: &str) -> Result<PropertyType> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("Unknown property type '{}'", raw))
}

fn process_from_row(row: &PgRow) -> Result<ProcessInstance> {
    let attributes: Json<serde_json::Map<String, serde_json::Value>> = row.try_get("attributes")?;
    Ok(ProcessInstance {
        id: row.try_get("bk_process_id")?,
        business_id: row.try_get("bk_biz_id")?,
        attributes: attributes.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn relation_from_row(row: &PgRow) -> Result<ProcessInstanceRelation> {
    Ok(ProcessInstanceRelation {
        business_id: row.try_get("bk_biz_id")?,
        process_id: row.try_get("bk_process_id")?,
        service_instance_id: row.try_get("service_instance_id")?,
        process_template_id: row.try_get("process_template_id")?,
        host_id: row.try_get("bk_host_id")?,
    })
}

fn service_instance_from_row(row: &PgRow) -> Result<ServiceInstance> {
    Ok(ServiceInstance {
        id: row.try_get("id")?,
        business_id: row.try_get("bk_biz_id")?,
        name: row.try_get("name")?,
        module_id: row.try_get("bk_module_id")?,
        service_template_id: row.try_get("service_template_id")?,
        host_id: row.try_get("bk_host_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn clamp(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl AttributeStore for PostgresStore {
    async fn read_model_attributes(&self, object_id: &str) -> Result<Vec<AttributeDefinition>> {
        let rows = sqlx::query(
            "SELECT bk_obj_id, bk_property_id, bk_property_name, bk_property_type, editable \
             FROM model_attributes WHERE bk_obj_id = $1 ORDER BY bk_property_id",
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to read model attributes")?;

        rows.iter()
            .map(|row| {
                let raw_type: String = row.try_get("bk_property_type")?;
                Ok(AttributeDefinition {
                    object_id: row.try_get("bk_obj_id")?,
                    property_id: row.try_get("bk_property_id")?,
                    property_name: row.try_get("bk_property_name")?,
                    property_type: parse_property_type(&raw_type)?,
                    editable: row.try_get("editable")?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ProcessStore for PostgresStore {
    async fn get_service_template(&self, business_id: Id, id: Id) -> Result<Option<ServiceTemplate>> {
        let row = sqlx::query(
            "SELECT id, bk_biz_id, name, bk_module_id FROM service_templates \
             WHERE bk_biz_id = $1 AND id = $2",
        )
        .bind(business_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch service template")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ServiceTemplate {
            id: row.try_get("id")?,
            business_id: row.try_get("bk_biz_id")?,
            name: row.try_get("name")?,
            module_id: row.try_get("bk_module_id")?,
        }))
    }

    async fn list_process_templates(
        &self,
        business_id: Id,
        service_template_id: Id,
    ) -> Result<Vec<ProcessTemplate>> {
        let rows = sqlx::query(
            "SELECT id, bk_biz_id, service_template_id, property FROM process_templates \
             WHERE bk_biz_id = $1 AND service_template_id = $2 ORDER BY id",
        )
        .bind(business_id)
        .bind(service_template_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list process templates")?;

        rows.iter()
            .map(|row| {
                let property: Option<Json<ProcessProperty>> = row.try_get("property")?;
                Ok(ProcessTemplate {
                    id: row.try_get("id")?,
                    business_id: row.try_get("bk_biz_id")?,
                    service_template_id: row.try_get("service_template_id")?,
                    property: property.map(|p| p.0),
                })
            })
            .collect()
    }

    async fn list_process_instance_relations(
        &self,
        business_id: Id,
        filter: &RelationFilter,
    ) -> Result<Vec<ProcessInstanceRelation>> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT bk_biz_id, bk_process_id, service_instance_id, process_template_id, bk_host_id \
             FROM process_instance_relations WHERE bk_biz_id = ",
        );
        query.push_bind(business_id);
        if let Some(template_id) = filter.process_template_id {
            query.push(" AND process_template_id = ").push_bind(template_id);
        }
        if let Some(ids) = &filter.service_instance_ids {
            query
                .push(" AND service_instance_id = ANY(")
                .push_bind(ids.clone())
                .push(")");
        }
        if let Some(ids) = &filter.process_ids {
            query
                .push(" AND bk_process_id = ANY(")
                .push_bind(ids.clone())
                .push(")");
        }
        query.push(" ORDER BY bk_process_id");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list process instance relations")?;

        rows.iter().map(relation_from_row).collect()
    }

    async fn get_process_instance(&self, id: Id) -> Result<Option<ProcessInstance>> {
        let row = sqlx::query(
            "SELECT bk_process_id, bk_biz_id, attributes, created_at, updated_at \
             FROM process_instances WHERE bk_process_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch process instance")?;

        row.as_ref().map(process_from_row).transpose()
    }

    async fn list_process_instances(&self, ids: &[Id]) -> Result<Vec<ProcessInstance>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT bk_process_id, bk_biz_id, attributes, created_at, updated_at \
             FROM process_instances WHERE bk_process_id = ANY($1) ORDER BY bk_process_id",
        )
        .bind(ids.to_vec())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list process instances")?;

        rows.iter().map(process_from_row).collect()
    }

    async fn create_process_instance(&self, business_id: Id, process: NewProcessInstance) -> Result<Id> {
        let row = sqlx::query(
            "INSERT INTO process_instances (bk_biz_id, attributes) VALUES ($1, $2) \
             RETURNING bk_process_id",
        )
        .bind(business_id)
        .bind(Json(&process.attributes))
        .fetch_one(&self.pool)
        .await
        .context("Failed to create process instance")?;

        Ok(row.try_get("bk_process_id")?)
    }

    async fn update_process_instance(&self, id: Id, process: NewProcessInstance) -> Result<()> {
        let result = sqlx::query(
            "UPDATE process_instances SET attributes = $2, updated_at = NOW() WHERE bk_process_id = $1",
        )
        .bind(id)
        .bind(Json(&process.attributes))
        .execute(&self.pool)
        .await
        .context("Failed to update process instance")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("process instance {} not found", id));
        }
        Ok(())
    }

    async fn delete_process_instance(&self, id: Id) -> Result<()> {
        sqlx::query("DELETE FROM process_instances WHERE bk_process_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete process instance")?;
        Ok(())
    }

    async fn delete_process_instances(&self, business_id: Id, ids: &[Id]) -> Result<()> {
        sqlx::query("DELETE FROM process_instances WHERE bk_biz_id = $1 AND bk_process_id = ANY($2)")
            .bind(business_id)
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await
            .context("Failed to delete process instances")?;
        Ok(())
    }

    async fn create_process_instance_relation(
        &self,
        relation: ProcessInstanceRelation,
    ) -> Result<ProcessInstanceRelation> {
        sqlx::query(
            "INSERT INTO process_instance_relations \
             (bk_process_id, bk_biz_id, service_instance_id, process_template_id, bk_host_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(relation.process_id)
        .bind(relation.business_id)
        .bind(relation.service_instance_id)
        .bind(relation.process_template_id)
        .bind(relation.host_id)
        .execute(&self.pool)
        .await
        .context("Failed to create process instance relation")?;

        Ok(relation)
    }

    async fn delete_process_instance_relation(&self, process_id: Id) -> Result<()> {
        sqlx::query("DELETE FROM process_instance_relations WHERE bk_process_id = $1")
            .bind(process_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete process instance relation")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ServiceInstanceStore for PostgresStore {
    async fn list_service_instances(
        &self,
        business_id: Id,
        filter: &ServiceInstanceFilter,
        page: Page,
    ) -> Result<Vec<ServiceInstance>> {
        let mut query = QueryBuilder::<Postgres>::new(
            "SELECT id, bk_biz_id, name, bk_module_id, service_template_id, bk_host_id, created_at \
             FROM service_instances WHERE bk_biz_id = ",
        );
        query.push_bind(business_id);
        if let Some(module_id) = filter.module_id {
            query.push(" AND bk_module_id = ").push_bind(module_id);
        }
        if let Some(template_id) = filter.service_template_id {
            query.push(" AND service_template_id = ").push_bind(template_id);
        }
        if let Some(ids) = &filter.service_instance_ids {
            query.push(" AND id = ANY(").push_bind(ids.clone()).push(")");
        }
        query
            .push(" ORDER BY id LIMIT ")
            .push_bind(clamp(page.limit))
            .push(" OFFSET ")
            .push_bind(clamp(page.start));

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .context("Failed to list service instances")?;

        rows.iter().map(service_instance_from_row).collect()
    }

    async fn create_service_instance(
        &self,
        business_id: Id,
        instance: NewServiceInstance,
    ) -> Result<ServiceInstance> {
        let row = sqlx::query(
            "INSERT INTO service_instances (bk_biz_id, name, bk_module_id, service_template_id, bk_host_id) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, bk_biz_id, name, bk_module_id, service_template_id, bk_host_id, created_at",
        )
        .bind(business_id)
        .bind(&instance.name)
        .bind(instance.module_id)
        .bind(instance.service_template_id)
        .bind(instance.host_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create service instance")?;

        service_instance_from_row(&row)
    }

    async fn delete_service_instance(&self, id: Id) -> Result<()> {
        let result = sqlx::query("DELETE FROM service_instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete service instance")?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("service instance {} not found", id));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TopologyStore for PostgresStore {
    async fn load_model_topology(&self) -> Result<ModelTopologyNode> {
        let rows = sqlx::query("SELECT bk_obj_id, bk_parent_obj_id FROM mainline_model")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load mainline model")?;

        let edges = rows
            .iter()
            .map(|row| {
                Ok(ModelTopologyEdge {
                    object_id: row.try_get("bk_obj_id")?,
                    parent_object_id: row.try_get("bk_parent_obj_id")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        model_tree_from_edges(&edges)
            .ok_or_else(|| anyhow!("mainline model must have exactly one root, got {} rows", edges.len()))
    }

    async fn load_instances_at_level(
        &self,
        business_id: Id,
        object_id: &str,
    ) -> Result<Vec<MainlineInstance>> {
        let business_column = if object_id == OBJ_BUSINESS {
            "bk_inst_id"
        } else {
            "bk_biz_id"
        };
        let sql = format!(
            "SELECT bk_obj_id, bk_inst_id, bk_inst_name, bk_biz_id, bk_parent_id, detail \
             FROM mainline_instances WHERE bk_obj_id = $1 AND {} = $2 ORDER BY bk_inst_id",
            business_column
        );
        let rows = sqlx::query(&sql)
            .bind(object_id)
            .bind(business_id)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("Failed to load {} instances", object_id))?;

        rows.iter()
            .map(|row| {
                let detail: Json<serde_json::Map<String, serde_json::Value>> = row.try_get("detail")?;
                Ok(MainlineInstance {
                    object_id: row.try_get("bk_obj_id")?,
                    instance_id: row.try_get("bk_inst_id")?,
                    name: row.try_get("bk_inst_name")?,
                    business_id: row.try_get("bk_biz_id")?,
                    parent_id: row.try_get("bk_parent_id")?,
                    detail: detail.0,
                })
            })
            .collect()
    }
}

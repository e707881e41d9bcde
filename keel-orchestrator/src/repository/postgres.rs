//! PostgreSQL Store
//!
//! Handles all database operations for templates, instance trees and workers.
//! Schema lives in `db::run_migrations`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::domain::instance::{
    ActionInstance, PipelineInstance, StageInstance, UNSAVED_ID, WorkflowInstance,
};
use keel_core::domain::status::{INPROGRESS, NEW, READY, Status, StatusType, WARNING};
use keel_core::domain::template::{
    ActionTemplate, PipelineTemplate, StageTemplate, WorkflowTemplate,
};
use keel_core::domain::work::{Slice, WorkRequest};
use keel_core::domain::worker::{Worker, WorkerStatus};
use keel_core::dto::worker::RegisterWorker;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap};

use super::{Store, StoreError, action_changed};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ACTION_INSTANCE_COLUMNS: &str = r#"
    id, workflow_instance_id, pipeline_instance_id, action_id, order_index, status_id,
    slice_index, slice_total, assigned_to, start_date, end_date, manual,
    callback_required, output
"#;

const WORK_COLUMNS: &str = r#"
    ai.id AS action_instance_id, ai.pipeline_instance_id, ai.workflow_instance_id,
    ai.action_id, a.cmd, a.executable, a.args, a.grain, a.environment,
    ai.slice_index, ai.slice_total, ai.order_index, pi.priority, pi.created_date,
    pi.parameters
"#;

const WORK_ORDER: &str = r#"
    ORDER BY pi.priority DESC, pi.created_date ASC, pi.id ASC,
             ai.order_index ASC, ai.slice_index ASC
"#;

#[async_trait]
impl Store for PgStore {
    async fn list_statuses(&self) -> Result<Vec<Status>, StoreError> {
        let rows = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT id, status_type, display_name, active
            FROM statuses
            WHERE id > $1
            ORDER BY id
            "#,
        )
        .bind(WARNING)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Status::try_from).collect()
    }

    async fn find_template(
        &self,
        pipeline_id: i64,
    ) -> Result<Option<PipelineTemplate>, StoreError> {
        let Some(pipeline) = sqlx::query_as::<_, NamedRow>(
            "SELECT id, name, 0::BIGINT AS parent_id, 0 AS order_index FROM pipelines WHERE id = $1",
        )
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let stages = sqlx::query_as::<_, NamedRow>(
            r#"
            SELECT id, name, pipeline_id AS parent_id, order_index
            FROM stages
            WHERE pipeline_id = $1
            ORDER BY order_index, id
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        let workflows = sqlx::query_as::<_, NamedRow>(
            r#"
            SELECT w.id, w.name, w.stage_id AS parent_id, w.order_index
            FROM workflows w
            JOIN stages s ON s.id = w.stage_id
            WHERE s.pipeline_id = $1
            ORDER BY w.order_index, w.id
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        let actions = sqlx::query_as::<_, ActionRow>(
            r#"
            SELECT a.id, a.workflow_id, a.name, a.order_index, a.cmd, a.executable,
                   a.args, a.manual, a.callback_required, a.grain, a.slices,
                   a.environment
            FROM actions a
            JOIN workflows w ON w.id = a.workflow_id
            JOIN stages s ON s.id = w.stage_id
            WHERE s.pipeline_id = $1
            ORDER BY a.order_index, a.id
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        let mut actions_by_workflow: BTreeMap<i64, Vec<ActionTemplate>> = BTreeMap::new();
        for row in actions {
            let workflow_id = row.workflow_id;
            actions_by_workflow
                .entry(workflow_id)
                .or_default()
                .push(row.into());
        }

        let mut workflows_by_stage: BTreeMap<i64, Vec<WorkflowTemplate>> = BTreeMap::new();
        for row in workflows {
            workflows_by_stage
                .entry(row.parent_id)
                .or_default()
                .push(WorkflowTemplate {
                    id: row.id,
                    name: row.name,
                    order: row.order_index,
                    actions: actions_by_workflow.remove(&row.id).unwrap_or_default(),
                });
        }

        let stages = stages
            .into_iter()
            .map(|row| StageTemplate {
                id: row.id,
                name: row.name,
                order: row.order_index,
                workflows: workflows_by_stage.remove(&row.id).unwrap_or_default(),
            })
            .collect();

        Ok(Some(PipelineTemplate {
            id: pipeline.id,
            name: pipeline.name,
            stages,
        }))
    }

    async fn load_tree(
        &self,
        pipeline_instance_id: i64,
    ) -> Result<Option<PipelineInstance>, StoreError> {
        let Some(pipeline) = sqlx::query_as::<_, PipelineInstanceRow>(
            r#"
            SELECT id, pipeline_id, status_id, priority, created_date, start_date,
                   end_date, parameters
            FROM pipeline_instances
            WHERE id = $1
            "#,
        )
        .bind(pipeline_instance_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let stages = sqlx::query_as::<_, StageInstanceRow>(
            r#"
            SELECT id, pipeline_instance_id, stage_id, order_index, status_id,
                   start_date, end_date
            FROM stage_instances
            WHERE pipeline_instance_id = $1
            ORDER BY order_index, id
            "#,
        )
        .bind(pipeline_instance_id)
        .fetch_all(&self.pool)
        .await?;

        let workflows = sqlx::query_as::<_, WorkflowInstanceRow>(
            r#"
            SELECT id, stage_instance_id, pipeline_instance_id, workflow_id,
                   order_index, status_id, start_date, end_date
            FROM workflow_instances
            WHERE pipeline_instance_id = $1
            ORDER BY order_index, id
            "#,
        )
        .bind(pipeline_instance_id)
        .fetch_all(&self.pool)
        .await?;

        let actions = sqlx::query_as::<_, ActionInstanceRow>(&format!(
            "SELECT {} FROM action_instances WHERE pipeline_instance_id = $1 \
             ORDER BY order_index, slice_index, id",
            ACTION_INSTANCE_COLUMNS
        ))
        .bind(pipeline_instance_id)
        .fetch_all(&self.pool)
        .await?;

        let mut actions_by_workflow: BTreeMap<i64, Vec<ActionInstance>> = BTreeMap::new();
        for row in actions {
            let workflow_id = row.workflow_instance_id;
            actions_by_workflow
                .entry(workflow_id)
                .or_default()
                .push(row.into());
        }

        let mut workflows_by_stage: BTreeMap<i64, Vec<WorkflowInstance>> = BTreeMap::new();
        for row in workflows {
            let mut workflow: WorkflowInstance = row.into();
            workflow.action_instances = actions_by_workflow.remove(&workflow.id).unwrap_or_default();
            workflows_by_stage
                .entry(workflow.stage_instance_id)
                .or_default()
                .push(workflow);
        }

        let mut tree: PipelineInstance = pipeline.into();
        tree.stage_instances = stages
            .into_iter()
            .map(|row| {
                let mut stage: StageInstance = row.into();
                stage.workflow_instances = workflows_by_stage.remove(&stage.id).unwrap_or_default();
                stage
            })
            .collect();

        Ok(Some(tree))
    }

    async fn save_tree(&self, tree: &mut PipelineInstance) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        write_tree(&mut tx, tree, None).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_tree(
        &self,
        before: &PipelineInstance,
        tree: &mut PipelineInstance,
    ) -> Result<Vec<i64>, StoreError> {
        let loaded: HashMap<i64, &ActionInstance> = before.actions().map(|a| (a.id, a)).collect();

        let mut tx = self.pool.begin().await?;
        let skipped = write_tree(&mut tx, tree, Some(&loaded)).await?;
        tx.commit().await?;
        Ok(skipped)
    }

    async fn find_action(
        &self,
        action_instance_id: i64,
    ) -> Result<Option<ActionInstance>, StoreError> {
        let row = sqlx::query_as::<_, ActionInstanceRow>(&format!(
            "SELECT {} FROM action_instances WHERE id = $1",
            ACTION_INSTANCE_COLUMNS
        ))
        .bind(action_instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn ready_work(&self) -> Result<Vec<WorkRequest>, StoreError> {
        let rows = sqlx::query_as::<_, WorkRow>(&format!(
            r#"
            SELECT {}
            FROM action_instances ai
            JOIN pipeline_instances pi ON pi.id = ai.pipeline_instance_id
            JOIN actions a ON a.id = ai.action_id
            WHERE ai.status_id = $1
              AND ai.manual = FALSE
              AND pi.status_id = $2
            {}
            "#,
            WORK_COLUMNS, WORK_ORDER
        ))
        .bind(READY)
        .bind(INPROGRESS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn stalled_work(&self) -> Result<Vec<WorkRequest>, StoreError> {
        let rows = sqlx::query_as::<_, WorkRow>(&format!(
            r#"
            SELECT {}
            FROM action_instances ai
            JOIN pipeline_instances pi ON pi.id = ai.pipeline_instance_id
            JOIN workflow_instances wi ON wi.id = ai.workflow_instance_id
            JOIN actions a ON a.id = ai.action_id
            WHERE ai.status_id = $1
              AND ai.manual = FALSE
              AND pi.status_id = $2
              AND wi.status_id = $2
              AND NOT EXISTS (
                  SELECT 1
                  FROM action_instances prior
                  WHERE prior.workflow_instance_id = ai.workflow_instance_id
                    AND prior.order_index < ai.order_index
                    AND prior.status_id <= $2
              )
            {}
            "#,
            WORK_COLUMNS, WORK_ORDER
        ))
        .bind(NEW)
        .bind(INPROGRESS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn claim_action(
        &self,
        action_instance_id: i64,
        assigned_to: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE action_instances
            SET status_id = $1, assigned_to = $2, start_date = $3, end_date = NULL
            WHERE id = $4 AND status_id IN ($5, $6)
            "#,
        )
        .bind(INPROGRESS)
        .bind(assigned_to)
        .bind(Utc::now())
        .bind(action_instance_id)
        .bind(NEW)
        .bind(READY)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_assignment(
        &self,
        action_instance_id: i64,
        assigned_to: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE action_instances SET assigned_to = $1 WHERE id = $2")
            .bind(assigned_to)
            .bind(action_instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn release_action(&self, action_instance_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE action_instances
            SET status_id = $1, assigned_to = NULL, start_date = NULL
            WHERE id = $2 AND status_id = $3
            "#,
        )
        .bind(READY)
        .bind(action_instance_id)
        .bind(INPROGRESS)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn stale_in_progress(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ActionInstance>, StoreError> {
        let rows = sqlx::query_as::<_, ActionInstanceRow>(&format!(
            "SELECT {} FROM action_instances \
             WHERE status_id = $1 AND end_date IS NULL \
               AND (start_date IS NULL OR start_date < $2) \
             ORDER BY start_date",
            ACTION_INSTANCE_COLUMNS
        ))
        .bind(INPROGRESS)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn register_worker(&self, req: &RegisterWorker) -> Result<Worker, StoreError> {
        let row = sqlx::query_as::<_, WorkerRow>(
            r#"
            INSERT INTO workers (address, grains, registered_at, last_heartbeat_at, status)
            VALUES ($1, $2, $3, $3, $4)
            ON CONFLICT (address) DO UPDATE SET
                grains = EXCLUDED.grains,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                status = EXCLUDED.status
            RETURNING address, grains, registered_at, last_heartbeat_at, status
            "#,
        )
        .bind(&req.address)
        .bind(&req.grains)
        .bind(Utc::now())
        .bind(WorkerStatus::Online.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn heartbeat_worker(&self, address: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workers
            SET last_heartbeat_at = $1, status = $2
            WHERE address = $3
            "#,
        )
        .bind(Utc::now())
        .bind(WorkerStatus::Online.to_string())
        .bind(address)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query_as::<_, WorkerRow>(
            r#"
            SELECT address, grains, registered_at, last_heartbeat_at, status
            FROM workers
            ORDER BY registered_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn set_worker_status(
        &self,
        address: &str,
        status: WorkerStatus,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE workers SET status = $1 WHERE address = $2")
            .bind(status.to_string())
            .bind(address)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn mark_stale_workers_offline(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let offline = WorkerStatus::Offline.to_string();

        let result = sqlx::query(
            r#"
            UPDATE workers
            SET status = $1
            WHERE last_heartbeat_at < $2 AND status != $1
            "#,
        )
        .bind(&offline)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Tree Persistence
// =============================================================================

async fn save_pipeline_instance(
    tx: &mut Transaction<'_, Postgres>,
    tree: &mut PipelineInstance,
) -> Result<(), StoreError> {
    let parameters = serde_json::to_value(&tree.parameters)
        .map_err(|e| StoreError::Corrupt(format!("pipeline parameters: {}", e)))?;

    if tree.id == UNSAVED_ID {
        tree.id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO pipeline_instances
                (pipeline_id, status_id, priority, created_date, start_date, end_date, parameters)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(tree.pipeline_id)
        .bind(tree.status_id)
        .bind(tree.priority)
        .bind(tree.created_date)
        .bind(tree.start_date)
        .bind(tree.end_date)
        .bind(parameters)
        .fetch_one(&mut **tx)
        .await?;

        return Ok(());
    }

    // serializes concurrent writers of the same tree
    sqlx::query("SELECT id FROM pipeline_instances WHERE id = $1 FOR UPDATE")
        .bind(tree.id)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        r#"
        UPDATE pipeline_instances
        SET status_id = $1, priority = $2, start_date = $3, end_date = $4, parameters = $5
        WHERE id = $6
        "#,
    )
    .bind(tree.status_id)
    .bind(tree.priority)
    .bind(tree.start_date)
    .bind(tree.end_date)
    .bind(parameters)
    .bind(tree.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn save_stage_instance(
    tx: &mut Transaction<'_, Postgres>,
    stage: &mut StageInstance,
) -> Result<(), StoreError> {
    if stage.id == UNSAVED_ID {
        stage.id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO stage_instances
                (pipeline_instance_id, stage_id, order_index, status_id, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(stage.pipeline_instance_id)
        .bind(stage.stage_id)
        .bind(stage.order)
        .bind(stage.status_id)
        .bind(stage.start_date)
        .bind(stage.end_date)
        .fetch_one(&mut **tx)
        .await?;

        return Ok(());
    }

    sqlx::query(
        "UPDATE stage_instances SET status_id = $1, start_date = $2, end_date = $3 WHERE id = $4",
    )
    .bind(stage.status_id)
    .bind(stage.start_date)
    .bind(stage.end_date)
    .bind(stage.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

async fn save_workflow_instance(
    tx: &mut Transaction<'_, Postgres>,
    workflow: &mut WorkflowInstance,
) -> Result<(), StoreError> {
    if workflow.id == UNSAVED_ID {
        workflow.id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO workflow_instances
                (stage_instance_id, pipeline_instance_id, workflow_id, order_index,
                 status_id, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(workflow.stage_instance_id)
        .bind(workflow.pipeline_instance_id)
        .bind(workflow.workflow_id)
        .bind(workflow.order)
        .bind(workflow.status_id)
        .bind(workflow.start_date)
        .bind(workflow.end_date)
        .fetch_one(&mut **tx)
        .await?;

        return Ok(());
    }

    sqlx::query(
        "UPDATE workflow_instances SET status_id = $1, start_date = $2, end_date = $3 WHERE id = $4",
    )
    .bind(workflow.status_id)
    .bind(workflow.start_date)
    .bind(workflow.end_date)
    .bind(workflow.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Writes the tree node by node. With `loaded`, action rows follow the
/// `Store::update_tree` rules and the skipped ids are returned.
async fn write_tree(
    tx: &mut Transaction<'_, Postgres>,
    tree: &mut PipelineInstance,
    loaded: Option<&HashMap<i64, &ActionInstance>>,
) -> Result<Vec<i64>, StoreError> {
    let mut skipped = Vec::new();

    save_pipeline_instance(tx, tree).await?;

    for stage in &mut tree.stage_instances {
        stage.pipeline_instance_id = tree.id;
        save_stage_instance(tx, stage).await?;

        for workflow in &mut stage.workflow_instances {
            workflow.stage_instance_id = stage.id;
            workflow.pipeline_instance_id = tree.id;
            save_workflow_instance(tx, workflow).await?;

            for action in &mut workflow.action_instances {
                action.workflow_instance_id = workflow.id;
                action.pipeline_instance_id = tree.id;

                let was = loaded.and_then(|l| l.get(&action.id).copied());
                match was {
                    Some(was) if !action_changed(was, action) => {
                        if let Some(stored) = fetch_action(tx, action.id).await? {
                            *action = stored;
                        }
                    }
                    Some(was) => {
                        if !update_action_if_unchanged(tx, action, was).await? {
                            skipped.push(action.id);
                            if let Some(stored) = fetch_action(tx, action.id).await? {
                                *action = stored;
                            }
                        }
                    }
                    None => save_action_instance(tx, action).await?,
                }
            }
        }
    }

    Ok(skipped)
}

async fn fetch_action(
    tx: &mut Transaction<'_, Postgres>,
    action_instance_id: i64,
) -> Result<Option<ActionInstance>, StoreError> {
    let row = sqlx::query_as::<_, ActionInstanceRow>(&format!(
        "SELECT {} FROM action_instances WHERE id = $1",
        ACTION_INSTANCE_COLUMNS
    ))
    .bind(action_instance_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Compare-and-set write: only applies while the row keeps the status and
/// assignment of `was`
async fn update_action_if_unchanged(
    tx: &mut Transaction<'_, Postgres>,
    action: &ActionInstance,
    was: &ActionInstance,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE action_instances
        SET status_id = $1, assigned_to = $2, start_date = $3, end_date = $4, output = $5
        WHERE id = $6 AND status_id = $7 AND assigned_to IS NOT DISTINCT FROM $8
        "#,
    )
    .bind(action.status_id)
    .bind(&action.assigned_to)
    .bind(action.start_date)
    .bind(action.end_date)
    .bind(&action.output)
    .bind(action.id)
    .bind(was.status_id)
    .bind(&was.assigned_to)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn save_action_instance(
    tx: &mut Transaction<'_, Postgres>,
    action: &mut ActionInstance,
) -> Result<(), StoreError> {
    if action.id == UNSAVED_ID {
        action.id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO action_instances
                (workflow_instance_id, pipeline_instance_id, action_id, order_index, status_id,
                 slice_index, slice_total, assigned_to, start_date, end_date, manual,
                 callback_required, output)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING id
            "#,
        )
        .bind(action.workflow_instance_id)
        .bind(action.pipeline_instance_id)
        .bind(action.action_id)
        .bind(action.order)
        .bind(action.status_id)
        .bind(action.slice.index as i32)
        .bind(action.slice.total as i32)
        .bind(&action.assigned_to)
        .bind(action.start_date)
        .bind(action.end_date)
        .bind(action.manual)
        .bind(action.callback_required)
        .bind(&action.output)
        .fetch_one(&mut **tx)
        .await?;

        return Ok(());
    }

    sqlx::query(
        r#"
        UPDATE action_instances
        SET status_id = $1, assigned_to = $2, start_date = $3, end_date = $4, output = $5
        WHERE id = $6
        "#,
    )
    .bind(action.status_id)
    .bind(&action.assigned_to)
    .bind(action.start_date)
    .bind(action.end_date)
    .bind(&action.output)
    .bind(action.id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StatusRow {
    id: i32,
    status_type: String,
    display_name: String,
    active: bool,
}

impl TryFrom<StatusRow> for Status {
    type Error = StoreError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        let status_type = StatusType::parse(&row.status_type).ok_or_else(|| {
            StoreError::Corrupt(format!(
                "status {} has unknown type '{}'",
                row.id, row.status_type
            ))
        })?;

        Ok(Status {
            id: row.id,
            status_type,
            display_name: row.display_name,
            active: row.active,
        })
    }
}

/// Pipelines, stages and workflows share this shape
#[derive(sqlx::FromRow)]
struct NamedRow {
    id: i64,
    name: String,
    parent_id: i64,
    order_index: i32,
}

#[derive(sqlx::FromRow)]
struct ActionRow {
    id: i64,
    workflow_id: i64,
    name: String,
    order_index: i32,
    cmd: String,
    executable: String,
    args: serde_json::Value,
    manual: bool,
    callback_required: bool,
    grain: String,
    slices: i32,
    environment: serde_json::Value,
}

impl From<ActionRow> for ActionTemplate {
    fn from(row: ActionRow) -> Self {
        ActionTemplate {
            id: row.id,
            name: row.name,
            order: row.order_index,
            cmd: row.cmd,
            executable: row.executable,
            args: serde_json::from_value(row.args).unwrap_or_default(),
            manual: row.manual,
            callback_required: row.callback_required,
            grain: row.grain,
            slices: row.slices.max(0) as u32,
            environment: serde_json::from_value(row.environment).unwrap_or_default(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct PipelineInstanceRow {
    id: i64,
    pipeline_id: i64,
    status_id: i32,
    priority: i32,
    created_date: DateTime<Utc>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    parameters: serde_json::Value,
}

impl From<PipelineInstanceRow> for PipelineInstance {
    fn from(row: PipelineInstanceRow) -> Self {
        PipelineInstance {
            id: row.id,
            pipeline_id: row.pipeline_id,
            status_id: row.status_id,
            priority: row.priority,
            created_date: row.created_date,
            start_date: row.start_date,
            end_date: row.end_date,
            parameters: serde_json::from_value(row.parameters).unwrap_or_default(),
            stage_instances: vec![],
        }
    }
}

#[derive(sqlx::FromRow)]
struct StageInstanceRow {
    id: i64,
    pipeline_instance_id: i64,
    stage_id: i64,
    order_index: i32,
    status_id: i32,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl From<StageInstanceRow> for StageInstance {
    fn from(row: StageInstanceRow) -> Self {
        StageInstance {
            id: row.id,
            pipeline_instance_id: row.pipeline_instance_id,
            stage_id: row.stage_id,
            order: row.order_index,
            status_id: row.status_id,
            start_date: row.start_date,
            end_date: row.end_date,
            workflow_instances: vec![],
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowInstanceRow {
    id: i64,
    stage_instance_id: i64,
    pipeline_instance_id: i64,
    workflow_id: i64,
    order_index: i32,
    status_id: i32,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
}

impl From<WorkflowInstanceRow> for WorkflowInstance {
    fn from(row: WorkflowInstanceRow) -> Self {
        WorkflowInstance {
            id: row.id,
            stage_instance_id: row.stage_instance_id,
            pipeline_instance_id: row.pipeline_instance_id,
            workflow_id: row.workflow_id,
            order: row.order_index,
            status_id: row.status_id,
            start_date: row.start_date,
            end_date: row.end_date,
            action_instances: vec![],
        }
    }
}

#[derive(sqlx::FromRow)]
struct ActionInstanceRow {
    id: i64,
    workflow_instance_id: i64,
    pipeline_instance_id: i64,
    action_id: i64,
    order_index: i32,
    status_id: i32,
    slice_index: i32,
    slice_total: i32,
    assigned_to: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    manual: bool,
    callback_required: bool,
    output: Option<serde_json::Value>,
}

impl From<ActionInstanceRow> for ActionInstance {
    fn from(row: ActionInstanceRow) -> Self {
        ActionInstance {
            id: row.id,
            workflow_instance_id: row.workflow_instance_id,
            pipeline_instance_id: row.pipeline_instance_id,
            action_id: row.action_id,
            order: row.order_index,
            status_id: row.status_id,
            slice: Slice::new(row.slice_index.max(1) as u32, row.slice_total.max(1) as u32),
            assigned_to: row.assigned_to,
            start_date: row.start_date,
            end_date: row.end_date,
            manual: row.manual,
            callback_required: row.callback_required,
            output: row.output,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkRow {
    action_instance_id: i64,
    pipeline_instance_id: i64,
    workflow_instance_id: i64,
    action_id: i64,
    cmd: String,
    executable: String,
    args: serde_json::Value,
    grain: String,
    environment: serde_json::Value,
    slice_index: i32,
    slice_total: i32,
    order_index: i32,
    priority: i32,
    created_date: DateTime<Utc>,
    parameters: serde_json::Value,
}

impl From<WorkRow> for WorkRequest {
    fn from(row: WorkRow) -> Self {
        let mut environment: BTreeMap<String, String> =
            serde_json::from_value(row.parameters).unwrap_or_default();
        let overrides: BTreeMap<String, String> =
            serde_json::from_value(row.environment).unwrap_or_default();
        environment.extend(overrides);

        WorkRequest {
            action_instance_id: row.action_instance_id,
            pipeline_instance_id: row.pipeline_instance_id,
            workflow_instance_id: row.workflow_instance_id,
            action_id: row.action_id,
            cmd: row.cmd,
            executable: row.executable,
            args: serde_json::from_value(row.args).unwrap_or_default(),
            grain: row.grain,
            slice: Slice::new(row.slice_index.max(1) as u32, row.slice_total.max(1) as u32),
            order: row.order_index,
            priority: row.priority,
            pipeline_created: row.created_date,
            environment,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WorkerRow {
    address: String,
    grains: Vec<String>,
    registered_at: DateTime<Utc>,
    last_heartbeat_at: DateTime<Utc>,
    status: String,
}

impl From<WorkerRow> for Worker {
    fn from(row: WorkerRow) -> Self {
        Worker {
            address: row.address,
            grains: row.grains,
            registered_at: row.registered_at,
            last_heartbeat_at: row.last_heartbeat_at,
            status: WorkerStatus::parse(&row.status),
        }
    }
}

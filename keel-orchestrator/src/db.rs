use keel_core::domain::status::{NEW, StatusCatalog, WARNING};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Status catalog
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS statuses (
            id INTEGER PRIMARY KEY,
            status_type VARCHAR(20) NOT NULL,
            display_name VARCHAR(255) NOT NULL,
            active BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    let builtin = StatusCatalog::builtin();
    for id in NEW..=WARNING {
        if let Some(status) = builtin.get(id) {
            sqlx::query(
                r#"
                INSERT INTO statuses (id, status_type, display_name, active)
                VALUES ($1, $2, $3, TRUE)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(status.id)
            .bind(status.status_type.as_str())
            .bind(&status.display_name)
            .execute(pool)
            .await?;
        }
    }

    // Templates
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id BIGSERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stages (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            order_index INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflows (
            id BIGSERIAL PRIMARY KEY,
            stage_id BIGINT NOT NULL REFERENCES stages(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            order_index INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS actions (
            id BIGSERIAL PRIMARY KEY,
            workflow_id BIGINT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            order_index INTEGER NOT NULL,
            cmd TEXT NOT NULL,
            executable VARCHAR(255) NOT NULL,
            args JSONB NOT NULL DEFAULT '[]',
            manual BOOLEAN NOT NULL DEFAULT FALSE,
            callback_required BOOLEAN NOT NULL DEFAULT TRUE,
            grain VARCHAR(255) NOT NULL,
            slices INTEGER NOT NULL DEFAULT 1,
            environment JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Instance tree
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_instances (
            id BIGSERIAL PRIMARY KEY,
            pipeline_id BIGINT NOT NULL REFERENCES pipelines(id),
            status_id INTEGER NOT NULL REFERENCES statuses(id),
            priority INTEGER NOT NULL DEFAULT 0,
            created_date TIMESTAMPTZ NOT NULL,
            start_date TIMESTAMPTZ,
            end_date TIMESTAMPTZ,
            parameters JSONB NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_instances (
            id BIGSERIAL PRIMARY KEY,
            pipeline_instance_id BIGINT NOT NULL REFERENCES pipeline_instances(id),
            stage_id BIGINT NOT NULL REFERENCES stages(id),
            order_index INTEGER NOT NULL,
            status_id INTEGER NOT NULL REFERENCES statuses(id),
            start_date TIMESTAMPTZ,
            end_date TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_instances (
            id BIGSERIAL PRIMARY KEY,
            stage_instance_id BIGINT NOT NULL REFERENCES stage_instances(id),
            pipeline_instance_id BIGINT NOT NULL REFERENCES pipeline_instances(id),
            workflow_id BIGINT NOT NULL REFERENCES workflows(id),
            order_index INTEGER NOT NULL,
            status_id INTEGER NOT NULL REFERENCES statuses(id),
            start_date TIMESTAMPTZ,
            end_date TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS action_instances (
            id BIGSERIAL PRIMARY KEY,
            workflow_instance_id BIGINT NOT NULL REFERENCES workflow_instances(id),
            pipeline_instance_id BIGINT NOT NULL REFERENCES pipeline_instances(id),
            action_id BIGINT NOT NULL REFERENCES actions(id),
            order_index INTEGER NOT NULL,
            status_id INTEGER NOT NULL REFERENCES statuses(id),
            slice_index INTEGER NOT NULL DEFAULT 1,
            slice_total INTEGER NOT NULL DEFAULT 1,
            assigned_to VARCHAR(255),
            start_date TIMESTAMPTZ,
            end_date TIMESTAMPTZ,
            manual BOOLEAN NOT NULL DEFAULT FALSE,
            callback_required BOOLEAN NOT NULL DEFAULT TRUE,
            output JSONB
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the work selector and liveness queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pipeline_instances_status ON pipeline_instances(status_id, priority DESC, created_date)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_action_instances_status ON action_instances(status_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_action_instances_workflow ON action_instances(workflow_instance_id, order_index)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_action_instances_pipeline ON action_instances(pipeline_instance_id)",
    )
    .execute(pool)
    .await?;

    // Push workers
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workers (
            address VARCHAR(255) PRIMARY KEY,
            grains TEXT[] NOT NULL,
            registered_at TIMESTAMPTZ NOT NULL,
            last_heartbeat_at TIMESTAMPTZ NOT NULL,
            status VARCHAR(50) NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_workers_last_heartbeat ON workers(last_heartbeat_at)",
    )
    .execute(pool)
    .await?;

    // Concurrency markers shared by every scheduler process
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS markers (
            key VARCHAR(255) PRIMARY KEY,
            owner VARCHAR(64) NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}

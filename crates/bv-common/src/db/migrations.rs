use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

use crate::db::PgPool;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration: {0}")]
    Postgres(#[from] PgError),
}

struct Migration {
    id: i32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        description: "projects, documents, items and the edit ledger",
        sql: r#"
CREATE TABLE IF NOT EXISTS bidvet.projects (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL,
    organization_id UUID,
    name TEXT NOT NULL,
    trade_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'complete', 'error')),
    status_message TEXT,
    breakdown_template_id UUID,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS bidvet.organization_members (
    organization_id UUID NOT NULL,
    user_id UUID NOT NULL,
    PRIMARY KEY (organization_id, user_id)
);

CREATE TABLE IF NOT EXISTS bidvet.bid_documents (
    id UUID PRIMARY KEY,
    project_id UUID NOT NULL REFERENCES bidvet.projects(id) ON DELETE CASCADE,
    contractor_name TEXT NOT NULL,
    file_ref TEXT NOT NULL,
    file_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'uploaded'
        CHECK (status IN ('uploaded', 'processed', 'error')),
    status_message TEXT,
    raw_text TEXT,
    position_map JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS bidvet.extracted_items (
    id UUID PRIMARY KEY,
    document_id UUID NOT NULL REFERENCES bidvet.bid_documents(id) ON DELETE CASCADE,
    line_number INTEGER NOT NULL,
    description TEXT NOT NULL,
    category TEXT,
    quantity DOUBLE PRECISION,
    unit TEXT,
    unit_price DOUBLE PRECISION,
    total_price DOUBLE PRECISION,
    is_exclusion BOOLEAN NOT NULL DEFAULT false,
    is_inclusion BOOLEAN NOT NULL DEFAULT false,
    confidence DOUBLE PRECISION NOT NULL
        CHECK (confidence >= 0.0 AND confidence <= 1.0),
    confidence_tier TEXT NOT NULL CHECK (confidence_tier IN ('low', 'medium', 'high')),
    user_modified BOOLEAN NOT NULL DEFAULT false,
    is_baseline BOOLEAN NOT NULL DEFAULT false,
    leveled_price DOUBLE PRECISION,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- No foreign key: the ledger outlives items replaced by re-analysis.
CREATE TABLE IF NOT EXISTS bidvet.item_edit_history (
    id UUID PRIMARY KEY,
    seq BIGSERIAL NOT NULL UNIQUE,
    item_id UUID NOT NULL,
    user_id UUID NOT NULL,
    field_name TEXT NOT NULL,
    old_value JSONB NOT NULL,
    new_value JSONB NOT NULL,
    change_reason TEXT,
    batch_id TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#,
    },
    Migration {
        id: 2,
        description: "comparison results, breakdown templates, confidence thresholds",
        sql: r#"
CREATE TABLE IF NOT EXISTS bidvet.comparison_results (
    project_id UUID PRIMARY KEY REFERENCES bidvet.projects(id) ON DELETE CASCADE,
    summary_json JSONB NOT NULL,
    recommendation_json JSONB,
    price_low DOUBLE PRECISION,
    price_high DOUBLE PRECISION,
    price_average DOUBLE PRECISION,
    leveling_json JSONB,
    scope_gaps JSONB NOT NULL DEFAULT '[]'::jsonb,
    analysis_run_id TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS bidvet.breakdown_templates (
    id UUID PRIMARY KEY,
    trade_type TEXT NOT NULL,
    name TEXT NOT NULL,
    nodes JSONB NOT NULL,
    use_count BIGINT NOT NULL DEFAULT 0 CHECK (use_count >= 0)
);

CREATE TABLE IF NOT EXISTS bidvet.confidence_thresholds (
    trade_type TEXT PRIMARY KEY,
    low DOUBLE PRECISION NOT NULL,
    medium DOUBLE PRECISION NOT NULL,
    sample_count BIGINT NOT NULL DEFAULT 0,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT chk_threshold_order CHECK (0.0 <= low AND low < medium AND medium <= 1.0)
);
"#,
    },
    Migration {
        id: 3,
        description: "lookup indexes for documents, items and history",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_bid_documents_project_created
    ON bidvet.bid_documents(project_id, created_at, id);
CREATE INDEX IF NOT EXISTS idx_extracted_items_document_line
    ON bidvet.extracted_items(document_id, line_number);
CREATE INDEX IF NOT EXISTS idx_item_edit_history_item_seq
    ON bidvet.item_edit_history(item_id, seq);
CREATE INDEX IF NOT EXISTS idx_breakdown_templates_trade
    ON bidvet.breakdown_templates(lower(trade_type));
"#,
    },
];

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrationError> {
    let mut client = pool.get().await?;
    client
        .batch_execute(
            "CREATE SCHEMA IF NOT EXISTS bidvet;
             CREATE TABLE IF NOT EXISTS bidvet.schema_migrations (
                id INTEGER PRIMARY KEY,
                description TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
             );",
        )
        .await?;

    for migration in MIGRATIONS {
        let already_applied: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM bidvet.schema_migrations WHERE id = $1)",
                &[&migration.id],
            )
            .await?
            .get(0);

        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO bidvet.schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        info!(
            id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_ids_are_strictly_increasing() {
        let ids: Vec<i32> = MIGRATIONS.iter().map(|m| m.id).collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(MIGRATIONS.iter().all(|m| m.sql.contains("bidvet.")));
    }
}

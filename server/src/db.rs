pub mod schema;

use self::schema::{encode_u256, BidRow, DbJobStatus, JobRow};
use anyhow::Result;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use lifecycle::{
    Bid, Job, JobFilter, JobId, LedgerIntent, NewBid, NewJob, RecordStore, StoreError, UserId,
};
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::Json,
    Executor,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Clone)]
pub struct DBConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl DBConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.dbname
        )
    }
}

#[derive(Clone)]
pub struct DB {
    pub pool: PgPool,
}

impl DB {
    pub async fn new(config: DBConfig) -> Result<Self> {
        let connection_string = config.connection_string();
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&connection_string)
            .await?;
        Ok(Self { pool })
    }

    pub async fn new_from_environment() -> Result<Self> {
        let db_config = DBConfig {
            host: std::env::var("DB_HOST")?,
            port: std::env::var("DB_PORT")?.parse()?,
            user: std::env::var("DB_USER")?,
            password: std::env::var("DB_PASSWORD")?,
            dbname: std::env::var("DB_NAME")?,
        };
        Self::new(db_config).await
    }
}

pub async fn create_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create ENUM type
    pool.execute(sqlx::query(
        r#"
        DO $$ BEGIN
            IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'job_status') THEN
                CREATE TYPE job_status AS ENUM (
                    'open',
                    'awaiting_payment',
                    'in_escrow',
                    'submitted',
                    'revision_requested',
                    'complete',
                    'disputed',
                    'resolved'
                );
            END IF;
        END $$;
    "#,
    ))
    .await?;

    // Create Jobs table
    pool.execute(sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            client_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            budget BYTEA NOT NULL,
            deadline TIMESTAMPTZ NOT NULL,
            category TEXT NOT NULL,
            skills TEXT[] NOT NULL DEFAULT '{}',
            status job_status NOT NULL,
            selected_bid_id BIGINT,
            escrow_funded BOOLEAN NOT NULL DEFAULT FALSE,
            escrow_tx_ref TEXT,
            completion_tx_ref TEXT,
            work_content TEXT,
            work_submitted_at TIMESTAMPTZ,
            revision_note TEXT,
            dispute_reason TEXT,
            pending_ledger_op JSONB,
            integrity_fault TEXT,
            created_at TIMESTAMPTZ NOT NULL,
            version BIGINT NOT NULL
        )
    "#,
    ))
    .await?;

    // Create Bids table
    pool.execute(sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bids (
            id BIGSERIAL PRIMARY KEY,
            job_id BIGINT NOT NULL REFERENCES jobs (id),
            freelancer_id TEXT NOT NULL,
            payout_address BYTEA NOT NULL,
            amount BYTEA NOT NULL,
            delivery_days INTEGER NOT NULL,
            proposal TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (job_id, freelancer_id)
        )
    "#,
    ))
    .await?;

    // Create indexes
    pool.execute(sqlx::query(
        r#"
        DO $$ BEGIN
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
            CREATE INDEX IF NOT EXISTS idx_jobs_client_id ON jobs (client_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at);
            CREATE INDEX IF NOT EXISTS idx_bids_job_id ON bids (job_id);
        END $$;
    "#,
    ))
    .await?;

    // Wake the reconciler whenever a ledger intent is recorded
    pool.execute(sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION notify_ledger_pending() RETURNS trigger AS $$
        BEGIN
            IF NEW.pending_ledger_op IS NOT NULL AND OLD.pending_ledger_op IS NULL THEN
                PERFORM pg_notify('ledger_pending', NEW.id::text);
            END IF;
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql;
    "#,
    ))
    .await?;

    pool.execute(sqlx::query(
        r#"
        DO $$ BEGIN
            IF NOT EXISTS (SELECT 1 FROM pg_trigger WHERE tgname = 'jobs_ledger_pending') THEN
                CREATE TRIGGER jobs_ledger_pending
                    AFTER UPDATE OF pending_ledger_op ON jobs
                    FOR EACH ROW EXECUTE FUNCTION notify_ledger_pending();
            END IF;
        END $$;
    "#,
    ))
    .await?;

    Ok(())
}

const JOB_COLUMNS: &str = r#"
    id, client_id, title, description, budget, deadline, category, skills,
    status, selected_bid_id, escrow_funded, escrow_tx_ref, completion_tx_ref,
    work_content, work_submitted_at, revision_note, dispute_reason,
    pending_ledger_op, integrity_fault, created_at, version
"#;

const BID_COLUMNS: &str = r#"
    id, job_id, freelancer_id, payout_address, amount, delivery_days, proposal, created_at
"#;

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Postgres-backed `RecordStore`. Optimistic concurrency is a conditional
/// `UPDATE ... WHERE version = $expected`.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    async fn load_bids(&self, ids: &[i64]) -> Result<HashMap<i64, Vec<Bid>>, StoreError> {
        let rows: Vec<BidRow> = sqlx::query_as(&format!(
            "SELECT {} FROM bids WHERE job_id = ANY($1) ORDER BY job_id, id",
            BID_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        let mut grouped = HashMap::new();
        for (job_id, rows) in &rows.into_iter().chunk_by(|r| r.job_id) {
            let bids = rows.map(Bid::try_from).collect::<Result<Vec<_>, _>>()?;
            grouped.entry(job_id).or_insert_with(Vec::new).extend(bids);
        }
        Ok(grouped)
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM jobs WHERE id = $1)")
            .bind(id.0 as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)
    }
}

impl RecordStore for PgStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let row: JobRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO jobs (
                client_id, title, description, budget, deadline, category,
                skills, status, created_at, version
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, 1
            )
            RETURNING {}
        "#,
            JOB_COLUMNS
        ))
        .bind(job.client_id.as_str())
        .bind(&job.title)
        .bind(&job.description)
        .bind(encode_u256(job.budget))
        .bind(job.deadline)
        .bind(&job.category)
        .bind(job.skills.iter().cloned().collect::<Vec<_>>())
        .bind(DbJobStatus::Open)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        debug!(job_id = row.id, "job inserted");
        row.into_job(Vec::new())
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM jobs WHERE id = $1", JOB_COLUMNS))
                .bind(id.0 as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        let row = row.ok_or(StoreError::NotFound(id))?;
        let bids = self.load_bids(&[row.id]).await?.remove(&row.id);
        row.into_job(bids.unwrap_or_default())
    }

    async fn compare_and_set(
        &self,
        id: JobId,
        expected_version: u64,
        job: Job,
    ) -> Result<Job, StoreError> {
        let (work_content, work_submitted_at) = match job.work_submission {
            Some(w) => (Some(w.content), Some(w.submitted_at)),
            None => (None, None),
        };
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE jobs
            SET
                status = $3,
                selected_bid_id = $4,
                escrow_funded = $5,
                escrow_tx_ref = $6,
                completion_tx_ref = $7,
                work_content = $8,
                work_submitted_at = $9,
                revision_note = $10,
                dispute_reason = $11,
                pending_ledger_op = $12,
                integrity_fault = $13,
                version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {}
        "#,
            JOB_COLUMNS
        ))
        .bind(id.0 as i64)
        .bind(expected_version as i64)
        .bind(DbJobStatus::from(job.status))
        .bind(job.selected_bid_id.map(|b| b.0 as i64))
        .bind(job.escrow_funded)
        .bind(job.escrow_tx_ref.map(|t| t.to_string()))
        .bind(job.completion_tx_ref.map(|t| t.to_string()))
        .bind(work_content)
        .bind(work_submitted_at)
        .bind(job.revision_note)
        .bind(job.dispute_reason)
        .bind(job.pending_ledger_op.map(Json::<LedgerIntent>))
        .bind(job.integrity_fault)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => {
                let bids = self.load_bids(&[row.id]).await?.remove(&row.id);
                row.into_job(bids.unwrap_or_default())
            }
            None if self.exists(id).await? => Err(StoreError::Conflict {
                job: id,
                expected: expected_version,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn append_bid(
        &self,
        id: JobId,
        freelancer: UserId,
        bid: NewBid,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let delivery_days = i32::try_from(bid.delivery_days).map_err(|_| {
            StoreError::Backend(format!(
                "delivery days {} do not fit the bids table",
                bid.delivery_days
            ))
        })?;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // Row lock plus version bump: concurrent selectBid CAS fails.
        let status: Option<DbJobStatus> = sqlx::query_scalar(
            "UPDATE jobs SET version = version + 1 WHERE id = $1 AND status = 'open' RETURNING status",
        )
        .bind(id.0 as i64)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;
        if status.is_none() {
            let current: Option<DbJobStatus> =
                sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                    .bind(id.0 as i64)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(backend)?;
            return Err(match current {
                Some(status) => StoreError::Closed {
                    job: id,
                    status: status.into(),
                },
                None => StoreError::NotFound(id),
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO bids (
                job_id, freelancer_id, payout_address, amount,
                delivery_days, proposal, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
        "#,
        )
        .bind(id.0 as i64)
        .bind(freelancer.as_str())
        .bind(bid.payout_address.as_slice())
        .bind(encode_u256(bid.amount))
        .bind(delivery_days)
        .bind(&bid.proposal)
        .bind(now)
        .execute(&mut *tx)
        .await;
        if let Err(e) = inserted {
            let duplicate = e
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation());
            return Err(if duplicate {
                StoreError::Duplicate {
                    job: id,
                    freelancer,
                }
            } else {
                backend(e)
            });
        }

        tx.commit().await.map_err(backend)?;
        self.get(id).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let statuses = filter
            .statuses
            .iter()
            .map(|s| DbJobStatus::from(*s))
            .collect::<Vec<_>>();
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM jobs j
            WHERE (cardinality($1::job_status[]) = 0 OR j.status = ANY($1))
              AND ($2::text IS NULL OR j.client_id = $2)
              AND ($3::text IS NULL OR EXISTS (
                    SELECT 1 FROM bids b
                    WHERE b.id = j.selected_bid_id AND b.freelancer_id = $3
              ))
            ORDER BY j.created_at DESC, j.id DESC
        "#,
            JOB_COLUMNS
        ))
        .bind(statuses)
        .bind(filter.client_id.as_ref().map(UserId::as_str))
        .bind(filter.freelancer_id.as_ref().map(UserId::as_str))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        let ids = rows.iter().map(|r| r.id).collect::<Vec<_>>();
        let mut bids = self.load_bids(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let job_bids = bids.remove(&row.id).unwrap_or_default();
                row.into_job(job_bids)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle::{
        test_utils::{fixture_bid, fixture_job},
        JobStatus,
    };

    async fn test_store() -> anyhow::Result<PgStore> {
        let db = DB::new_from_environment().await?;
        create_schema(&db.pool).await?;
        Ok(PgStore::new(db.pool))
    }

    #[tokio::test]
    #[ignore = "requires postgres instance"]
    async fn stale_versions_are_rejected() -> anyhow::Result<()> {
        let store = test_store().await?;
        let job = store.insert(fixture_job("client"), Utc::now()).await?;
        assert_eq!(job.version, 1);

        let mut next = job.clone();
        next.status = JobStatus::Disputed;
        next.dispute_reason = Some("stalled".into());
        let stored = store.compare_and_set(job.id, 1, next.clone()).await?;
        assert_eq!(stored.version, 2);
        assert_eq!(stored.dispute_reason.as_deref(), Some("stalled"));

        let err = store.compare_and_set(job.id, 1, next).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 1, .. }));
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires postgres instance"]
    async fn one_bid_per_freelancer() -> anyhow::Result<()> {
        let store = test_store().await?;
        let job = store.insert(fixture_job("client"), Utc::now()).await?;
        let job = store
            .append_bid(job.id, "f1".into(), fixture_bid(1), Utc::now())
            .await?;
        assert_eq!(job.bids.len(), 1);
        assert_eq!(job.bids[0].amount, fixture_bid(1).amount);
        assert_eq!(job.version, 2);

        let err = store
            .append_bid(job.id, "f1".into(), fixture_bid(1), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate { .. }));

        let listed = store
            .list(&JobFilter {
                client_id: Some("client".into()),
                ..JobFilter::default()
            })
            .await?;
        assert!(listed.iter().any(|j| j.id == job.id && j.bids.len() == 1));
        Ok(())
    }
}

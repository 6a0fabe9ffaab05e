//! PostgreSQL-backed relationship tuple repository
//!
//! This implementation stores tuples in `rebac_tuples` (see
//! `migrations/0001_rebac_tuples.sql`) with:
//! - A partial unique index enforcing one Active tuple per key
//! - Transaction-scoped advisory locks serializing writes per object and subject
//! - A recursive CTE rejecting `member_of` cycles inside the insert transaction
//! - Tombstones so a grant racing a cascade cannot leave an orphan

use crate::{
    error::RebacError,
    models::*,
    repository::{cascade_sides, LockKey, TupleRepository},
    tree::DeletionHook,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

const COLUMNS: &str = "id, subject_id, subject_type, relation, object_id, object_type, \
                       zone_id, created_at, lifecycle_state, revoked_at";

/// PostgreSQL-backed tuple repository
pub struct PostgresTupleRepository {
    pool: PgPool,
}

impl PostgresTupleRepository {
    /// Create a new PostgreSQL repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create with connection string
    pub async fn from_connection_string(connection_string: &str) -> Result<Self, RebacError> {
        let pool = PgPool::connect(connection_string).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Cascade inside a transaction the caller already holds, so the
    /// caller's own row deletion and the tuple sweep commit together.
    /// Tombstones are written; the caller commits or rolls back.
    ///
    /// Nothing here touches cached decisions. After a successful commit,
    /// hand the swept tuples to `AuthorizationEngine::cascade_committed`.
    pub async fn cascade_in_transaction(
        &self,
        conn: &mut PgConnection,
        target: &CascadeTarget,
        at: DateTime<Utc>,
        policy: RevokePolicy,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        sweep(conn, target, at, policy).await
    }
}

async fn acquire_locks(conn: &mut PgConnection, mut keys: Vec<LockKey>) -> Result<(), RebacError> {
    keys.sort();
    keys.dedup();
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(key.lock_name())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn row_to_tuple(row: &PgRow) -> Result<RelationTuple, RebacError> {
    let subject_type: String = row.try_get("subject_type")?;
    let relation: String = row.try_get("relation")?;
    let object_type: String = row.try_get("object_type")?;
    let state: String = row.try_get("lifecycle_state")?;

    Ok(RelationTuple {
        id: TupleId(row.try_get::<Uuid, _>("id")?),
        subject: SubjectRef {
            subject_type: subject_type.parse()?,
            id: row.try_get("subject_id")?,
        },
        relation: relation.parse()?,
        object: ObjectRef {
            object_type: object_type.parse()?,
            id: row.try_get("object_id")?,
        },
        zone_id: ZoneId(row.try_get("zone_id")?),
        created_at: row.try_get("created_at")?,
        state: LifecycleState::from_columns(&state, row.try_get("revoked_at")?)?,
    })
}

fn rows_to_tuples(rows: &[PgRow]) -> Result<Vec<RelationTuple>, RebacError> {
    rows.iter().map(row_to_tuple).collect()
}

async fn sweep(
    conn: &mut PgConnection,
    target: &CascadeTarget,
    at: DateTime<Utc>,
    policy: RevokePolicy,
) -> Result<Vec<RelationTuple>, RebacError> {
    acquire_locks(&mut *conn, LockKey::for_cascade(target)).await?;
    let (subject, object) = cascade_sides(target);

    let matches = "lifecycle_state = 'active' \
                   AND ((object_type = $1 AND object_id = $2) OR (subject_type = $3 AND subject_id = $4))";
    let sql = match policy {
        RevokePolicy::Retain => format!(
            "UPDATE rebac_tuples SET lifecycle_state = 'deleted', revoked_at = $5 WHERE {} RETURNING {}",
            matches, COLUMNS
        ),
        RevokePolicy::Purge => format!("DELETE FROM rebac_tuples WHERE {} RETURNING {}", matches, COLUMNS),
    };

    let mut query = sqlx::query(&sql)
        .bind(object.as_ref().map(|o| o.object_type.as_str()))
        .bind(object.as_ref().map(|o| o.id.as_str()))
        .bind(subject.as_ref().map(|s| s.subject_type.as_str()))
        .bind(subject.as_ref().map(|s| s.id.as_str()));
    if policy == RevokePolicy::Retain {
        query = query.bind(at);
    }
    let rows = query.fetch_all(&mut *conn).await?;

    let mut swept = rows_to_tuples(&rows)?;
    if policy == RevokePolicy::Purge {
        for tuple in &mut swept {
            tuple.state = LifecycleState::Deleted { at };
        }
    }

    let mut tombstones: Vec<(&str, &str, &str)> = Vec::with_capacity(2);
    if let Some(ref object) = object {
        tombstones.push(("object", object.object_type.as_str(), object.id.as_str()));
    }
    if let Some(ref subject) = subject {
        tombstones.push(("subject", subject.subject_type.as_str(), subject.id.as_str()));
    }
    for (kind, entity_type, entity_id) in tombstones {
        sqlx::query(
            r#"
            INSERT INTO rebac_tombstones (kind, entity_type, entity_id, deleted_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, entity_type, entity_id) DO UPDATE SET deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(kind)
        .bind(entity_type)
        .bind(entity_id)
        .bind(at)
        .execute(&mut *conn)
        .await?;
    }

    debug!("Swept {} tuples for {}", swept.len(), target);
    Ok(swept)
}

#[async_trait]
impl TupleRepository for PostgresTupleRepository {
    async fn insert(&self, tuple: RelationTuple) -> Result<TupleId, RebacError> {
        debug!("Writing tuple to PostgreSQL: {}", tuple);

        let mut tx = self.pool.begin().await?;
        acquire_locks(&mut tx, LockKey::for_tuple(&tuple.subject, tuple.relation, &tuple.object)).await?;

        let tombstoned = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM rebac_tombstones
                WHERE (kind = 'object' AND entity_type = $1 AND entity_id = $2)
                   OR (kind = 'subject' AND entity_type = $3 AND entity_id = $4)
            )
            "#,
        )
        .bind(tuple.object.object_type.as_str())
        .bind(&tuple.object.id)
        .bind(tuple.subject.subject_type.as_str())
        .bind(&tuple.subject.id)
        .fetch_one(&mut *tx)
        .await?;
        if tombstoned {
            return Err(RebacError::NotFound(format!("{} or {} has been deleted", tuple.object, tuple.subject)));
        }

        if tuple.relation == Relation::MemberOf && tuple.subject.subject_type == SubjectType::Group {
            // Walk upward from the target group; reaching the new member closes a loop.
            let cycle = sqlx::query_scalar::<_, bool>(
                r#"
                WITH RECURSIVE reach(group_id) AS (
                    SELECT $1::text
                    UNION
                    SELECT t.object_id
                    FROM rebac_tuples t
                    JOIN reach r ON t.subject_id = r.group_id
                    WHERE t.subject_type = 'group'
                      AND t.relation = 'member_of'
                      AND t.lifecycle_state = 'active'
                )
                SELECT EXISTS(SELECT 1 FROM reach WHERE group_id = $2)
                "#,
            )
            .bind(&tuple.object.id)
            .bind(&tuple.subject.id)
            .fetch_one(&mut *tx)
            .await?;
            if cycle {
                return Err(RebacError::CycleDetected(tuple.key().to_string()));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO rebac_tuples (
                id,
                subject_id, subject_type,
                relation,
                object_id, object_type,
                zone_id,
                created_at,
                lifecycle_state,
                revoked_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'active', NULL)
            "#,
        )
        .bind(tuple.id.0)
        .bind(&tuple.subject.id)
        .bind(tuple.subject.subject_type.as_str())
        .bind(tuple.relation.as_str())
        .bind(&tuple.object.id)
        .bind(tuple.object.object_type.as_str())
        .bind(tuple.zone_id.as_str())
        .bind(tuple.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match RebacError::from(e) {
            RebacError::DuplicateTuple(_) => RebacError::DuplicateTuple(tuple.key().to_string()),
            other => other,
        })?;

        tx.commit().await?;

        info!("Tuple written successfully");
        Ok(tuple.id)
    }

    async fn revoke(
        &self,
        key: &TupleKey,
        at: DateTime<Utc>,
        policy: RevokePolicy,
    ) -> Result<RelationTuple, RebacError> {
        debug!("Revoking tuple in PostgreSQL: {}", key);

        let mut tx = self.pool.begin().await?;
        acquire_locks(&mut tx, LockKey::for_tuple(&key.subject, key.relation, &key.object)).await?;

        let matches = "subject_type = $1 AND subject_id = $2 AND relation = $3 \
                       AND object_type = $4 AND object_id = $5 AND lifecycle_state = 'active'";
        let sql = match policy {
            RevokePolicy::Retain => format!(
                "UPDATE rebac_tuples SET lifecycle_state = 'revoked', revoked_at = $6 WHERE {} RETURNING {}",
                matches, COLUMNS
            ),
            RevokePolicy::Purge => format!("DELETE FROM rebac_tuples WHERE {} RETURNING {}", matches, COLUMNS),
        };

        let mut query = sqlx::query(&sql)
            .bind(key.subject.subject_type.as_str())
            .bind(&key.subject.id)
            .bind(key.relation.as_str())
            .bind(key.object.object_type.as_str())
            .bind(&key.object.id);
        if policy == RevokePolicy::Retain {
            query = query.bind(at);
        }

        let row = query
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| RebacError::NotFound(format!("no active tuple {}", key)))?;
        let mut tuple = row_to_tuple(&row)?;
        if policy == RevokePolicy::Purge {
            tuple.state = LifecycleState::Revoked { at };
        }

        tx.commit().await?;

        info!("Tuple revoked successfully");
        Ok(tuple)
    }

    async fn cascade(
        &self,
        target: &CascadeTarget,
        at: DateTime<Utc>,
        policy: RevokePolicy,
        hook: &dyn DeletionHook,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        let mut tx = self.pool.begin().await?;
        let swept = sweep(&mut tx, target, at, policy).await?;

        if let Err(e) = hook.delete().await {
            warn!("Deletion of {} failed, rolling back cascade", target);
            tx.rollback().await?;
            return Err(RebacError::Internal(e.context(format!("deletion of {} failed", target))));
        }

        if let Err(e) = tx.commit().await {
            // the hook already deleted the entity; its tuples must not outlive it
            warn!("Cascade commit for {} failed after deletion, sweeping again: {}", target, e);
            let mut retry = self.pool.begin().await?;
            let swept = sweep(&mut retry, target, at, policy).await?;
            retry.commit().await?;
            info!("Cascade on {} swept {} tuples on retry", target, swept.len());
            return Ok(swept);
        }

        info!("Cascade on {} swept {} tuples", target, swept.len());
        Ok(swept)
    }

    async fn restore(&self, target: &CascadeTarget) -> Result<(), RebacError> {
        let mut tx = self.pool.begin().await?;
        acquire_locks(&mut tx, LockKey::for_cascade(target)).await?;

        let (subject, object) = cascade_sides(target);
        sqlx::query(
            r#"
            DELETE FROM rebac_tombstones
            WHERE (kind = 'object' AND entity_type = $1 AND entity_id = $2)
               OR (kind = 'subject' AND entity_type = $3 AND entity_id = $4)
            "#,
        )
        .bind(object.as_ref().map(|o| o.object_type.as_str()))
        .bind(object.as_ref().map(|o| o.id.as_str()))
        .bind(subject.as_ref().map(|s| s.subject_type.as_str()))
        .bind(subject.as_ref().map(|s| s.id.as_str()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn read_tuples(
        &self,
        subject: Option<&SubjectRef>,
        relation: Option<Relation>,
        object: Option<&ObjectRef>,
    ) -> Result<Vec<RelationTuple>, RebacError> {
        debug!("Reading tuples: subject={:?}, relation={:?}, object={:?}", subject, relation, object);

        // Build dynamic query based on filters
        let mut query = format!("SELECT {} FROM rebac_tuples WHERE lifecycle_state = 'active'", COLUMNS);
        let mut binds: Vec<String> = Vec::new();

        if let Some(s) = subject {
            binds.push(s.subject_type.as_str().to_string());
            query.push_str(&format!(" AND subject_type = ${}", binds.len()));
            binds.push(s.id.clone());
            query.push_str(&format!(" AND subject_id = ${}", binds.len()));
        }

        if let Some(r) = relation {
            binds.push(r.as_str().to_string());
            query.push_str(&format!(" AND relation = ${}", binds.len()));
        }

        if let Some(o) = object {
            binds.push(o.object_type.as_str().to_string());
            query.push_str(&format!(" AND object_type = ${}", binds.len()));
            binds.push(o.id.clone());
            query.push_str(&format!(" AND object_id = ${}", binds.len()));
        }
        query.push_str(" ORDER BY created_at");

        let mut sqlx_query = sqlx::query(&query);
        for bind in binds {
            sqlx_query = sqlx_query.bind(bind);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        let tuples = rows_to_tuples(&rows)?;

        debug!("Found {} tuples", tuples.len());
        Ok(tuples)
    }

    async fn find_active(&self, key: &TupleKey) -> Result<Option<RelationTuple>, RebacError> {
        let sql = format!(
            "SELECT {} FROM rebac_tuples \
             WHERE subject_type = $1 AND subject_id = $2 AND relation = $3 \
               AND object_type = $4 AND object_id = $5 AND lifecycle_state = 'active'",
            COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(key.subject.subject_type.as_str())
            .bind(&key.subject.id)
            .bind(key.relation.as_str())
            .bind(key.object.object_type.as_str())
            .bind(&key.object.id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_tuple).transpose()
    }

    async fn read_history(&self, object: &ObjectRef) -> Result<Vec<RelationTuple>, RebacError> {
        let sql = format!(
            "SELECT {} FROM rebac_tuples WHERE object_type = $1 AND object_id = $2 ORDER BY created_at",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(object.object_type.as_str())
            .bind(&object.id)
            .fetch_all(&self.pool)
            .await?;
        rows_to_tuples(&rows)
    }
}

//! Convenience macros for working with the outbox.

/// Insert an outbox record within an existing transaction.
///
/// Wraps the common pattern of building a [`NewOutboxRecord`](crate::NewOutboxRecord)
/// and inserting it next to a domain write.
///
/// # Usage
///
/// ```rust,no_run
/// use transactional_outbox::{record_outbox, SqlxOutboxRepository};
/// use sqlx::PgPool;
/// use serde_json::json;
///
/// # async fn example(pool: PgPool, repo: SqlxOutboxRepository) -> Result<(), Box<dyn std::error::Error>> {
/// let mut tx = pool.begin().await?;
///
/// sqlx::query("UPDATE assignments SET enrolled_at = NOW() WHERE id = $1")
///     .bind(42_i64)
///     .execute(&mut *tx)
///     .await?;
///
/// record_outbox!(
///     &mut tx,
///     &repo,
///     "assignment",
///     "7:user_42",
///     "assignment.enrolled",
///     json!({ "experiment_id": 7, "user_id": "user_42" })
/// )?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
///
/// # Arguments
///
/// * `$tx` - Mutable reference to the database transaction
/// * `$repo` - Reference to an [`OutboxRepository`](crate::OutboxRepository) implementation
/// * `$aggregate_type` - Kind of aggregate (e.g. "assignment", "event")
/// * `$aggregate_id` - Aggregate identity string (also the bus partition key)
/// * `$event_type` - Event type string (e.g. "assignment.enrolled")
/// * `$payload` - JSON payload
#[macro_export]
macro_rules! record_outbox {
    ($tx:expr, $repo:expr, $aggregate_type:expr, $aggregate_id:expr, $event_type:expr, $payload:expr) => {{
        use $crate::{NewOutboxRecord, OutboxRepository};

        let record = NewOutboxRecord::new($aggregate_type, $aggregate_id, $event_type, $payload);
        $repo.insert($tx, &record).await
    }};
}

use sqlx::{Postgres, Transaction};

/// Make sure a user row exists for the opaque id; no-op when already present.
///
/// The single-event ingest path calls this inside its transaction so events
/// and assignments always satisfy their user reference. The batch path does
/// not: per-row validation happens above that layer.
pub async fn ensure_user(
    tx: &mut Transaction<'_, Postgres>,
    user_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO users (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

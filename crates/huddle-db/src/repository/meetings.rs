//! Read-only meeting lookups against the web app's schema.
//!
//! The table is created and migrated by the web app (Prisma), which quotes
//! its identifiers, hence `"Meetings"` and `"hostId"`.

use sqlx::PgPool;

/// Find the host's user ID for a meeting, or `None` if the meeting does not exist.
pub async fn find_host_id(pool: &PgPool, meeting_id: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(r#"SELECT "hostId" FROM "Meetings" WHERE id = $1"#)
        .bind(meeting_id)
        .fetch_optional(pool)
        .await
}

use anyhow::Result;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open the shared Postgres connection pool.
///
/// The pool is owned by the process and shared by every worker and
/// request handler; callers close it at shutdown.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await?;
    Ok(pool)
}

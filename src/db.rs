//! Database module
//!
//! Connection and schema checks run at startup; the schema itself lives in
//! raw SQL under migrations/.

use sqlx::PgPool;

/// Tables the application cannot run without.
const REQUIRED_TABLES: &[&str] = &[
    "users",
    "accounts",
    "ledger_entries",
    "idempotency_keys",
    "rate_limit_buckets",
];

/// Round-trip a trivial query to prove the pool can reach the database.
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Report whether every required table is present.
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let expected: Vec<String> = REQUIRED_TABLES.iter().map(|t| t.to_string()).collect();

    let present: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT table_name FROM information_schema.tables
        WHERE table_schema = 'public' AND table_name = ANY($1)
        "#,
    )
    .bind(&expected)
    .fetch_all(pool)
    .await?;

    let mut complete = true;
    for table in REQUIRED_TABLES {
        if !present.iter().any(|p| p == table) {
            tracing::error!(table, "required table is missing");
            complete = false;
        }
    }

    Ok(complete)
}

use sqlx::{postgres::PgPoolOptions, PgPool};

pub async fn setup_pool() -> PgPool {
    dotenvy::dotenv().ok();

    let url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    let mut shared = sqlx::migrate!("../../db/migrations");
    shared.set_ignore_missing(true);
    shared.run(&pool).await.expect("Failed to run shared migrations");
    let mut local = sqlx::migrate!("./db/migrations");
    local.set_ignore_missing(true);
    local.run(&pool).await.expect("Failed to run module migrations");

    for table in ["things", "events_outbox"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&pool)
            .await
            .expect("Failed to clean test tables");
    }

    pool
}

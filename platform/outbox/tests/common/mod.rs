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

    let mut migrator = sqlx::migrate!("../../db/migrations");
    migrator.set_ignore_missing(true);
    migrator.run(&pool).await.expect("Failed to run migrations");

    sqlx::query("DELETE FROM events_outbox")
        .execute(&pool)
        .await
        .expect("Failed to clean events_outbox");

    pool
}

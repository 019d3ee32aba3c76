use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqlitePoolOptions::new();

    // every connection to :memory: is its own database, so keep exactly one alive
    let options = if database_url.contains(":memory:") {
        options
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        options.max_connections(max_connections)
    };

    options.connect(database_url).await
}

pub async fn migrate(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            room_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )",
    )
    .execute(db_pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS messages_room_seq ON messages (room_id, seq)")
        .execute(db_pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS profiles (
            user_id TEXT PRIMARY KEY,
            name TEXT,
            email TEXT
        )",
    )
    .execute(db_pool)
    .await?;

    Ok(())
}

/// In-memory pool with the schema applied. Meant for tests and local
/// tooling; nothing survives the pool being dropped.
pub async fn memory() -> Result<SqlitePool, sqlx::Error> {
    let db_pool = connect("sqlite::memory:", 1).await?;
    migrate(&db_pool).await?;
    Ok(db_pool)
}

//! Shared setup for database tests. Every test gets its own schema and its own copy
//! of the bundled migrations, so scripts can be edited without touching the repo.

#![allow(dead_code)]

use pgcrud::{AppState, Migrator, Settings};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::fs;
use std::path::{Path, PathBuf};

pub struct TestDb {
    pub pool: PgPool,
    pub schema: String,
    pub dir: PathBuf,
    pub settings: Settings,
}

/// `None` when `TEST_DATABASE_URL` is unset; callers skip the test.
pub async fn setup(tag: &str) -> Option<TestDb> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let id = uuid::Uuid::new_v4().simple().to_string();
    let schema = format!("pgcrud_{}_{}", tag, &id[..12]);
    let dir = std::env::temp_dir().join(format!("pgcrud-migrations-{}", id));
    fs::create_dir_all(&dir).unwrap();
    let bundled = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
    for entry in fs::read_dir(bundled).unwrap() {
        let path = entry.unwrap().path();
        fs::copy(&path, dir.join(path.file_name().unwrap())).unwrap();
    }

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect to TEST_DATABASE_URL");
    let settings = Settings::from_lookup(|key| match key {
        "DATABASE_URL" => Some(url.clone()),
        "DB_SCHEMA" => Some(schema.clone()),
        "MIGRATIONS_DIR" => Some(dir.display().to_string()),
        _ => None,
    })
    .unwrap();

    Some(TestDb {
        pool,
        schema,
        dir,
        settings,
    })
}

impl TestDb {
    pub fn migrator(&self) -> Migrator {
        Migrator::new(self.pool.clone(), &self.schema, &self.dir)
    }

    /// Applies the bundled migrations and returns state wired to this schema.
    pub async fn migrated_state(&self) -> AppState {
        let state = AppState::new(self.pool.clone(), &self.settings);
        self.migrator()
            .with_cache(state.schema.clone())
            .apply()
            .await
            .unwrap();
        state
    }

    pub fn write_script(&self, file: &str, body: &str) {
        fs::write(self.dir.join(file), body).unwrap();
    }

    pub async fn teardown(self) {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", self.schema))
            .execute(&self.pool)
            .await
            .unwrap();
        self.pool.close().await;
        let _ = fs::remove_dir_all(&self.dir);
    }
}

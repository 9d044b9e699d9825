//! 数据库连接管理

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use telederm_core::{Result, TeledermError};

/// 数据库连接池
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    /// 按连接串建立连接池
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| TeledermError::Database(e.to_string()))?;
        tracing::info!("Database pool established (max_connections={})", max_connections);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

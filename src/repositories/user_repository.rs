use crate::error::{AppError, Result};
use crate::models::{NewUser, User};
use crate::repositories::DbPool;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Persistence for users.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Persists a new user and returns it with its assigned id.
    async fn save(&self, user: NewUser) -> Result<User>;

    /// Finds a user by id.
    async fn get(&self, id: i64) -> Result<Option<User>>;
}

/// Repository for users stored in PostgreSQL.
pub struct PostgresUserRepository {
    pool: DbPool,
}

impl PostgresUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    async fn save(&self, user: NewUser) -> Result<User> {
        let row = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (name, email, created_at)
            VALUES ($1, $2, $3)
            RETURNING id, name, email, created_at
            "#,
        )
        .bind(&user.name)
        .bind(&user.email)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"
            SELECT id, name, email, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}

#[derive(Debug, Default)]
struct InMemoryUsers {
    next_id: i64,
    rows: HashMap<i64, User>,
}

/// Process-local user store with sequential ids starting at 1.
#[derive(Debug, Default)]
pub struct InMemoryUserRepository {
    inner: RwLock<InMemoryUsers>,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.rows.len()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn save(&self, user: NewUser) -> Result<User> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;

        let row = User {
            id: inner.next_id,
            name: user.name,
            email: user.email,
            created_at: Utc::now(),
        };
        inner.rows.insert(row.id, row.clone());

        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<User>> {
        Ok(self.inner.read().await.rows.get(&id).cloned())
    }
}

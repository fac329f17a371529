pub mod user_repository;

pub use user_repository::{InMemoryUserRepository, PostgresUserRepository, UserRepository};

use sqlx::PgPool;

/// Database connection pool type alias.
pub type DbPool = PgPool;

use crate::error::{AppError, Result};
use crate::models::{NewUser, User};
use crate::observability::get_metrics;
use crate::repositories::UserRepository;
use std::sync::Arc;

/// Service for user operations.
#[derive(Clone)]
pub struct UserService {
    repository: Arc<dyn UserRepository>,
}

impl UserService {
    pub fn new(repository: Arc<dyn UserRepository>) -> Self {
        Self { repository }
    }

    /// Creates a new user.
    pub async fn create_user(&self, user: NewUser) -> Result<User> {
        let user = self.repository.save(user).await?;
        get_metrics().record_user_created();

        tracing::info!(user_id = user.id, "User created");
        Ok(user)
    }

    /// Finds a user by id.
    pub async fn find_by_id(&self, id: i64) -> Result<User> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {} not found", id)))
    }
}

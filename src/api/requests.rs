use serde::{Deserialize, Serialize};

use crate::models::NewUser;

/// Request to create a new user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
}

impl CreateUserRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(ValidationError { field: "name".to_string(), message: "name cannot be empty".to_string() });
        }
        let email = self.email.trim();
        if email.is_empty() {
            errors.push(ValidationError { field: "email".to_string(), message: "email cannot be empty".to_string() });
        } else if !email.contains('@') || email.starts_with('@') || email.ends_with('@') {
            errors.push(ValidationError { field: "email".to_string(), message: "email must be a valid address".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl From<CreateUserRequest> for NewUser {
    fn from(request: CreateUserRequest) -> Self {
        NewUser::new(request.name.trim(), request.email.trim())
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

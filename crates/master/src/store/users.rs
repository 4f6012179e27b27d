use uuid::Uuid;

use super::{StoreClient, StoreError};

/// A user row, as far as the control plane needs it: identity plus the
/// admin flag driving authorization checks. Account management itself
/// lives outside this service.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub public_id: Uuid,
    pub username: String,
    pub is_admin: bool,
}

impl StoreClient {
    /// Resolve the caller behind a bearer token. None means the token is
    /// unknown or revoked.
    pub async fn get_user_by_token(&self, token: &str) -> Result<Option<UserRecord>, StoreError> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT id, public_id, username, is_admin FROM users WHERE api_token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(row)
    }
}

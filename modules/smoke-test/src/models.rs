use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Thing {
    pub id: String,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /api/things`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateThingRequest {
    pub name: String,
}

/// Payload of `thing.created`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingCreatedPayload {
    pub id: String,
    pub name: String,
    pub created_by: String,
}

/// Payload of `thing.renamed`, produced upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingRenamedPayload {
    pub id: String,
    pub name: String,
}

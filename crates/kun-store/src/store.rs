//! CRUD over the upstreams table

use crate::entities::upstream::{ActiveModel, Column, Entity};
use crate::StoreError;
use chrono::Utc;
use kun_proto::UpstreamRecord;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct UpstreamStore {
    db: DatabaseConnection,
}

impl UpstreamStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn create(&self, record: &UpstreamRecord) -> Result<UpstreamRecord, StoreError> {
        let model = ActiveModel::from_record(record).insert(&self.db).await?;
        debug!(id = %model.id, domain = %model.domain_name, "Persisted upstream");
        Ok(model.into())
    }

    /// Fetch a record by id, ignoring soft-deleted rows
    pub async fn get(&self, id: &str) -> Result<Option<UpstreamRecord>, StoreError> {
        let model = Entity::find_by_id(id.to_string())
            .filter(Column::DeletedAt.is_null())
            .one(&self.db)
            .await?;
        Ok(model.map(Into::into))
    }

    /// Overwrite the mutable columns of an existing, non-deleted row
    pub async fn update(&self, record: &UpstreamRecord) -> Result<UpstreamRecord, StoreError> {
        let existing = Entity::find_by_id(record.id.clone())
            .filter(Column::DeletedAt.is_null())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(record.id.clone()))?;

        let mut active: ActiveModel = existing.into();
        active.domain_name = Set(record.domain_name.clone());
        active.node_id = Set(record.endpoint.node_id.clone());
        active.peer_addr = Set(record.endpoint.peer_addr.clone());
        active.session_id = Set(record.endpoint.session_id.clone());
        active.updated_at = Set(record.updated_at);
        active.expired_at = Set(record.expired_at);

        let model = active.update(&self.db).await?;
        Ok(model.into())
    }

    /// Create the row, or update it if the id is already known
    pub async fn save(&self, record: &UpstreamRecord) -> Result<UpstreamRecord, StoreError> {
        let exists = Entity::find_by_id(record.id.clone()).one(&self.db).await?;
        match exists {
            Some(model) if model.deleted_at.is_none() => self.update(record).await,
            // A soft-deleted id is never reused
            Some(model) => Ok(model.into()),
            None => self.create(record).await,
        }
    }

    /// Mark a row deleted. Returns false if it was absent or already deleted.
    pub async fn soft_delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(model) = Entity::find_by_id(id.to_string())
            .filter(Column::DeletedAt.is_null())
            .one(&self.db)
            .await?
        else {
            return Ok(false);
        };

        let mut active: ActiveModel = model.into();
        active.deleted_at = Set(Some(Utc::now()));
        active.update(&self.db).await?;
        debug!(id = %id, "Soft-deleted upstream");
        Ok(true)
    }

    /// Newest non-deleted record for a domain
    pub async fn find_by_domain(&self, domain: &str) -> Result<Option<UpstreamRecord>, StoreError> {
        let model = Entity::find()
            .filter(Column::DomainName.eq(domain))
            .filter(Column::DeletedAt.is_null())
            .order_by_desc(Column::UpdatedAt)
            .order_by_desc(Column::Id)
            .one(&self.db)
            .await?;
        Ok(model.map(Into::into))
    }

    /// Every non-deleted record, oldest first
    pub async fn list(&self) -> Result<Vec<UpstreamRecord>, StoreError> {
        let models = Entity::find()
            .filter(Column::DeletedAt.is_null())
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Into::into).collect())
    }
}

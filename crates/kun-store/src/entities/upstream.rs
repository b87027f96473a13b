//! Upstream entity: durable log of routing records

use kun_proto::{Endpoint, UpstreamRecord};
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "upstreams")]
pub struct Model {
    /// Record id (`upstream-<uuid>`)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    #[sea_orm(indexed)]
    pub domain_name: String,

    pub node_id: String,

    /// Peer listener address of the owning node
    pub peer_addr: String,

    pub session_id: String,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,

    pub expired_at: ChronoDateTimeUtc,

    /// Soft delete marker
    pub deleted_at: Option<ChronoDateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for UpstreamRecord {
    fn from(model: Model) -> Self {
        UpstreamRecord {
            id: model.id,
            domain_name: model.domain_name,
            endpoint: Endpoint::new(model.node_id, model.peer_addr, model.session_id),
            created_at: model.created_at,
            updated_at: model.updated_at,
            expired_at: model.expired_at,
        }
    }
}

impl ActiveModel {
    /// Active model with every column of `record` set
    pub fn from_record(record: &UpstreamRecord) -> Self {
        Self {
            id: Set(record.id.clone()),
            domain_name: Set(record.domain_name.clone()),
            node_id: Set(record.endpoint.node_id.clone()),
            peer_addr: Set(record.endpoint.peer_addr.clone()),
            session_id: Set(record.endpoint.session_id.clone()),
            created_at: Set(record.created_at),
            updated_at: Set(record.updated_at),
            expired_at: Set(record.expired_at),
            deleted_at: Set(None),
        }
    }
}

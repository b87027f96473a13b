//! Create the upstreams table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Upstreams::Table)
                    .if_not_exists()
                    .col(string_len(Upstreams::Id, 64).primary_key())
                    .col(string_len(Upstreams::DomainName, 256).not_null())
                    .col(string_len(Upstreams::NodeId, 128).not_null())
                    .col(string_len(Upstreams::PeerAddr, 512).not_null())
                    .col(string_len(Upstreams::SessionId, 64).not_null())
                    .col(timestamp_with_time_zone(Upstreams::CreatedAt).not_null())
                    .col(timestamp_with_time_zone(Upstreams::UpdatedAt).not_null())
                    .col(timestamp_with_time_zone(Upstreams::ExpiredAt).not_null())
                    .col(timestamp_with_time_zone_null(Upstreams::DeletedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_upstreams_domain_name")
                    .table(Upstreams::Table)
                    .col(Upstreams::DomainName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Upstreams::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Upstreams {
    Table,
    Id,
    DomainName,
    NodeId,
    PeerAddr,
    SessionId,
    CreatedAt,
    UpdatedAt,
    ExpiredAt,
    DeletedAt,
}

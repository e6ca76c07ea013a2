use sea_orm::{ConnectionTrait, EntityTrait, Schema};
use sea_orm_migration::prelude::*;

use crate::entities::{
    basket, basket_line, order, order_line, payment_event, payment_processor_response,
    payment_source, refund, refund_line, sdn_check_failure, sdn_fallback_record,
};

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_basket_tables::Migration),
            Box::new(m20240101_000002_create_order_tables::Migration),
            Box::new(m20240101_000003_create_payment_audit_table::Migration),
            Box::new(m20240101_000004_create_refund_tables::Migration),
            Box::new(m20240101_000005_create_sdn_tables::Migration),
        ]
    }
}

/// Builds `CREATE TABLE IF NOT EXISTS` for an entity using the connected backend's dialect.
fn create_table_for<E: EntityTrait>(manager: &SchemaManager<'_>, entity: E) -> TableCreateStatement {
    Schema::new(manager.get_database_backend())
        .create_table_from_entity(entity)
        .if_not_exists()
        .to_owned()
}

mod m20240101_000001_create_basket_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_basket_tables"
        }
    }

    #[allow(elided_lifetimes_in_paths)]
    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(create_table_for(manager, basket::Entity))
                .await?;
            manager
                .create_table(create_table_for(manager, basket_line::Entity))
                .await?;
            manager
                .create_index(
                    Index::create()
                        .name("idx_baskets_owner_status")
                        .table(basket::Entity)
                        .col(basket::Column::Owner)
                        .col(basket::Column::Status)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(basket_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(basket::Entity).to_owned())
                .await
        }
    }
}

mod m20240101_000002_create_order_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_order_tables"
        }
    }

    #[allow(elided_lifetimes_in_paths)]
    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(create_table_for(manager, order::Entity))
                .await?;
            manager
                .create_table(create_table_for(manager, order_line::Entity))
                .await?;
            manager
                .create_table(create_table_for(manager, payment_source::Entity))
                .await?;
            manager
                .create_table(create_table_for(manager, payment_event::Entity))
                .await?;
            manager
                .create_index(
                    Index::create()
                        .name("idx_payment_events_reference")
                        .table(payment_event::Entity)
                        .col(payment_event::Column::ProcessorName)
                        .col(payment_event::Column::Reference)
                        .if_not_exists()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(payment_event::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(payment_source::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(order_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(order::Entity).to_owned())
                .await
        }
    }
}

mod m20240101_000003_create_payment_audit_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_payment_audit_table"
        }
    }

    #[allow(elided_lifetimes_in_paths)]
    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(create_table_for(manager, payment_processor_response::Entity))
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(
                    Table::drop()
                        .table(payment_processor_response::Entity)
                        .to_owned(),
                )
                .await
        }
    }
}

mod m20240101_000004_create_refund_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_refund_tables"
        }
    }

    #[allow(elided_lifetimes_in_paths)]
    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(create_table_for(manager, refund::Entity))
                .await?;
            manager
                .create_table(create_table_for(manager, refund_line::Entity))
                .await?;
            // An order line belongs to at most one refund that has not been denied
            manager
                .get_connection()
                .execute_unprepared(
                    "CREATE UNIQUE INDEX IF NOT EXISTS idx_refund_lines_active_order_line \
                     ON refund_lines (order_line_id) WHERE status <> 'denied'",
                )
                .await?;
            Ok(())
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(refund_line::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(refund::Entity).to_owned())
                .await
        }
    }
}

mod m20240101_000005_create_sdn_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000005_create_sdn_tables"
        }
    }

    #[allow(elided_lifetimes_in_paths)]
    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(create_table_for(manager, sdn_check_failure::Entity))
                .await?;
            manager
                .create_table(create_table_for(manager, sdn_fallback_record::Entity))
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(sdn_fallback_record::Entity).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(sdn_check_failure::Entity).to_owned())
                .await
        }
    }
}

//! PostgreSQL saga store.
//!
//! One table per service (`{service}_sagas`). Statements run on the
//! connection of the unit of work's `PgTransaction`, so a save is only
//! visible once the dispatch commits. Version checks use conditional
//! `UPDATE ... WHERE version = $expected`; a create uses
//! `INSERT ... ON CONFLICT DO NOTHING`. Lookups by correlation id use an
//! index on `(saga_type, correlation_id)`.

use async_trait::async_trait;
use sea_query::{
    Alias, ColumnDef, Expr, Index, OnConflict, Order, PostgresQueryBuilder, Query, SelectStatement,
    Table,
};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};

use super::{SagaStore, StoreError};
use crate::envelope::SagaId;
use crate::saga::{SagaInstance, SagaStatus};
use crate::tx::postgres::pg_connection;
use crate::tx::Transaction;

const COL_SAGA_ID: &str = "saga_id";
const COL_SAGA_TYPE: &str = "saga_type";
const COL_STATE: &str = "state";
const COL_VERSION: &str = "version";
const COL_STATUS: &str = "status";
const COL_CORRELATION_ID: &str = "correlation_id";

/// Table name for a service: lowercase, non-alphanumerics replaced by `_`.
pub(crate) fn table_name(service_name: &str, suffix: &str) -> String {
    let base: String = service_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}", base, suffix)
}

fn col(name: &str) -> Alias {
    Alias::new(name)
}

/// Saga store backed by PostgreSQL.
pub struct PgSagaStore {
    table: String,
}

impl PgSagaStore {
    pub fn new(service_name: &str) -> Self {
        Self {
            table: table_name(service_name, "sagas"),
        }
    }

    /// Create the table if it does not exist.
    pub async fn init(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        let create = Table::create()
            .table(Alias::new(&self.table))
            .if_not_exists()
            .col(ColumnDef::new(col(COL_SAGA_ID)).uuid().primary_key())
            .col(ColumnDef::new(col(COL_SAGA_TYPE)).text().not_null())
            .col(ColumnDef::new(col(COL_STATE)).binary().not_null())
            .col(ColumnDef::new(col(COL_VERSION)).big_integer().not_null())
            .col(ColumnDef::new(col(COL_STATUS)).text().not_null())
            .col(ColumnDef::new(col(COL_CORRELATION_ID)).text().null())
            .to_string(PostgresQueryBuilder);
        let index = Index::create()
            .if_not_exists()
            .name(format!("{}_correlation_idx", self.table))
            .table(Alias::new(&self.table))
            .col(col(COL_SAGA_TYPE))
            .col(col(COL_CORRELATION_ID))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&create).execute(pool).await?;
        sqlx::query(&index).execute(pool).await?;
        info!(table = %self.table, "Saga table initialized (PostgreSQL)");
        Ok(())
    }

    fn conn(tx: &mut dyn Transaction) -> Result<&mut PgConnection, StoreError> {
        pg_connection(tx).map_err(StoreError::Storage)
    }

    async fn stored_version(
        &self,
        conn: &mut PgConnection,
        id: SagaId,
    ) -> Result<Option<u64>, StoreError> {
        let select = Query::select()
            .column(col(COL_VERSION))
            .from(Alias::new(&self.table))
            .and_where(Expr::col(col(COL_SAGA_ID)).eq(id.to_string()))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(conn).await?;
        match row {
            Some(row) => {
                let version: i64 = row.try_get(COL_VERSION)?;
                Ok(Some(version as u64))
            }
            None => Ok(None),
        }
    }
}

impl PgSagaStore {
    fn select_active(&self, saga_type: &str) -> SelectStatement {
        Query::select()
            .column(col(COL_SAGA_ID))
            .from(Alias::new(&self.table))
            .and_where(Expr::col(col(COL_SAGA_TYPE)).eq(saga_type))
            .and_where(Expr::col(col(COL_STATUS)).eq(SagaStatus::Active.as_str()))
            .order_by(col(COL_SAGA_ID), Order::Asc)
            .to_owned()
    }

    async fn fetch_ids(
        &self,
        conn: &mut PgConnection,
        select: &SelectStatement,
    ) -> Result<Vec<SagaId>, StoreError> {
        let query = select.to_string(PostgresQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(conn).await?;
        rows.iter()
            .map(|row| {
                let id: uuid::Uuid = row.try_get(COL_SAGA_ID)?;
                Ok(SagaId::from_uuid(id))
            })
            .collect()
    }
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn get(
        &self,
        tx: &mut dyn Transaction,
        id: SagaId,
    ) -> Result<Option<SagaInstance>, StoreError> {
        let conn = Self::conn(tx)?;
        let select = Query::select()
            .columns([
                col(COL_SAGA_TYPE),
                col(COL_STATE),
                col(COL_VERSION),
                col(COL_STATUS),
                col(COL_CORRELATION_ID),
            ])
            .from(Alias::new(&self.table))
            .and_where(Expr::col(col(COL_SAGA_ID)).eq(id.to_string()))
            .to_string(PostgresQueryBuilder);

        let Some(row) = sqlx::query(&select).fetch_optional(conn).await? else {
            return Ok(None);
        };

        let status: String = row.try_get(COL_STATUS)?;
        let status = SagaStatus::parse(&status)
            .ok_or_else(|| StoreError::Storage(format!("unknown saga status '{}'", status)))?;
        let version: i64 = row.try_get(COL_VERSION)?;

        Ok(Some(SagaInstance {
            id,
            saga_type: row.try_get(COL_SAGA_TYPE)?,
            state: row.try_get(COL_STATE)?,
            version: version as u64,
            status,
            correlation_id: row.try_get(COL_CORRELATION_ID)?,
        }))
    }

    async fn save(
        &self,
        tx: &mut dyn Transaction,
        instance: &SagaInstance,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let conn = Self::conn(tx)?;
        let version = expected_version + 1;

        let statement = if expected_version == 0 {
            Query::insert()
                .into_table(Alias::new(&self.table))
                .columns([
                    col(COL_SAGA_ID),
                    col(COL_SAGA_TYPE),
                    col(COL_STATE),
                    col(COL_VERSION),
                    col(COL_STATUS),
                    col(COL_CORRELATION_ID),
                ])
                .values_panic([
                    instance.id.to_string().into(),
                    instance.saga_type.clone().into(),
                    instance.state.clone().into(),
                    (version as i64).into(),
                    instance.status.as_str().into(),
                    instance.correlation_id.clone().into(),
                ])
                .on_conflict(OnConflict::column(col(COL_SAGA_ID)).do_nothing().to_owned())
                .to_string(PostgresQueryBuilder)
        } else {
            Query::update()
                .table(Alias::new(&self.table))
                .value(col(COL_STATE), instance.state.clone())
                .value(col(COL_VERSION), version as i64)
                .value(col(COL_STATUS), instance.status.as_str())
                .and_where(Expr::col(col(COL_SAGA_ID)).eq(instance.id.to_string()))
                .and_where(Expr::col(col(COL_VERSION)).eq(expected_version as i64))
                .to_string(PostgresQueryBuilder)
        };

        let result = sqlx::query(&statement).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            let actual = self.stored_version(conn, instance.id).await?;
            return Err(StoreError::VersionConflict {
                saga_id: instance.id,
                expected: expected_version,
                actual,
            });
        }

        debug!(saga_id = %instance.id, version, "Saga saved");
        Ok(version)
    }

    async fn delete(&self, tx: &mut dyn Transaction, id: SagaId) -> Result<(), StoreError> {
        let conn = Self::conn(tx)?;
        let delete = Query::delete()
            .from_table(Alias::new(&self.table))
            .and_where(Expr::col(col(COL_SAGA_ID)).eq(id.to_string()))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&delete).execute(conn).await?;
        Ok(())
    }

    async fn find_by_correlation(
        &self,
        tx: &mut dyn Transaction,
        saga_type: &str,
        correlation_id: &str,
    ) -> Result<Vec<SagaId>, StoreError> {
        let mut select = self.select_active(saga_type);
        select.and_where(Expr::col(col(COL_CORRELATION_ID)).eq(correlation_id));
        self.fetch_ids(Self::conn(tx)?, &select).await
    }

    async fn list_active(
        &self,
        tx: &mut dyn Transaction,
        saga_type: &str,
    ) -> Result<Vec<SagaId>, StoreError> {
        let select = self.select_active(saga_type);
        self.fetch_ids(Self::conn(tx)?, &select).await
    }
}

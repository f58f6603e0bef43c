//! PostgreSQL outbox.
//!
//! Envelopes are inserted into `{service}_outbox` on the unit of work's
//! connection and deleted once published. The envelope is stored as JSON so
//! the row survives independently of the bus serializer.

use std::time::Duration;

use async_trait::async_trait;
use sea_query::{Alias, ColumnDef, Expr, Index, Order, PostgresQueryBuilder, Query, Table};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::{Outbox, OutboxError};
use crate::broker::Outgoing;
use crate::envelope::Envelope;
use crate::saga::store::postgres::table_name;
use crate::tx::postgres::pg_connection;
use crate::tx::Transaction;

const COL_ID: &str = "id";
const COL_EXCHANGE: &str = "exchange";
const COL_ROUTING_KEY: &str = "routing_key";
const COL_ENVELOPE: &str = "envelope";
const COL_DELAY_MS: &str = "delay_ms";
const COL_CREATED_AT: &str = "created_at";

fn col(name: &str) -> Alias {
    Alias::new(name)
}

/// Outbox backed by PostgreSQL.
pub struct PgOutbox {
    pool: PgPool,
    table: String,
}

impl PgOutbox {
    pub fn new(pool: PgPool, service_name: &str) -> Self {
        Self {
            pool,
            table: table_name(service_name, "outbox"),
        }
    }

    /// Create the table and its recovery index if they do not exist.
    pub async fn init(&self) -> Result<(), sqlx::Error> {
        let create_table = Table::create()
            .table(Alias::new(&self.table))
            .if_not_exists()
            .col(ColumnDef::new(col(COL_ID)).uuid().primary_key())
            .col(ColumnDef::new(col(COL_EXCHANGE)).text().not_null())
            .col(ColumnDef::new(col(COL_ROUTING_KEY)).text().not_null())
            .col(ColumnDef::new(col(COL_ENVELOPE)).text().not_null())
            .col(ColumnDef::new(col(COL_DELAY_MS)).big_integer())
            .col(
                ColumnDef::new(col(COL_CREATED_AT))
                    .timestamp_with_time_zone()
                    .not_null()
                    .default(Expr::current_timestamp()),
            )
            .to_string(PostgresQueryBuilder);
        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name(format!("idx_{}_created_at", self.table))
            .table(Alias::new(&self.table))
            .col(col(COL_CREATED_AT))
            .to_string(PostgresQueryBuilder);
        sqlx::query(&create_index).execute(&self.pool).await?;

        info!(table = %self.table, "Outbox table initialized (PostgreSQL)");
        Ok(())
    }
}

fn storage(err: impl std::fmt::Display) -> OutboxError {
    OutboxError::Storage(err.to_string())
}

#[async_trait]
impl Outbox for PgOutbox {
    async fn stage(
        &self,
        tx: &mut dyn Transaction,
        messages: &[Outgoing],
    ) -> Result<(), OutboxError> {
        if messages.is_empty() {
            return Ok(());
        }
        let conn = pg_connection(tx).map_err(|_| OutboxError::WrongTransaction {
            expected: "postgres",
        })?;

        let mut insert = Query::insert();
        insert.into_table(Alias::new(&self.table)).columns([
            col(COL_ID),
            col(COL_EXCHANGE),
            col(COL_ROUTING_KEY),
            col(COL_ENVELOPE),
            col(COL_DELAY_MS),
        ]);
        for outgoing in messages {
            let envelope = serde_json::to_string(&outgoing.envelope).map_err(storage)?;
            let delay_ms = outgoing.deliver_after.map(|d| d.as_millis() as i64);
            insert.values_panic([
                outgoing.envelope.id.to_string().into(),
                outgoing.exchange.clone().into(),
                outgoing.routing_key.clone().into(),
                envelope.into(),
                delay_ms.into(),
            ]);
        }
        let insert = insert.to_string(PostgresQueryBuilder);

        sqlx::query(&insert).execute(conn).await.map_err(storage)?;
        debug!(count = messages.len(), "Outbound envelopes staged in outbox");
        Ok(())
    }

    async fn mark_sent(&self, ids: &[Uuid]) -> Result<(), OutboxError> {
        if ids.is_empty() {
            return Ok(());
        }
        let delete = Query::delete()
            .from_table(Alias::new(&self.table))
            .and_where(Expr::col(col(COL_ID)).is_in(ids.iter().map(|id| id.to_string())))
            .to_string(PostgresQueryBuilder);

        sqlx::query(&delete)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<Outgoing>, OutboxError> {
        let select = Query::select()
            .columns([
                col(COL_EXCHANGE),
                col(COL_ROUTING_KEY),
                col(COL_ENVELOPE),
                col(COL_DELAY_MS),
            ])
            .from(Alias::new(&self.table))
            .order_by(col(COL_CREATED_AT), Order::Asc)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&select)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in rows {
            let envelope: String = row.try_get(COL_ENVELOPE).map_err(storage)?;
            let envelope: Envelope = serde_json::from_str(&envelope).map_err(storage)?;
            let delay_ms: Option<i64> = row.try_get(COL_DELAY_MS).map_err(storage)?;
            pending.push(Outgoing {
                exchange: row.try_get(COL_EXCHANGE).map_err(storage)?,
                routing_key: row.try_get(COL_ROUTING_KEY).map_err(storage)?,
                envelope,
                deliver_after: delay_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            });
        }
        Ok(pending)
    }
}

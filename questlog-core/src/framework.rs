//! Thin accessors over the Postgres pool used by the entity commands.
//!
//! Plain reads and single-statement writes go through [`DatabaseProcessor`],
//! which implements `kanau::processor::Processor` for each command struct.
//! Read-modify-write sequences borrow a [`TransactionProcessor`] so the row
//! lock taken by `SELECT ... FOR UPDATE` lives until commit.

use sqlx::PgPool;

pub trait DatabaseAccessor {
    fn acquire(&mut self) -> impl sqlx::PgExecutor<'_>;
}

#[derive(Debug, Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

impl DatabaseProcessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a transaction on the pool.
    pub async fn begin(&self) -> Result<TransactionProcessor<'static>, sqlx::Error> {
        let tx = self.pool.begin().await?;
        Ok(TransactionProcessor { tx })
    }
}

pub struct TransactionProcessor<'b> {
    pub tx: sqlx::Transaction<'b, sqlx::Postgres>,
}

impl TransactionProcessor<'_> {
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }
}

impl DatabaseAccessor for DatabaseProcessor {
    fn acquire(&mut self) -> impl sqlx::PgExecutor<'_> {
        &self.pool
    }
}

impl<'b> DatabaseAccessor for TransactionProcessor<'b> {
    fn acquire(&mut self) -> impl sqlx::PgExecutor<'_> {
        &mut *self.tx
    }
}

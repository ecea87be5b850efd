pub mod config;
pub mod cycle;
pub mod error;
pub mod evaluator;
pub mod normalizer;
pub mod notify;
pub mod scorer;
pub mod trigger;

use lecycle_db::rusqlite::{self, Connection, Transaction, TransactionBehavior};

/// Takes the write lock up front so concurrent invocations serialize.
pub(crate) fn immediate(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

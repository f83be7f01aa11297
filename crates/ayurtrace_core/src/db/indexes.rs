//! Structural index registry.
//!
//! # Responsibility
//! - Create the collection tables and the indexes core relies on.
//!
//! # Invariants
//! - Every statement is `IF NOT EXISTS`, so running the set again is a no-op.
//! - Each index is created in its own transaction; a failure leaves no
//!   half-built index behind.

use super::{Collection, DbError, DbResult};
use rusqlite::Connection;

const COLLECTIONS_SQL: &str = include_str!("sql/collections.sql");

/// One index the store must hold before serving traffic.
#[derive(Debug, Clone, Copy)]
pub struct IndexDefinition {
    pub name: &'static str,
    pub collection: Collection,
    sql: &'static str,
}

const INDEXES: &[IndexDefinition] = &[
    IndexDefinition {
        name: "qr_codes_qr_code_unique",
        collection: Collection::QrCodes,
        sql: include_str!("sql/qr_code_unique.sql"),
    },
    IndexDefinition {
        name: "collection_events_location_2dsphere",
        collection: Collection::CollectionEvents,
        sql: include_str!("sql/location_2dsphere.sql"),
    },
];

/// Returns the indexes `ensure_indexes` establishes.
pub fn required_indexes() -> &'static [IndexDefinition] {
    INDEXES
}

/// Creates collection tables if they are missing.
pub(crate) fn ensure_collections(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(COLLECTIONS_SQL)
}

/// Creates every required index. Idempotent.
pub(crate) fn apply_indexes(conn: &mut Connection) -> DbResult<()> {
    for index in INDEXES {
        create_index(conn, index).map_err(|source| DbError::Index {
            index: index.name,
            source,
        })?;
    }
    Ok(())
}

fn create_index(conn: &mut Connection, index: &IndexDefinition) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(index.sql)?;
    tx.commit()
}

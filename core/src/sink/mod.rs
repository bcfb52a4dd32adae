//! Destination store: one SQLite database per project.

pub mod sqlite;
pub mod table;

pub use sqlite::{Database, WriteTicket};
pub use table::{
    create_text_table, insert_all, quote_identifier, table_columns, transform_column_types,
};

//! Piggyback Codec
//!
//! Carries site metadata inside ordinary DNS messages, in the additional
//! section, so it rides along with queries and replies instead of using a
//! side channel:
//!
//! - **Coordinates**: a LOC record at `edge.site.`, always the *last*
//!   additional record.
//! - **Site table**: a TXT record holding JSON, always the *first*
//!   additional record.
//!
//! Positions are fixed rather than searched, so at most one piggyback of
//! each kind travels per message.

pub mod loc;
pub mod table;

pub use loc::{attach_location, decode_location, encode_location, take_location, SITE_RECORD_NAME};
pub use table::{attach_table, decode_table, encode_table, take_table};

use thiserror::Error;

/// Piggyback decode/encode failures.
///
/// Any of these on a reply from another site means the two sites do not
/// speak the same format; the query fails rather than being retried.
#[derive(Debug, Error)]
pub enum PiggybackError {
    #[error("invalid location record: {0}")]
    InvalidLocation(String),
    #[error("reply carries no table record")]
    MissingTable,
    #[error("invalid table record: {0}")]
    InvalidTable(String),
    #[error("table payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wire error: {0}")]
    Proto(#[from] hickory_proto::error::ProtoError),
}

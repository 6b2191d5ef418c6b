//! Repository modules, one per aggregate

pub mod conversations;
pub mod events;
pub mod files;
pub mod messages;

/// SQL expression ranking a message status for monotone updates
pub(crate) const STATUS_RANK: &str =
    "CASE ? WHEN 'SENT' THEN 0 WHEN 'DELIVERED' THEN 1 WHEN 'READ' THEN 2 ELSE 3 END";

/// Same ranking over a column instead of a bind parameter
pub(crate) fn status_rank_col(column: &str) -> String {
    format!("CASE {column} WHEN 'SENT' THEN 0 WHEN 'DELIVERED' THEN 1 WHEN 'READ' THEN 2 ELSE 3 END")
}

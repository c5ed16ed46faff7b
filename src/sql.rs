//! Maintenance statement templates.
//!
//! The transport treats statement text as an external collaborator concern;
//! this module is the single seam where it lives. Both templates are bound to
//! the transport schema, validated at configuration time to be a plain
//! identifier.

/// Statement processing a bounded batch of pending queue metrics.
///
/// Binds one parameter: the row limit for the batch.
pub fn process_metrics_sql(schema: &str) -> String {
    format!("SELECT {schema}.process_metrics($1)")
}

/// Statement purging stale topology rows. No parameters beyond the schema.
pub fn purge_topology_sql(schema: &str) -> String {
    format!("SELECT {schema}.purge_topology()")
}

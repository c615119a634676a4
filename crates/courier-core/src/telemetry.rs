//! Metric names recorded by the core.
//!
//! Counters go through the `metrics` facade and are no-ops until the host
//! process installs a recorder.

/// Metric names.
pub mod names {
    pub const OUTBOUND_DROPPED_TOTAL: &str = "courier_outbound_dropped_total";
    pub const HEARTBEAT_EVICTIONS_TOTAL: &str = "courier_heartbeat_evictions_total";
    pub const INBOUND_DISCARDED_TOTAL: &str = "courier_inbound_discarded_total";
    pub const BUS_DISCARDED_TOTAL: &str = "courier_bus_discarded_total";
    pub const SESSIONS_REPLACED_TOTAL: &str = "courier_sessions_replaced_total";
}

//! Narrow audit-log seam for operator-facing actions (process CRUD, lifecycle
//! transitions, config changes). Separate from `tracing`-based operational
//! logging: audit events are a stable, structured contract for compliance
//! tooling, not a debugging stream.

#[derive(Debug, Clone)]
pub enum AuditEvent {
    ProcessAdded { process_name: String },
    ProcessRemoved { process_name: String },
    ProcessUpdated { process_name: String },
    ProcessStarted { process_name: String },
    ProcessStopped { process_name: String },
    ConfigSaved,
    ConfigReloaded,
}

pub trait AuditLogger: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Default logger for embedders that have not wired in an audit sink.
pub struct NoopAuditLogger;

impl AuditLogger for NoopAuditLogger {
    fn record(&self, _event: AuditEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_logger_accepts_every_variant_without_panicking() {
        let logger = NoopAuditLogger;
        logger.record(AuditEvent::ProcessAdded {
            process_name: "worker".to_string(),
        });
        logger.record(AuditEvent::ConfigReloaded);
    }
}

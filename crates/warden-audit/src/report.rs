//! Diagnostic report rendering
//!
//! Renders a [`DiagnosticReport`] as markdown tables for the escalation
//! ticket description.

use crate::diagnostics::DiagnosticReport;
use std::fmt::Write;

/// Checklist appended to every escalation ticket
pub const ACCEPTANCE_CRITERIA: [&str; 5] = [
    "Root cause identified and documented",
    "Audit worker consumes from the audit request stream",
    "A manual audit completes within the adaptive timeout",
    "Remediation tickets resolved or re-prioritized",
    "Post-incident notes added to this ticket",
];

fn opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| v.to_string())
}

fn pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.1}%"))
}

fn ms(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.0} ms"))
}

/// Render the component tables and findings
#[must_use]
pub fn render_markdown(report: &DiagnosticReport) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_report(&mut out, report);
    out
}

fn write_report(out: &mut String, report: &DiagnosticReport) -> std::fmt::Result {
    writeln!(out, "## Diagnostic Report")?;
    writeln!(out)?;
    writeln!(out, "- **Generated:** {}", report.timestamp.to_rfc3339())?;
    if let Some(id) = &report.audit_request_id {
        writeln!(out, "- **Audit request:** {id}")?;
    }
    writeln!(out, "- **Probable cause:** {}", report.probable_cause)?;
    writeln!(out, "- **Severity:** {}", report.severity)?;
    writeln!(out)?;

    writeln!(out, "### Message Bus")?;
    writeln!(out)?;
    writeln!(out, "| Metric | Value |")?;
    writeln!(out, "|---|---|")?;
    writeln!(out, "| Connected | {} |", report.bus.connected)?;
    writeln!(out, "| Latency | {} |", ms(report.bus.latency_ms))?;
    if let Some(error) = &report.bus.error {
        writeln!(out, "| Error | {error} |")?;
    }
    if !report.bus.streams.is_empty() {
        writeln!(out)?;
        writeln!(out, "| Stream | Pending | Consumers |")?;
        writeln!(out, "|---|---|---|")?;
        for stream in &report.bus.streams {
            writeln!(out, "| {} | {} | {} |", stream.subject, stream.pending, stream.consumers)?;
        }
    }
    writeln!(out)?;

    writeln!(out, "### Database")?;
    writeln!(out)?;
    match &report.database {
        Some(db) => {
            writeln!(out, "| Metric | Value |")?;
            writeln!(out, "|---|---|")?;
            writeln!(out, "| Connected | {} |", db.connected)?;
            writeln!(out, "| Latency | {} |", opt(db.latency_ms.map(|v| format!("{v} ms"))))?;
            writeln!(
                out,
                "| Connections | {} / {} |",
                opt(db.active_connections),
                opt(db.max_connections)
            )?;
            writeln!(out, "| Slow round trip | {} |", db.slow_round_trip)?;
            if let Some(error) = &db.error {
                writeln!(out, "| Error | {error} |")?;
            }
        }
        None => writeln!(out, "Not configured.")?,
    }
    writeln!(out)?;

    writeln!(out, "### Resources")?;
    writeln!(out)?;
    writeln!(out, "| Metric | Value |")?;
    writeln!(out, "|---|---|")?;
    writeln!(out, "| CPU | {} |", pct(report.host.cpu_percent))?;
    writeln!(out, "| Memory | {} |", pct(report.host.memory_percent))?;
    writeln!(out, "| Free memory | {} |", opt(report.host.free_memory_mb.map(|v| format!("{v} MB"))))?;
    writeln!(
        out,
        "| Load average | {} ({} cores) |",
        opt(report.host.load_average.map(|v| format!("{v:.2}"))),
        report.host.cpu_cores
    )?;
    writeln!(out, "| Uptime | {} |", opt(report.host.uptime_secs.map(|v| format!("{v} s"))))?;
    if let Some(error) = &report.host.error {
        writeln!(out, "| Error | {error} |")?;
    }
    writeln!(out)?;

    writeln!(out, "### Spawn History")?;
    writeln!(out)?;
    writeln!(out, "| Metric | Value |")?;
    writeln!(out, "|---|---|")?;
    writeln!(out, "| Attempts | {} |", report.spawn.attempts)?;
    writeln!(out, "| Successes | {} |", report.spawn.successes)?;
    writeln!(out, "| Success rate | {} |", pct(report.spawn.success_rate.map(|r| r * 100.0)))?;
    writeln!(out, "| Average spawn time | {} |", ms(report.spawn.avg_spawn_ms))?;
    if let Some(error) = &report.spawn.error {
        writeln!(out, "| Note | {error} |")?;
    }
    writeln!(out)?;

    writeln!(out, "### Recommendations")?;
    writeln!(out)?;
    for (i, rec) in report.recommendations.iter().enumerate() {
        writeln!(out, "{}. {rec}", i + 1)?;
    }
    Ok(())
}

/// Escalation ticket description: the report plus the acceptance checklist
#[must_use]
pub fn escalation_description(audit_id: &str, attempts: u32, report: &DiagnosticReport) -> String {
    let mut out = format!(
        "Audit `{audit_id}` received no response after {attempts} attempts. Automated recovery is exhausted.\n\n"
    );
    out.push_str(&render_markdown(report));
    out.push_str("\n### Acceptance Criteria\n\n");
    for item in ACCEPTANCE_CRITERIA {
        out.push_str("- [ ] ");
        out.push_str(item);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{BusHealth, SpawnHealth, StreamHealth};
    use crate::host::HostHealth;
    use chrono::Utc;
    use warden_core::Severity;

    fn report() -> DiagnosticReport {
        DiagnosticReport {
            timestamp: Utc::now(),
            audit_request_id: Some("audit-1".into()),
            bus: BusHealth {
                connected: true,
                latency_ms: Some(2.0),
                streams: vec![StreamHealth {
                    subject: "audit.request".into(),
                    pending: 50,
                    consumers: 0,
                }],
                error: None,
            },
            database: None,
            spawn: SpawnHealth::default(),
            host: HostHealth::default(),
            findings: vec![],
            recommendations: vec!["HIGH: Start a consumer for audit.request (50 messages pending)".into()],
            probable_cause: "no consumers for audit stream".into(),
            severity: Severity::High,
        }
    }

    #[test]
    fn renders_every_section() {
        let text = render_markdown(&report());
        for heading in ["### Message Bus", "### Database", "### Resources", "### Spawn History", "### Recommendations"] {
            assert!(text.contains(heading), "missing {heading}");
        }
        assert!(text.contains("| audit.request | 50 | 0 |"));
        assert!(text.contains("- **Severity:** high"));
        assert!(text.contains("1. HIGH: Start a consumer"));
    }

    #[test]
    fn escalation_has_checklist() {
        let text = escalation_description("audit-1", 4, &report());
        assert!(text.starts_with("Audit `audit-1` received no response after 4 attempts"));
        assert_eq!(text.matches("- [ ] ").count(), ACCEPTANCE_CRITERIA.len());
    }
}

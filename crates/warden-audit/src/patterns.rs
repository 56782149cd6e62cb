//! Remediation pattern matcher
//!
//! Maps recommendation and cause text to targeted remediation tickets through
//! a fixed regex table. One ticket per root cause.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use warden_core::{NewRequest, Priority};

/// A targeted fix derived from diagnostic text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationTicket {
    /// Identifier of the matched pattern, e.g. `database_down`
    pub root_cause: &'static str,
    /// Ticket title
    pub title: &'static str,
    /// Fix steps followed by the diagnostic text that matched
    pub description: String,
    /// Worker the ticket is assigned to
    pub responsible: &'static str,
    /// Ticket priority
    pub priority: Priority,
}

impl RemediationTicket {
    /// Ticket to open in the request store
    #[must_use]
    pub fn to_request(&self) -> NewRequest {
        NewRequest::new(self.title, self.description.clone(), self.priority)
            .assigned_to(self.responsible)
            .with_label("remediation")
            .with_label(self.root_cause)
    }
}

struct Pattern {
    regex: Regex,
    root_cause: &'static str,
    title: &'static str,
    fix: &'static str,
    responsible: &'static str,
    priority: Priority,
}

fn pattern(
    regex: &str,
    root_cause: &'static str,
    title: &'static str,
    fix: &'static str,
    responsible: &'static str,
    priority: Priority,
) -> Pattern {
    Pattern {
        regex: Regex::new(regex).expect("remediation pattern is valid"),
        root_cause,
        title,
        fix,
        responsible,
        priority,
    }
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        pattern(
            r"(?i)message bus (disconnected|unreachable)|bus connectivity",
            "bus_down",
            "Restore message bus",
            "Check the bus server process and network path, then confirm publishers reconnect.",
            "devops-engineer",
            Priority::Critical,
        ),
        pattern(
            r"(?i)no consumers? for|start a consumer",
            "missing_consumers",
            "Restart stream consumers",
            "Restart the worker processes subscribed to the idle stream and verify the backlog drains.",
            "devops-engineer",
            Priority::High,
        ),
        pattern(
            r"(?i)database (disconnected|unreachable)|database connectivity",
            "database_down",
            "Restore database connectivity",
            "Check the database server, credentials, and connection limits.",
            "devops-engineer",
            Priority::Critical,
        ),
        pattern(
            r"(?i)slow (database )?(quer(y|ies)|round trip)|database latency",
            "slow_database",
            "Investigate slow database responses",
            "Check disk latency and lock contention on the history database; look for long-running writers.",
            "devops-engineer",
            Priority::High,
        ),
        pattern(
            r"(?i)spawn(ing)? fail|fix worker spawning",
            "spawn_failures",
            "Fix worker spawn failures",
            "Inspect worker spawn logs and the spawn command configuration; retry failed spawns.",
            "devops-engineer",
            Priority::Critical,
        ),
        pattern(
            r"(?i)cpu (exhaustion|pressure)|memory (exhaustion|pressure)|free memory|shed load|overloaded",
            "resource_exhaustion",
            "Relieve host resource pressure",
            "Identify the processes consuming CPU or memory and scale or restart them.",
            "devops-engineer",
            Priority::High,
        ),
        pattern(
            r"(?i)\b(vulnerab|cve-|secret|credential)",
            "security",
            "Address security finding",
            "Patch the affected component and rotate any exposed credentials.",
            "security-engineer",
            Priority::Critical,
        ),
        pattern(
            r"(?i)test(s)? (fail|coverage)|flaky",
            "test_health",
            "Repair failing tests",
            "Fix or quarantine the failing tests and restore coverage.",
            "qa-engineer",
            Priority::Medium,
        ),
    ]
});

/// Match texts against the pattern table
///
/// Each root cause yields at most one ticket, from the first text that
/// matched it. Text matching nothing is ignored.
#[must_use]
pub fn match_remediations<'a>(texts: impl IntoIterator<Item = &'a str>) -> Vec<RemediationTicket> {
    let mut seen = HashSet::new();
    let mut tickets = Vec::new();
    for text in texts {
        for p in PATTERNS.iter().filter(|p| p.regex.is_match(text)) {
            if !seen.insert(p.root_cause) {
                continue;
            }
            tickets.push(RemediationTicket {
                root_cause: p.root_cause,
                title: p.title,
                description: format!("{}\n\nTriggered by: {}", p.fix, text.trim()),
                responsible: p.responsible,
                priority: p.priority,
            });
        }
    }
    tickets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_compiles() {
        assert!(!PATTERNS.is_empty());
    }

    #[test]
    fn dedups_by_root_cause() {
        let tickets = match_remediations([
            "no consumers for audit stream",
            "HIGH: Start a consumer for audit.request (50 messages pending)",
            "CRITICAL: Restore database connectivity (connection refused)",
        ]);
        let causes: Vec<_> = tickets.iter().map(|t| t.root_cause).collect();
        assert_eq!(causes, vec!["missing_consumers", "database_down"]);
        assert!(tickets[0].description.contains("no consumers for audit stream"));
    }

    #[test]
    fn slow_database_finding_maps_to_one_ticket() {
        let tickets = match_remediations([
            "slow database round trip",
            "HIGH: Investigate database latency: the health query took 12000 ms",
        ]);
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].root_cause, "slow_database");
        assert_eq!(tickets[0].responsible, "devops-engineer");
    }

    #[test]
    fn unmatched_text_yields_nothing() {
        assert!(match_remediations(["all good", ""]).is_empty());
    }

    #[test]
    fn ticket_carries_owner_and_labels() {
        let tickets = match_remediations(["CRITICAL: CVE-2024-1234 in openssl"]);
        assert_eq!(tickets.len(), 1);
        let request = tickets[0].to_request();
        assert_eq!(request.priority, Priority::Critical);
        assert_eq!(request.assigned_to.as_deref(), Some("security-engineer"));
        assert!(request.labels.contains(&"remediation".to_string()));
    }
}

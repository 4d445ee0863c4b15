//! `Diagnoser`: classify a failed connection attempt into an actionable
//! diagnosis (spec.md §4.6), grounded in `original_source/doctor.py`'s
//! `AutoDoctor.analyze_error`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Auth,
    Service,
    Network,
    Config,
    Security,
    System,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnosis {
    pub reason: String,
    pub category: Category,
    pub severity: Severity,
    pub fixable: bool,
    pub remedies: Vec<String>,
}

struct Rule {
    patterns: &'static [&'static str],
    reason: &'static str,
    category: Category,
    severity: Severity,
    fixable: bool,
    remedies: &'static [&'static str],
}

/// The prioritized, case-insensitive substring table of spec.md §4.6, in
/// priority order: first match wins.
const RULES: &[Rule] = &[
    Rule {
        patterns: &["permission denied", "authentication failed"],
        reason: "Authentication Failed",
        category: Category::Auth,
        severity: Severity::High,
        fixable: true,
        remedies: &[
            "Check password",
            "Verify username",
            "Check SSH key permissions",
            "Enable password authentication",
        ],
    },
    Rule {
        patterns: &["too many authentication failures"],
        reason: "Too Many Authentication Failures",
        category: Category::Auth,
        severity: Severity::Medium,
        fixable: true,
        remedies: &["Reduce MaxAuthTries in sshd_config", "Use SSH keys instead of passwords"],
    },
    Rule {
        patterns: &["connection refused"],
        reason: "SSH Service Not Running or Port Closed",
        category: Category::Service,
        severity: Severity::High,
        fixable: true,
        remedies: &["Start SSH service", "Open firewall port", "Check SSH port configuration"],
    },
    Rule {
        patterns: &["connection timed out", "timed out"],
        reason: "Connection Timeout - Network or Firewall Issue",
        category: Category::Network,
        severity: Severity::Medium,
        fixable: true,
        remedies: &[
            "Check network connectivity",
            "Verify IP address",
            "Check firewall rules",
            "Test with different port",
        ],
    },
    Rule {
        patterns: &["no route to host", "network is unreachable"],
        reason: "Network Routing Issue",
        category: Category::Network,
        severity: Severity::High,
        fixable: false,
        remedies: &["Check network configuration", "Verify IP reachability", "Contact network administrator"],
    },
    Rule {
        patterns: &["channel setup failed", "tcp forwarding"],
        reason: "TCP Forwarding Disabled",
        category: Category::Config,
        severity: Severity::High,
        fixable: true,
        remedies: &["Enable AllowTcpForwarding", "Enable GatewayPorts", "Restart SSH service"],
    },
    Rule {
        patterns: &["broken pipe", "connection reset by peer"],
        reason: "Connection Interrupted",
        category: Category::Config,
        severity: Severity::Medium,
        fixable: true,
        remedies: &["Increase ClientAliveInterval", "Check network stability", "Enable KeepAlive"],
    },
    Rule {
        patterns: &["host key verification failed"],
        reason: "Host Key Changed or Verification Failed",
        category: Category::Security,
        severity: Severity::Medium,
        fixable: true,
        remedies: &["Remove old host key", "Verify server identity", "Relax host-key checking for testing"],
    },
    Rule {
        patterns: &["resource temporarily unavailable"],
        reason: "Server Resource Limits",
        category: Category::System,
        severity: Severity::Medium,
        fixable: true,
        remedies: &["Check system resources", "Increase limits.conf", "Optimize server performance"],
    },
];

/// Classify `error_message` using the prioritized substring table above.
/// Falls back to an unfixable `general`/`unknown` diagnosis when nothing
/// matches.
pub fn analyze(error_message: &str) -> Diagnosis {
    let lower = error_message.to_lowercase();

    for rule in RULES {
        if rule.patterns.iter().any(|pattern| lower.contains(pattern)) {
            return Diagnosis {
                reason: rule.reason.to_string(),
                category: rule.category,
                severity: rule.severity,
                fixable: rule.fixable,
                remedies: rule.remedies.iter().map(|s| s.to_string()).collect(),
            };
        }
    }

    Diagnosis {
        reason: "Unknown Error".to_string(),
        category: Category::General,
        severity: Severity::Unknown,
        fixable: false,
        remedies: Vec::new(),
    }
}

//! Alert-triggered update analysis
//!
//! Classifies container-update alerts into findings without involving the
//! LLM: the container image determines a severity floor and category, and
//! the time the update has been pending escalates severity further. A
//! per-resource cooldown and a pending set keep at most one analysis in
//! flight per resource.

use crate::findings::FindingsStore;
use crate::models::{Alert, Finding, FindingCategory, Severity};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::interval;
use tracing::{debug, info};

/// Alert type handled by the analyzer
pub const UPDATE_ALERT_TYPE: &str = "docker-container-update";

/// Default per-resource analysis cooldown
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Cleanup ticker period and entry max age
const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CLEANUP_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Pending-hours escalation boundaries (one week, two weeks)
const ESCALATE_WARNING_HOURS: f64 = 168.0;
const ESCALATE_CRITICAL_HOURS: f64 = 336.0;

/// Classification derived from a container image
#[derive(Debug, Clone)]
pub struct UpdateClassification {
    pub severity: Severity,
    pub category: FindingCategory,
    pub urgency: &'static str,
    pub recommendation: &'static str,
}

/// Classify a container image by substring. Unknown images default to a
/// watch-level reliability finding.
pub fn classify_image(image: &str) -> UpdateClassification {
    let image = image.to_ascii_lowercase();
    let contains_any = |names: &[&str]| names.iter().any(|n| image.contains(n));

    if contains_any(&["nginx", "traefik", "haproxy", "caddy", "apache", "envoy"]) {
        return UpdateClassification {
            severity: Severity::Warning,
            category: FindingCategory::Security,
            urgency: "high",
            recommendation: "Update promptly; edge proxies are commonly internet-facing and \
                             updates frequently carry security fixes.",
        };
    }
    if contains_any(&["keycloak", "authelia", "authentik", "vault"]) {
        return UpdateClassification {
            severity: Severity::Warning,
            category: FindingCategory::Security,
            urgency: "high",
            recommendation: "Update promptly; identity and secrets services are high-value \
                             targets.",
        };
    }
    if contains_any(&[
        "postgres",
        "mysql",
        "mariadb",
        "mongo",
        "redis",
        "influx",
        "clickhouse",
    ]) {
        return UpdateClassification {
            severity: Severity::Watch,
            category: FindingCategory::Reliability,
            urgency: "medium",
            recommendation: "Plan the update in a maintenance window; databases need an \
                             orderly shutdown and a verified backup first.",
        };
    }
    if contains_any(&["rabbitmq", "kafka", "nats", "mosquitto"]) {
        return UpdateClassification {
            severity: Severity::Watch,
            category: FindingCategory::Reliability,
            urgency: "medium",
            recommendation: "Plan the update; drain consumers before restarting the broker.",
        };
    }
    if contains_any(&["jenkins", "gitlab", "gitea", "drone"]) {
        return UpdateClassification {
            severity: Severity::Watch,
            category: FindingCategory::Maintenance,
            urgency: "medium",
            recommendation: "Update during a quiet period; CI/CD outages block deploys.",
        };
    }
    if contains_any(&["minio", "restic", "duplicati", "syncthing"]) {
        return UpdateClassification {
            severity: Severity::Watch,
            category: FindingCategory::Backup,
            urgency: "medium",
            recommendation: "Update and re-run a backup verification afterwards.",
        };
    }
    if contains_any(&["prometheus", "grafana", "loki", "jaeger", "alertmanager"]) {
        return UpdateClassification {
            severity: Severity::Info,
            category: FindingCategory::Reliability,
            urgency: "low",
            recommendation: "Update at leisure; monitoring components tolerate brief restarts.",
        };
    }

    UpdateClassification {
        severity: Severity::Watch,
        category: FindingCategory::Reliability,
        urgency: "medium",
        recommendation: "Review the changelog and update during a maintenance window.",
    }
}

/// Severity implied by how long the update has been pending. The image
/// classification acts as a floor; time only escalates.
pub fn escalate_for_pending_hours(floor: Severity, pending_hours: f64) -> Severity {
    let time_severity = if pending_hours > ESCALATE_CRITICAL_HOURS {
        Severity::Critical
    } else if pending_hours >= ESCALATE_WARNING_HOURS {
        Severity::Warning
    } else {
        Severity::Watch
    };
    floor.max(time_severity)
}

struct AnalyzerState {
    last_analyzed: HashMap<String, Instant>,
    pending: HashSet<String>,
}

/// Heuristic classifier turning container-update alerts into findings
pub struct UpdateAlertAnalyzer {
    findings: Arc<FindingsStore>,
    /// Cooldown and pending maps, guarded together
    state: Mutex<AnalyzerState>,
    cooldown: Duration,
    enabled: bool,
}

impl UpdateAlertAnalyzer {
    pub fn new(findings: Arc<FindingsStore>) -> Self {
        Self {
            findings,
            state: Mutex::new(AnalyzerState {
                last_analyzed: HashMap::new(),
                pending: HashSet::new(),
            }),
            cooldown: DEFAULT_COOLDOWN,
            enabled: true,
        }
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Handle a fired alert. Returns `true` when an analysis ran.
    pub async fn on_alert_fired(&self, alert: &Alert) -> bool {
        if !self.enabled {
            return false;
        }
        let key = alert.resource_key();
        if key.is_empty() {
            return false;
        }

        // Gate on cooldown and the in-flight set together
        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.last_analyzed.get(&key) {
                if last.elapsed() < self.cooldown {
                    debug!(resource = %key, "Skipping analysis, within cooldown");
                    return false;
                }
            }
            if !state.pending.insert(key.clone()) {
                debug!(resource = %key, "Skipping analysis, already in flight");
                return false;
            }
        }

        let analyzed = if alert.alert_type == UPDATE_ALERT_TYPE {
            self.analyze_update_alert(alert).await
        } else {
            false
        };

        let mut state = self.state.lock().unwrap();
        state.pending.remove(&key);
        if analyzed {
            state.last_analyzed.insert(key, Instant::now());
        }
        analyzed
    }

    async fn analyze_update_alert(&self, alert: &Alert) -> bool {
        let image = alert.metadata_str("image").unwrap_or_default();
        let pending_hours = alert.metadata_f64("pendingHours").unwrap_or(0.0);

        let classification = classify_image(&image);
        let severity = escalate_for_pending_hours(classification.severity, pending_hours);

        let resource_type = if alert.metadata_str("containerId").is_some() {
            "docker-container"
        } else {
            "docker-host"
        };

        let finding = Finding::new(
            "container-update",
            severity,
            classification.category,
            alert.resource_key(),
            if alert.resource_name.is_empty() {
                alert.resource_key()
            } else {
                alert.resource_name.clone()
            },
            resource_type,
            alert.instance.clone(),
            format!("Container update pending: {image}"),
        )
        .with_description(format!(
            "An update for image {image} has been pending for {pending_hours:.0} hours \
             (urgency: {}).",
            classification.urgency
        ))
        .with_recommendation(classification.recommendation)
        .with_evidence(format!(
            "alert {} pending for {pending_hours:.0}h",
            alert.id
        ));

        let created = self.findings.add(finding).await;
        info!(
            resource = %alert.resource_key(),
            image = %image,
            severity = %severity,
            created,
            "Analyzed container update alert"
        );
        true
    }

    /// Background ticker pruning stale cooldown entries
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut ticker = interval(CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut state = self.state.lock().unwrap();
                    state
                        .last_analyzed
                        .retain(|_, t| t.elapsed() < CLEANUP_MAX_AGE);
                }
                _ = shutdown.recv() => {
                    debug!("Shutting down analyzer cleanup");
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    fn cooldown_entries(&self) -> usize {
        self.state.lock().unwrap().last_analyzed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn update_alert(image: &str, pending_hours: f64) -> Alert {
        let mut alert = Alert {
            id: "alert-1".to_string(),
            alert_type: UPDATE_ALERT_TYPE.to_string(),
            level: "warning".to_string(),
            resource_id: "docker/host1/web".to_string(),
            resource_name: "web".to_string(),
            instance: "host1".to_string(),
            value: 0.0,
            threshold: 0.0,
            start_time: Utc::now(),
            metadata: HashMap::new(),
        };
        alert
            .metadata
            .insert("image".to_string(), serde_json::json!(image));
        alert
            .metadata
            .insert("pendingHours".to_string(), serde_json::json!(pending_hours));
        alert
    }

    #[test]
    fn test_image_classification_table() {
        assert_eq!(classify_image("nginx:latest").severity, Severity::Warning);
        assert_eq!(
            classify_image("nginx:latest").category,
            FindingCategory::Security
        );
        assert_eq!(classify_image("vault:1.15").severity, Severity::Warning);
        assert_eq!(classify_image("postgres:16").severity, Severity::Watch);
        assert_eq!(
            classify_image("postgres:16").category,
            FindingCategory::Reliability
        );
        assert_eq!(
            classify_image("gitea/gitea:1.21").category,
            FindingCategory::Maintenance
        );
        assert_eq!(
            classify_image("minio/minio").category,
            FindingCategory::Backup
        );
        assert_eq!(classify_image("grafana/grafana").severity, Severity::Info);
        assert_eq!(classify_image("somethingelse").severity, Severity::Watch);
    }

    #[test]
    fn test_escalation_boundaries() {
        // Under one week: floor applies
        assert_eq!(
            escalate_for_pending_hours(Severity::Watch, 100.0),
            Severity::Watch
        );
        // nginx at 240 hours: warning
        assert_eq!(
            escalate_for_pending_hours(Severity::Warning, 240.0),
            Severity::Warning
        );
        // nginx at 504 hours: critical
        assert_eq!(
            escalate_for_pending_hours(Severity::Warning, 504.0),
            Severity::Critical
        );
        // Floor is never lowered
        assert_eq!(
            escalate_for_pending_hours(Severity::Critical, 1.0),
            Severity::Critical
        );
    }

    #[tokio::test]
    async fn test_nginx_escalation_end_to_end() {
        let store = Arc::new(FindingsStore::new());
        let analyzer = UpdateAlertAnalyzer::new(store.clone());

        assert!(analyzer.on_alert_fired(&update_alert("nginx:latest", 240.0)).await);
        let findings = store.get_all(Severity::Info).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Warning);
        assert_eq!(findings[0].key, "container-update");

        // Re-analysis after cooldown escalates the same finding
        let analyzer = UpdateAlertAnalyzer::new(store.clone());
        assert!(analyzer.on_alert_fired(&update_alert("nginx:latest", 504.0)).await);
        let findings = store.get_all(Severity::Info).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_reanalysis() {
        let store = Arc::new(FindingsStore::new());
        let analyzer = UpdateAlertAnalyzer::new(store.clone());

        assert!(analyzer.on_alert_fired(&update_alert("redis:7", 10.0)).await);
        assert!(!analyzer.on_alert_fired(&update_alert("redis:7", 10.0)).await);
        assert_eq!(analyzer.cooldown_entries(), 1);
    }

    #[tokio::test]
    async fn test_disabled_analyzer_is_noop() {
        let store = Arc::new(FindingsStore::new());
        let analyzer = UpdateAlertAnalyzer::new(store.clone()).with_enabled(false);

        assert!(!analyzer.on_alert_fired(&update_alert("nginx", 10.0)).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_resource_key_is_noop() {
        let store = Arc::new(FindingsStore::new());
        let analyzer = UpdateAlertAnalyzer::new(store.clone());

        let mut alert = update_alert("nginx", 10.0);
        alert.resource_id.clear();
        alert.resource_name.clear();
        alert.instance.clear();

        assert!(!analyzer.on_alert_fired(&alert).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_update_alert_marks_no_cooldown() {
        let store = Arc::new(FindingsStore::new());
        let analyzer = UpdateAlertAnalyzer::new(store.clone());

        let mut alert = update_alert("nginx", 10.0);
        alert.alert_type = "high-memory".to_string();

        assert!(!analyzer.on_alert_fired(&alert).await);
        assert_eq!(analyzer.cooldown_entries(), 0);
        assert!(store.is_empty().await);
    }
}

//! Pre-LLM triage
//!
//! Scans the current snapshot for resources above their watch thresholds or
//! deviating from their baselines. Triage bounds what the LLM is asked to
//! look at; a quiet triage lets a scheduled patrol skip the LLM entirely.
//! Every scanned value is also folded into the baseline store.

use crate::baseline::BaselineStore;
use crate::models::ResourcesChecked;
use crate::snapshot::StateSnapshot;
use crate::thresholds::PatrolThresholds;
use chrono::Utc;

/// Why a resource was flagged
#[derive(Debug, Clone, PartialEq)]
pub enum FlagReason {
    /// Value exceeds the watch threshold
    Threshold { watch: f64 },
    /// Value deviates from the resource's baseline
    Anomaly { expected: f64, z_score: f64 },
}

/// One flagged resource metric
#[derive(Debug, Clone)]
pub struct TriageFlag {
    pub resource_id: String,
    pub resource_name: String,
    pub resource_type: String,
    pub node: String,
    pub metric: String,
    pub value: f64,
    pub reason: FlagReason,
}

/// Result of one triage pass
#[derive(Debug, Clone, Default)]
pub struct TriageReport {
    pub flags: Vec<TriageFlag>,
    pub checked: ResourcesChecked,
}

impl TriageReport {
    pub fn is_quiet(&self) -> bool {
        self.flags.is_empty()
    }

    /// Flags limited to a set of resource ids (empty set = all)
    pub fn flags_for<'a>(
        &'a self,
        resource_ids: &'a std::collections::BTreeSet<String>,
    ) -> impl Iterator<Item = &'a TriageFlag> {
        self.flags
            .iter()
            .filter(move |f| resource_ids.is_empty() || resource_ids.contains(&f.resource_id))
    }
}

struct Probe<'a> {
    resource_id: &'a str,
    resource_name: &'a str,
    resource_type: &'a str,
    node: &'a str,
    metric: &'static str,
    value: f64,
    watch: f64,
}

fn check(probe: Probe<'_>, baselines: &BaselineStore, now: i64, flags: &mut Vec<TriageFlag>) {
    baselines.record_sample(probe.resource_id, probe.metric, now, probe.value);

    if probe.value > probe.watch {
        flags.push(TriageFlag {
            resource_id: probe.resource_id.to_string(),
            resource_name: probe.resource_name.to_string(),
            resource_type: probe.resource_type.to_string(),
            node: probe.node.to_string(),
            metric: probe.metric.to_string(),
            value: probe.value,
            reason: FlagReason::Threshold { watch: probe.watch },
        });
        return;
    }

    if let Some(anomaly) = baselines.check(probe.resource_id, probe.metric, probe.value) {
        flags.push(TriageFlag {
            resource_id: probe.resource_id.to_string(),
            resource_name: probe.resource_name.to_string(),
            resource_type: probe.resource_type.to_string(),
            node: probe.node.to_string(),
            metric: probe.metric.to_string(),
            value: probe.value,
            reason: FlagReason::Anomaly {
                expected: anomaly.expected,
                z_score: anomaly.z_score,
            },
        });
    }
}

/// Scan a snapshot against the current thresholds and baselines
pub fn triage(
    snapshot: &StateSnapshot,
    thresholds: &PatrolThresholds,
    baselines: &BaselineStore,
) -> TriageReport {
    let now = Utc::now().timestamp();
    let mut report = TriageReport::default();
    let flags = &mut report.flags;

    for node in &snapshot.nodes {
        report.checked.nodes += 1;
        check(
            Probe {
                resource_id: &node.id,
                resource_name: &node.name,
                resource_type: "node",
                node: &node.name,
                metric: "cpu",
                value: node.cpu_percent,
                watch: thresholds.node_cpu.watch,
            },
            baselines,
            now,
            flags,
        );
        check(
            Probe {
                resource_id: &node.id,
                resource_name: &node.name,
                resource_type: "node",
                node: &node.name,
                metric: "memory",
                value: node.memory_percent,
                watch: thresholds.node_memory.watch,
            },
            baselines,
            now,
            flags,
        );
    }

    for guest in &snapshot.guests {
        report.checked.guests += 1;
        if guest.status != "running" {
            continue;
        }
        let resource_type = guest.kind.to_string();
        check(
            Probe {
                resource_id: &guest.id,
                resource_name: &guest.name,
                resource_type: &resource_type,
                node: &guest.node,
                metric: "memory",
                value: guest.memory_percent,
                watch: thresholds.guest_memory.watch,
            },
            baselines,
            now,
            flags,
        );
        check(
            Probe {
                resource_id: &guest.id,
                resource_name: &guest.name,
                resource_type: &resource_type,
                node: &guest.node,
                metric: "disk",
                value: guest.disk_percent,
                watch: thresholds.guest_disk.watch,
            },
            baselines,
            now,
            flags,
        );
        check(
            Probe {
                resource_id: &guest.id,
                resource_name: &guest.name,
                resource_type: &resource_type,
                node: &guest.node,
                metric: "cpu",
                value: guest.cpu_percent,
                watch: thresholds.node_cpu.watch,
            },
            baselines,
            now,
            flags,
        );
    }

    for host in &snapshot.docker_hosts {
        report.checked.docker_hosts += 1;
        check(
            Probe {
                resource_id: &host.id,
                resource_name: &host.name,
                resource_type: "docker-host",
                node: &host.name,
                metric: "memory",
                value: host.memory_percent,
                watch: thresholds.node_memory.watch,
            },
            baselines,
            now,
            flags,
        );
        check(
            Probe {
                resource_id: &host.id,
                resource_name: &host.name,
                resource_type: "docker-host",
                node: &host.name,
                metric: "disk",
                value: host.disk_percent,
                watch: thresholds.guest_disk.watch,
            },
            baselines,
            now,
            flags,
        );
    }

    for pool in &snapshot.storage {
        report.checked.storage += 1;
        check(
            Probe {
                resource_id: &pool.id,
                resource_name: &pool.name,
                resource_type: "storage",
                node: &pool.node,
                metric: "usage",
                value: pool.usage_percent,
                watch: thresholds.storage.watch,
            },
            baselines,
            now,
            flags,
        );
    }

    for pbs in &snapshot.backup_servers {
        report.checked.backup += 1;
        check(
            Probe {
                resource_id: &pbs.id,
                resource_name: &pbs.name,
                resource_type: "pbs",
                node: &pbs.name,
                metric: "usage",
                value: pbs.datastore_usage_percent,
                watch: thresholds.storage.watch,
            },
            baselines,
            now,
            flags,
        );
    }

    for pmg in &snapshot.mail_gateways {
        report.checked.mail += 1;
        check(
            Probe {
                resource_id: &pmg.id,
                resource_name: &pmg.name,
                resource_type: "pmg",
                node: &pmg.name,
                metric: "memory",
                value: pmg.memory_percent,
                watch: thresholds.node_memory.watch,
            },
            baselines,
            now,
            flags,
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{GuestKind, GuestRecord, NodeRecord, StoragePoolRecord};
    use crate::thresholds::{Band, BandWithCritical, ThresholdMode};

    fn thresholds() -> PatrolThresholds {
        PatrolThresholds {
            node_cpu: Band {
                watch: 80.0,
                warning: 85.0,
            },
            node_memory: Band {
                watch: 80.0,
                warning: 85.0,
            },
            guest_memory: Band {
                watch: 80.0,
                warning: 85.0,
            },
            guest_disk: BandWithCritical {
                watch: 75.0,
                warning: 85.0,
                critical: 90.0,
            },
            storage: BandWithCritical {
                watch: 75.0,
                warning: 85.0,
                critical: 90.0,
            },
            mode: ThresholdMode::Exact,
        }
    }

    fn snapshot() -> StateSnapshot {
        StateSnapshot {
            nodes: vec![NodeRecord {
                id: "node/pve1".to_string(),
                name: "pve1".to_string(),
                cpu_percent: 50.0,
                memory_percent: 91.0,
                ..Default::default()
            }],
            guests: vec![
                GuestRecord {
                    id: "qemu/101".to_string(),
                    name: "web01".to_string(),
                    node: "pve1".to_string(),
                    kind: GuestKind::Vm,
                    vmid: 101,
                    status: "running".to_string(),
                    cpu_percent: 10.0,
                    memory_percent: 40.0,
                    disk_percent: 91.0,
                    ..Default::default()
                },
                GuestRecord {
                    id: "lxc/200".to_string(),
                    name: "stopped01".to_string(),
                    status: "stopped".to_string(),
                    disk_percent: 99.0,
                    ..Default::default()
                },
            ],
            storage: vec![StoragePoolRecord {
                id: "storage/local".to_string(),
                name: "local".to_string(),
                usage_percent: 50.0,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_flags_threshold_breaches() {
        let baselines = BaselineStore::new();
        let report = triage(&snapshot(), &thresholds(), &baselines);

        assert_eq!(report.flags.len(), 2);
        assert!(report
            .flags
            .iter()
            .any(|f| f.resource_id == "node/pve1" && f.metric == "memory"));
        assert!(report
            .flags
            .iter()
            .any(|f| f.resource_id == "qemu/101" && f.metric == "disk"));
        assert_eq!(report.checked.nodes, 1);
        assert_eq!(report.checked.guests, 2);
        assert_eq!(report.checked.storage, 1);
    }

    #[test]
    fn test_stopped_guests_not_flagged() {
        let baselines = BaselineStore::new();
        let report = triage(&snapshot(), &thresholds(), &baselines);
        assert!(!report.flags.iter().any(|f| f.resource_id == "lxc/200"));
    }

    #[test]
    fn test_quiet_snapshot() {
        let baselines = BaselineStore::new();
        let mut quiet = snapshot();
        quiet.nodes[0].memory_percent = 40.0;
        quiet.guests[0].disk_percent = 30.0;

        let report = triage(&quiet, &thresholds(), &baselines);
        assert!(report.is_quiet());
    }

    #[test]
    fn test_baseline_anomaly_flags_below_threshold() {
        let baselines = BaselineStore::new().with_min_samples(5);
        let mut calm = snapshot();
        calm.nodes[0].memory_percent = 40.0;
        calm.guests[0].disk_percent = 30.0;

        // Build a tight baseline around 10% guest CPU
        for i in 0..20 {
            calm.guests[0].cpu_percent = 10.0 + (i % 3) as f64;
            triage(&calm, &thresholds(), &baselines);
        }

        // A jump to 60% is far below the 80% watch but way off baseline
        calm.guests[0].cpu_percent = 60.0;
        let report = triage(&calm, &thresholds(), &baselines);

        let flag = report
            .flags
            .iter()
            .find(|f| f.resource_id == "qemu/101" && f.metric == "cpu")
            .expect("anomaly flag");
        assert!(matches!(flag.reason, FlagReason::Anomaly { .. }));
    }

    #[test]
    fn test_flags_for_scope_filter() {
        let baselines = BaselineStore::new();
        let report = triage(&snapshot(), &thresholds(), &baselines);

        let scoped: std::collections::BTreeSet<String> =
            ["qemu/101".to_string()].into_iter().collect();
        let scoped_flags: Vec<_> = report.flags_for(&scoped).collect();
        assert_eq!(scoped_flags.len(), 1);

        let all: std::collections::BTreeSet<String> = Default::default();
        assert_eq!(report.flags_for(&all).count(), 2);
    }
}

//! Infrastructure state snapshot types
//!
//! A snapshot is the typed inventory the patrol engine inspects: hypervisor
//! nodes, guests, Docker hosts and their containers, storage pools, backup
//! and mail gateway instances, and agent hosts. Usage values may arrive as
//! fractions (≤ 1) or percentages (> 1); `normalize` canonicalizes to percent.

use serde::{Deserialize, Serialize};

/// Convert a fraction-or-percent value to a percentage in [0, 100]
pub fn normalize_percent(value: f64) -> f64 {
    let pct = if value <= 1.0 { value * 100.0 } else { value };
    pct.clamp(0.0, 100.0)
}

/// A hypervisor node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub instance: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub uptime_secs: u64,
}

/// Kind of guest workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    #[default]
    Vm,
    Container,
}

impl std::fmt::Display for GuestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuestKind::Vm => write!(f, "vm"),
            GuestKind::Container => write!(f, "container"),
        }
    }
}

/// A virtual machine or LXC container
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuestRecord {
    pub id: String,
    pub name: String,
    pub node: String,
    pub instance: String,
    pub kind: GuestKind,
    pub vmid: u32,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

/// A Docker container on a monitored host
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DockerContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub restart_count: u32,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// A Docker host and its containers
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DockerHostRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub containers: Vec<DockerContainerRecord>,
}

/// A storage pool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoragePoolRecord {
    pub id: String,
    pub name: String,
    pub node: String,
    pub instance: String,
    pub status: String,
    pub usage_percent: f64,
    pub total_bytes: u64,
    pub used_bytes: u64,
}

/// A backup server instance
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupServerRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub datastore_usage_percent: f64,
    pub last_backup_age_hours: Option<f64>,
}

/// A mail gateway instance
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailGatewayRecord {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub queue_depth: u64,
}

/// A host running a connected command agent
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentHostRecord {
    pub id: String,
    pub name: String,
    pub node: String,
    pub connected: bool,
    pub version: String,
}

/// Full inventory snapshot consumed by a patrol run
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateSnapshot {
    pub nodes: Vec<NodeRecord>,
    pub guests: Vec<GuestRecord>,
    pub docker_hosts: Vec<DockerHostRecord>,
    pub storage: Vec<StoragePoolRecord>,
    pub backup_servers: Vec<BackupServerRecord>,
    pub mail_gateways: Vec<MailGatewayRecord>,
    pub agent_hosts: Vec<AgentHostRecord>,
}

impl StateSnapshot {
    /// Canonicalize all usage values to percentages
    pub fn normalize(&mut self) {
        for n in &mut self.nodes {
            n.cpu_percent = normalize_percent(n.cpu_percent);
            n.memory_percent = normalize_percent(n.memory_percent);
            n.disk_percent = normalize_percent(n.disk_percent);
        }
        for g in &mut self.guests {
            g.cpu_percent = normalize_percent(g.cpu_percent);
            g.memory_percent = normalize_percent(g.memory_percent);
            g.disk_percent = normalize_percent(g.disk_percent);
        }
        for d in &mut self.docker_hosts {
            d.cpu_percent = normalize_percent(d.cpu_percent);
            d.memory_percent = normalize_percent(d.memory_percent);
            d.disk_percent = normalize_percent(d.disk_percent);
            for c in &mut d.containers {
                c.cpu_percent = normalize_percent(c.cpu_percent);
                c.memory_percent = normalize_percent(c.memory_percent);
            }
        }
        for s in &mut self.storage {
            s.usage_percent = normalize_percent(s.usage_percent);
        }
        for b in &mut self.backup_servers {
            b.cpu_percent = normalize_percent(b.cpu_percent);
            b.memory_percent = normalize_percent(b.memory_percent);
            b.datastore_usage_percent = normalize_percent(b.datastore_usage_percent);
        }
        for m in &mut self.mail_gateways {
            m.cpu_percent = normalize_percent(m.cpu_percent);
            m.memory_percent = normalize_percent(m.memory_percent);
        }
    }

    /// Whether any resource list is non-empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.guests.is_empty()
            && self.docker_hosts.is_empty()
            && self.storage.is_empty()
            && self.backup_servers.is_empty()
            && self.mail_gateways.is_empty()
    }

    /// Look up the display name for a resource id, if present
    pub fn resource_name(&self, resource_id: &str) -> Option<&str> {
        if let Some(n) = self.nodes.iter().find(|n| n.id == resource_id) {
            return Some(&n.name);
        }
        if let Some(g) = self.guests.iter().find(|g| g.id == resource_id) {
            return Some(&g.name);
        }
        if let Some(d) = self.docker_hosts.iter().find(|d| d.id == resource_id) {
            return Some(&d.name);
        }
        if let Some(s) = self.storage.iter().find(|s| s.id == resource_id) {
            return Some(&s.name);
        }
        if let Some(b) = self.backup_servers.iter().find(|b| b.id == resource_id) {
            return Some(&b.name);
        }
        if let Some(m) = self.mail_gateways.iter().find(|m| m.id == resource_id) {
            return Some(&m.name);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_percent_fraction() {
        assert_eq!(normalize_percent(0.42), 42.0);
        assert_eq!(normalize_percent(1.0), 100.0);
    }

    #[test]
    fn test_normalize_percent_passthrough() {
        assert_eq!(normalize_percent(42.0), 42.0);
        assert_eq!(normalize_percent(150.0), 100.0);
        assert_eq!(normalize_percent(-3.0), 0.0);
    }

    #[test]
    fn test_snapshot_normalize_mixed_encodings() {
        let mut snapshot = StateSnapshot {
            nodes: vec![NodeRecord {
                id: "node/pve1".to_string(),
                cpu_percent: 0.35,
                memory_percent: 72.0,
                ..Default::default()
            }],
            guests: vec![GuestRecord {
                id: "vm/101".to_string(),
                disk_percent: 0.9,
                ..Default::default()
            }],
            ..Default::default()
        };

        snapshot.normalize();

        assert_eq!(snapshot.nodes[0].cpu_percent, 35.0);
        assert_eq!(snapshot.nodes[0].memory_percent, 72.0);
        assert_eq!(snapshot.guests[0].disk_percent, 90.0);
    }

    #[test]
    fn test_resource_name_lookup() {
        let snapshot = StateSnapshot {
            guests: vec![GuestRecord {
                id: "vm/101".to_string(),
                name: "web01".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(snapshot.resource_name("vm/101"), Some("web01"));
        assert_eq!(snapshot.resource_name("vm/999"), None);
    }
}

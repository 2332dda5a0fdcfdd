use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::Deserialize;

/// Captured output of a successful `lxc` invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

// ── lxc list --format json ──────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceState {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub network: Option<BTreeMap<String, NetworkState>>,
    #[serde(default)]
    pub cpu: Option<CpuState>,
    #[serde(default)]
    pub memory: Option<MemoryState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkState {
    #[serde(default)]
    pub addresses: Option<Vec<NetworkAddress>>,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkAddress {
    pub family: String,
    pub address: String,
    #[serde(default)]
    pub scope: String,
}

/// Cumulative CPU time in nanoseconds.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CpuState {
    #[serde(default)]
    pub usage: i64,
}

/// Current memory usage in bytes.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct MemoryState {
    #[serde(default)]
    pub usage: i64,
}

impl Instance {
    /// First global-scope IPv4 address on any non-loopback interface.
    ///
    /// Interfaces are visited in name order so the answer is stable across
    /// calls.
    pub fn first_global_ipv4(&self) -> Option<Ipv4Addr> {
        let network = self.state.as_ref()?.network.as_ref()?;
        network
            .iter()
            .filter(|(iface, net)| iface.as_str() != "lo" && net.kind != "loopback")
            .flat_map(|(_, net)| net.addresses.iter().flatten())
            .filter(|addr| addr.family == "inet" && addr.scope == "global")
            .find_map(|addr| {
                addr.address
                    .parse::<Ipv4Addr>()
                    .ok()
                    .filter(|ip| !ip.is_loopback())
            })
    }

    pub fn cpu_usage_ns(&self) -> u64 {
        self.state
            .as_ref()
            .and_then(|s| s.cpu)
            .map(|c| c.usage.max(0) as u64)
            .unwrap_or(0)
    }

    pub fn memory_usage_bytes(&self) -> u64 {
        self.state
            .as_ref()
            .and_then(|s| s.memory)
            .map(|m| m.usage.max(0) as u64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUNNING: &str = r#"[{
        "name": "vps-1a2b3c4d-web",
        "status": "Running",
        "state": {
            "status": "Running",
            "network": {
                "lo": {
                    "type": "loopback",
                    "addresses": [
                        {"family": "inet", "address": "127.0.0.1", "scope": "local"}
                    ]
                },
                "eth0": {
                    "type": "broadcast",
                    "addresses": [
                        {"family": "inet6", "address": "fd42::1", "scope": "global"},
                        {"family": "inet", "address": "10.44.12.7", "scope": "global"}
                    ]
                }
            },
            "cpu": {"usage": 5123456789},
            "memory": {"usage": 73400320}
        }
    }]"#;

    #[test]
    fn picks_global_ipv4_and_skips_loopback() {
        let instances: Vec<Instance> = serde_json::from_str(RUNNING).unwrap();
        let instance = &instances[0];

        assert_eq!(instance.status, "Running");
        assert_eq!(
            instance.first_global_ipv4(),
            Some(Ipv4Addr::new(10, 44, 12, 7))
        );
        assert_eq!(instance.cpu_usage_ns(), 5_123_456_789);
        assert_eq!(instance.memory_usage_bytes(), 73_400_320);
    }

    #[test]
    fn link_local_only_means_no_address_yet() {
        let json = r#"[{
            "name": "vps-x",
            "status": "Running",
            "state": {
                "network": {
                    "eth0": {
                        "type": "broadcast",
                        "addresses": [
                            {"family": "inet6", "address": "fe80::1", "scope": "link"}
                        ]
                    }
                }
            }
        }]"#;
        let instances: Vec<Instance> = serde_json::from_str(json).unwrap();
        assert_eq!(instances[0].first_global_ipv4(), None);
    }

    #[test]
    fn stopped_instance_has_null_state_fields() {
        let json = r#"[{
            "name": "vps-x",
            "status": "Stopped",
            "state": {"status": "Stopped", "network": null, "cpu": {"usage": 0}, "memory": {"usage": 0}}
        }]"#;
        let instances: Vec<Instance> = serde_json::from_str(json).unwrap();
        assert_eq!(instances[0].status, "Stopped");
        assert_eq!(instances[0].first_global_ipv4(), None);
        assert_eq!(instances[0].cpu_usage_ns(), 0);
    }
}

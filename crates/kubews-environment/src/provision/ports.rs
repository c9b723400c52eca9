//! Installer server port conflicts
//!
//! Containers of one pod share a network namespace, so two installers that
//! declare the same port would fail at runtime. The first declaration keeps
//! its port; every later one is moved to the lowest free port of the
//! configured range, and the machine learns the new value through a
//! `CHE_SERVER_<NAME>_PORT` variable.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use kubews_common::{Error, Result};

use crate::identity::RuntimeIdentity;
use crate::model::{KubernetesEnvironment, MachineConfig};
use crate::pipeline::Provisioner;

/// Half-open port range `[min, max)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// First port that may be assigned
    pub min: u16,
    /// One past the last port that may be assigned
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: 10_000,
            max: 20_000,
        }
    }
}

/// Ports taken in one pod, plus a cursor for handing out free ones
#[derive(Debug)]
pub struct PortReservationSet {
    occupied: BTreeSet<u16>,
    next_free: u16,
    range: PortRange,
}

impl PortReservationSet {
    /// Empty set over `range`
    pub fn new(range: PortRange) -> Self {
        Self {
            occupied: BTreeSet::new(),
            next_free: range.min,
            range,
        }
    }

    /// Claim `port`; false if it was already taken
    pub fn occupy(&mut self, port: u16) -> bool {
        self.occupied.insert(port)
    }

    /// Whether `port` is taken
    pub fn is_occupied(&self, port: u16) -> bool {
        self.occupied.contains(&port)
    }

    /// Claim the lowest free port at or after the cursor.
    ///
    /// The cursor only moves forward, so a port below it is never handed out
    /// twice even if it was skipped.
    pub fn next_free(&mut self) -> Result<u16> {
        while self.next_free < self.range.max {
            let candidate = self.next_free;
            self.next_free += 1;
            if self.occupied.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::port_range_exhausted(self.range.min, self.range.max))
    }
}

/// `CHE_SERVER_<NAME>_PORT` for a server name
pub fn server_port_env_name(server: &str) -> String {
    let normalized: String = server
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CHE_SERVER_{}_PORT", normalized)
}

/// Servers of one installer of one machine that share a requested port
#[derive(Debug)]
struct PortGroup {
    port: u16,
    machine: String,
    installer: usize,
    servers: Vec<String>,
}

fn collect_groups(machines: &BTreeMap<String, MachineConfig>) -> Vec<PortGroup> {
    let mut groups: Vec<PortGroup> = Vec::new();
    for (machine_name, machine) in machines {
        for (index, installer) in machine.installers.iter().enumerate() {
            for (server_name, server) in &installer.servers {
                let Some(port) = server.port_number() else {
                    continue;
                };
                let existing = groups.iter_mut().find(|g| {
                    g.port == port && g.machine == *machine_name && g.installer == index
                });
                match existing {
                    Some(group) => group.servers.push(server_name.clone()),
                    None => groups.push(PortGroup {
                        port,
                        machine: machine_name.clone(),
                        installer: index,
                        servers: vec![server_name.clone()],
                    }),
                }
            }
        }
    }
    groups
}

/// Resolve conflicts among the machines of one pod.
///
/// `machines` holds only that pod's machines. Machine servers that belong to
/// no installer are fixed and claimed before any installer. Returns the number
/// of server groups that were moved.
pub fn resolve_pod_ports(
    machines: &mut BTreeMap<String, MachineConfig>,
    range: PortRange,
) -> Result<usize> {
    let mut reservations = PortReservationSet::new(range);

    for machine in machines.values() {
        let installer_servers: BTreeSet<&str> = machine
            .installers
            .iter()
            .flat_map(|i| i.servers.keys().map(String::as_str))
            .collect();
        for (name, server) in &machine.servers {
            if installer_servers.contains(name.as_str()) {
                continue;
            }
            if let Some(port) = server.port_number() {
                reservations.occupy(port);
            }
        }
    }

    let mut conflicting = Vec::new();
    for group in collect_groups(machines) {
        if !reservations.occupy(group.port) {
            conflicting.push(group);
        }
    }

    for group in &conflicting {
        let new_port = reservations.next_free()?;
        let Some(machine) = machines.get_mut(&group.machine) else {
            continue;
        };
        for server_name in &group.servers {
            if let Some(server) = machine
                .installers
                .get_mut(group.installer)
                .and_then(|i| i.servers.get_mut(server_name))
            {
                server.set_port_number(new_port);
            }
            if let Some(server) = machine.servers.get_mut(server_name) {
                server.set_port_number(new_port);
            }
            machine
                .env
                .insert(server_port_env_name(server_name), new_port.to_string());
        }
        info!(
            machine = %group.machine,
            requested = group.port,
            assigned = new_port,
            servers = ?group.servers,
            "installer server port reassigned"
        );
    }

    Ok(conflicting.len())
}

/// Runs [`resolve_pod_ports`] once per pod
pub struct InstallerServersPortProvisioner {
    range: PortRange,
}

impl InstallerServersPortProvisioner {
    /// Provisioner assigning moved servers from `range`
    pub fn new(range: PortRange) -> Self {
        Self { range }
    }
}

#[async_trait]
impl Provisioner for InstallerServersPortProvisioner {
    fn name(&self) -> &str {
        "installer-server-ports"
    }

    async fn provision(
        &self,
        env: &mut KubernetesEnvironment,
        identity: &RuntimeIdentity,
    ) -> Result<()> {
        // Machines are keyed `<pod>/<container>`; split them per pod
        let mut per_pod: BTreeMap<String, BTreeMap<String, MachineConfig>> = BTreeMap::new();
        for (name, machine) in std::mem::take(&mut env.machines) {
            let pod = name.split('/').next().unwrap_or_default().to_string();
            per_pod.entry(pod).or_default().insert(name, machine);
        }

        let mut result = Ok(());
        for (pod, machines) in per_pod.iter_mut() {
            match resolve_pod_ports(machines, self.range) {
                Ok(moved) if moved > 0 => debug!(
                    workspace_id = %identity.workspace_id,
                    pod = %pod,
                    moved,
                    "resolved installer port conflicts"
                ),
                Ok(_) => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        env.machines = per_pod.into_values().flatten().collect();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InstallerConfig, ServerConfig};

    fn server(port: &str) -> ServerConfig {
        ServerConfig {
            port: port.to_string(),
            protocol: Some("http".to_string()),
            ..Default::default()
        }
    }

    fn installer(id: &str, servers: &[(&str, &str)]) -> InstallerConfig {
        InstallerConfig {
            id: id.to_string(),
            servers: servers
                .iter()
                .map(|(name, port)| (name.to_string(), server(port)))
                .collect(),
        }
    }

    /// Machine whose server map mirrors its installers' servers
    fn machine(installers: Vec<InstallerConfig>) -> MachineConfig {
        let servers = installers
            .iter()
            .flat_map(|i| i.servers.clone())
            .collect();
        MachineConfig {
            servers,
            installers,
            ..Default::default()
        }
    }

    fn range() -> PortRange {
        PortRange {
            min: 4400,
            max: 4420,
        }
    }

    // ==========================================================================
    // Story: reservation set
    // ==========================================================================

    #[test]
    fn next_free_skips_occupied_and_never_moves_back() {
        let mut set = PortReservationSet::new(PortRange { min: 10, max: 14 });
        set.occupy(10);
        set.occupy(12);
        assert_eq!(set.next_free().unwrap(), 11);
        assert_eq!(set.next_free().unwrap(), 13);
        assert!(matches!(
            set.next_free(),
            Err(Error::PortRangeExhausted { min: 10, max: 14 })
        ));
    }

    #[test]
    fn env_name_is_normalized() {
        assert_eq!(
            server_port_env_name("exec-agent/http"),
            "CHE_SERVER_EXEC_AGENT_HTTP_PORT"
        );
        assert_eq!(server_port_env_name("terminal"), "CHE_SERVER_TERMINAL_PORT");
    }

    // ==========================================================================
    // Story: two installers in one pod declare the same port
    // ==========================================================================

    #[test]
    fn second_claim_moves_to_lowest_free_port_and_keeps_suffix() {
        let mut machines = BTreeMap::from([
            (
                "app/ide".to_string(),
                machine(vec![installer("terminal", &[("terminal", "4411/tcp")])]),
            ),
            (
                "app/tools".to_string(),
                machine(vec![installer("exec", &[("exec-agent", "4411/tcp")])]),
            ),
        ]);

        let moved = resolve_pod_ports(&mut machines, range()).unwrap();
        assert_eq!(moved, 1);

        let kept = &machines["app/ide"];
        assert_eq!(kept.installers[0].servers["terminal"].port, "4411/tcp");
        assert!(kept.env.is_empty());

        let moved = &machines["app/tools"];
        assert_eq!(moved.installers[0].servers["exec-agent"].port, "4400/tcp");
        assert_eq!(moved.servers["exec-agent"].port, "4400/tcp");
        assert_eq!(moved.env["CHE_SERVER_EXEC_AGENT_PORT"], "4400");
    }

    #[test]
    fn servers_of_one_installer_on_one_port_move_together() {
        let mut machines = BTreeMap::from([
            (
                "app/a".to_string(),
                machine(vec![installer("ws-agent", &[("wsagent/http", "4401/tcp")])]),
            ),
            (
                "app/b".to_string(),
                machine(vec![installer(
                    "ws-agent",
                    &[("wsagent/http", "4401/tcp"), ("wsagent/ws", "4401/tcp")],
                )]),
            ),
        ]);

        resolve_pod_ports(&mut machines, range()).unwrap();

        let b = &machines["app/b"];
        assert_eq!(b.installers[0].servers["wsagent/http"].port, "4400/tcp");
        assert_eq!(b.installers[0].servers["wsagent/ws"].port, "4400/tcp");
        assert_eq!(b.env["CHE_SERVER_WSAGENT_HTTP_PORT"], "4400");
        assert_eq!(b.env["CHE_SERVER_WSAGENT_WS_PORT"], "4400");
    }

    #[test]
    fn all_ports_distinct_after_resolution() {
        let mut machines: BTreeMap<String, MachineConfig> = (0..5)
            .map(|i| {
                (
                    format!("app/c{}", i),
                    machine(vec![installer("agent", &[("agent", "4400/tcp")])]),
                )
            })
            .collect();

        assert_eq!(resolve_pod_ports(&mut machines, range()).unwrap(), 4);

        let ports: BTreeSet<u16> = machines
            .values()
            .map(|m| m.installers[0].servers["agent"].port_number().unwrap())
            .collect();
        assert_eq!(ports.len(), 5);
        assert!(ports.iter().all(|p| (4400..4420).contains(p)));
    }

    #[test]
    fn fixed_machine_servers_are_never_handed_out() {
        let mut ide = machine(vec![installer("terminal", &[("terminal", "4411/tcp")])]);
        ide.servers.insert("app".to_string(), server("4400/tcp"));
        let mut machines = BTreeMap::from([
            ("app/ide".to_string(), ide),
            (
                "app/tools".to_string(),
                machine(vec![installer("terminal", &[("terminal", "4411/tcp")])]),
            ),
        ]);

        resolve_pod_ports(&mut machines, range()).unwrap();

        assert_eq!(
            machines["app/tools"].installers[0].servers["terminal"].port,
            "4401/tcp"
        );
    }

    #[test]
    fn exhausted_range_is_fatal() {
        let mut machines = BTreeMap::from([
            (
                "app/a".to_string(),
                machine(vec![installer("x", &[("x", "80")])]),
            ),
            (
                "app/b".to_string(),
                machine(vec![installer("x", &[("x", "80")])]),
            ),
        ]);

        let err = resolve_pod_ports(&mut machines, PortRange { min: 80, max: 81 }).unwrap_err();
        assert!(err.to_string().contains("no available port in configured range"));
    }

    // ==========================================================================
    // Story: provisioner splits machines per pod
    // ==========================================================================

    #[tokio::test]
    async fn same_port_in_different_pods_is_not_a_conflict() {
        let mut env = KubernetesEnvironment::default();
        env.machines.insert(
            "web/main".to_string(),
            machine(vec![installer("terminal", &[("terminal", "4411/tcp")])]),
        );
        env.machines.insert(
            "db/main".to_string(),
            machine(vec![installer("terminal", &[("terminal", "4411/tcp")])]),
        );

        InstallerServersPortProvisioner::new(range())
            .provision(
                &mut env,
                &RuntimeIdentity::new("ws1", "default", "owner", "ns"),
            )
            .await
            .unwrap();

        assert_eq!(env.machines.len(), 2);
        for machine in env.machines.values() {
            assert_eq!(machine.installers[0].servers["terminal"].port, "4411/tcp");
            assert!(machine.env.is_empty());
        }
    }
}

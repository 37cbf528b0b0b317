//! Indexed port/hub storage.
//!
//! The original implementation keeps ports and hubs on intrusive
//! `LIST_HEAD`s and finds a port by path with a linear scan. Here a port is
//! addressable by any of its topology paths through a secondary index, and
//! removal is O(number of paths on the port) rather than O(list length).

use std::collections::HashMap;

use crate::model::hub::{Hub, HubId};
use crate::model::path::TopologyPath;
use crate::model::port::{Port, PortId};

#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: HashMap<PortId, Port>,
    by_path: HashMap<TopologyPath, PortId>,
    hubs: HashMap<HubId, Hub>,
    next_port_id: u32,
    next_hub_id: u32,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_port_id(&mut self) -> PortId {
        let id = PortId(self.next_port_id);
        self.next_port_id += 1;
        id
    }

    pub fn alloc_hub_id(&mut self) -> HubId {
        let id = HubId(self.next_hub_id);
        self.next_hub_id += 1;
        id
    }

    /// Adds a port. Panics if any of its paths is already registered,
    /// preserving the "a port appears in the registry at most once"
    /// invariant (`spec.md` §3).
    pub fn add_port(&mut self, port: Port) {
        for path in &port.topology_paths {
            assert!(
                !self.by_path.contains_key(path),
                "topology path {path} already registered"
            );
        }
        for path in &port.topology_paths {
            self.by_path.insert(path.clone(), port.id);
        }
        self.ports.insert(port.id, port);
    }

    pub fn remove_port(&mut self, id: PortId) -> Option<Port> {
        let port = self.ports.remove(&id)?;
        for path in &port.topology_paths {
            self.by_path.remove(path);
        }
        Some(port)
    }

    pub fn find_by_path(&self, path: &TopologyPath) -> Option<&Port> {
        let id = self.by_path.get(path)?;
        self.ports.get(id)
    }

    pub fn find_by_path_mut(&mut self, path: &TopologyPath) -> Option<&mut Port> {
        let id = *self.by_path.get(path)?;
        self.ports.get_mut(&id)
    }

    pub fn get(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id)
    }

    pub fn get_mut(&mut self, id: PortId) -> Option<&mut Port> {
        self.ports.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Port> {
        self.ports.values_mut()
    }

    pub fn add_hub(&mut self, hub: Hub) {
        self.hubs.insert(hub.id, hub);
    }

    pub fn hub(&self, id: HubId) -> Option<&Hub> {
        self.hubs.get(&id)
    }

    /// Finds the hub whose own topology path is exactly `parent_path`, so a
    /// hotplug arrival's path can be split into "which hub" plus "which of
    /// its ports" (`spec.md` §4.4/§4.5: a `GenericHub`/`Ykush` port has no
    /// real path of its own until a device first enumerates under it).
    pub fn find_hub_by_path(&self, parent_path: &TopologyPath) -> Option<&Hub> {
        self.hubs.values().find(|h| h.path.as_ref() == Some(parent_path))
    }

    /// Finds the still-placeholder-pathed port belonging to `hub_id` whose
    /// backend-specific port number is `hub_port`.
    pub fn find_port_by_hub_port(&self, hub_id: HubId, hub_port: u8) -> Option<PortId> {
        self.ports
            .values()
            .find(|p| p.parent_hub == Some(hub_id) && p.hub_port_number() == Some(hub_port))
            .map(|p| p.id)
    }

    /// Rewrites `port_id`'s topology path to `path`, fixing up the `by_path`
    /// index. Used once a `GenericHub`/`Ykush` port's real path is learned
    /// from its first device arrival, replacing the placeholder it was
    /// registered with.
    pub fn retarget_port_path(&mut self, port_id: PortId, path: TopologyPath) {
        if let Some(port) = self.ports.get(&port_id) {
            for old in &port.topology_paths {
                self.by_path.remove(old);
            }
        }
        self.by_path.insert(path.clone(), port_id);
        if let Some(port) = self.ports.get_mut(&port_id) {
            port.topology_paths = vec![path];
        }
    }

    /// Exchanges two ports' topology paths and fixes up the `by_path` index
    /// to match, so a later [`Self::find_by_path`] resolves to the port that
    /// now actually owns each path. Used by the GPIO path-discovery probe
    /// when it learns that a line it lit actually controls the physical
    /// location another port was configured with (`spec.md` §4.6 item 4).
    /// A no-op if either port does not exist.
    pub fn swap_port_paths(&mut self, a: PortId, b: PortId) {
        if a == b {
            return;
        }
        let Some(a_paths) = self.ports.get(&a).map(|p| p.topology_paths.clone()) else { return };
        let Some(b_paths) = self.ports.get(&b).map(|p| p.topology_paths.clone()) else { return };

        for path in a_paths.iter().chain(b_paths.iter()) {
            self.by_path.remove(path);
        }

        if let Some(port) = self.ports.get_mut(&a) {
            port.topology_paths = b_paths.clone();
        }
        if let Some(port) = self.ports.get_mut(&b) {
            port.topology_paths = a_paths.clone();
        }

        for path in b_paths {
            self.by_path.insert(path, a);
        }
        for path in a_paths {
            self.by_path.insert(path, b);
        }
    }

    /// Removes a hub and every port whose `parent_hub` is that hub
    /// (`spec.md` §8: "removing `h` removes every port whose
    /// `parent_hub_ref == h`").
    pub fn remove_hub(&mut self, id: HubId) -> Vec<Port> {
        self.hubs.remove(&id);
        let orphaned: Vec<PortId> = self
            .ports
            .values()
            .filter(|p| p.parent_hub == Some(id))
            .map(|p| p.id)
            .collect();
        orphaned
            .into_iter()
            .filter_map(|pid| self.remove_port(pid))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::port::{BackendRef, PortKind};

    fn gpio_port(id: PortId, path: &str) -> Port {
        Port::new(
            id,
            vec![path.parse().unwrap()],
            PortKind::Gpio,
            BackendRef::Gpio {
                addr: crate::model::port::GpioAddr::Num(1),
                on_val: b'1',
                off_val: b'0',
            },
        )
    }

    #[test]
    fn find_by_path_after_add() {
        let mut reg = PortRegistry::new();
        let id = reg.alloc_port_id();
        reg.add_port(gpio_port(id, "1-1"));
        assert!(reg.find_by_path(&"1-1".parse().unwrap()).is_some());
        assert!(reg.find_by_path(&"1-2".parse().unwrap()).is_none());
    }

    #[test]
    fn removing_hub_removes_its_ports() {
        let mut reg = PortRegistry::new();
        let hub_id = reg.alloc_hub_id();
        reg.add_hub(Hub::new(hub_id, crate::model::hub::DeviceRef { bus: 1, address: 2 }));

        let port_id = reg.alloc_port_id();
        let mut port = gpio_port(port_id, "1-1");
        port.parent_hub = Some(hub_id);
        reg.add_port(port);

        let other_id = reg.alloc_port_id();
        reg.add_port(gpio_port(other_id, "1-2"));

        let removed = reg.remove_hub(hub_id);
        assert_eq!(removed.len(), 1);
        assert!(reg.get(port_id).is_none());
        assert!(reg.get(other_id).is_some());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_path_panics() {
        let mut reg = PortRegistry::new();
        let id_a = reg.alloc_port_id();
        reg.add_port(gpio_port(id_a, "1-1"));
        let id_b = reg.alloc_port_id();
        reg.add_port(gpio_port(id_b, "1-1"));
    }

    #[test]
    fn resolves_hub_child_arrival_and_retargets_placeholder_path() {
        let mut reg = PortRegistry::new();
        let hub_id = reg.alloc_hub_id();
        let mut hub = Hub::new(hub_id, crate::model::hub::DeviceRef { bus: 2, address: 5 });
        hub.path = Some("2-1".parse().unwrap());
        reg.add_hub(hub);

        let port_id = reg.alloc_port_id();
        let mut port = Port::new(
            port_id,
            vec!["255-0-0-2".parse().unwrap()], // placeholder, not a real path
            PortKind::GenericHub,
            BackendRef::GenericHub { hub_port: 2 },
        );
        port.parent_hub = Some(hub_id);
        reg.add_port(port);

        // A device arrives on the hub's port 2, i.e. real path "2-1-2".
        let parent_path: TopologyPath = "2-1".parse().unwrap();
        let found_hub = reg.find_hub_by_path(&parent_path).expect("hub should resolve by its own path");
        assert_eq!(found_hub.id, hub_id);

        let resolved = reg.find_port_by_hub_port(hub_id, 2).expect("port should resolve by hub + port number");
        assert_eq!(resolved, port_id);

        reg.retarget_port_path(resolved, "2-1-2".parse().unwrap());
        assert!(reg.find_by_path(&"2-1-2".parse().unwrap()).is_some());
        assert!(reg.find_by_path(&"255-0-0-2".parse().unwrap()).is_none());
    }

    #[test]
    fn swap_port_paths_keeps_index_consistent() {
        let mut reg = PortRegistry::new();
        let id_a = reg.alloc_port_id();
        reg.add_port(gpio_port(id_a, "1-1"));
        let id_b = reg.alloc_port_id();
        reg.add_port(gpio_port(id_b, "1-2"));

        reg.swap_port_paths(id_a, id_b);

        assert_eq!(reg.get(id_a).unwrap().topology_paths, vec!["1-2".parse().unwrap()]);
        assert_eq!(reg.get(id_b).unwrap().topology_paths, vec!["1-1".parse().unwrap()]);
        assert_eq!(reg.find_by_path(&"1-1".parse().unwrap()).unwrap().id, id_b);
        assert_eq!(reg.find_by_path(&"1-2".parse().unwrap()).unwrap().id, id_a);
    }
}

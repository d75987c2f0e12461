//! Sharing map pins.
//!
//! The server keeps the authoritative pin list, deduplicated on each pin's position key. Pins
//! sent to it are merged and forwarded verbatim to every other peer. Clients only ever merge pins
//! that come from the server, and skip ones they already have or placed themselves.

use std::collections::HashSet;

use super::{
    pin::{MapPin, PinDeletion},
    store::PinStore,
    MapSurface, PeerId, RoutedRpc, ADD_PIN, DELETE_PIN,
};
use crate::vector::{GridKey, Vec3};

/// Pin categories that are shared. The rest (deaths, bed, boss markers) belong to one player.
const SHARED_CATEGORIES: std::ops::RangeInclusive<i32> = 0..=4;

/// Cleans up a pin name the way the host does before showing it. Returns `None` if nothing
/// remains.
pub fn sanitize_pin_name(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '$' | '<' | '>') { ' ' } else { c })
        .collect();

    if cleaned.trim().is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Added,

    /// A pin with the same key is already stored. Not an error.
    Duplicate,
}

/// What a client did with a pin from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Added,
    NotFromServer,
    Malformed,

    /// We placed the pin ourselves.
    Own,

    /// The map already shows an equivalent pin.
    Similar,
}

pub struct PinSync {
    store: PinStore,
    pins: Vec<MapPin>,
    keys: HashSet<GridKey>,
}

impl PinSync {
    pub fn new(store: PinStore) -> PinSync {
        PinSync {
            store,
            pins: vec![],
            keys: HashSet::new(),
        }
    }

    /// Replaces the in-memory pins with the contents of the pin file.
    pub fn load(&mut self) {
        let loaded = match self.store.load_all() {
            Ok(pins) => pins,
            Err(err) => {
                log::error!("Failed to load map pins: {err:?}");
                return;
            }
        };

        self.pins.clear();
        self.keys.clear();

        for pin in loaded {
            self.merge(pin);
        }
    }

    pub fn save(&self) {
        if let Err(err) = self.store.save_all(&self.pins) {
            log::error!("An error occurred while saving pins: {err:?}");
        }
    }

    pub fn pins(&self) -> &[MapPin] {
        &self.pins
    }

    pub fn merge(&mut self, pin: MapPin) -> Merge {
        if !self.keys.insert(pin.key()) {
            return Merge::Duplicate;
        }

        self.pins.push(pin);
        Merge::Added
    }

    /// Removes every pin placed by `sender_name` within `radius` of `position`, returning how
    /// many were removed.
    pub fn delete(&mut self, sender_name: &str, position: Vec3, radius: f32) -> usize {
        let before = self.pins.len();
        let keys = &mut self.keys;

        self.pins.retain(|pin| {
            let doomed = pin.sender_name == sender_name && pin.position.distance(position) <= radius;

            if doomed {
                keys.remove(&pin.key());
            }

            !doomed
        });

        before - self.pins.len()
    }

    /// Handles pins sent to the server. The payload may hold several pins; if at least one is
    /// new, the payload is forwarded unchanged to every peer except `sender`.
    pub fn on_server_add(
        &mut self,
        rpc: &mut dyn RoutedRpc,
        sender: PeerId,
        payload: &[u8],
    ) -> usize {
        let mut added = 0;

        for pin in MapPin::read_each(payload) {
            match pin {
                Ok(pin) => {
                    if self.merge(pin) == Merge::Added {
                        added += 1;
                    }
                }

                Err(err) => {
                    log::warn!("Bad pin payload from {sender}: {err:?}");
                    break;
                }
            }
        }

        if added == 0 {
            log::debug!("Nothing new in pin payload from {sender}.");
            return 0;
        }

        for peer in rpc.peers() {
            if peer != sender {
                rpc.invoke(peer, ADD_PIN, payload.to_vec());
            }
        }

        added
    }

    /// Handles a deletion request on the server.
    pub fn on_server_delete(&mut self, sender: PeerId, payload: &[u8], radius: f32) -> usize {
        let request = match PinDeletion::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                log::warn!("Bad pin deletion from {sender}: {err:?}");
                return 0;
            }
        };

        let removed = self.delete(&request.sender_name, request.position, radius);

        log::debug!(
            "Deleted {removed} pin(s) from '{}' near {}.",
            request.sender_name,
            request.position
        );

        removed
    }

    /// Sends every stored pin to a peer that just joined, one pin per payload.
    pub fn push_all(&self, rpc: &mut dyn RoutedRpc, peer: PeerId) {
        log::info!("Sending {} stored map pins to {peer}.", self.pins.len());

        for pin in &self.pins {
            rpc.invoke(peer, ADD_PIN, pin.encode());
        }
    }
}

/// Handles a pin arriving at a client.
pub fn on_client_add(
    rpc: &dyn RoutedRpc,
    map: &mut dyn MapSurface,
    sender: PeerId,
    payload: &[u8],
) -> Receipt {
    if sender != rpc.server_id() {
        return Receipt::NotFromServer;
    }

    let pin = match MapPin::decode(payload) {
        Ok(pin) => pin,
        Err(err) => {
            log::error!("Exception while reading map pin data: {err:?}");
            return Receipt::Malformed;
        }
    };

    if pin.sender_name == map.local_player_name() || pin.sender_id == rpc.local_id() {
        return Receipt::Own;
    }

    if map.has_similar_pin(pin.position, pin.category, &pin.name) {
        return Receipt::Similar;
    }

    map.add_pin(pin.position, pin.category, &pin.name);

    if !pin.keep_quiet {
        map.show_message(&format!(
            "Received map pin {} from {}!",
            pin.name, pin.sender_name
        ));
    }

    log::info!("Got pin named {} from {}.", pin.name, pin.sender_name);
    Receipt::Added
}

/// Sends a pin the local player placed to the server. Quiet pins carry no sender name, so
/// nobody is told who placed them. Returns whether anything was sent.
pub fn send_pin(
    rpc: &mut dyn RoutedRpc,
    map: &dyn MapSurface,
    position: Vec3,
    category: i32,
    name: &str,
    keep_quiet: bool,
) -> bool {
    if !SHARED_CATEGORIES.contains(&category) {
        return false;
    }

    let Some(name) = sanitize_pin_name(name) else {
        return false;
    };

    let pin = MapPin {
        sender_id: rpc.local_id(),
        sender_name: if keep_quiet {
            String::new()
        } else {
            map.local_player_name()
        },
        position,
        category,
        name,
        keep_quiet,
    };

    let server = rpc.server_id();
    rpc.invoke(server, ADD_PIN, pin.encode());

    true
}

/// Asks the server to forget the local player's pins near `position`. The server never asks
/// itself.
pub fn send_deletion(rpc: &mut dyn RoutedRpc, map: &dyn MapSurface, position: Vec3) -> bool {
    if rpc.is_server() {
        return false;
    }

    let request = PinDeletion {
        sender_name: map.local_player_name(),
        position,
    };

    let server = rpc.server_id();
    rpc.invoke(server, DELETE_PIN, request.encode());

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake::{FakeMap, FakeRpc};

    fn temp_store(name: &str) -> PinStore {
        PinStore::new(
            std::env::temp_dir().join(format!("vplus-pins-{}-{name}", std::process::id())),
        )
    }

    fn pin(sender_id: PeerId, sender: &str, position: Vec3) -> MapPin {
        MapPin {
            sender_id,
            sender_name: sender.to_string(),
            position,
            category: 0,
            name: "marker".to_string(),
            keep_quiet: false,
        }
    }

    #[test]
    fn same_delta_twice_stores_one_record() {
        let mut sync = PinSync::new(temp_store("unused-1"));
        let mut rpc = FakeRpc::server(&[2, 3]);
        let payload = pin(2, "Alice", Vec3::new(100.0, 50.0, 200.0)).encode();

        assert_eq!(sync.on_server_add(&mut rpc, 2, &payload), 1);
        assert_eq!(sync.on_server_add(&mut rpc, 2, &payload), 0);
        assert_eq!(sync.pins().len(), 1);
    }

    #[test]
    fn deltas_are_not_echoed_to_their_sender() {
        let mut sync = PinSync::new(temp_store("unused-2"));

        // Peers X, Y and Z are 10, 20 and 30.
        let mut rpc = FakeRpc::server(&[10, 20, 30]);
        let payload = pin(10, "X", Vec3::new(1.0, 2.0, 3.0)).encode();

        sync.on_server_add(&mut rpc, 10, &payload);

        assert_eq!(rpc.targets_of(ADD_PIN), [20, 30]);
        assert!(rpc.sent.iter().all(|(_, _, sent)| *sent == payload));
    }

    #[test]
    fn multi_pin_payloads_merge_every_pin() {
        let mut sync = PinSync::new(temp_store("unused-3"));
        let mut rpc = FakeRpc::server(&[]);

        let mut payload = pin(2, "A", Vec3::new(1.0, 0.0, 0.0)).encode();
        pin(2, "A", Vec3::new(2.0, 0.0, 0.0)).write(&mut payload);
        pin(2, "A", Vec3::new(1.0, 0.0, 0.0)).write(&mut payload);

        assert_eq!(sync.on_server_add(&mut rpc, 2, &payload), 2);
    }

    #[test]
    fn pins_before_a_corrupt_one_are_kept() {
        let mut sync = PinSync::new(temp_store("unused-6"));
        let mut rpc = FakeRpc::server(&[2, 3]);

        let mut payload = pin(2, "A", Vec3::new(1.0, 0.0, 0.0)).encode();
        payload.extend_from_slice(&[1, 2, 3]);

        assert_eq!(sync.on_server_add(&mut rpc, 2, &payload), 1);
        assert_eq!(rpc.targets_of(ADD_PIN), [3]);
    }

    #[test]
    fn deletion_is_by_name_and_radius() {
        let mut sync = PinSync::new(temp_store("unused-4"));
        sync.merge(pin(2, "Bob", Vec3::new(0.0, 0.0, 0.0)));
        sync.merge(pin(2, "Bob", Vec3::new(10.0, 0.0, 0.0)));
        sync.merge(pin(3, "Carol", Vec3::new(0.5, 0.0, 0.0)));

        let request = PinDeletion {
            sender_name: "Bob".to_string(),
            position: Vec3::new(1.0, 0.0, 0.0),
        };

        assert_eq!(sync.on_server_delete(2, &request.encode(), 5.0), 1);

        let left: Vec<_> = sync.pins().iter().map(|p| (p.sender_name.as_str(), p.position.x)).collect();
        assert_eq!(left, [("Bob", 10.0), ("Carol", 0.5)]);

        // The removed key can be used again.
        assert_eq!(sync.merge(pin(2, "Bob", Vec3::new(0.0, 0.0, 0.0))), Merge::Added);
    }

    #[test]
    fn joining_peers_get_every_pin() {
        let mut sync = PinSync::new(temp_store("unused-5"));
        sync.merge(pin(2, "A", Vec3::new(1.0, 0.0, 0.0)));
        sync.merge(pin(2, "A", Vec3::new(2.0, 0.0, 0.0)));

        let mut rpc = FakeRpc::server(&[2, 9]);
        sync.push_all(&mut rpc, 9);

        assert_eq!(rpc.targets_of(ADD_PIN), [9, 9]);
        assert_eq!(MapPin::decode(&rpc.sent[1].2).unwrap(), sync.pins()[1]);
    }

    #[test]
    fn load_and_save_go_through_the_store() {
        let store = temp_store("persisted.dat");
        let path = store.path().to_path_buf();

        let mut sync = PinSync::new(store);
        sync.merge(pin(2, "A", Vec3::new(1.0, 0.0, 0.0)));
        sync.save();

        let mut again = PinSync::new(PinStore::new(&path));
        again.load();
        assert_eq!(again.pins(), sync.pins());

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn clients_filter_what_they_receive() {
        let rpc = FakeRpc::client(5);
        let mut map = FakeMap {
            player: "Me".to_string(),
            ..Default::default()
        };

        let other = pin(6, "Them", Vec3::new(1.0, 0.0, 0.0)).encode();
        let mine = pin(5, "Me", Vec3::new(2.0, 0.0, 0.0)).encode();

        assert_eq!(on_client_add(&rpc, &mut map, 6, &other), Receipt::NotFromServer);
        assert_eq!(on_client_add(&rpc, &mut map, 1, &mine), Receipt::Own);
        assert_eq!(on_client_add(&rpc, &mut map, 1, &other), Receipt::Added);
        assert_eq!(on_client_add(&rpc, &mut map, 1, &other), Receipt::Similar);
        assert_eq!(on_client_add(&rpc, &mut map, 1, &[1, 2]), Receipt::Malformed);

        assert_eq!(map.pins.len(), 1);
        assert_eq!(map.messages, ["Received map pin marker from Them!"]);
    }

    #[test]
    fn quiet_pins_are_anonymous() {
        let mut rpc = FakeRpc::client(5);
        let map = FakeMap {
            player: "Me".to_string(),
            ..Default::default()
        };

        assert!(send_pin(&mut rpc, &map, Vec3::new(1.0, 2.0, 3.0), 1, "<b>ore</b>", true));
        assert!(!send_pin(&mut rpc, &map, Vec3::new(1.0, 2.0, 3.0), 9, "death", false));

        let sent = MapPin::decode(&rpc.sent[0].2).unwrap();
        assert_eq!(rpc.sent[0].0, 1);
        assert_eq!(sent.sender_name, "");
        assert_eq!(sent.name, " b ore /b ");
        assert!(sent.keep_quiet);
    }

    #[test]
    fn only_clients_request_deletion() {
        let map = FakeMap::default();

        let mut client = FakeRpc::client(5);
        assert!(send_deletion(&mut client, &map, Vec3::default()));
        assert_eq!(client.targets_of(DELETE_PIN), [1]);

        let mut server = FakeRpc::server(&[5]);
        assert!(!send_deletion(&mut server, &map, Vec3::default()));
    }
}

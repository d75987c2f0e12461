//! Keeping map state consistent between the server and its clients.
//!
//! Everything here travels over the host's routed RPC mechanism: named handlers, each taking one
//! opaque byte payload. The server is authoritative; clients only send requests and merge what
//! the server forwards to them.

pub mod config;
pub mod explore;
pub mod pin;
pub mod pins;
pub mod queue;
pub mod store;

use crate::vector::Vec3;

/// A peer's id on the routed RPC network.
pub type PeerId = i64;

pub const ADD_PIN: &str = "VPlusMapAddPin";
pub const DELETE_PIN: &str = "VPlusMapDeletePin";
pub const MAP_SYNC: &str = "VPlusMapSync";
pub const CONFIG_SYNC: &str = "VPlusConfigSync";

/// Every handler name registered with the host.
pub const RPC_NAMES: [&str; 4] = [CONFIG_SYNC, MAP_SYNC, ADD_PIN, DELETE_PIN];

/// The host's routed RPC mechanism. Delivery is not guaranteed.
pub trait RoutedRpc {
    fn local_id(&self) -> PeerId;
    fn server_id(&self) -> PeerId;

    /// Every connected peer other than ourselves.
    fn peers(&self) -> Vec<PeerId>;

    fn register(&mut self, method: &str);
    fn invoke(&mut self, target: PeerId, method: &str, payload: Vec<u8>);

    fn is_server(&self) -> bool {
        self.local_id() == self.server_id()
    }
}

/// The parts of the host's map UI that synced state is applied to.
pub trait MapSurface {
    fn local_player_name(&self) -> String;

    /// Whether a pin of `category` named `name` already exists within a short distance of
    /// `position`.
    fn has_similar_pin(&self, position: Vec3, category: i32, name: &str) -> bool;

    fn add_pin(&mut self, position: Vec3, category: i32, name: &str);
    fn show_message(&mut self, text: &str);

    /// Indices of the map pixels the local player has explored.
    fn explored(&self) -> Vec<u32>;

    /// Marks the given map pixels as explored.
    fn reveal(&mut self, pixels: &[u32]);
}

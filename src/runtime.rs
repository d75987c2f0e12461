//! Owns every service and exposes one entry point per host event.
//!
//! The host integration calls into `Runtime` from its own hooks: when the game starts, when an
//! RPC registered under one of `sync::RPC_NAMES` arrives, when peers join and move, when the
//! world is saved, and so on. Nothing here blocks on the network.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::LevelFilter;

use crate::{
    game::{
        self,
        autostack::StackAllState,
        fireplace::{AutoFuel, FireSource, FuelStore},
    },
    hook::{
        engine::{ApplicationRecord, PatchEngine},
        image::HostImage,
        registry::Registry,
    },
    logging,
    settings::{ConfigSource, Snapshot},
    sync::{
        self,
        explore::{ExploreMap, ExploreSync},
        pins::{self, PinSync, Receipt},
        queue::RpcQueue,
        store::PinStore,
        MapSurface, PeerId, RoutedRpc, ADD_PIN, CONFIG_SYNC, DELETE_PIN, MAP_SYNC,
    },
    vector::Vec3,
};

/// Where the runtime keeps its files, and how the host runs.
#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    pub pins_path: PathBuf,
    pub explore_path: PathBuf,

    /// Log file to open on startup. Without one, messages go to whatever logger the host
    /// installed.
    pub log_path: Option<PathBuf>,
    pub log_level: LevelFilter,

    /// Pins are only saved on world saves when there is no local player.
    pub dedicated_server: bool,

    /// How often the server writes exploration data between world saves.
    pub explore_save_interval: Duration,
}

impl Options {
    /// The default file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Options {
        Options {
            config_path: dir.join("vplus.json"),
            pins_path: dir.join("vplus-pins.txt"),
            explore_path: dir.join("vplus-explored.bin"),
            log_path: None,
            log_level: LevelFilter::Info,
            dedicated_server: false,
            explore_save_interval: Duration::from_secs(300),
        }
    }
}

pub struct Runtime {
    options: Options,
    config: ConfigSource,
    engine: PatchEngine,
    pins: PinSync,
    explore: ExploreSync,
    queue: RpcQueue,
    auto_fuel: AutoFuel,
    stack_all: Arc<Mutex<StackAllState>>,
    last_explore_save: Option<Instant>,
}

impl Runtime {
    /// Loads the configuration and saved map data, and registers every gameplay patch. Nothing
    /// is applied until `start`.
    pub fn new(options: Options) -> Runtime {
        if let Some(path) = &options.log_path {
            if let Err(err) = logging::init(path, options.log_level) {
                eprintln!("vplus: unable to start logging: {err:?}");
            }
        }

        let config = ConfigSource::load(&options.config_path);
        let stack_all = Arc::new(Mutex::new(StackAllState::default()));

        let mut registry = Registry::new();
        game::register_all(&mut registry, stack_all.clone());

        let mut pins = PinSync::new(PinStore::new(&options.pins_path));
        pins.load();

        let mut explore = ExploreSync::new(
            &options.explore_path,
            ExploreMap::new(ExploreMap::TEXTURE_SIZE, ExploreMap::PIXEL_SIZE),
        );
        explore.load();

        Runtime {
            options,
            config,
            engine: PatchEngine::new(registry),
            pins,
            explore,
            queue: RpcQueue::new(),
            auto_fuel: AutoFuel::new(),
            stack_all,
            last_explore_save: None,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.config.snapshot()
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    pub fn pins(&self) -> &PinSync {
        &self.pins
    }

    pub fn explore(&self) -> &ExploreSync {
        &self.explore
    }

    pub fn queue(&self) -> &RpcQueue {
        &self.queue
    }

    /// Shared with the host's auto-stack driver.
    pub fn stack_all_state(&self) -> Arc<Mutex<StackAllState>> {
        self.stack_all.clone()
    }

    /// Registers the RPC handlers and applies every enabled patch.
    pub fn start(
        &mut self,
        image: &mut dyn HostImage,
        rpc: &mut dyn RoutedRpc,
    ) -> Vec<ApplicationRecord> {
        for name in sync::RPC_NAMES {
            rpc.register(name);
        }

        let snapshot = self.config.snapshot();
        self.engine.apply_all(image, &snapshot)
    }

    /// Routes one of our RPCs. Returns whether `method` was one of ours.
    pub fn on_rpc(
        &mut self,
        image: &mut dyn HostImage,
        rpc: &mut dyn RoutedRpc,
        map: &mut dyn MapSurface,
        sender: PeerId,
        method: &str,
        payload: &[u8],
    ) -> bool {
        let config = self.config.snapshot();
        let map_config = &config.map;

        match method {
            CONFIG_SYNC => {
                if let Some(snapshot) = sync::config::on_rpc(rpc, &self.config, sender, payload) {
                    self.engine.reapply(image, &snapshot);
                }
            }

            MAP_SYNC => {
                if map_config.enabled && map_config.share_map_progression {
                    self.explore
                        .on_rpc(rpc, map, &mut self.queue, sender, payload);
                }
            }

            ADD_PIN => {
                if !(map_config.enabled && map_config.share_all_pins) {
                    return true;
                }

                if rpc.is_server() {
                    self.pins.on_server_add(rpc, sender, payload);
                } else if pins::on_client_add(rpc, map, sender, payload) == Receipt::Malformed {
                    log::warn!("Dropped a malformed pin from {sender}.");
                }
            }

            DELETE_PIN => {
                if rpc.is_server() && map_config.enabled && map_config.share_all_pins {
                    self.pins
                        .on_server_delete(sender, payload, map_config.pin_delete_radius);
                }
            }

            _ => {
                log::warn!("Unknown RPC '{method}' from {sender}.");
                return false;
            }
        }

        true
    }

    /// Client: the handshake with the server finished.
    pub fn on_peer_handshake(&mut self, rpc: &mut dyn RoutedRpc) {
        sync::config::request(rpc);
    }

    /// Server: a peer's character is known, so it can be sent the stored pins.
    pub fn on_character_registered(&mut self, rpc: &mut dyn RoutedRpc, peer: PeerId) {
        let config = self.config.snapshot();

        if rpc.is_server() && config.map.enabled && config.map.share_all_pins {
            self.pins.push_all(rpc, peer);
        }
    }

    /// Server: a peer reported where it is.
    pub fn on_peer_position(&mut self, rpc: &dyn RoutedRpc, position: Vec3) -> usize {
        let config = self.config.snapshot();

        if !rpc.is_server() || !config.map.enabled || !config.map.share_map_progression {
            return 0;
        }

        self.explore
            .on_peer_position(position, config.map.clamped_explore_radius())
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        self.queue.forget(peer);
    }

    /// The local player placed a pin on the map.
    pub fn on_pin_placed(
        &mut self,
        rpc: &mut dyn RoutedRpc,
        map: &dyn MapSurface,
        position: Vec3,
        category: i32,
        name: &str,
        keep_quiet: bool,
    ) -> bool {
        let config = self.config.snapshot();

        config.map.enabled
            && config.map.share_all_pins
            && pins::send_pin(rpc, map, position, category, name, keep_quiet)
    }

    /// The local player removed a pin from the map.
    pub fn on_pin_removed(
        &mut self,
        rpc: &mut dyn RoutedRpc,
        map: &dyn MapSurface,
        position: Vec3,
    ) -> bool {
        let config = self.config.snapshot();

        config.map.enabled && config.map.share_all_pins && pins::send_deletion(rpc, map, position)
    }

    /// The local player spawned in the world.
    pub fn on_spawn(&mut self, rpc: &dyn RoutedRpc, map: &dyn MapSurface) {
        let config = self.config.snapshot();

        if config.map.enabled && config.map.share_map_progression && !rpc.is_server() {
            self.explore.on_spawn(rpc, map, &mut self.queue);
        }
    }

    /// Called on the host's periodic network update. Sends at most one queued RPC.
    pub fn on_tick(&mut self, rpc: &mut dyn RoutedRpc, now: Instant) {
        self.queue.send_next(rpc);

        let config = self.config.snapshot();

        if !rpc.is_server() || !config.map.enabled || !config.map.share_map_progression {
            return;
        }

        match self.last_explore_save {
            None => self.last_explore_save = Some(now),

            Some(last) if now.saturating_duration_since(last) >= self.options.explore_save_interval => {
                self.explore.save();
                self.last_explore_save = Some(now);
            }

            Some(_) => {}
        }
    }

    /// Server: the world is being saved.
    pub fn on_save_world(&mut self, rpc: &dyn RoutedRpc) {
        if !rpc.is_server() {
            return;
        }

        let config = self.config.snapshot();

        if self.options.dedicated_server && config.map.enabled && config.map.share_all_pins {
            self.pins.save();
        }

        if config.map.enabled && config.map.share_map_progression {
            self.explore.save();
        }
    }

    /// Client: we left the server. Goes back to the local configuration.
    pub fn on_disconnect(&mut self, image: &mut dyn HostImage) {
        let snapshot = self.config.reload();
        self.engine.reapply(image, &snapshot);

        self.explore.on_disconnect();
        self.queue.clear();
    }

    /// The host is shutting down. Saves what the server owns and removes every patch.
    pub fn on_shutdown(&mut self, image: &mut dyn HostImage, rpc: &dyn RoutedRpc) {
        let config = self.config.snapshot();

        if rpc.is_server() && config.map.enabled {
            if config.map.share_all_pins {
                self.pins.save();
            }

            if config.map.share_map_progression {
                self.explore.save();
            }
        }

        self.engine.unapply_all(image);
        log::info!("Shut down.");
    }

    /// A fire source is updating. Returns how much fuel was pulled from nearby chests.
    pub fn on_fireplace_update(
        &mut self,
        store: &mut dyn FuelStore,
        fire: &FireSource,
        now: Instant,
    ) -> u32 {
        let config = self.config.snapshot();
        self.auto_fuel.update(&config, store, fire, now)
    }

    pub fn on_fireplace_destroyed(&mut self, position: Vec3) {
        self.auto_fuel.forget(position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hook::{asm::InstructionStream, image::InMemoryImage, Signature},
        settings::Configuration,
        sync::{
            fake::{FakeMap, FakeRpc},
            pin::MapPin,
        },
    };

    fn options(name: &str) -> Options {
        let dir = std::env::temp_dir().join(format!("vplus-runtime-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        Options::in_dir(&dir)
    }

    fn sharing() -> Configuration {
        let mut config = Configuration::default();
        config.map.enabled = true;
        config.map.share_all_pins = true;
        config.map.share_map_progression = true;
        config
    }

    fn runtime(name: &str, config: &Configuration) -> Runtime {
        let options = options(name);
        config.try_save(&options.config_path).unwrap();
        Runtime::new(options)
    }

    fn ship_host() -> InMemoryImage {
        let mut image = InMemoryImage::new("0.217.46");
        image.add_instance(
            Signature::any_overload("Ship", "Awake"),
            InstructionStream::parse("ret").unwrap(),
        );
        image
    }

    fn pin(sender_id: PeerId, name: &str, x: f32) -> MapPin {
        MapPin {
            sender_id,
            sender_name: format!("player{sender_id}"),
            position: Vec3::new(x, 0.0, 0.0),
            category: 1,
            name: name.to_string(),
            keep_quiet: false,
        }
    }

    #[test]
    fn logging_starts_before_anything_loads() {
        let mut options = options("logging");
        let log_path = options.config_path.with_file_name("vplus.log");
        options.log_path = Some(log_path.clone());

        let runtime = Runtime::new(options);

        assert!(log_path.exists());
        assert_eq!(runtime.snapshot().version(), 1);
    }

    #[test]
    fn start_registers_handlers_and_applies_enabled_patches() {
        let mut config = Configuration::default();
        config.ship.enabled = true;

        let mut runtime = runtime("start", &config);
        let mut image = ship_host();
        let mut rpc = FakeRpc::server(&[]);

        let records = runtime.start(&mut image, &mut rpc);

        assert_eq!(rpc.registered, sync::RPC_NAMES);
        assert_eq!(records.len(), 1);
        assert_eq!(runtime.engine().applied_labels(), ["ship modifiers"]);
    }

    #[test]
    fn server_configuration_lasts_until_disconnect() {
        let mut runtime = runtime("config", &Configuration::default());
        let mut image = ship_host();
        let mut rpc = FakeRpc::client(4);
        let mut map = FakeMap::default();

        runtime.start(&mut image, &mut rpc);
        runtime.on_peer_handshake(&mut rpc);
        assert_eq!(rpc.targets_of(CONFIG_SYNC), [1]);

        let mut server_config = Configuration::default();
        server_config.ship.enabled = true;
        let payload = sync::config::encode(&server_config).unwrap();

        assert!(runtime.on_rpc(&mut image, &mut rpc, &mut map, 1, CONFIG_SYNC, &payload));
        assert!(runtime.snapshot().ship.enabled);
        assert_eq!(runtime.engine().applied_labels(), ["ship modifiers"]);

        runtime.on_disconnect(&mut image);
        assert!(!runtime.snapshot().ship.enabled);
        assert!(runtime.engine().applied_labels().is_empty());
        assert_eq!(image.attached_count(), 0);
    }

    #[test]
    fn server_shares_pins_and_saves_them() {
        let mut runtime = runtime("pins", &sharing());
        let mut image = InMemoryImage::new("0.217.46");
        let mut rpc = FakeRpc::server(&[4, 5]);
        let mut map = FakeMap::default();

        runtime.start(&mut image, &mut rpc);

        let payload = pin(4, "Copper", 10.0).encode();
        assert!(runtime.on_rpc(&mut image, &mut rpc, &mut map, 4, ADD_PIN, &payload));
        assert_eq!(runtime.pins().pins().len(), 1);
        assert_eq!(rpc.targets_of(ADD_PIN), [5]);

        runtime.on_character_registered(&mut rpc, 9);
        assert_eq!(rpc.targets_of(ADD_PIN), [5, 9]);

        runtime.on_shutdown(&mut image, &rpc);

        let reloaded = Runtime::new(runtime.options.clone());
        assert_eq!(reloaded.pins().pins(), runtime.pins().pins());
    }

    #[test]
    fn pins_are_ignored_when_sharing_is_off() {
        let mut runtime = runtime("no-pins", &Configuration::default());
        let mut image = InMemoryImage::new("0.217.46");
        let mut rpc = FakeRpc::server(&[4, 5]);
        let mut map = FakeMap::default();

        let payload = pin(4, "Copper", 10.0).encode();
        assert!(runtime.on_rpc(&mut image, &mut rpc, &mut map, 4, ADD_PIN, &payload));
        assert!(runtime.pins().pins().is_empty());
        assert!(rpc.sent.is_empty());

        assert!(!runtime.on_rpc(&mut image, &mut rpc, &mut map, 4, "SomethingElse", &[]));
    }

    #[test]
    fn client_exploration_goes_out_one_packet_per_tick() {
        let mut runtime = runtime("explore-client", &sharing());
        let mut rpc = FakeRpc::client(4);
        let map = FakeMap {
            revealed: (0..25_000).collect(),
            ..Default::default()
        };

        runtime.on_spawn(&rpc, &map);
        assert_eq!(runtime.queue().len(), 3);

        // Spawning again doesn't resend.
        runtime.on_spawn(&rpc, &map);
        assert_eq!(runtime.queue().len(), 3);

        let now = Instant::now();
        runtime.on_tick(&mut rpc, now);
        runtime.on_tick(&mut rpc, now);
        assert_eq!(rpc.targets_of(MAP_SYNC), [1, 1]);
    }

    #[test]
    fn server_explores_around_peers() {
        let mut runtime = runtime("explore-server", &sharing());
        let rpc = FakeRpc::server(&[4]);

        assert!(runtime.on_peer_position(&rpc, Vec3::default()) > 0);
        assert!(runtime.explore().map().is_explored(128, 128));

        // Clients never track exploration themselves.
        let client = FakeRpc::client(4);
        assert_eq!(runtime.on_peer_position(&client, Vec3::new(640.0, 0.0, 0.0)), 0);
    }
}

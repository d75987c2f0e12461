//! The user's configuration, and the versioned snapshots the patch engine reads it through.

use std::{
    fs::File,
    io::Read,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Egg hatching.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EggSection {
    pub enabled: bool,

    /// Seconds an egg needs to hatch.
    pub hatch_time: f32,

    /// Whether eggs need a fire and a roof to grow.
    pub require_shelter: bool,

    /// Whether warm eggs may stack.
    pub can_stack: bool,
}

impl Default for EggSection {
    fn default() -> Self {
        EggSection {
            enabled: false,
            hatch_time: 300.0,
            require_shelter: true,
            can_stack: false,
        }
    }
}

/// Ship handling. Every value is a percentage modifier applied to the host's own value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipSection {
    pub enabled: bool,
    pub forward_speed: f32,
    pub backward_speed: f32,
    pub rudder_speed: f32,
    pub steer_force: f32,
    pub water_impact_damage: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventorySection {
    pub enabled: bool,

    /// Rows in the player's inventory. Clamped to the range the host UI can show.
    pub player_inventory_rows: i32,
}

impl Default for InventorySection {
    fn default() -> Self {
        InventorySection {
            enabled: false,
            player_inventory_rows: 4,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemsSection {
    pub enabled: bool,

    /// Allows teleporting with any item.
    pub no_teleport_prevention: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub enabled: bool,
    pub max_players: i32,
}

impl Default for ServerSection {
    fn default() -> Self {
        ServerSection {
            enabled: false,
            max_players: 10,
        }
    }
}

/// World difficulty scaling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameSection {
    pub enabled: bool,

    /// Range in metres used to count the players near an enemy.
    pub difficulty_scale_range: f32,

    /// When above zero, the nearby player count is always this value.
    pub set_fixed_player_count_to: i32,

    /// Added to the nearby player count.
    pub extra_player_count_nearby: i32,
}

impl Default for GameSection {
    fn default() -> Self {
        GameSection {
            enabled: false,
            difficulty_scale_range: 200.0,
            set_fixed_player_count_to: 0,
            extra_player_count_nearby: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapSection {
    pub enabled: bool,

    /// Share explored areas between every player on the server.
    pub share_map_progression: bool,

    /// Radius around a player that counts as explored.
    pub explore_radius: f32,

    /// Stops players from hiding their position on the map.
    pub prevent_player_from_turning_off_public_position: bool,

    /// Share every pin placed on the map through the server.
    pub share_all_pins: bool,

    /// Removing a pin removes every shared pin within this distance of it.
    pub pin_delete_radius: f32,
}

impl MapSection {
    /// Largest exploration radius the server will honour.
    pub const MAX_EXPLORE_RADIUS: f32 = 10_000.0;

    pub fn clamped_explore_radius(&self) -> f32 {
        self.explore_radius.min(Self::MAX_EXPLORE_RADIUS)
    }
}

impl Default for MapSection {
    fn default() -> Self {
        MapSection {
            enabled: false,
            share_map_progression: false,
            explore_radius: 50.0,
            prevent_player_from_turning_off_public_position: false,
            share_all_pins: false,
            pin_delete_radius: 25.6,
        }
    }
}

/// Families of tameable creatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimalType {
    Boar,
    Wolf,
    Lox,
    Hen,
    Asksvin,
}

impl AnimalType {
    pub const ALL: [AnimalType; 5] = [
        AnimalType::Boar,
        AnimalType::Wolf,
        AnimalType::Lox,
        AnimalType::Hen,
        AnimalType::Asksvin,
    ];

    /// The family of the creature with the host's display token `name`.
    pub fn of(name: &str) -> Option<AnimalType> {
        match name {
            "$enemy_boar" | "$enemy_boarpiggy" => Some(AnimalType::Boar),
            "$enemy_wolf" | "$enemy_wolfcub" => Some(AnimalType::Wolf),
            "$enemy_lox" | "$enemy_loxcalf" => Some(AnimalType::Lox),
            "$enemy_hen" | "$enemy_chicken" => Some(AnimalType::Hen),
            "$enemy_asksvin" | "$enemy_asksvin_hatchling" => Some(AnimalType::Asksvin),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TameableSection {
    pub enabled: bool,

    /// Creature families the taming tweaks apply to.
    pub animal_types: Vec<AnimalType>,

    /// Lets tameable creatures eat (and so be tamed) while alerted.
    pub ignore_alerted: bool,

    /// Percentage changes to how long taming takes, how much feeding speeds it up, and the
    /// range over which nearby players speed it up.
    pub tame_time_multiplier: f32,
    pub tame_boost_multiplier: f32,
    pub tame_boost_range_multiplier: f32,
}

impl TameableSection {
    pub fn changes_taming_speed(&self) -> bool {
        [
            self.tame_time_multiplier,
            self.tame_boost_multiplier,
            self.tame_boost_range_multiplier,
        ]
        .iter()
        .any(|percent| *percent != 0.0)
    }

    /// Whether the creature with the display token `name` is covered by the taming tweaks.
    pub fn applies_to(&self, name: &str) -> bool {
        AnimalType::of(name).map_or(false, |kind| self.animal_types.contains(&kind))
    }
}

impl Default for TameableSection {
    fn default() -> Self {
        TameableSection {
            enabled: false,
            animal_types: AnimalType::ALL.to_vec(),
            ignore_alerted: false,
            tame_time_multiplier: 0.0,
            tame_boost_multiplier: 0.0,
            tame_boost_range_multiplier: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoStackSection {
    pub enabled: bool,

    /// Radius searched for chests when stacking into all of them.
    pub auto_stack_all_range: f32,
}

impl AutoStackSection {
    pub fn clamped_range(&self) -> f32 {
        self.auto_stack_all_range.clamp(1.0, 50.0)
    }
}

impl Default for AutoStackSection {
    fn default() -> Self {
        AutoStackSection {
            enabled: false,
            auto_stack_all_range: 10.0,
        }
    }
}

/// Fires and torches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FireSourceSection {
    pub enabled: bool,

    /// Fires never run out of fuel.
    pub fires: bool,

    /// Torches never run out of fuel.
    pub torches: bool,

    /// Pull fuel from nearby chests.
    pub auto_fuel: bool,
    pub auto_range: f32,
}

impl FireSourceSection {
    pub fn clamped_range(&self) -> f32 {
        self.auto_range.clamp(1.0, 50.0)
    }
}

impl Default for FireSourceSection {
    fn default() -> Self {
        FireSourceSection {
            enabled: false,
            fires: false,
            torches: false,
            auto_fuel: false,
            auto_range: 10.0,
        }
    }
}

/// Every configurable feature area. Each area has its own `enabled` flag, and every field falls
/// back to its default when missing from the file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub egg: EggSection,
    pub ship: ShipSection,
    pub inventory: InventorySection,
    pub items: ItemsSection,
    pub server: ServerSection,
    pub game: GameSection,
    pub map: MapSection,
    pub tameable: TameableSection,
    pub auto_stack: AutoStackSection,
    pub fire_source: FireSourceSection,
}

impl Configuration {
    /// Attempts to parse the contents of `reader` to get a `Configuration` value.
    pub fn parse_json(reader: impl Read) -> Result<Configuration> {
        // Coerce with `?`.
        Ok(serde_json::from_reader(reader)?)
    }

    /// Looks for a configuration file and loads it. A missing file is not an error.
    fn load_from_file(path: &Path) -> Result<Option<Configuration>> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
        Ok(Some(Configuration::parse_json(file)?))
    }

    /// Either loads the configuration from disk or falls back to the defaults.
    pub fn load(path: &Path) -> Configuration {
        match Configuration::load_from_file(path) {
            Ok(Some(config)) => return config,

            Ok(None) => log::info!("No configuration file found. Defaults will be used."),

            Err(err) => {
                log::error!("Error loading configuration: {err:?}. Defaults will be used.")
            }
        };

        Configuration::default()
    }

    /// Saves the configuration, returning any errors encountered.
    pub fn try_save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .wrap_err_with(|| format!("writing {}", path.display()))?;

        Ok(())
    }
}

/// One immutable view of the configuration. Snapshots are cheap to clone and never change;
/// a new configuration produces a new snapshot with a higher version.
#[derive(Clone, Debug)]
pub struct Snapshot {
    version: u64,
    config: Arc<Configuration>,
}

impl Snapshot {
    pub fn new(version: u64, config: Configuration) -> Snapshot {
        Snapshot {
            version,
            config: Arc::new(config),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }
}

impl std::ops::Deref for Snapshot {
    type Target = Configuration;

    fn deref(&self) -> &Configuration {
        &self.config
    }
}

/// Owns the live configuration. The core only ever reads snapshots from here; new values come
/// from the local file or from the server.
pub struct ConfigSource {
    path: PathBuf,
    current: Mutex<Snapshot>,
}

impl ConfigSource {
    /// Loads the file at `path` (or the defaults) as version 1.
    pub fn load(path: impl Into<PathBuf>) -> ConfigSource {
        let path = path.into();
        let config = Configuration::load(&path);

        ConfigSource {
            path,
            current: Mutex::new(Snapshot::new(1, config)),
        }
    }

    /// Creates a source with a fixed starting value. `reload` will still read `path`.
    pub fn with_config(path: impl Into<PathBuf>, config: Configuration) -> ConfigSource {
        ConfigSource {
            path: path.into(),
            current: Mutex::new(Snapshot::new(1, config)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        // A poisoned lock still holds a complete snapshot, since snapshots are swapped whole.
        self.current.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    /// Installs `config` as the current value and returns the new snapshot.
    pub fn swap(&self, config: Configuration) -> Snapshot {
        let mut current = self.lock();
        *current = Snapshot::new(current.version + 1, config);

        log::info!("Configuration is now at version {}.", current.version);
        current.clone()
    }

    /// Re-reads the local file. Used when leaving a server whose configuration replaced ours.
    pub fn reload(&self) -> Snapshot {
        self.swap(Configuration::load(&self.path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

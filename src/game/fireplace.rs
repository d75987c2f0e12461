//! Fires and torches: infinite fuel, and refuelling from nearby chests.

use std::time::{Duration, Instant};

use crate::{
    hook::{
        registry::{PatchDescriptor, Registry},
        CallFrame, Signature, Value,
    },
    settings::Configuration,
    throttle::Throttle,
    vector::Vec3,
};

/// Prefabs that count as torches rather than fires.
const TORCHES: [&str; 9] = [
    "piece_groundtorch_wood",
    "piece_groundtorch",
    "piece_groundtorch_green",
    "piece_groundtorch_blue",
    "piece_walltorch",
    "piece_brazierceiling01",
    "piece_brazierfloor01",
    "piece_brazierfloor02",
    "piece_jackoturnip",
];

pub fn is_torch(prefab: &str) -> bool {
    TORCHES.contains(&prefab)
}

/// Whether the configuration makes this kind of fire source burn forever.
fn has_infinite_fuel(config: &Configuration, prefab: &str) -> bool {
    let fire_source = &config.fire_source;

    if is_torch(prefab) {
        fire_source.torches
    } else {
        fire_source.fires
    }
}

fn awake(config: &Configuration, frame: &mut CallFrame) {
    let infinite = frame
        .field("Fireplace::m_prefabName")
        .and_then(Value::as_str)
        .map_or(false, |prefab| has_infinite_fuel(config, prefab));

    if infinite {
        frame.set_field("Fireplace::m_infiniteFuel", Value::Bool(true));
    }
}

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::after(
            "infinite fuel",
            Signature::any_overload("Fireplace", "Awake"),
            awake,
        )
        .when(|c| c.fire_source.enabled),
    );
}

/// One fire source at the moment it updates.
#[derive(Debug, Clone)]
pub struct FireSource {
    pub prefab: String,
    pub position: Vec3,
    pub fuel: f32,
    pub max_fuel: f32,
    pub fuel_item: String,
}

/// Chests the host can take items out of.
pub trait FuelStore {
    /// Removes up to `amount` of `item` from chests within `range` of `around`, returning how
    /// many were removed.
    fn take(&mut self, around: Vec3, range: f32, item: &str, amount: u32) -> u32;
}

/// Tops fire sources up from nearby chests, at most once a second per fire source.
pub struct AutoFuel {
    throttle: Throttle,
}

impl AutoFuel {
    pub const INTERVAL: Duration = Duration::from_secs(1);
    const TTL: Duration = Duration::from_secs(60);
    const CAPACITY: usize = 1024;

    pub fn new() -> AutoFuel {
        AutoFuel {
            throttle: Throttle::new(Self::CAPACITY, Self::INTERVAL, Self::TTL),
        }
    }

    /// Returns how much fuel was added to `fire`.
    pub fn update(
        &mut self,
        config: &Configuration,
        store: &mut dyn FuelStore,
        fire: &FireSource,
        now: Instant,
    ) -> u32 {
        let fire_source = &config.fire_source;

        if !fire_source.enabled
            || !fire_source.auto_fuel
            || has_infinite_fuel(config, &fire.prefab)
        {
            return 0;
        }

        let missing = fire.max_fuel as i64 - fire.fuel.ceil() as i64;

        if missing <= 0 || !self.throttle.ready(Throttle::key(fire.position), now) {
            return 0;
        }

        let added = store.take(
            fire.position,
            fire_source.clamped_range(),
            &fire.fuel_item,
            missing as u32,
        );

        if added > 0 {
            log::info!("Added {added} {} to {} at {}.", fire.fuel_item, fire.prefab, fire.position);
        }

        added
    }

    /// The fire source at `position` was destroyed.
    pub fn forget(&mut self, position: Vec3) {
        self.throttle.forget(Throttle::key(position));
    }

    pub fn tracked(&self) -> usize {
        self.throttle.len()
    }
}

impl Default for AutoFuel {
    fn default() -> Self {
        AutoFuel::new()
    }
}

//! Player inventory size, and teleporting with any item.

use crate::hook::{
    registry::{PatchDescriptor, Registry},
    CallFrame, Flow, Signature, Value,
};
use crate::settings::Configuration;

pub const MIN_ROWS: i32 = 4;
pub const MAX_ROWS: i32 = 20;

/// Names of the inventories that belong to a player.
const PLAYER_INVENTORIES: [&str; 2] = ["Grave", "Inventory"];

// Arguments of `Inventory(string name, Sprite bkg, int w, int h)`, after the instance.
const NAME_ARG: usize = 1;
const HEIGHT_ARG: usize = 4;

fn construct(config: &Configuration, frame: &mut CallFrame) -> Flow {
    let is_player = frame
        .arg(NAME_ARG)
        .and_then(Value::as_str)
        .map_or(false, |name| PLAYER_INVENTORIES.contains(&name));

    if is_player {
        let rows = config.inventory.player_inventory_rows.clamp(MIN_ROWS, MAX_ROWS);

        if let Some(height) = frame.args.get_mut(HEIGHT_ARG) {
            *height = Value::Int(rows as i64);
        }
    }

    Flow::Continue
}

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::before(
            "player inventory rows",
            Signature::new("Inventory", ".ctor", &["string", "Sprite", "int", "int"]),
            construct,
        )
        .when(|c| c.inventory.enabled),
    );

    registry.register(
        PatchDescriptor::after(
            "teleport anything",
            Signature::any_overload("Inventory", "IsTeleportable"),
            |_, frame| frame.result = Value::Bool(true),
        )
        .when(|c| c.items.enabled && c.items.no_teleport_prevention),
    );
}

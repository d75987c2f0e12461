use crate::hook::{
    registry::{PatchDescriptor, Registry},
    CallFrame, Signature, Value,
};
use crate::settings::Configuration;

/// Changes `value` by `percent` percent. Nothing goes below zero.
pub fn apply_modifier(value: f32, percent: f32) -> f32 {
    value + value / 100.0 * percent.max(-100.0)
}

fn awake(config: &Configuration, frame: &mut CallFrame) {
    let ship = &config.ship;

    let modifiers = [
        ("Ship::m_force", ship.forward_speed),
        ("Ship::m_backwardForce", ship.backward_speed),
        ("Ship::m_rudderSpeed", ship.rudder_speed),
        ("Ship::m_stearForce", ship.steer_force),
        ("Ship::m_waterImpactDamage", ship.water_impact_damage),
    ];

    for (field, percent) in modifiers {
        if let Some(value) = frame.float_field(field) {
            frame.set_field(field, Value::Float(apply_modifier(value, percent)));
        }
    }
}

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::after("ship modifiers", Signature::any_overload("Ship", "Awake"), awake)
            .when(|c| c.ship.enabled),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::{host, instance, Harness};

    #[test]
    fn modifiers_are_percentages() {
        assert_eq!(apply_modifier(10.0, 50.0), 15.0);
        assert_eq!(apply_modifier(10.0, -50.0), 5.0);
        assert_eq!(apply_modifier(10.0, -300.0), 0.0);
    }

    #[test]
    fn awake_scales_forces() {
        let mut image = host();
        instance(
            &mut image,
            "Ship",
            "Awake",
            &[],
            r#"
                ldarg 0
                ldc.r4 10.0
                stfld Ship::m_force
                ldarg 0
                ldc.r4 4.0
                stfld Ship::m_rudderSpeed
                ret
            "#,
        );

        let mut config = Configuration::default();
        config.ship.enabled = true;
        config.ship.forward_speed = 100.0;
        config.ship.rudder_speed = -25.0;

        let harness = Harness::new(image, config, register);
        let frame = harness.call("Ship::Awake", CallFrame::new(vec![Value::This]));

        assert_eq!(frame.float_field("Ship::m_force"), Some(20.0));
        assert_eq!(frame.float_field("Ship::m_rudderSpeed"), Some(3.0));

        // Fields the host never set stay unset.
        assert_eq!(frame.field("Ship::m_stearForce"), None);
    }
}

use crate::hook::{
    registry::{PatchDescriptor, Registry},
    Signature, Value,
};

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::after(
            "public position lock",
            Signature::any_overload("ZNet", "SetPublicReferencePosition"),
            |_, frame| frame.set_field("ZNet::m_publicReferencePosition", Value::Bool(true)),
        )
        .when(|c| c.map.enabled && c.map.prevent_player_from_turning_off_public_position),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::{host, instance, Harness};
    use crate::hook::CallFrame;
    use crate::settings::Configuration;

    #[test]
    fn position_stays_public() {
        let mut image = host();
        instance(
            &mut image,
            "ZNet",
            "SetPublicReferencePosition",
            &["bool"],
            "ldarg 0\nldarg 1\nstfld ZNet::m_publicReferencePosition\nret",
        );

        let mut config = Configuration::default();
        config.map.enabled = true;
        config.map.prevent_player_from_turning_off_public_position = true;

        let harness = Harness::new(image, config, register);
        let frame = harness.call(
            "ZNet::SetPublicReferencePosition",
            CallFrame::new(vec![Value::This, Value::Bool(false)]),
        );

        assert_eq!(
            frame.field("ZNet::m_publicReferencePosition"),
            Some(&Value::Bool(true))
        );
    }
}

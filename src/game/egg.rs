//! Egg hatching time, shelter requirements and stacking of warm eggs.

use crate::hook::{
    asm::{OpCode, Operand},
    matcher::{CodeMatcher, Pattern, RewriteError, Step},
    registry::{PatchDescriptor, Registry},
    CallFrame, Flow, Signature, Value,
};
use crate::settings::Configuration;

fn start(config: &Configuration, frame: &mut CallFrame) -> Flow {
    let egg = &config.egg;

    frame.set_field("EggGrow::m_growTime", Value::Float(egg.hatch_time));
    frame.set_field("EggGrow::m_requireNearbyFire", Value::Bool(egg.require_shelter));
    frame.set_field("EggGrow::m_requireUnderRoof", Value::Bool(egg.require_shelter));

    Flow::Continue
}

/// The host refuses to grow an egg that is stacked with others by comparing the stack size
/// against one. Comparing against the largest stack anything can have lets the whole stack grow.
fn allow_stacks(_: &Configuration, matcher: &mut CodeMatcher) -> Result<(), RewriteError> {
    let found = matcher.first(&Pattern::new(vec![
        Step::loads_field("ItemDrop.ItemData::m_stack"),
        Step::exact(OpCode::LdcI4, Operand::Int(1)),
    ]))?;

    matcher.set_operand(found.last(), Operand::Int(i32::MAX as i64))
}

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::before(
            "egg hatch time",
            Signature::any_overload("EggGrow", "Start"),
            start,
        )
        .when(|c| c.egg.enabled),
    );

    for member in ["CanGrow", "GetHoverText"] {
        registry.register(
            PatchDescriptor::rewrite(
                "egg stacking",
                Signature::any_overload("EggGrow", member),
                allow_stacks,
            )
            .when(|c| c.egg.enabled && c.egg.can_stack),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::{host, instance, Harness};
    use crate::hook::image::InMemoryImage;

    fn image() -> InMemoryImage {
        let mut image = host();

        instance(&mut image, "EggGrow", "Start", &[], "ret");

        instance(
            &mut image,
            "EggGrow",
            "CanGrow",
            &[],
            r#"
                ldarg 0
                ldfld ItemDrop.ItemData::m_stack
                ldc.i4 1
                cgt
                brfalse L0
                ldc.i4 0
                ret
            L0: ldc.i4 1
                ret
            "#,
        );

        instance(
            &mut image,
            "EggGrow",
            "GetHoverText",
            &[],
            r#"
                ldarg 0
                ldfld ItemDrop.ItemData::m_stack
                ldc.i4 1
                cgt
                brtrue L0
                ldstr "Warm egg"
                ret
            L0: ldstr "Cold egg"
                ret
            "#,
        );

        image
    }

    fn stacked() -> CallFrame {
        CallFrame::new(vec![Value::This]).with_field("ItemDrop.ItemData::m_stack", Value::Int(5))
    }

    #[test]
    fn start_sets_hatch_time_and_shelter() {
        let mut config = Configuration::default();
        config.egg.enabled = true;
        config.egg.hatch_time = 60.0;
        config.egg.require_shelter = false;

        let harness = Harness::new(image(), config, register);
        let frame = harness.call("EggGrow::Start", CallFrame::new(vec![Value::This]));

        assert_eq!(frame.float_field("EggGrow::m_growTime"), Some(60.0));
        assert_eq!(
            frame.field("EggGrow::m_requireUnderRoof"),
            Some(&Value::Bool(false))
        );
    }

    #[test]
    fn stacked_eggs_only_grow_when_stacking_is_allowed() {
        let mut config = Configuration::default();
        config.egg.enabled = true;

        let harness = Harness::new(image(), config.clone(), register);
        assert_eq!(harness.call("EggGrow::CanGrow", stacked()).result, Value::Int(0));

        config.egg.can_stack = true;
        let harness = Harness::new(image(), config, register);
        assert!(harness.all_applied());
        assert_eq!(harness.records.len(), 3);
        assert_eq!(harness.call("EggGrow::CanGrow", stacked()).result, Value::Int(1));
        assert_eq!(
            harness.call("EggGrow::GetHoverText", stacked()).result,
            Value::Str("Warm egg".to_string())
        );
    }
}

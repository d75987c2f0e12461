//! Taming: letting tameable creatures eat while they are alerted, and scaling how long taming
//! takes.
//!
//! The host's AI returns early when a creature is alerted, before it ever looks for food. The
//! rewrite jumps from the start of that check straight to the food lookup, so every other part
//! of the AI still sees the alerted state.

use super::ship::apply_modifier;
use crate::hook::{
    asm::{OpCode, Operand},
    matcher::{CodeMatcher, Pattern, RewriteError, Step},
    registry::{PatchDescriptor, Registry},
    CallFrame, Signature, Value,
};
use crate::settings::Configuration;

fn awake(config: &Configuration, frame: &mut CallFrame) {
    let tameable = &config.tameable;

    let applies = frame
        .field("Character::m_name")
        .and_then(Value::as_str)
        .map_or(false, |name| tameable.applies_to(name));

    if !applies {
        return;
    }

    let modifiers = [
        ("Tameable::m_tamingTime", tameable.tame_time_multiplier),
        ("Tameable::m_tamingSpeedMultiplierRange", tameable.tame_boost_range_multiplier),
        ("Tameable::m_tamingBoostMultiplier", tameable.tame_boost_multiplier),
    ];

    for (field, percent) in modifiers {
        if let Some(value) = frame.float_field(field) {
            frame.set_field(field, Value::Float(apply_modifier(value, percent)));
        }
    }

    // Taming already under way can't take longer than a fresh start would.
    if let (Some(time), Some(left)) = (
        frame.float_field("Tameable::m_tamingTime"),
        frame.float_field("Tameable::m_tameTimeLeft"),
    ) {
        if left > time {
            frame.set_field("Tameable::m_tameTimeLeft", Value::Float(time));
        }
    }
}

fn ignore_alerted(_: &Configuration, matcher: &mut CodeMatcher) -> Result<(), RewriteError> {
    let consume = matcher.first(&Pattern::new(vec![
        Step::exact(OpCode::LdArg, Operand::Index(0)),
        Step::exact(OpCode::LdLoc, Operand::Index(0)),
        Step::exact(OpCode::LdArg, Operand::Index(1)),
        Step::calls("MonsterAI::UpdateConsumeItem"),
    ]))?;

    let target = matcher.label_at(consume.start)?;

    // The check starts right after the previous block's return.
    matcher.find_backward(&Pattern::new(vec![Step::op(OpCode::Ret)]))?;
    let check = matcher.advance(1)?;

    if check == consume.start {
        return Err(RewriteError::Refused(
            "no alerted check before the food lookup".to_string(),
        ));
    }

    matcher.redirect(check, target)
}

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::rewrite(
            "tame while alerted",
            Signature::any_overload("MonsterAI", "UpdateAI"),
            ignore_alerted,
        )
        .when(|c| c.tameable.enabled && c.tameable.ignore_alerted),
    );

    registry.register(
        PatchDescriptor::after(
            "taming speed",
            Signature::any_overload("Tameable", "Awake"),
            awake,
        )
        .when(|c| c.tameable.enabled && c.tameable.changes_taming_speed()),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::{host, instance, Harness};
    use crate::hook::{engine::PatchFailure, image::InMemoryImage};
    use crate::settings::AnimalType;

    const UPDATE_AI: &str = r#"
            ldarg 0
            call MonsterAI::IsDead
            brfalse L0
            ldc.i4 0
            ret
        L0: ldarg 0
            call MonsterAI::IsAlerted
            brtrue L1
            ldarg 0
            ldloc 0
            ldarg 1
            call MonsterAI::UpdateConsumeItem
            brfalse L1
            ldc.i4 1
            ret
        L1: ldc.i4 0
            ret
    "#;

    fn image(update_ai: &str) -> InMemoryImage {
        let mut image = host();

        instance(&mut image, "MonsterAI", "IsDead", &[], "ldc.i4 0\nret");
        instance(
            &mut image,
            "MonsterAI",
            "IsAlerted",
            &[],
            "ldarg 0\nldfld MonsterAI::m_alerted\nret",
        );
        instance(
            &mut image,
            "MonsterAI",
            "UpdateConsumeItem",
            &["Humanoid", "float"],
            r#"
                ldarg 0
                ldc.i4 1
                stfld MonsterAI::m_ate
                ldc.i4 1
                ret
            "#,
        );
        instance(&mut image, "MonsterAI", "UpdateAI", &["float"], update_ai);

        image
    }

    fn config() -> Configuration {
        let mut config = Configuration::default();
        config.tameable.enabled = true;
        config.tameable.ignore_alerted = true;
        config
    }

    fn alerted() -> CallFrame {
        CallFrame::new(vec![Value::This, Value::Float(0.1)])
            .with_field("MonsterAI::m_alerted", Value::Bool(true))
    }

    #[test]
    fn alerted_creatures_still_eat() {
        let harness = Harness::new(image(UPDATE_AI), Configuration::default(), register);
        let frame = harness.call("MonsterAI::UpdateAI", alerted());
        assert_eq!(frame.field("MonsterAI::m_ate"), None);

        let harness = Harness::new(image(UPDATE_AI), config(), register);
        assert!(harness.all_applied());

        let frame = harness.call("MonsterAI::UpdateAI", alerted());
        assert_eq!(frame.field("MonsterAI::m_ate"), Some(&Value::Int(1)));
        assert_eq!(frame.result, Value::Int(1));
    }

    fn wolf() -> CallFrame {
        CallFrame::new(vec![Value::This])
            .with_field("Character::m_name", Value::Str("$enemy_wolf".to_string()))
            .with_field("Tameable::m_tamingTime", Value::Float(1800.0))
            .with_field("Tameable::m_tamingBoostMultiplier", Value::Float(2.0))
            .with_field("Tameable::m_tameTimeLeft", Value::Float(1500.0))
    }

    #[test]
    fn taming_speed_follows_animal_types() {
        let mut image = host();
        instance(&mut image, "Tameable", "Awake", &[], "ret");

        let mut config = Configuration::default();
        config.tameable.enabled = true;
        config.tameable.tame_time_multiplier = -50.0;
        config.tameable.tame_boost_multiplier = 100.0;

        let harness = Harness::new(image, config.clone(), register);
        assert!(harness.all_applied());

        let frame = harness.call("Tameable::Awake", wolf());
        assert_eq!(frame.float_field("Tameable::m_tamingTime"), Some(900.0));
        assert_eq!(frame.float_field("Tameable::m_tamingBoostMultiplier"), Some(4.0));
        assert_eq!(frame.float_field("Tameable::m_tameTimeLeft"), Some(900.0));

        // Wolves left out of the list keep the host's values.
        let mut image = host();
        instance(&mut image, "Tameable", "Awake", &[], "ret");
        config.tameable.animal_types = vec![AnimalType::Boar];

        let harness = Harness::new(image, config, register);
        let frame = harness.call("Tameable::Awake", wolf());
        assert_eq!(frame.float_field("Tameable::m_tamingTime"), Some(1800.0));
    }

    #[test]
    fn missing_food_lookup_leaves_the_ai_alone() {
        let harness = Harness::new(image("ldc.i4 0\nret"), config(), register);

        assert!(matches!(
            harness.records[0].failure(),
            Some(PatchFailure::PatternNotMatched(RewriteError::NotMatched(_)))
        ));
    }
}

//! How many players the host thinks are near an enemy, which scales its difficulty.

use crate::hook::{
    asm::{Instruction, OpCode, Operand},
    matcher::{CodeMatcher, Pattern, RewriteError, Step},
    registry::{PatchDescriptor, Registry},
    CallFrame, Signature, Value,
};
use crate::settings::Configuration;

/// Ranges shorter than this would never count the player themselves.
pub const MIN_RANGE: f32 = 2.0;

pub fn scale_range(config: &Configuration) -> f32 {
    config.game.difficulty_scale_range.max(MIN_RANGE)
}

/// Replaces the load of the range field (and the instance it is loaded from) with a constant.
fn range(config: &Configuration, matcher: &mut CodeMatcher) -> Result<(), RewriteError> {
    let found = matcher.first(&Pattern::new(vec![
        Step::exact(OpCode::LdArg, Operand::Index(0)),
        Step::loads_field("Game::m_difficultyScaleRange"),
    ]))?;

    matcher.replace(found, vec![Instruction::ldc_r4(scale_range(config))])
}

pub fn adjusted_count(config: &Configuration, count: i64) -> i64 {
    let game = &config.game;

    let count = if game.set_fixed_player_count_to > 0 {
        game.set_fixed_player_count_to as i64
    } else {
        count
    };

    count + game.extra_player_count_nearby as i64
}

fn player_count(config: &Configuration, frame: &mut CallFrame) {
    if let Some(count) = frame.result.as_int() {
        frame.result = Value::Int(adjusted_count(config, count));
    }
}

pub fn register(registry: &mut Registry) {
    let target = Signature::any_overload("Game", "GetPlayerDifficulty");

    registry.register(
        PatchDescriptor::rewrite("difficulty scale range", target.clone(), range)
            .when(|c| c.game.enabled),
    );

    registry.register(
        PatchDescriptor::after("difficulty player count", target, player_count)
            .when(|c| c.game.enabled),
    );
}

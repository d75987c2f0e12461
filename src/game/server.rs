use crate::hook::{
    asm::{OpCode, Operand},
    matcher::{CodeMatcher, Pattern, RewriteError, Step},
    registry::{PatchDescriptor, Registry},
    Signature,
};
use crate::settings::Configuration;

/// The host compares its player count against a constant when a peer joins. Swap in ours.
fn player_limit(config: &Configuration, matcher: &mut CodeMatcher) -> Result<(), RewriteError> {
    let found = matcher.first(&Pattern::new(vec![
        Step::calls("ZNet::GetNrOfPlayers"),
        Step::op(OpCode::LdcI4),
    ]))?;

    matcher.set_operand(
        found.last(),
        Operand::Int(config.server.max_players as i64),
    )
}

pub fn register(registry: &mut Registry) {
    registry.register(
        PatchDescriptor::rewrite(
            "server player limit",
            Signature::any_overload("ZNet", "RPC_PeerInfo"),
            player_limit,
        )
        .when(|c| c.server.enabled),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::{body, host, instance, Harness};
    use crate::hook::{CallFrame, Value};

    #[test]
    fn peers_are_accepted_up_to_the_configured_limit() {
        let mut image = host();

        image.add_static(
            Signature::new("ZNet", "GetNrOfPlayers", &[]),
            body("ldc.i4 12\nret"),
        );

        instance(
            &mut image,
            "ZNet",
            "RPC_PeerInfo",
            &["ZRpc", "ZPackage"],
            r#"
                call ZNet::GetNrOfPlayers
                ldc.i4 10
                clt
                brtrue L0
                ldstr "server full"
                ret
            L0: ldstr "welcome"
                ret
            "#,
        );

        let mut config = Configuration::default();
        config.server.enabled = true;
        config.server.max_players = 64;

        let harness = Harness::new(image, config, register);
        let frame = harness.call(
            "ZNet::RPC_PeerInfo",
            CallFrame::new(vec![Value::This, Value::Unit, Value::Unit]),
        );

        assert_eq!(frame.result, Value::Str("welcome".to_string()));
    }
}

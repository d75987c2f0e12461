//! Making clients use the server's configuration while they are connected to it.
//!
//! After the handshake a client sends an empty `VPlusConfigSync` request. The server answers with
//! its whole configuration as JSON, which the client installs in place of its own. When the
//! client disconnects it goes back to its local file.

use eyre::{Context, Result};

use super::{PeerId, RoutedRpc, CONFIG_SYNC};
use crate::settings::{ConfigSource, Configuration, Snapshot};

/// Client: asks the server for its configuration. Does nothing on the server itself.
pub fn request(rpc: &mut dyn RoutedRpc) -> bool {
    if rpc.is_server() {
        return false;
    }

    log::info!("Requesting the server's configuration.");

    let server = rpc.server_id();
    rpc.invoke(server, CONFIG_SYNC, vec![]);

    true
}

pub fn encode(config: &Configuration) -> Result<Vec<u8>> {
    serde_json::to_vec(config).wrap_err("serializing configuration")
}

pub fn decode(payload: &[u8]) -> Result<Configuration> {
    Configuration::parse_json(payload).wrap_err("parsing server configuration")
}

/// Handles a configuration message on either end. On a client that accepted the server's
/// configuration, returns the new snapshot; the caller must reapply patches with it.
pub fn on_rpc(
    rpc: &mut dyn RoutedRpc,
    source: &ConfigSource,
    sender: PeerId,
    payload: &[u8],
) -> Option<Snapshot> {
    if rpc.is_server() {
        match encode(&source.snapshot()) {
            Ok(bytes) => {
                log::info!("Sending configuration to {sender}.");
                rpc.invoke(sender, CONFIG_SYNC, bytes);
            }

            Err(err) => log::error!("Unable to send configuration: {err:?}"),
        }

        return None;
    }

    if sender != rpc.server_id() {
        log::warn!("Ignoring configuration from {sender}, which is not the server.");
        return None;
    }

    match decode(payload) {
        Ok(config) => {
            log::info!("Received configuration from the server.");
            Some(source.swap(config))
        }

        Err(err) => {
            log::error!("Keeping local configuration: {err:?}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::fake::FakeRpc;

    fn source(config: Configuration) -> ConfigSource {
        ConfigSource::with_config(
            std::env::temp_dir().join(format!("vplus-config-sync-{}.json", std::process::id())),
            config,
        )
    }

    #[test]
    fn server_answers_with_its_configuration() {
        let mut server_config = Configuration::default();
        server_config.server.max_players = 32;

        let mut rpc = FakeRpc::server(&[4]);
        assert!(on_rpc(&mut rpc, &source(server_config.clone()), 4, &[]).is_none());

        let (target, method, payload) = &rpc.sent[0];
        assert_eq!((*target, method.as_str()), (4, CONFIG_SYNC));
        assert_eq!(decode(payload).unwrap(), server_config);
    }

    #[test]
    fn client_installs_the_servers_configuration() {
        let mut server_config = Configuration::default();
        server_config.egg.enabled = true;

        let local = source(Configuration::default());
        let mut rpc = FakeRpc::client(4);

        assert!(request(&mut rpc));
        assert_eq!(rpc.targets_of(CONFIG_SYNC), [1]);

        let payload = encode(&server_config).unwrap();

        // Only the server may replace our configuration.
        assert!(on_rpc(&mut rpc, &local, 9, &payload).is_none());
        assert!(on_rpc(&mut rpc, &local, 1, b"{ broken").is_none());

        let snapshot = on_rpc(&mut rpc, &local, 1, &payload).unwrap();
        assert!(snapshot.egg.enabled);
        assert_eq!(snapshot.version(), 2);
    }
}

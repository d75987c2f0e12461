//! Gameplay tweaks, each described as patches on the host's own operations.
//!
//! Every module registers its descriptors with a `when` predicate over its configuration
//! section, so a disabled feature never touches the host.

pub mod autostack;
pub mod difficulty;
pub mod egg;
pub mod fireplace;
pub mod inventory;
pub mod map;
pub mod server;
pub mod ship;
pub mod tameable;

use std::sync::{Arc, Mutex};

use crate::hook::registry::Registry;

/// Registers every tweak. `stack_all` is shared with the auto-stack driver that runs outside
/// the patched operation.
pub fn register_all(registry: &mut Registry, stack_all: Arc<Mutex<autostack::StackAllState>>) {
    egg::register(registry);
    ship::register(registry);
    inventory::register(registry);
    server::register(registry);
    difficulty::register(registry);
    tameable::register(registry);
    map::register(registry);
    fireplace::register(registry);
    autostack::register(registry, stack_all);

    log::info!("Registered {} gameplay patches.", registry.len());
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::{
        hook::{
            asm::InstructionStream,
            engine::{ApplicationRecord, PatchEngine},
            image::InMemoryImage,
            registry::Registry,
            CallFrame, Signature,
        },
        settings::{Configuration, Snapshot},
    };

    /// A host with patches applied from one configuration.
    pub struct Harness {
        pub image: InMemoryImage,
        pub engine: PatchEngine,
        pub snapshot: Snapshot,
        pub records: Vec<ApplicationRecord>,
    }

    impl Harness {
        pub fn new(
            mut image: InMemoryImage,
            config: Configuration,
            register: impl FnOnce(&mut Registry),
        ) -> Harness {
            let mut registry = Registry::new();
            register(&mut registry);

            let snapshot = Snapshot::new(1, config);
            let mut engine = PatchEngine::new(registry);
            let records = engine.apply_all(&mut image, &snapshot);

            Harness {
                image,
                engine,
                snapshot,
                records,
            }
        }

        pub fn call(&self, symbol: &str, mut frame: CallFrame) -> CallFrame {
            self.image
                .call_symbol(symbol, self.engine.hooks(), &self.snapshot, &mut frame)
                .unwrap();

            frame
        }

        pub fn all_applied(&self) -> bool {
            self.records.iter().all(ApplicationRecord::applied)
        }
    }

    pub fn body(source: &str) -> InstructionStream {
        InstructionStream::parse(source).unwrap()
    }

    pub fn instance(image: &mut InMemoryImage, owner: &str, member: &str, params: &[&str], source: &str) {
        image.add_instance(Signature::new(owner, member, params), body(source));
    }

    pub fn host() -> InMemoryImage {
        InMemoryImage::new("0.217.46")
    }
}

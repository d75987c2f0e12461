//! Installing and removing patches.
//!
//! `PatchEngine::apply_all` walks the registry in registration order and installs every enabled
//! descriptor. One descriptor failing never stops the others: the failure is logged, recorded
//! and the feature stays inert. Everything the engine changes is remembered so that
//! `unapply_all` can put the host back exactly as it was.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
};

use super::{
    asm::InstructionStream,
    image::{HostError, HostImage},
    matcher::RewriteError,
    registry::{AfterHook, BeforeHook, Modification, ModificationKind, Registry, ReplaceHook},
    resolve::{Resolver, SignatureNotFound},
    CallFrame, Flow, MethodId, TargetHandle,
};
use crate::settings::{Configuration, Snapshot};

/// Why a descriptor could not be installed.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchFailure {
    SignatureNotFound(SignatureNotFound),
    PatternNotMatched(RewriteError),

    /// Another patch already replaces the same target.
    ConflictingReplacement { existing: String },

    HostRejected(HostError),
}

impl Display for PatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchFailure::SignatureNotFound(err) => err.fmt(f),
            PatchFailure::PatternNotMatched(err) => write!(f, "rewrite failed: {err}"),
            PatchFailure::ConflictingReplacement { existing } => {
                write!(f, "target is already replaced by '{existing}'")
            }
            PatchFailure::HostRejected(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for PatchFailure {}

impl From<SignatureNotFound> for PatchFailure {
    fn from(err: SignatureNotFound) -> Self {
        PatchFailure::SignatureNotFound(err)
    }
}

impl From<RewriteError> for PatchFailure {
    fn from(err: RewriteError) -> Self {
        PatchFailure::PatternNotMatched(err)
    }
}

impl From<HostError> for PatchFailure {
    fn from(err: HostError) -> Self {
        PatchFailure::HostRejected(err)
    }
}

/// What happened to one enabled descriptor during `apply_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationRecord {
    /// Registration index of the descriptor.
    pub index: usize,
    pub label: String,
    pub kind: ModificationKind,
    pub outcome: Result<TargetHandle, PatchFailure>,
}

impl ApplicationRecord {
    pub fn applied(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure(&self) -> Option<&PatchFailure> {
        self.outcome.as_ref().err()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

#[derive(Clone)]
enum Hook {
    Before(BeforeHook),
    After(AfterHook),
    Replace(ReplaceHook),
}

#[derive(Clone)]
struct InstalledHook {
    id: HookId,
    label: String,
    hook: Hook,
}

/// The wrapping modifications currently installed, per target. The host calls `invoke` for every
/// call to an attached target.
#[derive(Default)]
pub struct HookTable {
    next_id: u64,
    hooks: BTreeMap<MethodId, Vec<InstalledHook>>,
}

impl HookTable {
    fn install(&mut self, method: MethodId, label: &str, hook: Hook) -> Result<HookId, PatchFailure> {
        let installed = self.hooks.entry(method).or_default();

        if matches!(hook, Hook::Replace(_)) {
            if let Some(existing) = installed.iter().find(|h| matches!(h.hook, Hook::Replace(_))) {
                return Err(PatchFailure::ConflictingReplacement {
                    existing: existing.label.clone(),
                });
            }
        }

        let id = HookId(self.next_id);
        self.next_id += 1;

        installed.push(InstalledHook {
            id,
            label: label.to_string(),
            hook,
        });

        Ok(id)
    }

    fn remove(&mut self, id: HookId) -> bool {
        let mut removed = false;

        self.hooks.retain(|_, installed| {
            let before = installed.len();
            installed.retain(|h| h.id != id);
            removed |= installed.len() != before;

            !installed.is_empty()
        });

        removed
    }

    pub fn is_hooked(&self, method: MethodId) -> bool {
        self.hooks.contains_key(&method)
    }

    /// Total number of installed hooks over every target.
    pub fn len(&self) -> usize {
        self.hooks.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Dispatches one call to `method`. Before-hooks run in installation order and any of them
    /// may skip the body; the replacement, if there is one, runs instead of `original`;
    /// after-hooks always run, in installation order, and see the final result.
    pub fn invoke<E>(
        &self,
        method: MethodId,
        config: &Configuration,
        frame: &mut CallFrame,
        original: impl FnOnce(&mut CallFrame) -> Result<(), E>,
    ) -> Result<(), E> {
        let Some(installed) = self.hooks.get(&method) else {
            return original(frame);
        };

        let mut flow = Flow::Continue;

        for hook in installed {
            if let Hook::Before(before) = &hook.hook {
                if before(config, frame) == Flow::Skip {
                    flow = Flow::Skip;
                }
            }
        }

        if flow == Flow::Continue {
            let replacement = installed.iter().find_map(|h| match &h.hook {
                Hook::Replace(replace) => Some(replace),
                _ => None,
            });

            match replacement {
                Some(replace) => replace(config, frame),
                None => original(frame)?,
            }
        }

        for hook in installed {
            if let Hook::After(after) = &hook.hook {
                after(config, frame);
            }
        }

        Ok(())
    }
}

enum Undo {
    Hook(HookId),

    /// The pristine body is held in `PatchEngine::pristine`.
    Rewrite,
}

struct AppliedPatch {
    index: usize,
    method: MethodId,
    undo: Undo,
}

pub struct PatchEngine {
    registry: Registry,
    resolver: Resolver,
    hooks: HookTable,
    applied: Vec<AppliedPatch>,

    /// Bodies as they were before the first rewrite touched them.
    pristine: BTreeMap<MethodId, InstructionStream>,

    /// Targets whose calls are currently routed through the hook table.
    attached: BTreeSet<MethodId>,

    records: Vec<ApplicationRecord>,

    /// Version of the snapshot the current patches were applied with.
    applied_version: Option<u64>,
}

impl PatchEngine {
    pub fn new(registry: Registry) -> PatchEngine {
        PatchEngine {
            registry,
            resolver: Resolver::new(),
            hooks: HookTable::default(),
            applied: vec![],
            pristine: BTreeMap::new(),
            attached: BTreeSet::new(),
            records: vec![],
            applied_version: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    /// Records from the most recent `apply_all`.
    pub fn records(&self) -> &[ApplicationRecord] {
        &self.records
    }

    pub fn applied_version(&self) -> Option<u64> {
        self.applied_version
    }

    /// Labels of the descriptors that are currently installed.
    pub fn applied_labels(&self) -> Vec<&str> {
        let descriptors = self.registry.all_descriptors();
        self.applied
            .iter()
            .map(|patch| descriptors[patch.index].label())
            .collect()
    }

    /// Installs every descriptor enabled by `snapshot`. Anything already installed is removed
    /// first, so applying twice leaves the same state as applying once.
    pub fn apply_all(
        &mut self,
        image: &mut dyn HostImage,
        snapshot: &Snapshot,
    ) -> Vec<ApplicationRecord> {
        if self.applied_version.is_some() {
            self.unapply_all(image);
        }

        log::info!(
            "Applying patches for configuration version {} (host {}).",
            snapshot.version(),
            image.version()
        );

        let enabled: Vec<usize> = self
            .registry
            .enabled_descriptors(snapshot)
            .map(|(index, _)| index)
            .collect();

        let mut records = Vec::with_capacity(enabled.len());

        for index in enabled {
            let outcome = self.apply_one(image, snapshot, index);
            let descriptor = &self.registry.all_descriptors()[index];

            match &outcome {
                Ok(handle) => log::info!("Applied '{}' to {}.", descriptor.label(), handle.signature),
                Err(err) => log::error!("Unable to apply '{}': {err}", descriptor.label()),
            }

            records.push(ApplicationRecord {
                index,
                label: descriptor.label().to_string(),
                kind: descriptor.modification().kind(),
                outcome,
            });
        }

        let failed = records.iter().filter(|r| !r.applied()).count();

        log::info!(
            "{} of {} enabled patches applied.",
            records.len() - failed,
            records.len()
        );

        self.applied_version = Some(snapshot.version());
        self.records = records.clone();
        records
    }

    fn apply_one(
        &mut self,
        image: &mut dyn HostImage,
        config: &Configuration,
        index: usize,
    ) -> Result<TargetHandle, PatchFailure> {
        let descriptor = self.registry.all_descriptors()[index].clone();
        let handle = self.resolver.resolve(image, descriptor.target())?;
        let method = handle.method;

        let hook = match descriptor.modification() {
            Modification::Rewrite(rule) => {
                let current = image.read_body(method)?;
                let rewritten = current.rewritten(|matcher| rule(config, matcher))?;
                image.write_body(method, rewritten)?;

                // Later rewrites of the same target start from this one's output, but undoing
                // always goes back to the body from before the first.
                self.pristine.entry(method).or_insert(current);

                self.applied.push(AppliedPatch {
                    index,
                    method,
                    undo: Undo::Rewrite,
                });

                return Ok(handle);
            }

            Modification::Before(hook) => Hook::Before(hook.clone()),
            Modification::After(hook) => Hook::After(hook.clone()),
            Modification::Replace(hook) => Hook::Replace(hook.clone()),
        };

        let id = self.hooks.install(method, descriptor.label(), hook)?;

        if !self.attached.contains(&method) {
            if let Err(err) = image.attach(method) {
                self.hooks.remove(id);
                return Err(err.into());
            }

            self.attached.insert(method);
        }

        self.applied.push(AppliedPatch {
            index,
            method,
            undo: Undo::Hook(id),
        });

        Ok(handle)
    }

    /// Removes every installed patch and restores every rewritten body. Errors from the host are
    /// logged and the rest of the removal carries on.
    pub fn unapply_all(&mut self, image: &mut dyn HostImage) {
        if self.applied.is_empty() && self.attached.is_empty() && self.pristine.is_empty() {
            self.applied_version = None;
            return;
        }

        log::info!("Removing {} patches.", self.applied.len());

        for patch in self.applied.drain(..).rev() {
            if let Undo::Hook(id) = patch.undo {
                if !self.hooks.remove(id) {
                    log::warn!(
                        "Hook for patch {} on method {} was already gone.",
                        patch.index,
                        patch.method.0
                    );
                }
            }
        }

        for method in std::mem::take(&mut self.attached) {
            if let Err(err) = image.detach(method) {
                log::error!("Unable to detach: {err}");
            }
        }

        for (method, body) in std::mem::take(&mut self.pristine) {
            if let Err(err) = image.write_body(method, body) {
                log::error!("Unable to restore body: {err}");
            }
        }

        self.records.clear();
        self.applied_version = None;
    }

    /// Removes everything and applies again with `snapshot`.
    pub fn reapply(
        &mut self,
        image: &mut dyn HostImage,
        snapshot: &Snapshot,
    ) -> Vec<ApplicationRecord> {
        self.unapply_all(image);
        self.apply_all(image, snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::hook::{
        asm::{Instruction, OpCode, Operand},
        image::InMemoryImage,
        matcher::{Pattern, Step},
        registry::PatchDescriptor,
        Signature, Value,
    };

    fn sig(owner: &str, member: &str) -> Signature {
        Signature::new(owner, member, &[])
    }

    fn host() -> InMemoryImage {
        let mut image = InMemoryImage::new("0.217.46");

        image.add_static(
            sig("ZNet", "GetNrOfPlayers"),
            InstructionStream::parse("ldc.i4 3\nret").unwrap(),
        );

        image.add_static(
            sig("ZNet", "MaxPlayers"),
            InstructionStream::parse("ldc.i4 10\nret").unwrap(),
        );

        image.add_instance(
            sig("Ship", "Awake"),
            InstructionStream::parse(
                r#"
                    ldarg 0
                    ldc.r4 10.0
                    stfld Ship::m_force
                    ret
                "#,
            )
            .unwrap(),
        );

        image
    }

    fn call(image: &InMemoryImage, engine: &PatchEngine, config: &Configuration, symbol: &str, frame: CallFrame) -> CallFrame {
        let mut frame = frame;
        image
            .call_symbol(symbol, engine.hooks(), config, &mut frame)
            .unwrap();
        frame
    }

    fn set_max_players() -> PatchDescriptor {
        PatchDescriptor::rewrite("max players", sig("ZNet", "MaxPlayers"), |config, m| {
            let found = m.first(&Pattern::new(vec![Step::op(OpCode::LdcI4)]))?;
            m.set_operand(found.start, Operand::Int(config.server.max_players as i64))
        })
    }

    fn double_force() -> PatchDescriptor {
        PatchDescriptor::after("double force", sig("Ship", "Awake"), |_, frame| {
            let force = frame.float_field("Ship::m_force").unwrap_or(0.0);
            frame.set_field("Ship::m_force", Value::Float(force * 2.0));
        })
    }

    fn snapshot(config: Configuration) -> Snapshot {
        Snapshot::new(1, config)
    }

    #[test]
    fn unapply_restores_the_host_exactly() {
        let mut image = host();
        let original_bodies: Vec<_> = (0..3)
            .map(|i| image.body(MethodId(i)).unwrap().clone())
            .collect();

        let mut registry = Registry::new();
        registry.register(set_max_players());
        registry.register(double_force());
        registry.register(PatchDescriptor::before("skip", sig("ZNet", "GetNrOfPlayers"), |_, frame| {
            frame.result = Value::Int(99);
            Flow::Skip
        }));

        let mut engine = PatchEngine::new(registry);
        let mut config = Configuration::default();
        config.server.max_players = 64;
        let snapshot = snapshot(config);

        let records = engine.apply_all(&mut image, &snapshot);
        assert!(records.iter().all(ApplicationRecord::applied));

        let this = || CallFrame::new(vec![Value::This]);

        assert_eq!(call(&image, &engine, &snapshot, "ZNet::MaxPlayers", CallFrame::default()).result, Value::Int(64));
        assert_eq!(call(&image, &engine, &snapshot, "ZNet::GetNrOfPlayers", CallFrame::default()).result, Value::Int(99));
        assert_eq!(call(&image, &engine, &snapshot, "Ship::Awake", this()).float_field("Ship::m_force"), Some(20.0));

        engine.unapply_all(&mut image);

        for (i, body) in original_bodies.iter().enumerate() {
            assert_eq!(image.body(MethodId(i as u32)), Some(body));
        }

        assert_eq!(image.attached_count(), 0);
        assert!(engine.hooks().is_empty());
        assert!(engine.applied_labels().is_empty());

        assert_eq!(call(&image, &engine, &snapshot, "ZNet::MaxPlayers", CallFrame::default()).result, Value::Int(10));
        assert_eq!(call(&image, &engine, &snapshot, "ZNet::GetNrOfPlayers", CallFrame::default()).result, Value::Int(3));
        assert_eq!(call(&image, &engine, &snapshot, "Ship::Awake", this()).float_field("Ship::m_force"), Some(10.0));
    }

    #[test]
    fn one_failure_does_not_stop_the_rest() {
        let mut image = host();

        let mut registry = Registry::new();
        registry.register(PatchDescriptor::after("missing", sig("Ship", "Sink"), |_, _| {}));
        registry.register(PatchDescriptor::rewrite("unmatched", sig("ZNet", "MaxPlayers"), |_, m| {
            m.first(&Pattern::new(vec![Step::calls("ZNet::Nothing")]))?;
            Ok(())
        }));
        registry.register(double_force());

        let mut engine = PatchEngine::new(registry);
        let config = snapshot(Configuration::default());
        let records = engine.apply_all(&mut image, &config);

        assert_eq!(records.len(), 3);
        assert!(matches!(records[0].failure(), Some(PatchFailure::SignatureNotFound(_))));
        assert!(matches!(
            records[1].failure(),
            Some(PatchFailure::PatternNotMatched(RewriteError::NotMatched(_)))
        ));
        assert!(records[2].applied());
        assert_eq!(records[1].label, "unmatched");

        // The failed rewrite left its target untouched.
        assert_eq!(
            image.body(MethodId(1)),
            Some(&InstructionStream::parse("ldc.i4 10\nret").unwrap())
        );

        assert_eq!(engine.applied_labels(), ["double force"]);
    }

    #[test]
    fn disabled_descriptors_are_not_attempted() {
        let mut image = host();

        let mut registry = Registry::new();
        registry.register(double_force().when(|c| c.ship.enabled));

        let mut engine = PatchEngine::new(registry);
        assert!(engine.apply_all(&mut image, &snapshot(Configuration::default())).is_empty());
        assert_eq!(image.attached_count(), 0);

        let mut config = Configuration::default();
        config.ship.enabled = true;

        let records = engine.reapply(&mut image, &Snapshot::new(2, config));
        assert_eq!(records.len(), 1);
        assert_eq!(engine.applied_version(), Some(2));
        assert_eq!(image.attached_count(), 1);
    }

    #[test]
    fn applying_twice_is_the_same_as_once() {
        let mut image = host();

        let mut registry = Registry::new();
        registry.register(set_max_players());
        registry.register(double_force());

        let mut engine = PatchEngine::new(registry);
        let mut config = Configuration::default();
        config.server.max_players = 20;
        let config = snapshot(config);

        engine.apply_all(&mut image, &config);
        let body = image.body(MethodId(1)).unwrap().clone();

        engine.apply_all(&mut image, &config);
        assert_eq!(image.body(MethodId(1)), Some(&body));
        assert_eq!(engine.hooks().len(), 1);

        let frame = call(&image, &engine, &config, "Ship::Awake", CallFrame::new(vec![Value::This]));
        assert_eq!(frame.float_field("Ship::m_force"), Some(20.0));
    }

    #[test]
    fn rewrites_compose_in_registration_order() {
        let mut image = host();

        let mut registry = Registry::new();
        registry.register(set_max_players());
        registry.register(PatchDescriptor::rewrite("add one", sig("ZNet", "MaxPlayers"), |_, m| {
            let ret = m.first(&Pattern::new(vec![Step::op(OpCode::Ret)]))?;
            m.insert_before(ret.start, vec![Instruction::ldc_i4(1), Instruction::op(OpCode::Add)])
        }));

        let mut engine = PatchEngine::new(registry);
        let mut config = Configuration::default();
        config.server.max_players = 30;
        let config = snapshot(config);

        engine.apply_all(&mut image, &config);
        let frame = call(&image, &engine, &config, "ZNet::MaxPlayers", CallFrame::default());
        assert_eq!(frame.result, Value::Int(31));

        engine.unapply_all(&mut image);
        assert_eq!(
            image.body(MethodId(1)),
            Some(&InstructionStream::parse("ldc.i4 10\nret").unwrap())
        );
    }

    #[test]
    fn only_one_replacement_per_target() {
        let mut image = host();

        let mut registry = Registry::new();
        registry.register(PatchDescriptor::replace("first", sig("ZNet", "GetNrOfPlayers"), |_, f| {
            f.result = Value::Int(1);
        }));
        registry.register(PatchDescriptor::replace("second", sig("ZNet", "GetNrOfPlayers"), |_, f| {
            f.result = Value::Int(2);
        }));

        let mut engine = PatchEngine::new(registry);
        let config = snapshot(Configuration::default());
        let records = engine.apply_all(&mut image, &config);

        assert!(records[0].applied());
        assert_eq!(
            records[1].failure(),
            Some(&PatchFailure::ConflictingReplacement {
                existing: "first".to_string()
            })
        );

        let frame = call(&image, &engine, &config, "ZNet::GetNrOfPlayers", CallFrame::default());
        assert_eq!(frame.result, Value::Int(1));
    }

    #[test]
    fn after_hooks_run_when_the_body_is_skipped() {
        let mut hooks = HookTable::default();
        let method = MethodId(0);

        let skip: BeforeHook = Arc::new(|_: &Configuration, _: &mut CallFrame| Flow::Skip);
        let after: AfterHook = Arc::new(|_: &Configuration, frame: &mut CallFrame| {
            frame.result = Value::Bool(true)
        });

        hooks.install(method, "skip", Hook::Before(skip)).unwrap();
        hooks.install(method, "after", Hook::After(after)).unwrap();

        let mut frame = CallFrame::default();
        let mut ran = false;

        hooks
            .invoke::<()>(method, &Configuration::default(), &mut frame, |_| {
                ran = true;
                Ok(())
            })
            .unwrap();

        assert!(!ran);
        assert_eq!(frame.result, Value::Bool(true));
    }
}

use std::{fmt::Debug, sync::Arc};

use super::{matcher::CodeMatcher, matcher::RewriteError, CallFrame, Flow, Signature};
use crate::settings::Configuration;

pub type BeforeHook = Arc<dyn Fn(&Configuration, &mut CallFrame) -> Flow + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&Configuration, &mut CallFrame) + Send + Sync>;
pub type ReplaceHook = Arc<dyn Fn(&Configuration, &mut CallFrame) + Send + Sync>;
pub type RewriteRule =
    Arc<dyn Fn(&Configuration, &mut CodeMatcher) -> Result<(), RewriteError> + Send + Sync>;
pub type Predicate = Arc<dyn Fn(&Configuration) -> bool + Send + Sync>;

/// How a patch changes its target.
#[derive(Clone)]
pub enum Modification {
    /// Runs before the original and may suppress it.
    Before(BeforeHook),

    /// Runs after the original (or its replacement) and may change the result.
    After(AfterHook),

    /// Runs instead of the original. A target can only have one.
    Replace(ReplaceHook),

    /// Edits the target's body.
    Rewrite(RewriteRule),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ModificationKind {
    Before,
    After,
    Replace,
    Rewrite,
}

impl Modification {
    pub fn kind(&self) -> ModificationKind {
        match self {
            Modification::Before(_) => ModificationKind::Before,
            Modification::After(_) => ModificationKind::After,
            Modification::Replace(_) => ModificationKind::Replace,
            Modification::Rewrite(_) => ModificationKind::Rewrite,
        }
    }
}

/// Declares one modification of one host operation, and when it should be installed.
#[derive(Clone)]
pub struct PatchDescriptor {
    label: String,
    target: Signature,
    modification: Modification,
    enabled: Predicate,
}

impl PatchDescriptor {
    /// Creates a descriptor that is always enabled. Use `when` to make it conditional.
    pub fn new(label: &str, target: Signature, modification: Modification) -> PatchDescriptor {
        PatchDescriptor {
            label: label.to_string(),
            target,
            modification,
            enabled: Arc::new(|_| true),
        }
    }

    pub fn before(
        label: &str,
        target: Signature,
        hook: impl Fn(&Configuration, &mut CallFrame) -> Flow + Send + Sync + 'static,
    ) -> PatchDescriptor {
        PatchDescriptor::new(label, target, Modification::Before(Arc::new(hook)))
    }

    pub fn after(
        label: &str,
        target: Signature,
        hook: impl Fn(&Configuration, &mut CallFrame) + Send + Sync + 'static,
    ) -> PatchDescriptor {
        PatchDescriptor::new(label, target, Modification::After(Arc::new(hook)))
    }

    pub fn replace(
        label: &str,
        target: Signature,
        hook: impl Fn(&Configuration, &mut CallFrame) + Send + Sync + 'static,
    ) -> PatchDescriptor {
        PatchDescriptor::new(label, target, Modification::Replace(Arc::new(hook)))
    }

    pub fn rewrite(
        label: &str,
        target: Signature,
        rule: impl Fn(&Configuration, &mut CodeMatcher) -> Result<(), RewriteError>
            + Send
            + Sync
            + 'static,
    ) -> PatchDescriptor {
        PatchDescriptor::new(label, target, Modification::Rewrite(Arc::new(rule)))
    }

    /// Only installs the patch when `predicate` holds for the configuration at apply time.
    pub fn when(
        mut self,
        predicate: impl Fn(&Configuration) -> bool + Send + Sync + 'static,
    ) -> PatchDescriptor {
        self.enabled = Arc::new(predicate);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn target(&self) -> &Signature {
        &self.target
    }

    pub fn modification(&self) -> &Modification {
        &self.modification
    }

    pub fn is_enabled(&self, config: &Configuration) -> bool {
        (self.enabled)(config)
    }
}

impl Debug for PatchDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchDescriptor")
            .field("label", &self.label)
            .field("target", &self.target)
            .field("kind", &self.modification.kind())
            .finish()
    }
}

/// Every patch the program knows about, in registration order. Filled once at startup.
#[derive(Default, Debug)]
pub struct Registry {
    descriptors: Vec<PatchDescriptor>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Adds `descriptor` and returns its registration index.
    pub fn register(&mut self, descriptor: PatchDescriptor) -> usize {
        log::trace!("Registered {descriptor:?}");

        self.descriptors.push(descriptor);
        self.descriptors.len() - 1
    }

    pub fn all_descriptors(&self) -> &[PatchDescriptor] {
        &self.descriptors
    }

    /// The descriptors whose predicates hold for `config`, with their registration indices.
    /// Predicates are evaluated as the iterator is consumed.
    pub fn enabled_descriptors<'r>(
        &'r self,
        config: &'r Configuration,
    ) -> impl Iterator<Item = (usize, &'r PatchDescriptor)> + 'r {
        self.descriptors
            .iter()
            .enumerate()
            .filter(move |(_, descriptor)| descriptor.is_enabled(config))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

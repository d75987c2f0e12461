//! Stacking the player's items into every nearby chest at once.
//!
//! Each chest belongs to whichever peer owns it, so stacking into it means asking for it and
//! waiting. `AutoStack` walks the chests through a `RequestChain` and reports one summary at the
//! end. While it runs, the host's own per-chest message is suppressed by a before-hook on
//! `Inventory::StackAll`.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{
    chain::{ChainDriver, ChainReport, RequestChain, DEFAULT_TIMEOUT},
    hook::{
        registry::{PatchDescriptor, Registry},
        CallFrame, Flow, Signature, Value,
    },
};

// Arguments of `StackAll(Inventory fromInventory, bool message)`, after the instance.
const MESSAGE_ARG: usize = 2;

#[derive(Debug, Default)]
pub struct StackAllState {
    /// A chain is running.
    pub processing: bool,

    /// Whether the player asked for feedback when the chain started.
    pub should_message: bool,
}

fn lock(state: &Mutex<StackAllState>) -> MutexGuard<'_, StackAllState> {
    state.lock().unwrap_or_else(|err| err.into_inner())
}

pub fn summary_message(count: i64, containers: usize) -> String {
    if count > 0 {
        format!("$msg_stackall {count} in {containers} Chests")
    } else {
        format!("$msg_stackall_none in {containers} Chests")
    }
}

fn stack_all(state: &Mutex<StackAllState>, frame: &mut CallFrame) -> Flow {
    let mut state = lock(state);

    if !state.processing {
        state.should_message = frame.arg(MESSAGE_ARG).map_or(false, Value::is_truthy);
    }

    if let Some(message) = frame.args.get_mut(MESSAGE_ARG) {
        *message = Value::Bool(false);
    }

    Flow::Continue
}

pub fn register(registry: &mut Registry, state: Arc<Mutex<StackAllState>>) {
    registry.register(
        PatchDescriptor::before(
            "auto-stack summary",
            Signature::any_overload("Inventory", "StackAll"),
            move |_, frame| stack_all(&state, frame),
        )
        .when(|c| c.auto_stack.enabled),
    );
}

/// A chest, by its network id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContainerId(pub u64);

/// What the auto-stack driver needs from the host on top of dispatching requests.
pub trait StackHost: ChainDriver<ContainerId> {
    /// Items in the player's inventory.
    fn count_items(&self) -> i64;

    fn show_message(&mut self, text: &str);
}

pub struct AutoStack<H> {
    state: Arc<Mutex<StackAllState>>,
    chain: Option<RequestChain<ContainerId, H>>,
    timeout: Duration,
}

impl<H: StackHost + 'static> AutoStack<H> {
    pub fn new(state: Arc<Mutex<StackAllState>>) -> AutoStack<H> {
        AutoStack {
            state,
            chain: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> AutoStack<H> {
        self.timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.chain.is_some()
    }

    /// Starts stacking into `containers`. Does nothing while a previous run is still going.
    pub fn begin(
        &mut self,
        host: &mut H,
        containers: Vec<ContainerId>,
        items_before: i64,
        now: Instant,
    ) -> bool {
        {
            let mut state = lock(&self.state);

            if state.processing {
                return false;
            }

            state.processing = true;
        }

        log::debug!("Stacking into {} containers.", containers.len());

        let state = self.state.clone();
        let mut chain = RequestChain::new(
            containers,
            self.timeout,
            move |report: &ChainReport, host: &mut H| {
                let mut state = lock(&state);

                if state.should_message && !report.cancelled {
                    let count = items_before - host.count_items();
                    host.show_message(&summary_message(count, report.dispatched));
                }

                state.processing = false;
            },
        );

        chain.start(host, now);
        self.keep_unless_finished(chain);

        true
    }

    /// The owner of `container` handed it over and the items were stacked.
    pub fn on_response(&mut self, host: &mut H, container: ContainerId, now: Instant) -> bool {
        let Some(mut chain) = self.chain.take() else {
            return false;
        };

        let accepted = chain.on_response(host, &container, now);
        self.keep_unless_finished(chain);

        accepted
    }

    pub fn poll(&mut self, host: &mut H, now: Instant) {
        if let Some(mut chain) = self.chain.take() {
            chain.poll(host, now);
            self.keep_unless_finished(chain);
        }
    }

    fn keep_unless_finished(&mut self, chain: RequestChain<ContainerId, H>) {
        if chain.is_finished() {
            log::debug!("Stacking finished: {:?}", chain.report());
        } else {
            self.chain = Some(chain);
        }
    }
}

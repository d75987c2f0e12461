use std::collections::VecDeque;

use super::{PeerId, RoutedRpc};

struct Pending {
    target: PeerId,
    method: &'static str,
    payload: Vec<u8>,
}

/// Calls waiting to be sent, one per network tick, so that large transfers (a whole exploration
/// map, say) don't flood the connection in a single frame.
#[derive(Default)]
pub struct RpcQueue {
    pending: VecDeque<Pending>,
}

impl RpcQueue {
    pub fn new() -> RpcQueue {
        RpcQueue::default()
    }

    pub fn enqueue(&mut self, target: PeerId, method: &'static str, payload: Vec<u8>) {
        self.pending.push_back(Pending {
            target,
            method,
            payload,
        });
    }

    /// Sends the oldest waiting call, if any. Returns whether something was sent.
    pub fn send_next(&mut self, rpc: &mut dyn RoutedRpc) -> bool {
        match self.pending.pop_front() {
            Some(call) => {
                rpc.invoke(call.target, call.method, call.payload);
                true
            }

            None => false,
        }
    }

    /// Drops every call addressed to `peer`.
    pub fn forget(&mut self, peer: PeerId) {
        self.pending.retain(|call| call.target != peer);
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

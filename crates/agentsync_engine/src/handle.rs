//! Per-module handle with the boundary's error policy.

use crate::engine::ProtocolEngine;
use agentsync_protocol::{Mode, Operation};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// One module's view of a [`ProtocolEngine`].
///
/// This is the shape exposed across the process boundary: failures are
/// logged, never returned. `persist_difference` returns nothing and the
/// other calls collapse their outcome to a flag.
#[derive(Debug, Clone)]
pub struct AgentSyncProtocol {
    module: String,
    engine: Arc<ProtocolEngine>,
}

impl AgentSyncProtocol {
    /// Binds `module` to an engine.
    pub fn new(module: impl Into<String>, engine: Arc<ProtocolEngine>) -> Self {
        Self {
            module: module.into(),
            engine,
        }
    }

    /// The bound module.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// The engine behind this handle.
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    /// Records a change; failures are logged.
    pub fn persist_difference(&self, id: &str, operation: Operation, index: &str, data: &str) {
        if let Err(e) = self
            .engine
            .persist_difference(&self.module, id, operation, index, data)
        {
            error!(module = %self.module, id, error = %e, "cannot persist difference");
        }
    }

    /// Runs one round. `true` means every pending row was offered and the
    /// manager's acknowledgment was reconciled.
    pub fn synchronize_module(
        &self,
        mode: Mode,
        timeout: Duration,
        retries: u32,
        max_eps: usize,
    ) -> bool {
        self.engine
            .synchronize_module(&self.module, mode, timeout, retries, max_eps)
            .is_ok()
    }

    /// Feeds a manager response to the engine. `false` means the buffer was
    /// discarded as malformed or foreign.
    pub fn parse_response_buffer(&self, buffer: &[u8]) -> bool {
        match self.engine.parse_response_buffer(buffer) {
            Ok(()) => true,
            Err(e) => {
                warn!(module = %self.module, error = %e, "response discarded");
                false
            }
        }
    }

    /// Drops every pending row of the module.
    pub fn reset(&self) -> bool {
        match self.engine.reset_module(&self.module) {
            Ok(_) => true,
            Err(e) => {
                error!(module = %self.module, error = %e, "cannot reset module");
                false
            }
        }
    }
}

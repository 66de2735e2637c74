//! Flow-wide configuration.

/// Tuning knobs for a [`crate::ControlFlow`].
#[derive(Clone, Copy, Debug)]
pub struct ControlFlowConfig {
    /// Annotate rejections with the chain of task descriptions that led to
    /// them. Off by default since it costs an allocation per task.
    pub long_stack_traces: bool,
    /// Used by [`crate::ControlFlow::wait`] when no timeout is given
    /// explicitly. `None` (the default) means wait forever.
    pub default_wait_timeout_ms: Option<u64>,
    /// How often a [`crate::ControlFlow::wait`] poll condition is
    /// re-checked.
    pub wait_poll_interval_ms: u64,
}

impl Default for ControlFlowConfig {
    fn default() -> Self {
        Self {
            long_stack_traces: false,
            default_wait_timeout_ms: None,
            wait_poll_interval_ms: 50,
        }
    }
}

impl ControlFlowConfig {
    pub fn builder() -> ControlFlowConfigBuilder {
        ControlFlowConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct ControlFlowConfigBuilder {
    config: ControlFlowConfig,
}

impl ControlFlowConfigBuilder {
    pub fn long_stack_traces(mut self, enabled: bool) -> Self {
        self.config.long_stack_traces = enabled;
        self
    }

    pub fn default_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.default_wait_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn wait_poll_interval_ms(mut self, interval_ms: u64) -> Self {
        self.config.wait_poll_interval_ms = interval_ms;
        self
    }

    pub fn build(self) -> ControlFlowConfig {
        self.config
    }
}

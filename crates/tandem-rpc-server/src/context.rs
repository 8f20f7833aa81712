//! Execution contexts: session-scoped restrictions on which methods are
//! currently callable.
//!
//! Contexts form a stack per connection. Only the top frame's allow-list is
//! consulted; a frame with an empty mapping imposes no restriction, so a
//! server built without an explicit allow-list dispatches against its whole
//! registry. Transitions are produced by successfully invoked methods and
//! applied by the connection's single dispatch task, so the stack itself
//! needs no locking.

use std::collections::HashMap;

use tandem_json_rpc::RESERVED_METHOD_PREFIX;
use tracing::debug;

/// An immutable snapshot of what is currently invocable.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Method that produced this frame; `None` for the root.
    pub produced_by: Option<String>,
    /// Allow-list of callable method names mapped to expected-parameter
    /// type tags. Empty means "no restriction".
    pub methods: HashMap<String, Option<&'static str>>,
}

impl ExecutionContext {
    fn new(
        produced_by: Option<String>,
        methods: Vec<(String, Option<&'static str>)>,
    ) -> Self {
        for (name, _) in &methods {
            assert!(
                !name.starts_with(RESERVED_METHOD_PREFIX),
                "reserved method name '{}' in allow-list",
                name
            );
        }
        Self {
            produced_by,
            methods: methods.into_iter().collect(),
        }
    }

    fn allows(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.contains_key(method)
    }
}

/// A context change requested by a successfully invoked method. Ignored
/// when the invocation failed.
#[derive(Debug, Clone, Default)]
pub struct StateTransition {
    /// Methods to install as the new top frame.
    pub push_methods: Option<Vec<(String, Option<&'static str>)>>,
    /// Retire the frame that was current when the method ran.
    pub pop_context: bool,
}

impl StateTransition {
    /// Push a new frame on top of the current one.
    pub fn push(methods: Vec<(String, Option<&'static str>)>) -> Self {
        Self {
            push_methods: Some(methods),
            pop_context: false,
        }
    }

    /// Replace the current frame with a new one.
    pub fn replace(methods: Vec<(String, Option<&'static str>)>) -> Self {
        Self {
            push_methods: Some(methods),
            pop_context: true,
        }
    }

    /// Retire the current frame, restoring the previous one.
    pub fn pop() -> Self {
        Self {
            push_methods: None,
            pop_context: true,
        }
    }
}

/// Stack of execution contexts for one connection.
#[derive(Debug)]
pub struct ExecutionContextStack {
    frames: Vec<ExecutionContext>,
}

impl Default for ExecutionContextStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContextStack {
    /// An unrestricted stack: the root frame allows every registered method.
    pub fn new() -> Self {
        Self {
            frames: vec![ExecutionContext::new(None, Vec::new())],
        }
    }

    /// A stack whose root frame restricts dispatch to the given methods.
    /// Reserved (`rpc.`-prefixed) names are a fatal construction error.
    pub fn with_root_methods(methods: Vec<(String, Option<&'static str>)>) -> Self {
        Self {
            frames: vec![ExecutionContext::new(None, methods)],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Whether the current top frame permits calling `method`.
    pub fn allows(&self, method: &str) -> bool {
        self.current().allows(method)
    }

    /// The expected-parameter-type tag the current frame records for a
    /// method, if any.
    pub fn expected_params(&self, method: &str) -> Option<&'static str> {
        self.current().methods.get(method).copied().flatten()
    }

    fn current(&self) -> &ExecutionContext {
        // The stack is never empty: pops below the root are fatal.
        &self.frames[self.frames.len() - 1]
    }

    /// Apply a transition produced by `method`. When both a push and a pop
    /// are requested, the frame that was current while the method ran is
    /// retired and the pushed frame takes its place.
    pub fn apply(&mut self, transition: &StateTransition, method: &str) {
        if transition.pop_context {
            self.pop_frame();
        }
        if let Some(methods) = &transition.push_methods {
            debug!(
                method,
                methods = methods.len(),
                "pushing execution context"
            );
            self.frames.push(ExecutionContext::new(
                Some(method.to_string()),
                methods.clone(),
            ));
        }
    }

    fn pop_frame(&mut self) {
        assert!(
            self.frames.len() > 1,
            "execution context stack underflow: attempted to pop the root context"
        );
        let frame = self.frames.pop();
        debug!(produced_by = ?frame.and_then(|f| f.produced_by), "popped execution context");
    }
}

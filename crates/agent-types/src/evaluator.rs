//! The policy evaluation engine is an external collaborator (§1 "Out of
//! scope"): this crate only defines the boundary it is invoked through.
//!
//! [`Evaluator`] is deliberately narrow — a query in, a JSON value out —
//! so that `agent-discovery` (evaluating the discovery decision) and
//! `agent-decision-log` (evaluating mask/drop decisions) can depend on the
//! same trait object without either one knowing how queries are compiled
//! or executed.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;

use crate::Bundle;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("evaluation of {query:?} failed: {detail}")]
    Failed { query: String, detail: String },

    #[error("decision {query:?} is undefined")]
    Undefined { query: String },
}

/// An in-flight evaluation, boxed so [`Evaluator`] stays object-safe without
/// pulling in an async-trait macro crate the rest of the workspace doesn't
/// otherwise need.
pub type EvalFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Value>, EvalError>> + Send + 'a>>;

/// Evaluates a `data.<path>` query against whatever document set the
/// embedder's policy engine currently has active, optionally against a
/// specific bundle's modules/data rather than the shared store (used by
/// discovery, which evaluates the *candidate* bundle before it is ever
/// activated).
pub trait Evaluator: Send + Sync {
    /// Evaluate `query` (e.g. `system/discovery/config` or
    /// `system/log/mask`) against `input`, returning the decision's result
    /// value. `Ok(None)` means the decision was undefined (distinct from a
    /// decision that evaluates to JSON `null`).
    fn evaluate<'a>(&'a self, query: &'a str, input: Value) -> EvalFuture<'a>;

    /// Evaluate `query` against a specific bundle's modules/data rather than
    /// whatever is currently active in the store (§4.G: discovery evaluates
    /// `data.<discovery.decision>` against the bundle it just downloaded,
    /// which is never itself written to the store). Evaluators that only
    /// ever compile against the active store — and have no notion of a
    /// standalone candidate bundle — can fall back to [`Evaluator::evaluate`].
    fn evaluate_bundle<'a>(&'a self, _bundle: &'a Bundle, query: &'a str, input: Value) -> EvalFuture<'a> {
        self.evaluate(query, input)
    }
}

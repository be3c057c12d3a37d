//! Action-plan interpreter.
//!
//! Site configurations declare each action as a JSON list of steps. This
//! module validates those lists into typed [`Plan`]s at load time and drives
//! them one step at a time against a [`Stash`]. The interpreter itself never
//! performs I/O: network, page and sub-action steps suspend the execution and
//! hand a [`Suspension`] back to the owning site.

/// Builders that validate declared steps into the IR.
pub mod builder;
/// Typed intermediate representation structures.
pub mod ir;
/// Stateless step evaluators.
pub mod ops;
/// Runner that drives plans against a host.
pub mod runtime;
/// Stash and value conversions.
pub mod value;

pub use builder::{build_plan, build_plan_value};
pub use ir::{
    ApiBody, AppendTarget, DebugMode, Dest, Gate, GateKind, GetSpec, HttpMethod, MatchOperand,
    MatchSpec, Op, Plan, SetSpec, Step,
};
pub use runtime::{
    Execution, FetchMethod, FetchRequest, Flow, PlanHost, RequestBody, ResponseShape, StepFailure,
    Suspension, resume, run,
};
pub use value::{ArrayState, Stash, VARS_KEY, expand_template, is_truthy, to_bool, to_text};

use thiserror::Error;

/// Convenience result alias for plan building.
pub type Result<T> = std::result::Result<T, PlanError>;

/// Errors surfaced while validating declared steps.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan is not a list.
    #[error("plan must be a list of steps")]
    NotAList,

    /// A step is not an object.
    #[error("step {index} is not an object")]
    NotAnObject {
        /// Step index.
        index: usize,
    },

    /// A step has no fields.
    #[error("step {index} is empty")]
    EmptyStep {
        /// Step index.
        index: usize,
    },

    /// A step uses a key no opcode or modifier recognizes.
    #[error("step {index}: unknown key `{key}`")]
    UnknownKey {
        /// Step index.
        index: usize,
        /// Offending key.
        key: String,
    },

    /// A step carries modifiers only.
    #[error("step {index}: no opcode")]
    MissingOpcode {
        /// Step index.
        index: usize,
    },

    /// A step names more than one opcode.
    #[error("step {index}: conflicting opcodes `{first}` and `{second}`")]
    AmbiguousOpcode {
        /// Step index.
        index: usize,
        /// First opcode seen.
        first: String,
        /// Second opcode seen.
        second: String,
    },

    /// A field is missing or has the wrong shape.
    #[error("step {index}: invalid `{field}`: {reason}")]
    InvalidField {
        /// Step index.
        index: usize,
        /// Field name.
        field: String,
        /// What is wrong.
        reason: String,
    },

    /// `rx` does not compile.
    #[error("step {index}: invalid regex: {source}")]
    BadRegex {
        /// Step index.
        index: usize,
        /// Compiler error.
        #[source]
        source: regex::Error,
    },

    /// `dest` is nested more than one level.
    #[error("step {index}: unsupported dest `{dest}`")]
    BadDest {
        /// Step index.
        index: usize,
        /// Declared destination.
        dest: String,
    },
}

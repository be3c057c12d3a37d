use regex::Regex;
use serde_json::Value;

use super::value::{Stash, is_truthy, to_bool};

/// Fully validated action plan ready for execution.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Action name the plan was declared under.
    pub name: String,
    /// Ordered steps.
    pub steps: Vec<Step>,
}

impl Plan {
    /// Number of declared steps. Index `len()` is the virtual success index.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan declares no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `index`, if any.
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Whether any step talks to the site API.
    pub fn uses_api(&self) -> bool {
        self.steps.iter().any(|step| matches!(step.op, Op::Api { .. }))
    }
}

/// One step of a plan: an opcode plus its modifiers.
#[derive(Debug, Clone)]
pub struct Step {
    /// What the step does.
    pub op: Op,
    /// Optional conditional gate evaluated before the opcode.
    pub gate: Option<Gate>,
    /// Where the step's value is written.
    pub dest: Option<Dest>,
    /// Tolerate missing keys and regex mismatches.
    pub ignore: bool,
    /// Per-step debug logging.
    pub debug: Option<DebugMode>,
    /// Declared form of the step, kept for failure reports.
    pub source: Value,
}

/// Which stash test a gate applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// `if`: value is truthy.
    Truthy,
    /// `if_set`: key is present.
    Present,
    /// `if_true`: value converts to `true`.
    True,
}

/// Conditional gate attached to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gate {
    /// Test to apply.
    pub kind: GateKind,
    /// Flat stash key being tested.
    pub key: String,
    /// Whether the result is inverted (leading `!`).
    pub negate: bool,
}

impl Gate {
    /// Whether the gated step should run against `stash`.
    pub fn admits(&self, stash: &Stash) -> bool {
        let value = stash.get(&self.key);
        let outcome = match self.kind {
            GateKind::Truthy => is_truthy(value),
            GateKind::Present => stash.contains(&self.key),
            GateKind::True => to_bool(value),
        };
        outcome != self.negate
    }
}

/// Destination of a step's value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dest {
    /// `dest: key`
    Key(String),
    /// `dest: outer.inner`
    Nested {
        /// Map key in the stash.
        outer: String,
        /// Key inside that map.
        inner: String,
    },
    /// `dest: VARS.key`, the site's persistent variable table.
    Var(String),
}

impl Dest {
    /// Parse a `dest` string. Paths deeper than one level are rejected.
    pub fn parse(text: &str) -> Option<Self> {
        if text.is_empty() {
            return None;
        }
        let parts: Vec<&str> = text.split('.').collect();
        match parts.as_slice() {
            [key] => Some(Dest::Key((*key).to_string())),
            [outer, inner] if !outer.is_empty() && !inner.is_empty() => {
                if *outer == super::value::VARS_KEY {
                    Some(Dest::Var((*inner).to_string()))
                } else {
                    Some(Dest::Nested {
                        outer: (*outer).to_string(),
                        inner: (*inner).to_string(),
                    })
                }
            }
            _ => None,
        }
    }

    /// The flat key, when this is a flat destination.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Dest::Key(key) => Some(key),
            _ => None,
        }
    }
}

/// Per-step debug logging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugMode {
    /// Log the full stash after the step.
    Stash,
    /// Log the step's value.
    Result,
}

/// Closed set of step kinds.
#[derive(Debug, Clone)]
pub enum Op {
    /// Delegate to another action on the domain control instance.
    SubAction {
        /// Action to run.
        action: String,
    },
    /// Request against the site API.
    Api {
        /// Endpoint template, resolved against `API_URL`.
        endpoint: String,
        /// Request body.
        body: ApiBody,
    },
    /// Plain HTTP request.
    Http {
        /// URL template.
        url: String,
        /// Request method.
        method: HttpMethod,
        /// Store the body as text instead of decoding JSON.
        raw: bool,
    },
    /// Show an interactive page and wait for the host to report back.
    LoadAuth {
        /// Stash path holding the page URL.
        url_key: String,
    },
    /// Compare two values.
    Match(MatchSpec),
    /// Read a stash path.
    Get(GetSpec),
    /// Build a value from a template or JSON literal.
    Set(SetSpec),
    /// Open or advance an iteration.
    Array {
        /// Stash path of the source list.
        source: String,
        /// Iteration variable name.
        item: String,
    },
    /// Append a value to a list.
    Append {
        /// Flat key of the value to append.
        source: String,
        /// Target list.
        target: AppendTarget,
    },
    /// Finish with the value at a path.
    Return {
        /// Stash path.
        key: String,
    },
    /// Emit the current element and advance.
    Yield {
        /// Iteration variable name.
        item: String,
    },
    /// Advance; finish with all elements on exhaustion.
    ReturnArray {
        /// Iteration variable name.
        item: String,
    },
    /// Advance; fall through on exhaustion.
    Continue {
        /// Iteration variable name.
        item: String,
    },
}

impl Op {
    /// Opcode keyword as written in configuration.
    pub fn keyword(&self) -> &'static str {
        match self {
            Op::SubAction { .. } => "action",
            Op::Api { .. } => "api",
            Op::Http { .. } => "http",
            Op::LoadAuth { .. } => "load_auth",
            Op::Match(_) => "match",
            Op::Get(_) => "get",
            Op::Set(_) => "set",
            Op::Array { .. } => "array",
            Op::Append { .. } => "append",
            Op::Return { .. } => "return",
            Op::Yield { .. } => "yield",
            Op::ReturnArray { .. } => "return-array",
            Op::Continue { .. } => "continue",
        }
    }
}

/// Body of an API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiBody {
    /// Plain GET.
    None,
    /// POST the JSON encoding of the value at this path.
    Json(String),
    /// POST the map at this path, urlencoded.
    Form(String),
}

/// HTTP method of an `http` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// Fetch the body.
    Get,
    /// Existence check; the value is a boolean.
    Head,
}

/// Operands of a `match` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchSpec {
    /// Left operand.
    pub left: MatchOperand,
    /// Literal right operand.
    pub right: String,
    /// `!=` instead of `=`.
    pub negate: bool,
}

/// Left-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOperand {
    /// Stash value when present, the literal otherwise (`v: [a, b]`).
    KeyOrLiteral(String),
    /// Always a stash value (`var`); missing compares as empty text.
    Var(String),
}

/// Parameters of a `get` (and `return`) step.
#[derive(Debug, Clone)]
pub struct GetSpec {
    /// Dotted stash path.
    pub path: String,
    /// Optional extraction pattern; capture group 1 becomes the value.
    pub rx: Option<Regex>,
    /// Require the value to be a list.
    pub as_array: bool,
}

impl GetSpec {
    /// Plain path lookup.
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            rx: None,
            as_array: false,
        }
    }
}

/// Source of a `set` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetSpec {
    /// `${path}` template rendered to text.
    Template(String),
    /// `J: ` literal, parsed as JSON when the step runs.
    Json(String),
}

/// Target list of an `append` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendTarget {
    /// `dest`: created when absent.
    Dest(String),
    /// `to`: must already hold a list; written back to the same key.
    To(String),
}

impl AppendTarget {
    /// Key of the target list.
    pub fn key(&self) -> &str {
        match self {
            AppendTarget::Dest(key) | AppendTarget::To(key) => key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn dest_forms() {
        assert_eq!(Dest::parse("a"), Some(Dest::Key("a".into())));
        assert_eq!(
            Dest::parse("a.b"),
            Some(Dest::Nested {
                outer: "a".into(),
                inner: "b".into()
            })
        );
        assert_eq!(Dest::parse("VARS.token"), Some(Dest::Var("token".into())));
        assert_eq!(Dest::parse("a.b.c"), None);
        assert_eq!(Dest::parse(".b"), None);
        assert_eq!(Dest::parse(""), None);
    }

    #[test]
    fn present_gate_sees_null() {
        let mut stash = Stash::new();
        stash.insert("k", Value::Null);
        let gate = Gate {
            kind: GateKind::Present,
            key: "k".into(),
            negate: false,
        };
        assert!(gate.admits(&stash));
        let truthy = Gate {
            kind: GateKind::Truthy,
            ..gate
        };
        assert!(!truthy.admits(&stash));
    }

    proptest! {
        #[test]
        fn negation_inverts_every_gate(value in prop_oneof![
            Just(json!(null)),
            Just(json!(0)),
            Just(json!(1)),
            Just(json!("")),
            Just(json!("false")),
            Just(json!("x")),
            Just(json!([])),
            Just(json!({"a": 1})),
        ], present in any::<bool>()) {
            let mut stash = Stash::new();
            if present {
                stash.insert("k", value);
            }
            for kind in [GateKind::Truthy, GateKind::Present, GateKind::True] {
                let plain = Gate { kind, key: "k".into(), negate: false };
                let negated = Gate { negate: true, ..plain.clone() };
                prop_assert_ne!(plain.admits(&stash), negated.admits(&stash));
            }
        }
    }
}

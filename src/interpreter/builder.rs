use regex::Regex;
use serde_json::{Map, Value};

use super::ir::{
    ApiBody, AppendTarget, DebugMode, Dest, Gate, GateKind, GetSpec, HttpMethod, MatchOperand,
    MatchSpec, Op, Plan, SetSpec, Step,
};
use super::value::to_text;
use super::{PlanError, Result};

const OPCODES: &[&str] = &[
    "action",
    "api",
    "http",
    "load_auth",
    "match",
    "get",
    "set",
    "array",
    "append",
    "return",
    "yield",
    "return-array",
    "continue",
];

const MODIFIERS: &[&str] = &[
    "dest", "if", "if_set", "if_true", "ignore", "debug", "rx", "type", "raw", "data", "form", "v",
    "var", "const", "to",
];

/// Build a typed plan from the declared list of steps.
pub fn build_plan(name: &str, steps: &[Value]) -> Result<Plan> {
    let steps = steps
        .iter()
        .enumerate()
        .map(|(index, step)| build_step(index, step))
        .collect::<Result<Vec<_>>>()?;
    Ok(Plan {
        name: name.to_string(),
        steps,
    })
}

/// Build a plan from a JSON value that must be a list.
pub fn build_plan_value(name: &str, value: &Value) -> Result<Plan> {
    match value {
        Value::Array(steps) => build_plan(name, steps),
        _ => Err(PlanError::NotAList),
    }
}

fn build_step(index: usize, value: &Value) -> Result<Step> {
    let fields = value
        .as_object()
        .ok_or(PlanError::NotAnObject { index })?;
    if fields.is_empty() {
        return Err(PlanError::EmptyStep { index });
    }

    let mut opcode = None;
    for key in fields.keys() {
        if OPCODES.contains(&key.as_str()) {
            if let Some(first) = opcode {
                return Err(PlanError::AmbiguousOpcode {
                    index,
                    first: String::from(first),
                    second: key.clone(),
                });
            }
            opcode = Some(key.as_str());
        } else if !MODIFIERS.contains(&key.as_str()) {
            return Err(PlanError::UnknownKey {
                index,
                key: key.clone(),
            });
        }
    }
    let opcode = opcode.ok_or(PlanError::MissingOpcode { index })?;

    let fields = Fields { index, map: fields };
    let dest = match fields.opt_string("dest")? {
        Some(text) => Some(Dest::parse(&text).ok_or(PlanError::BadDest { index, dest: text })?),
        None => None,
    };
    let op = parse_op(&fields, opcode, dest.as_ref())?;

    Ok(Step {
        op,
        gate: parse_gate(&fields)?,
        dest,
        ignore: fields.flag("ignore")?,
        debug: parse_debug(&fields)?,
        source: value.clone(),
    })
}

fn parse_op(fields: &Fields<'_>, opcode: &str, dest: Option<&Dest>) -> Result<Op> {
    let op = match opcode {
        "action" => Op::SubAction {
            action: fields.required_string("action")?,
        },
        "api" => {
            let body = match (fields.opt_string("data")?, fields.opt_string("form")?) {
                (Some(_), Some(_)) => {
                    return Err(fields.invalid("form", "cannot combine `data` and `form`"));
                }
                (Some(key), None) => ApiBody::Json(key),
                (None, Some(key)) => ApiBody::Form(key),
                (None, None) => ApiBody::None,
            };
            Op::Api {
                endpoint: fields.opt_string("api")?.unwrap_or_default(),
                body,
            }
        }
        "http" => {
            let method = match fields.opt_string("type")?.as_deref() {
                None | Some("get") => HttpMethod::Get,
                Some("head") | Some("check") => HttpMethod::Head,
                Some(other) => {
                    return Err(fields.invalid("type", format!("unsupported method `{other}`")));
                }
            };
            Op::Http {
                url: fields.required_string("http")?,
                method,
                raw: fields.flag("raw")?,
            }
        }
        "load_auth" => Op::LoadAuth {
            url_key: fields.required_string("load_auth")?,
        },
        "match" => Op::Match(parse_match(fields)?),
        "get" => Op::Get(parse_get(fields, "get")?),
        "set" => {
            let text = fields.required_string("set")?;
            match text.strip_prefix("J: ") {
                Some(literal) => Op::Set(SetSpec::Json(literal.to_string())),
                None => Op::Set(SetSpec::Template(text)),
            }
        }
        "array" => {
            let item = match dest {
                None => String::from("item"),
                Some(Dest::Key(key)) => key.clone(),
                Some(_) => {
                    return Err(fields.invalid("dest", "array items need a flat key"));
                }
            };
            Op::Array {
                source: fields.required_string("array")?,
                item,
            }
        }
        "append" => {
            let target = match (fields.opt_string("to")?, dest) {
                (Some(key), _) => AppendTarget::To(key),
                (None, Some(Dest::Key(key))) => AppendTarget::Dest(key.clone()),
                (None, Some(_)) => {
                    return Err(fields.invalid("dest", "append targets need a flat key"));
                }
                (None, None) => {
                    return Err(fields.invalid("append", "needs `dest` or `to`"));
                }
            };
            Op::Append {
                source: fields.required_string("append")?,
                target,
            }
        }
        "return" => Op::Return {
            key: fields.required_string("return")?,
        },
        "yield" => Op::Yield {
            item: fields.item_name("yield")?,
        },
        "return-array" => Op::ReturnArray {
            item: fields.item_name("return-array")?,
        },
        "continue" => Op::Continue {
            item: fields.item_name("continue")?,
        },
        _ => {
            return Err(PlanError::MissingOpcode {
                index: fields.index,
            });
        }
    };
    Ok(op)
}

fn parse_get(fields: &Fields<'_>, key: &str) -> Result<GetSpec> {
    let rx = match fields.opt_string("rx")? {
        Some(pattern) => Some(Regex::new(&pattern).map_err(|source| PlanError::BadRegex {
            index: fields.index,
            source,
        })?),
        None => None,
    };
    let as_array = match fields.opt_string("type")?.as_deref() {
        None => false,
        Some("array") => true,
        Some(other) => {
            return Err(fields.invalid("type", format!("unsupported value type `{other}`")));
        }
    };
    Ok(GetSpec {
        path: fields.required_string(key)?,
        rx,
        as_array,
    })
}

fn parse_match(fields: &Fields<'_>) -> Result<MatchSpec> {
    let negate = match fields.required_string("match")?.as_str() {
        "=" | "==" => false,
        "!=" => true,
        other => {
            return Err(fields.invalid("match", format!("unsupported operator `{other}`")));
        }
    };
    if let Some(operands) = fields.map.get("v") {
        let pair = operands
            .as_array()
            .filter(|items| items.len() == 2 && items.iter().all(is_scalar))
            .ok_or_else(|| fields.invalid("v", "expected two scalar operands"))?;
        return Ok(MatchSpec {
            left: MatchOperand::KeyOrLiteral(to_text(&pair[0])),
            right: to_text(&pair[1]),
            negate,
        });
    }
    match (fields.opt_string("var")?, fields.map.get("const")) {
        (Some(var), Some(constant)) if is_scalar(constant) => Ok(MatchSpec {
            left: MatchOperand::Var(var),
            right: to_text(constant),
            negate,
        }),
        _ => Err(fields.invalid("match", "needs `v` or `var` with `const`")),
    }
}

fn parse_gate(fields: &Fields<'_>) -> Result<Option<Gate>> {
    let mut gate = None;
    for (field, kind) in [
        ("if", GateKind::Truthy),
        ("if_set", GateKind::Present),
        ("if_true", GateKind::True),
    ] {
        let Some(text) = fields.opt_string(field)? else {
            continue;
        };
        if gate.is_some() {
            return Err(fields.invalid(field, "only one condition per step"));
        }
        let (negate, key) = match text.strip_prefix('!') {
            Some(rest) => (true, rest.to_string()),
            None => (false, text),
        };
        if key.is_empty() {
            return Err(fields.invalid(field, "empty condition key"));
        }
        gate = Some(Gate { kind, key, negate });
    }
    Ok(gate)
}

fn parse_debug(fields: &Fields<'_>) -> Result<Option<DebugMode>> {
    match fields.map.get("debug") {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(Value::String(mode)) if mode == "stash" => Ok(Some(DebugMode::Stash)),
        Some(_) => Ok(Some(DebugMode::Result)),
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

struct Fields<'a> {
    index: usize,
    map: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn invalid(&self, field: &str, reason: impl Into<String>) -> PlanError {
        PlanError::InvalidField {
            index: self.index,
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    fn opt_string(&self, field: &str) -> Result<Option<String>> {
        match self.map.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(Value::Number(num)) => Ok(Some(num.to_string())),
            Some(_) => Err(self.invalid(field, "expected a string")),
        }
    }

    fn required_string(&self, field: &str) -> Result<String> {
        match self.opt_string(field)? {
            Some(text) if !text.is_empty() => Ok(text),
            _ => Err(self.invalid(field, "expected a non-empty string")),
        }
    }

    fn item_name(&self, field: &str) -> Result<String> {
        Ok(self
            .opt_string(field)?
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| String::from("item")))
    }

    fn flag(&self, field: &str) -> Result<bool> {
        match self.map.get(field) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(Value::Number(num)) => Ok(num.as_f64().is_some_and(|n| n != 0.0)),
            Some(Value::String(text)) => Ok(!matches!(text.as_str(), "" | "0" | "false")),
            Some(_) => Err(self.invalid(field, "expected a boolean")),
        }
    }
}

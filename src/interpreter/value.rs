use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Reserved stash key holding a snapshot of the site's persistent variables.
pub const VARS_KEY: &str = "VARS";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([\w.]+)\}").expect("placeholder pattern is valid")
});

/// Variable environment threaded through the steps of one plan execution.
///
/// Besides the ordinary variables the stash carries the state of every open
/// `array` iteration, keyed by the iteration variable name. Loop state travels
/// with the data so a context can suspend mid-loop and resume later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stash {
    vars: Map<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    loops: BTreeMap<String, ArrayState>,
}

/// Progress of one `array` iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayState {
    /// Stash path the source list was read from.
    pub source_key: String,
    /// Snapshot of the source list taken on first entry.
    pub source: Vec<Value>,
    /// Index of the element currently bound to the iteration variable.
    pub index: usize,
    /// Plan index of the `array` step that opened the iteration.
    pub origin: usize,
    /// Elements already processed, as they looked when their turn ended.
    pub accumulated: Vec<Value>,
}

impl Stash {
    /// Create an empty stash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a stash from an existing variable map.
    pub fn from_map(vars: Map<String, Value>) -> Self {
        Self {
            vars,
            loops: BTreeMap::new(),
        }
    }

    /// Borrow the plain variables.
    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    /// Flat lookup of a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }

    /// Whether a top-level key is present (even if `null`).
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Store a top-level value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.vars.insert(key.into(), value)
    }

    /// Remove a top-level value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.vars.remove(key)
    }

    /// Store `value` under `outer.inner`.
    ///
    /// A non-map value at `outer` is replaced by a fresh map.
    pub fn insert_nested(&mut self, outer: &str, inner: &str, value: Value) {
        let slot = self
            .vars
            .entry(outer.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        if let Value::Object(map) = slot {
            map.insert(inner.to_string(), value);
        }
    }

    /// Resolve a dotted path (`a.b.c`) through nested maps.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.vars.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Merge caller parameters into the stash. Caller keys win, except the
    /// reserved [`VARS_KEY`].
    pub fn merge_params(&mut self, params: Map<String, Value>) {
        for (key, value) in params {
            if key == VARS_KEY {
                continue;
            }
            self.vars.insert(key, value);
        }
    }

    /// Iteration state for the loop bound to `item`.
    pub fn loop_state(&self, item: &str) -> Option<&ArrayState> {
        self.loops.get(item)
    }

    /// Mutable iteration state for the loop bound to `item`.
    pub fn loop_state_mut(&mut self, item: &str) -> Option<&mut ArrayState> {
        self.loops.get_mut(item)
    }

    /// Record a freshly opened iteration.
    pub fn open_loop(&mut self, item: impl Into<String>, state: ArrayState) {
        self.loops.insert(item.into(), state);
    }

    /// Drop the iteration bound to `item`, returning its final state.
    pub fn close_loop(&mut self, item: &str) -> Option<ArrayState> {
        self.loops.remove(item)
    }

    /// Number of open iterations.
    pub fn open_loops(&self) -> usize {
        self.loops.len()
    }

    /// Structured copy of the whole stash (used for diagnostics).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Truthiness used by the `if` gate.
///
/// Missing values, `null`, empty strings/lists/maps, `false` and integer zero
/// are false; everything else is true.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(num)) => {
            if let Some(int) = num.as_i64() {
                int != 0
            } else if let Some(int) = num.as_u64() {
                int != 0
            } else {
                true
            }
        }
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Boolean conversion used by the `if_true` gate and compatibility checks.
///
/// Strings are false when empty, `"0"` or `"false"` (any case); lists and
/// maps never convert.
pub fn to_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(num)) => num.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::String(text)) => {
            let lower = text.to_lowercase();
            !(lower.is_empty() || lower == "0" || lower == "false")
        }
        _ => false,
    }
}

/// String form of a value as substituted into templates and compared by `match`.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => flag.to_string(),
        Value::String(text) => text.clone(),
        Value::Number(num) => {
            if num.is_f64() {
                let float = num.as_f64().unwrap_or_default();
                if float.fract() == 0.0 && float.abs() < 1e15 {
                    return format!("{}", float as i64);
                }
            }
            num.to_string()
        }
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Replace every `${path}` in `template` with the text form of the stash value.
///
/// Returns the first unresolved path as the error.
pub fn expand_template(template: &str, stash: &Stash) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for captures in PLACEHOLDER.captures_iter(template) {
        let (Some(whole), Some(path)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let value = stash
            .lookup(path.as_str())
            .ok_or_else(|| path.as_str().to_string())?;
        output.push_str(&template[last..whole.start()]);
        output.push_str(&to_text(value));
        last = whole.end();
    }
    output.push_str(&template[last..]);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn stash(value: Value) -> Stash {
        match value {
            Value::Object(map) => Stash::from_map(map),
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn lookup_descends_nested_maps() {
        let s = stash(json!({"a": {"b": {"c": 5}}, "x": 1}));
        assert_eq!(s.lookup("a.b.c"), Some(&json!(5)));
        assert_eq!(s.lookup("x"), Some(&json!(1)));
        assert_eq!(s.lookup("a.z"), None);
        assert_eq!(s.lookup("x.y"), None);
    }

    #[test]
    fn insert_nested_replaces_scalars() {
        let mut s = stash(json!({"a": 3}));
        s.insert_nested("a", "b", json!("v"));
        s.insert_nested("c", "d", json!(true));
        assert_eq!(s.lookup("a.b"), Some(&json!("v")));
        assert_eq!(s.lookup("c.d"), Some(&json!(true)));
    }

    #[test]
    fn merge_params_keeps_vars() {
        let mut s = stash(json!({"VARS": {"token": "t"}, "URL": "u"}));
        let params = json!({"VARS": {"token": "evil"}, "URL": "override", "name": "n"});
        s.merge_params(params.as_object().cloned().unwrap());
        assert_eq!(s.lookup("VARS.token"), Some(&json!("t")));
        assert_eq!(s.get("URL"), Some(&json!("override")));
        assert_eq!(s.get("name"), Some(&json!("n")));
    }

    #[test]
    fn truthiness_table() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&Value::Null)));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!([]))));
        assert!(!is_truthy(Some(&json!({}))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(is_truthy(Some(&json!("0"))));
        assert!(is_truthy(Some(&json!(0.0))));
        assert!(is_truthy(Some(&json!([0]))));
        assert!(is_truthy(Some(&json!(-2))));
    }

    #[test]
    fn bool_conversion() {
        assert!(to_bool(Some(&json!("yes"))));
        assert!(!to_bool(Some(&json!("FALSE"))));
        assert!(!to_bool(Some(&json!("0"))));
        assert!(!to_bool(Some(&json!([1]))));
        assert!(to_bool(Some(&json!(2.5))));
    }

    #[test]
    fn text_rendering() {
        assert_eq!(to_text(&json!(5)), "5");
        assert_eq!(to_text(&json!(5.0)), "5");
        assert_eq!(to_text(&json!(2.5)), "2.5");
        assert_eq!(to_text(&Value::Null), "");
        assert_eq!(to_text(&json!(true)), "true");
        assert_eq!(to_text(&json!(["a"])), r#"["a"]"#);
    }

    #[test]
    fn template_expansion() {
        let s = stash(json!({"x": "a", "y": "b", "n": {"id": 7}}));
        assert_eq!(expand_template("${x}-${y}", &s).unwrap(), "a-b");
        assert_eq!(expand_template("id=${n.id}!", &s).unwrap(), "id=7!");
        assert_eq!(expand_template("${x}${missing}", &s), Err("missing".into()));
    }

    #[test]
    fn template_does_not_rescan_substituted_text() {
        let s = stash(json!({"x": "${y}", "y": "never"}));
        assert_eq!(expand_template("<${x}>", &s).unwrap(), "<${y}>");
    }

    proptest! {
        #[test]
        fn templates_without_placeholders_are_identity(text in "[a-zA-Z0-9 /:?=&.-]{0,40}") {
            let s = Stash::new();
            prop_assert_eq!(expand_template(&text, &s).unwrap(), text);
        }

        #[test]
        fn strings_are_truthy_iff_non_empty(text in ".{0,12}") {
            let value = Value::String(text.clone());
            prop_assert_eq!(is_truthy(Some(&value)), !text.is_empty());
        }
    }
}

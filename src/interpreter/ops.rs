//! Step evaluators.
//!
//! Every function here is synchronous and works only on the stash it is
//! handed. Network-bound steps do not perform I/O; they build a
//! [`FetchRequest`] that the site driver executes.

use serde_json::Value;
use url::Url;
use url::form_urlencoded;

use super::ir::{ApiBody, AppendTarget, GetSpec, HttpMethod, MatchOperand, MatchSpec, SetSpec};
use super::runtime::{FetchMethod, FetchRequest, RequestBody, ResponseShape};
use super::value::{ArrayState, Stash, expand_template, to_text};
use crate::runtime::error::{StepError, StepResult};
use crate::util::json::encode_json;

/// Stash key holding the API base URL.
pub const API_URL_KEY: &str = "API_URL";
/// Stash key holding extra API headers (`"Name: value"` strings).
pub const API_HEADERS_KEY: &str = "API_HEADERS";

/// Outcome of advancing an iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStep {
    /// More elements remain; jump back to the opening step.
    Next {
        /// Plan index of the `array` step.
        origin: usize,
        /// Element that was just finished.
        current: Value,
    },
    /// The source list is exhausted and the iteration closed.
    Exhausted {
        /// Every finished element, in source order.
        accumulated: Vec<Value>,
        /// Element that was just finished (`None` for an empty source).
        current: Option<Value>,
    },
}

/// `get`: resolve a dotted path with optional regex extraction.
pub fn get(spec: &GetSpec, ignore: bool, stash: &Stash) -> StepResult<Value> {
    let value = match stash.lookup(&spec.path) {
        Some(value) => value.clone(),
        None if ignore => return Ok(Value::Null),
        None => return Err(StepError::KeyMissing(spec.path.clone())),
    };

    let value = match &spec.rx {
        Some(rx) => {
            let text = to_text(&value);
            match rx.captures(&text) {
                Some(caps) => Value::String(
                    caps.get(1)
                        .map(|group| group.as_str().to_string())
                        .unwrap_or_default(),
                ),
                None if ignore => return Ok(Value::Null),
                None => return Err(StepError::RegexMismatch(spec.path.clone())),
            }
        }
        None => value,
    };

    if spec.as_array && !value.is_array() {
        return Err(StepError::NotAList(spec.path.clone()));
    }
    Ok(value)
}

/// `set`: render a template or parse a JSON literal.
pub fn set(spec: &SetSpec, stash: &Stash) -> StepResult<Value> {
    match spec {
        SetSpec::Template(template) => expand_template(template, stash)
            .map(Value::String)
            .map_err(StepError::TemplateKey),
        SetSpec::Json(literal) => serde_json::from_str(literal)
            .map_err(|err| StepError::BadJsonLiteral(err.to_string())),
    }
}

/// `match`: text comparison. The value of a successful match is `true`.
pub fn compare(spec: &MatchSpec, stash: &Stash) -> StepResult<Value> {
    let left = match &spec.left {
        MatchOperand::KeyOrLiteral(key) => stash
            .lookup(key)
            .map(to_text)
            .unwrap_or_else(|| key.clone()),
        MatchOperand::Var(key) => stash.lookup(key).map(to_text).unwrap_or_default(),
    };
    if (left == spec.right) != spec.negate {
        Ok(Value::Bool(true))
    } else {
        Err(StepError::MatchMismatch {
            left,
            right: spec.right.clone(),
        })
    }
}

/// `array`: open an iteration or bind its next element.
///
/// Returns the element to store under the iteration variable.
pub fn enter_array(
    source: &str,
    item: &str,
    origin: usize,
    ignore: bool,
    stash: &mut Stash,
) -> StepResult<Value> {
    if let Some(state) = stash.loop_state(item) {
        if state.index == 0 {
            return Err(StepError::ArrayReentry(item.to_string()));
        }
        return Ok(state.source.get(state.index).cloned().unwrap_or(Value::Null));
    }

    let list = match stash.lookup(source) {
        Some(Value::Array(items)) => items.clone(),
        Some(_) if !ignore => return Err(StepError::NotAList(source.to_string())),
        None if !ignore => return Err(StepError::KeyMissing(source.to_string())),
        _ => Vec::new(),
    };
    let first = list.first().cloned().unwrap_or(Value::Null);
    stash.open_loop(
        item,
        ArrayState {
            source_key: source.to_string(),
            source: list,
            index: 0,
            origin,
            accumulated: Vec::new(),
        },
    );
    Ok(first)
}

/// `yield` / `return-array` / `continue`: record the current element and
/// advance the iteration bound to `item`.
pub fn advance_loop(item: &str, stash: &mut Stash) -> StepResult<LoopStep> {
    let current = stash.get(item).cloned().unwrap_or(Value::Null);
    let state = stash
        .loop_state_mut(item)
        .ok_or_else(|| StepError::NoIteration(item.to_string()))?;

    if state.source.is_empty() {
        let accumulated = std::mem::take(&mut state.accumulated);
        stash.close_loop(item);
        return Ok(LoopStep::Exhausted {
            accumulated,
            current: None,
        });
    }

    state.accumulated.push(current.clone());
    if state.index + 1 < state.source.len() {
        state.index += 1;
        return Ok(LoopStep::Next {
            origin: state.origin,
            current,
        });
    }

    let accumulated = std::mem::take(&mut state.accumulated);
    stash.close_loop(item);
    Ok(LoopStep::Exhausted {
        accumulated,
        current: Some(current),
    })
}

/// `append`: push the value at `source` onto the target list.
///
/// A `to` target is updated in place; the new list is also the step value.
pub fn append(source: &str, target: &AppendTarget, stash: &mut Stash) -> StepResult<Value> {
    let value = stash
        .get(source)
        .cloned()
        .ok_or_else(|| StepError::AppendSource(source.to_string()))?;

    let mut list = match target {
        AppendTarget::Dest(key) => match stash.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        AppendTarget::To(key) => match stash.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => return Err(StepError::AppendTarget(key.clone())),
        },
    };
    list.push(value);

    let list = Value::Array(list);
    if let AppendTarget::To(key) = target {
        stash.insert(key.clone(), list.clone());
    }
    Ok(list)
}

/// `api`: build a request against `API_URL`.
pub fn api_request(endpoint: &str, body: &ApiBody, stash: &Stash) -> StepResult<FetchRequest> {
    let base_text = stash.get(API_URL_KEY).map(to_text).unwrap_or_default();
    let base = Url::parse(&base_text).map_err(|_| StepError::InvalidUrl(base_text.clone()))?;

    let endpoint = expand_template(endpoint, stash).map_err(StepError::TemplateKey)?;
    let url = if endpoint.is_empty() || endpoint == "GET" {
        base
    } else {
        base.join(&endpoint)
            .map_err(|_| StepError::InvalidUrl(endpoint.clone()))?
    };

    let (method, body) = match body {
        ApiBody::None => (FetchMethod::Get, None),
        ApiBody::Json(key) => {
            let value = stash
                .lookup(key)
                .ok_or_else(|| StepError::KeyMissing(key.clone()))?;
            (FetchMethod::Post, Some(RequestBody::json(encode_json(value))))
        }
        ApiBody::Form(key) => {
            let value = stash
                .lookup(key)
                .ok_or_else(|| StepError::KeyMissing(key.clone()))?;
            let mut form = form_urlencoded::Serializer::new(String::new());
            if let Some(fields) = value.as_object() {
                for (name, field) in fields {
                    form.append_pair(name, &to_text(field));
                }
            }
            (FetchMethod::Post, Some(RequestBody::form(form.finish())))
        }
    };

    Ok(FetchRequest {
        method,
        url,
        headers: api_headers(stash),
        body,
        shape: ResponseShape::Json,
    })
}

/// `http`: build a plain request from a URL template.
pub fn http_request(
    template: &str,
    method: HttpMethod,
    raw: bool,
    stash: &Stash,
) -> StepResult<FetchRequest> {
    let text = expand_template(template, stash).map_err(StepError::TemplateKey)?;
    let url = Url::parse(&text).map_err(|_| StepError::InvalidUrl(text.clone()))?;
    let (method, shape) = match (method, raw) {
        (HttpMethod::Head, _) => (FetchMethod::Head, ResponseShape::Exists),
        (HttpMethod::Get, true) => (FetchMethod::Get, ResponseShape::Text),
        (HttpMethod::Get, false) => (FetchMethod::Get, ResponseShape::Json),
    };
    Ok(FetchRequest {
        method,
        url,
        headers: Vec::new(),
        body: None,
        shape,
    })
}

/// `load_auth`: resolve the page URL to show.
pub fn page_url(url_key: &str, stash: &Stash) -> StepResult<String> {
    let value = stash
        .lookup(url_key)
        .ok_or_else(|| StepError::KeyMissing(url_key.to_string()))?;
    let url = to_text(value);
    if url.is_empty() {
        return Err(StepError::InvalidUrl(url));
    }
    Ok(url)
}

fn api_headers(stash: &Stash) -> Vec<(String, String)> {
    let Some(Value::Array(entries)) = stash.get(API_HEADERS_KEY) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(Value::as_str)
        .filter_map(|line| line.split_once(": "))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;

    fn stash(value: Value) -> Stash {
        Stash::from_map(value.as_object().cloned().unwrap())
    }

    #[test]
    fn get_nested_and_ignore() {
        let s = stash(json!({"a": {"b": 5}}));
        assert_eq!(get(&GetSpec::path("a.b"), false, &s).unwrap(), json!(5));
        assert!(matches!(
            get(&GetSpec::path("a.c"), false, &s),
            Err(StepError::KeyMissing(path)) if path == "a.c"
        ));
        assert_eq!(get(&GetSpec::path("a.c"), true, &s).unwrap(), Value::Null);
    }

    #[test]
    fn get_regex_extracts_first_group() {
        let s = stash(json!({"html": "<b>id=42</b>"}));
        let spec = GetSpec {
            path: "html".into(),
            rx: Some(Regex::new(r"id=(\d+)").unwrap()),
            as_array: false,
        };
        assert_eq!(get(&spec, false, &s).unwrap(), json!("42"));

        let no_group = GetSpec {
            rx: Some(Regex::new(r"id=\d+").unwrap()),
            ..spec.clone()
        };
        assert_eq!(get(&no_group, false, &s).unwrap(), json!(""));

        let miss = GetSpec {
            rx: Some(Regex::new(r"nope(\d)").unwrap()),
            ..spec
        };
        assert!(matches!(get(&miss, false, &s), Err(StepError::RegexMismatch(_))));
        assert_eq!(get(&miss, true, &s).unwrap(), Value::Null);
    }

    #[test]
    fn get_array_type_check() {
        let s = stash(json!({"list": [1], "text": "x"}));
        let mut spec = GetSpec::path("list");
        spec.as_array = true;
        assert_eq!(get(&spec, false, &s).unwrap(), json!([1]));
        spec.path = "text".into();
        assert!(matches!(get(&spec, false, &s), Err(StepError::NotAList(_))));
    }

    #[test]
    fn set_template_and_literal() {
        let s = stash(json!({"x": "a", "y": "b"}));
        let spec = SetSpec::Template("${x}-${y}".into());
        assert_eq!(set(&spec, &s).unwrap(), json!("a-b"));

        let s = stash(json!({"x": "a"}));
        assert!(matches!(set(&spec, &s), Err(StepError::TemplateKey(key)) if key == "y"));

        let literal = SetSpec::Json(r#"[{"field": "fixed"}]"#.into());
        assert_eq!(set(&literal, &s).unwrap(), json!([{"field": "fixed"}]));
        let broken = SetSpec::Json("{oops".into());
        assert!(matches!(set(&broken, &s), Err(StepError::BadJsonLiteral(_))));
    }

    #[test]
    fn compare_resolves_left_operand() {
        let s = stash(json!({"status": "ok", "count": 3}));
        let spec = |left: MatchOperand, right: &str, negate| MatchSpec {
            left,
            right: right.into(),
            negate,
        };
        assert_eq!(
            compare(&spec(MatchOperand::KeyOrLiteral("status".into()), "ok", false), &s).unwrap(),
            json!(true)
        );
        assert!(compare(&spec(MatchOperand::KeyOrLiteral("lit".into()), "lit", false), &s).is_ok());
        assert!(compare(&spec(MatchOperand::Var("count".into()), "3", false), &s).is_ok());
        assert!(compare(&spec(MatchOperand::Var("missing".into()), "", false), &s).is_ok());
        assert!(matches!(
            compare(&spec(MatchOperand::Var("status".into()), "error", false), &s),
            Err(StepError::MatchMismatch { .. })
        ));
        assert!(compare(&spec(MatchOperand::Var("status".into()), "error", true), &s).is_ok());
    }

    #[test]
    fn array_iteration_visits_each_element_once() {
        let mut s = stash(json!({"items": ["a", "b", "c"]}));
        let mut seen = Vec::new();
        let mut item = enter_array("items", "item", 4, false, &mut s).unwrap();
        loop {
            s.insert("item", item.clone());
            seen.push(item.clone());
            match advance_loop("item", &mut s).unwrap() {
                LoopStep::Next { origin, .. } => {
                    assert_eq!(origin, 4);
                    item = enter_array("items", "item", 4, false, &mut s).unwrap();
                }
                LoopStep::Exhausted { accumulated, .. } => {
                    assert_eq!(accumulated, vec![json!("a"), json!("b"), json!("c")]);
                    break;
                }
            }
        }
        assert_eq!(seen, vec![json!("a"), json!("b"), json!("c")]);
        assert_eq!(s.open_loops(), 0);
        assert!(matches!(advance_loop("item", &mut s), Err(StepError::NoIteration(_))));
    }

    #[test]
    fn array_reentry_at_index_zero_fails() {
        let mut s = stash(json!({"items": [1, 2]}));
        enter_array("items", "item", 0, false, &mut s).unwrap();
        assert!(matches!(
            enter_array("items", "item", 0, false, &mut s),
            Err(StepError::ArrayReentry(_))
        ));
    }

    #[test]
    fn empty_or_ignored_source_runs_once_without_accumulating() {
        let mut s = stash(json!({"items": []}));
        assert_eq!(enter_array("items", "item", 0, false, &mut s).unwrap(), Value::Null);
        assert_eq!(
            advance_loop("item", &mut s).unwrap(),
            LoopStep::Exhausted {
                accumulated: vec![],
                current: None
            }
        );

        let mut s = Stash::new();
        assert!(matches!(
            enter_array("missing", "item", 0, false, &mut s),
            Err(StepError::KeyMissing(_))
        ));
        assert_eq!(enter_array("missing", "item", 0, true, &mut s).unwrap(), Value::Null);
    }

    #[test]
    fn append_targets() {
        let mut s = stash(json!({"v": 1, "list": [0]}));
        assert_eq!(
            append("v", &AppendTarget::Dest("fresh".into()), &mut s).unwrap(),
            json!([1])
        );
        assert_eq!(
            append("v", &AppendTarget::To("list".into()), &mut s).unwrap(),
            json!([0, 1])
        );
        assert_eq!(s.get("list"), Some(&json!([0, 1])));
        assert!(matches!(
            append("v", &AppendTarget::To("absent".into()), &mut s),
            Err(StepError::AppendTarget(_))
        ));
        assert!(matches!(
            append("nope", &AppendTarget::Dest("list".into()), &mut s),
            Err(StepError::AppendSource(_))
        ));
    }

    #[test]
    fn api_request_joins_endpoint_and_headers() {
        let s = stash(json!({
            "API_URL": "https://api.example.com/v1/",
            "API_HEADERS": ["Authorization: Bearer t", "malformed"],
            "id": 9,
            "body": {"q": "x"},
        }));
        let req = api_request("videos/${id}", &ApiBody::None, &s).unwrap();
        assert_eq!(req.url.as_str(), "https://api.example.com/v1/videos/9");
        assert_eq!(req.method, FetchMethod::Get);
        assert_eq!(
            req.headers,
            vec![("Authorization".to_string(), "Bearer t".to_string())]
        );

        let req = api_request("GET", &ApiBody::Json("body".into()), &s).unwrap();
        assert_eq!(req.url.as_str(), "https://api.example.com/v1/");
        assert_eq!(req.method, FetchMethod::Post);
        assert_eq!(req.body.unwrap().bytes, br#"{"q":"x"}"#.to_vec());

        let req = api_request("search", &ApiBody::Form("body".into()), &s).unwrap();
        let body = req.body.unwrap();
        assert_eq!(body.bytes, b"q=x".to_vec());
        assert_eq!(body.content_type, "application/x-www-form-urlencoded");
    }

    #[test]
    fn http_request_shapes() {
        let s = stash(json!({"u": "https://cdn.example.com/a.jpg"}));
        let head = http_request("${u}", HttpMethod::Head, false, &s).unwrap();
        assert_eq!(head.method, FetchMethod::Head);
        assert_eq!(head.shape, ResponseShape::Exists);
        let raw = http_request("${u}", HttpMethod::Get, true, &s).unwrap();
        assert_eq!(raw.shape, ResponseShape::Text);
        assert!(matches!(
            http_request("not a url", HttpMethod::Get, false, &s),
            Err(StepError::InvalidUrl(_))
        ));
    }
}

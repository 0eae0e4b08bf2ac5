use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::{join_path, SpecError};

static TOKEN_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"%(\w+)%").unwrap());

/// Replaces every `%NAME%` token in the string scalars of the tree.
///
/// A token resolves against the scalar keys of the object holding the string,
/// then against each enclosing object up to the root. Sibling scalars are
/// substituted before they're handed out, so `{"name": "a", "host": "%name%"}`
/// and `{"host": "%name%", "name": "%prefix%-a"}` both work. The replacement
/// text itself is never rescanned, a result that would read as a new
/// placeholder is rejected so that resolving it again changes nothing.
pub(super) fn substitute(root: &mut Map<String, Value>) -> Result<(), SpecError> {
    substitute_object(root, None, "")
}

struct Scope<'a> {
    vars: HashMap<String, String>,
    parent: Option<&'a Scope<'a>>,
}

impl<'a> Scope<'a> {
    fn lookup(&self, name: &str) -> Option<&str> {
        match self.vars.get(name) {
            Some(value) => Some(value.as_str()),
            None => self.parent.and_then(|p| p.lookup(name)),
        }
    }

    fn expand(&self, text: &str, path: &str) -> Result<String, SpecError> {
        replace_tokens(text, path, &mut |name| {
            Ok(self.lookup(name).map(str::to_owned))
        })
    }
}

fn substitute_object(
    object: &mut Map<String, Value>,
    parent: Option<&Scope<'_>>,
    path: &str,
) -> Result<(), SpecError> {
    let scope = Scope {
        vars: SiblingResolver::new(object, parent, path).resolve_all()?,
        parent,
    };

    for (key, value) in object.iter_mut() {
        match value {
            Value::String(text) => {
                if let Some(expanded) = scope.vars.get(key) {
                    *text = expanded.clone();
                }
            }
            other => substitute_value(other, &scope, &join_path(path, key))?,
        }
    }

    Ok(())
}

fn substitute_value(value: &mut Value, scope: &Scope<'_>, path: &str) -> Result<(), SpecError> {
    match value {
        Value::String(text) => *text = scope.expand(text, path)?,
        Value::Array(items) => {
            for (i, item) in items.iter_mut().enumerate() {
                substitute_value(item, scope, &format!("{path}[{i}]"))?;
            }
        }
        Value::Object(object) => substitute_object(object, Some(scope), path)?,
        _ => {}
    }

    Ok(())
}

/// Substitutes the scalar keys of one object, resolving references between
/// siblings on demand.
struct SiblingResolver<'o, 'p> {
    object: &'o Map<String, Value>,
    parent: Option<&'p Scope<'p>>,
    path: &'o str,
    resolved: HashMap<String, String>,
    visiting: Vec<String>,
}

impl<'o, 'p> SiblingResolver<'o, 'p> {
    fn new(object: &'o Map<String, Value>, parent: Option<&'p Scope<'p>>, path: &'o str) -> Self {
        Self {
            object,
            parent,
            path,
            resolved: HashMap::new(),
            visiting: Vec::new(),
        }
    }

    fn resolve_all(mut self) -> Result<HashMap<String, String>, SpecError> {
        let object = self.object;
        for key in object.keys() {
            self.resolve(key)?;
        }

        Ok(self.resolved)
    }

    fn resolve(&mut self, key: &str) -> Result<Option<String>, SpecError> {
        if let Some(value) = self.resolved.get(key) {
            return Ok(Some(value.clone()));
        }

        let object = self.object;
        let value = match object.get(key) {
            Some(Value::String(text)) => {
                if self.visiting.iter().any(|k| k == key) {
                    return Err(SpecError::CircularSubstitution {
                        name: key.to_owned(),
                        path: self.path.to_owned(),
                    });
                }

                self.visiting.push(key.to_owned());
                let path = join_path(self.path, key);
                let expanded = replace_tokens(text, &path, &mut |name| self.lookup(name));
                self.visiting.pop();

                expanded?
            }
            Some(Value::Number(number)) => number.to_string(),
            Some(Value::Bool(flag)) => flag.to_string(),
            _ => return Ok(None),
        };

        self.resolved.insert(key.to_owned(), value.clone());

        Ok(Some(value))
    }

    fn lookup(&mut self, name: &str) -> Result<Option<String>, SpecError> {
        if let Some(value) = self.resolve(name)? {
            return Ok(Some(value));
        }

        Ok(self
            .parent
            .and_then(|p| p.lookup(name))
            .map(str::to_owned))
    }
}

fn replace_tokens(
    text: &str,
    path: &str,
    lookup: &mut dyn FnMut(&str) -> Result<Option<String>, SpecError>,
) -> Result<String, SpecError> {
    let mut output = String::with_capacity(text.len());
    let mut last = 0;

    for captures in TOKEN_REGEX.captures_iter(text) {
        let (Some(token), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };

        let value = lookup(name.as_str())?.ok_or_else(|| SpecError::UndefinedVariable {
            name: name.as_str().to_owned(),
            path: path.to_owned(),
        })?;

        output.push_str(&text[last..token.start()]);
        output.push_str(&value);
        last = token.end();
    }

    output.push_str(&text[last..]);

    if let Some(token) = TOKEN_REGEX.find(&output) {
        return Err(SpecError::AmbiguousSubstitution {
            token: token.as_str().to_owned(),
            path: path.to_owned(),
        });
    }

    Ok(output)
}

/// First placeholder left in `text`.
pub(super) fn find_token(text: &str) -> Option<&str> {
    TOKEN_REGEX.find(text).map(|token| token.as_str())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::spec::{resolve, SpecError};

    #[test]
    fn nearest_scope_wins() {
        let spec = resolve(&json!({
            "name": "agg-1",
            "templates": {"tpl": {"instance": "%hostname%/meminfo", "owner": "%name%"}},
            "nodes": [{"hostname": "samp-1", "!extends": "tpl"}],
        }))
        .unwrap();

        assert_eq!(
            spec.get("nodes"),
            Some(&json!([{
                "instance": "samp-1/meminfo",
                "owner": "agg-1",
                "hostname": "samp-1",
            }]))
        );
    }

    #[test]
    fn own_keys_shadow_ancestors() {
        let spec = resolve(&json!({
            "name": "outer",
            "daemon": {"name": "inner", "host": "%name%"},
        }))
        .unwrap();

        assert_eq!(spec.get("daemon"), Some(&json!({"name": "inner", "host": "inner"})));
    }

    #[test]
    fn integers_and_booleans_substitute_as_text() {
        let spec = resolve(&json!({
            "component_id": 10001,
            "start": true,
            "config": ["component_id=%component_id%", "start=%start%"],
        }))
        .unwrap();

        assert_eq!(
            spec.get("config"),
            Some(&json!(["component_id=10001", "start=true"]))
        );
    }

    #[test]
    fn sibling_references_resolve_in_any_order() {
        let spec = resolve(&json!({
            "prefix": "lab",
            "node": {"path": "/data/%host%", "host": "%prefix%-1"},
        }))
        .unwrap();

        assert_eq!(
            spec.get("node"),
            Some(&json!({"path": "/data/lab-1", "host": "lab-1"}))
        );
    }

    #[test]
    fn substitution_forming_a_new_placeholder_fails() {
        let result = resolve(&json!({
            "pct": "50%",
            "line": "used %pct%ile%pct%",
        }));

        match result {
            Err(SpecError::AmbiguousSubstitution { token, path }) => {
                assert_eq!(token, "%ile50%");
                assert_eq!(path, "line");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn percent_signs_in_values_are_kept() {
        let spec = resolve(&json!({
            "pct": "50%",
            "line": "used %pct% of it",
        }))
        .unwrap();

        assert_eq!(spec.get("line"), Some(&json!("used 50% of it")));
        assert_eq!(resolve(&spec.clone().into_value()).unwrap(), spec);
    }

    #[test]
    fn text_without_tokens_is_untouched() {
        let spec = resolve(&json!({"cmd": "echo 50% done"})).unwrap();

        assert_eq!(spec.get("cmd"), Some(&json!("echo 50% done")));
    }

    #[test]
    fn undefined_variable_is_reported() {
        let result = resolve(&json!({"nodes": [{"instance": "%hostname%/x"}]}));

        match result {
            Err(SpecError::UndefinedVariable { name, path }) => {
                assert_eq!(name, "hostname");
                assert_eq!(path, "nodes[0].instance");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn lists_and_objects_do_not_define_variables() {
        let result = resolve(&json!({"nodes": ["%nodes%"]}));

        assert!(matches!(result, Err(SpecError::UndefinedVariable { .. })));
    }

    #[test]
    fn circular_sibling_references_fail() {
        let result = resolve(&json!({"a": "%b%", "b": "%a%"}));

        assert!(matches!(result, Err(SpecError::CircularSubstitution { .. })));
    }

    #[test]
    fn template_example_expands_like_a_real_cluster() {
        let spec = resolve(&json!({
            "XPRT": "sock",
            "templates": {
                "compute-node": {
                    "daemons": [
                        {"name": "sshd", "type": "sshd"},
                        {"name": "sampler", "!extends": "ldmsd-sampler"},
                    ],
                },
                "ldmsd-base": {"type": "ldmsd", "listen_xprt": "%XPRT%"},
                "ldmsd-sampler": {
                    "!extends": "ldmsd-base",
                    "samplers": [
                        {"plugin": "meminfo", "!extends": "sampler-common"},
                        {"plugin": "vmstat", "!extends": "sampler-common", "interval": 2000000},
                    ],
                },
                "sampler-common": {
                    "interval": 1000000,
                    "config": ["component_id=%component_id%", "instance=%hostname%/%plugin%"],
                },
                "prdcr-base": {"host": "%name%", "xprt": "%XPRT%"},
            },
            "nodes": [
                {"hostname": "samp-1", "component_id": 10001, "!extends": "compute-node"},
                {
                    "hostname": "agg-1",
                    "daemons": [{
                        "name": "agg-1",
                        "!extends": "ldmsd-base",
                        "prdcrs": [{"name": "samp-1", "!extends": "prdcr-base"}],
                    }],
                },
            ],
        }))
        .unwrap();

        assert_eq!(
            spec.get("nodes"),
            Some(&json!([
                {
                    "hostname": "samp-1",
                    "component_id": 10001,
                    "daemons": [
                        {"name": "sshd", "type": "sshd"},
                        {
                            "name": "sampler",
                            "type": "ldmsd",
                            "listen_xprt": "sock",
                            "samplers": [
                                {
                                    "plugin": "meminfo",
                                    "interval": 1000000,
                                    "config": ["component_id=10001", "instance=samp-1/meminfo"],
                                },
                                {
                                    "plugin": "vmstat",
                                    "interval": 2000000,
                                    "config": ["component_id=10001", "instance=samp-1/vmstat"],
                                },
                            ],
                        },
                    ],
                },
                {
                    "hostname": "agg-1",
                    "daemons": [{
                        "name": "agg-1",
                        "type": "ldmsd",
                        "listen_xprt": "sock",
                        "prdcrs": [{"name": "samp-1", "host": "samp-1", "xprt": "sock"}],
                    }],
                },
            ]))
        );
    }
}

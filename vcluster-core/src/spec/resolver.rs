use std::collections::HashMap;

use log::debug;
use serde_json::{Map, Value};

use super::{
    join_path,
    substitution::{find_token, substitute},
    Spec, SpecError, ENV_KEY, EXTENDS_KEY, TEMPLATES_KEY,
};

/// Expands a raw spec tree into a resolved [`Spec`].
///
/// Inheritance is applied first for the whole tree, `%NAME%` substitution
/// runs afterwards on the inherited result. Resolving an already resolved
/// tree yields the same tree.
pub fn resolve(raw: &Value) -> Result<Spec, SpecError> {
    let root = raw.as_object().ok_or(SpecError::NotAnObject)?;

    validate_types(raw, "")?;

    let empty = Map::new();
    let templates = match root.get(TEMPLATES_KEY) {
        Some(Value::Object(templates)) => templates,
        Some(_) => {
            return Err(SpecError::InvalidTemplate {
                name: TEMPLATES_KEY.to_owned(),
            })
        }
        None => &empty,
    };

    let body = root
        .iter()
        .filter(|(key, _)| key.as_str() != TEMPLATES_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect::<Map<_, _>>();

    let mut inheritance = TemplateResolver::new(templates);
    let mut resolved = inheritance.resolve_object(&body, "")?;

    debug!(
        "Resolved spec inheritance using {} template(s)",
        inheritance.resolved.len()
    );

    substitute(&mut resolved)?;

    Ok(Spec::from_resolved(resolved))
}

/// Takes a tree produced by [`resolve`] without resolving it again.
pub(super) fn check_resolved(value: Value) -> Result<Spec, SpecError> {
    validate_types(&value, "")?;

    let Value::Object(root) = value else {
        return Err(SpecError::NotAnObject);
    };

    if root.contains_key(TEMPLATES_KEY) {
        return Err(SpecError::Unresolved {
            path: TEMPLATES_KEY.to_owned(),
        });
    }

    for (key, item) in &root {
        check_no_markers(item, key)?;
    }

    Ok(Spec::from_resolved(root))
}

fn check_no_markers(value: &Value, path: &str) -> Result<(), SpecError> {
    match value {
        Value::String(text) if find_token(text).is_some() => Err(SpecError::Unresolved {
            path: path.to_owned(),
        }),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| check_no_markers(item, &format!("{path}[{i}]"))),
        Value::Object(map) => map.iter().try_for_each(|(key, item)| {
            let path = join_path(path, key);
            if key == EXTENDS_KEY {
                return Err(SpecError::Unresolved { path });
            }

            check_no_markers(item, &path)
        }),
        _ => Ok(()),
    }
}

fn validate_types(value: &Value, path: &str) -> Result<(), SpecError> {
    match value {
        Value::Null => Err(SpecError::InvalidType {
            path: path.to_owned(),
        }),
        Value::Number(number) if !number.is_i64() && !number.is_u64() => {
            Err(SpecError::InvalidType {
                path: path.to_owned(),
            })
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| validate_types(item, &format!("{path}[{i}]"))),
        Value::Object(map) => map
            .iter()
            .try_for_each(|(key, item)| validate_types(item, &join_path(path, key))),
        _ => Ok(()),
    }
}

struct TemplateResolver<'a> {
    templates: &'a Map<String, Value>,
    resolved: HashMap<String, Map<String, Value>>,
    /// templates whose resolution is currently on the stack
    in_progress: Vec<String>,
}

impl<'a> TemplateResolver<'a> {
    fn new(templates: &'a Map<String, Value>) -> Self {
        Self {
            templates,
            resolved: HashMap::new(),
            in_progress: Vec::new(),
        }
    }

    /// Returns a fresh deep copy of the fully inherited template.
    fn template(&mut self, name: &str, path: &str) -> Result<Map<String, Value>, SpecError> {
        if let Some(template) = self.resolved.get(name) {
            return Ok(template.clone());
        }

        if self.in_progress.iter().any(|t| t == name) {
            let mut chain = self.in_progress.clone();
            chain.push(name.to_owned());

            return Err(SpecError::CircularExtends { chain });
        }

        let raw = self
            .templates
            .get(name)
            .ok_or_else(|| SpecError::UnknownTemplate {
                name: name.to_owned(),
                path: path.to_owned(),
            })?
            .as_object()
            .ok_or_else(|| SpecError::InvalidTemplate {
                name: name.to_owned(),
            })?;

        self.in_progress.push(name.to_owned());
        let template = self.resolve_object(raw, &join_path(TEMPLATES_KEY, name));
        self.in_progress.pop();

        let template = template?;
        self.resolved.insert(name.to_owned(), template.clone());

        Ok(template)
    }

    fn resolve_value(&mut self, value: &Value, path: &str) -> Result<Value, SpecError> {
        match value {
            Value::Object(map) => Ok(Value::Object(self.resolve_object(map, path)?)),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.resolve_value(item, &format!("{path}[{i}]")))
                    .collect::<Result<_, _>>()?,
            )),
            scalar => Ok(scalar.clone()),
        }
    }

    fn resolve_object(
        &mut self,
        object: &Map<String, Value>,
        path: &str,
    ) -> Result<Map<String, Value>, SpecError> {
        let mut own = Map::new();
        for (key, value) in object.iter().filter(|(key, _)| key.as_str() != EXTENDS_KEY) {
            own.insert(key.clone(), self.resolve_value(value, &join_path(path, key))?);
        }

        match object.get(EXTENDS_KEY) {
            None => Ok(own),
            Some(Value::String(name)) => {
                let base = self.template(name, path)?;

                Ok(merge(base, own))
            }
            Some(_) => Err(SpecError::InvalidExtends {
                path: path.to_owned(),
            }),
        }
    }
}

/// Lays `own` over `base`: lists append, `env` objects merge by key and
/// everything else is replaced.
fn merge(mut base: Map<String, Value>, own: Map<String, Value>) -> Map<String, Value> {
    for (key, value) in own {
        match (base.get_mut(&key), value) {
            (Some(Value::Array(inherited)), Value::Array(items)) => inherited.extend(items),
            (Some(Value::Object(inherited)), Value::Object(vars)) if key == ENV_KEY => {
                inherited.extend(vars)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }

    base
}

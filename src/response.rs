use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::query_planner::PathSegment;

/// One element of a concrete response path, e.g. `["topProducts", 0, "reviews"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        GraphQLError {
            message: message.into(),
            path: None,
            extensions: None,
        }
    }

    pub fn with_path(mut self, path: Vec<PathElement>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extensions
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value.into());
        self
    }
}

/// The response returned to the client: data stitched from every step plus
/// the errors recorded along the way.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedResponse {
    pub data: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl MergedResponse {
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        MergedResponse {
            data: Value::Null,
            errors,
        }
    }
}

/// The fields the client asked for, in query order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Shape {
    fields: Vec<ShapeField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapeField {
    pub key: String,
    /// Concrete types this field applies to; `None` means every type.
    pub type_conditions: Option<BTreeSet<String>>,
    pub children: Option<Shape>,
}

impl Shape {
    pub fn fields(&self) -> &[ShapeField] {
        &self.fields
    }

    /// Adds a field, merging it with an earlier selection of the same key.
    pub fn add(&mut self, field: ShapeField) {
        let existing = self.fields.iter_mut().find(|existing| existing.key == field.key);
        let Some(existing) = existing else {
            self.fields.push(field);
            return;
        };

        existing.type_conditions = match (existing.type_conditions.take(), field.type_conditions) {
            (Some(mut a), Some(b)) => {
                a.extend(b);
                Some(a)
            }
            _ => None,
        };

        if let Some(more) = field.children {
            let children = existing.children.get_or_insert_with(Shape::default);
            for field in more.fields {
                children.add(field);
            }
        }
    }
}

/// Keeps only the fields in `shape`, filling missing ones with `null`.
pub fn project(value: &Value, shape: &Shape) -> Value {
    match value {
        Value::Object(object) => {
            let typename = object.get("__typename").and_then(Value::as_str);
            let mut projected = Map::new();

            for field in &shape.fields {
                if let (Some(conditions), Some(typename)) = (&field.type_conditions, typename) {
                    if !conditions.contains(typename) {
                        continue;
                    }
                }

                let value = object.get(&field.key).unwrap_or(&Value::Null);
                let value = match &field.children {
                    Some(children) => project(value, children),
                    None => value.clone(),
                };

                projected.insert(field.key.clone(), value);
            }

            Value::Object(projected)
        }
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| project(item, shape)).collect())
        }
        other => other.clone(),
    }
}

/// Recursively merges `source` into `target`. Objects merge key by key and
/// equally long lists merge element-wise; a `null` never erases data.
pub fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(target), Value::Array(source)) if target.len() == source.len() => {
            for (existing, value) in target.iter_mut().zip(source) {
                deep_merge(existing, value);
            }
        }
        (target, Value::Null) if !target.is_null() => {}
        (target, source) => *target = source,
    }
}

pub fn value_at_mut<'v>(root: &'v mut Value, path: &[PathElement]) -> Option<&'v mut Value> {
    path.iter().try_fold(root, |value, element| match element {
        PathElement::Key(key) => value.as_object_mut()?.get_mut(key),
        PathElement::Index(index) => value.as_array_mut()?.get_mut(*index),
    })
}

/// Every object reachable from `root` along `path`, with its concrete path.
pub fn collect_objects<'v>(root: &'v Value, path: &[PathSegment]) -> Vec<Located<'v>> {
    let mut found = Vec::new();
    collect(root, path, &mut Vec::new(), &mut found);
    found
}

/// An object in the response together with its concrete path.
pub type Located<'v> = (Vec<PathElement>, &'v Map<String, Value>);

fn collect<'v>(
    value: &'v Value,
    path: &[PathSegment],
    current: &mut Vec<PathElement>,
    found: &mut Vec<Located<'v>>,
) {
    match path.split_first() {
        None => {
            if let Value::Object(object) = value {
                found.push((current.clone(), object));
            }
        }
        Some((PathSegment::Field(key), rest)) => {
            if let Some(next) = value.as_object().and_then(|object| object.get(key)) {
                current.push(PathElement::Key(key.clone()));
                collect(next, rest, current, found);
                current.pop();
            }
        }
        Some((PathSegment::Flatten, rest)) => {
            if let Value::Array(items) = value {
                for (index, item) in items.iter().enumerate() {
                    current.push(PathElement::Index(index));
                    collect(item, rest, current, found);
                    current.pop();
                }
            }
        }
    }
}

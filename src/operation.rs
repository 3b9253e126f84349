//! Client operation normalisation.
//!
//! The client document is parsed once, the requested operation is selected,
//! named fragments are inlined, and arguments and directives are rendered back
//! to text so planned sub-queries can carry them verbatim.

use std::collections::{BTreeSet, HashMap};

use graphql_parser::query::{
    Definition, Directive, FragmentDefinition, OperationDefinition, Selection, SelectionSet,
    TypeCondition, Value, VariableDefinition as AstVariableDefinition, parse_query,
};

use crate::{error::PlanningError, supergraph::render_type};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub variables: Vec<VariableDefinition>,
    pub selections: Vec<NormalizedSelection>,
}

/// A declared operation variable, pre-rendered as `$name: Type = default`.
#[derive(Debug, Clone)]
pub struct VariableDefinition {
    pub name: String,
    pub rendered: String,
}

#[derive(Debug, Clone)]
pub enum NormalizedSelection {
    Field(NormalizedField),
    InlineFragment(NormalizedFragment),
}

#[derive(Debug, Clone)]
pub struct NormalizedFragment {
    pub type_condition: Option<String>,
    pub directives: String,
    pub variables: BTreeSet<String>,
    pub selections: Vec<NormalizedSelection>,
}

#[derive(Debug, Clone)]
pub struct NormalizedField {
    pub alias: Option<String>,
    pub name: String,
    /// Rendered argument list including parentheses, or empty.
    pub arguments: String,
    /// Rendered directives with a leading space each, or empty.
    pub directives: String,
    /// Variables referenced by arguments and directives.
    pub variables: BTreeSet<String>,
    pub selections: Vec<NormalizedSelection>,
}

impl NormalizedField {
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Parses `query` and normalises the operation called `operation_name`.
pub fn parse_operation(
    query: &str,
    operation_name: Option<&str>,
) -> Result<Operation, PlanningError> {
    let document =
        parse_query::<String>(query).map_err(|e| PlanningError::Syntax(e.to_string()))?;

    let mut fragments = HashMap::new();
    let mut operations = Vec::new();

    for definition in &document.definitions {
        match definition {
            Definition::Fragment(fragment) => {
                fragments.insert(fragment.name.as_str(), fragment);
            }
            Definition::Operation(operation) => operations.push(operation),
        }
    }

    let operation = match operation_name {
        Some(wanted) => operations
            .into_iter()
            .find(|operation| operation_name_of(operation) == Some(wanted))
            .ok_or_else(|| PlanningError::UnknownOperation(wanted.to_string()))?,
        None => match operations.as_slice() {
            [] => return Err(PlanningError::NoOperation),
            [operation] => *operation,
            _ => return Err(PlanningError::OperationNameRequired),
        },
    };

    let (kind, name, variable_definitions, selection_set) = match operation {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, &[][..], set),
        OperationDefinition::Query(query) => (
            OperationKind::Query,
            query.name.clone(),
            query.variable_definitions.as_slice(),
            &query.selection_set,
        ),
        OperationDefinition::Mutation(mutation) => (
            OperationKind::Mutation,
            mutation.name.clone(),
            mutation.variable_definitions.as_slice(),
            &mutation.selection_set,
        ),
        OperationDefinition::Subscription(_) => {
            return Err(PlanningError::Unsupported("subscription"));
        }
    };

    let normalizer = Normalizer { fragments };

    Ok(Operation {
        kind,
        name,
        variables: variable_definitions.iter().map(render_variable_definition).collect(),
        selections: normalizer.selection_set(selection_set, &mut Vec::new())?,
    })
}

fn operation_name_of<'d>(operation: &'d OperationDefinition<'_, String>) -> Option<&'d str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

struct Normalizer<'d, 'a> {
    fragments: HashMap<&'d str, &'d FragmentDefinition<'a, String>>,
}

impl<'d, 'a> Normalizer<'d, 'a> {
    fn selection_set(
        &self,
        set: &SelectionSet<'a, String>,
        spreading: &mut Vec<&'d str>,
    ) -> Result<Vec<NormalizedSelection>, PlanningError> {
        let mut selections = Vec::with_capacity(set.items.len());

        for item in &set.items {
            let selection = match item {
                Selection::Field(field) => {
                    let mut variables = BTreeSet::new();
                    let arguments = render_arguments(&field.arguments, &mut variables);
                    let directives = render_directives(&field.directives, &mut variables);

                    NormalizedSelection::Field(NormalizedField {
                        alias: field.alias.clone(),
                        name: field.name.clone(),
                        arguments,
                        directives,
                        variables,
                        selections: self.selection_set(&field.selection_set, spreading)?,
                    })
                }
                Selection::InlineFragment(fragment) => {
                    let mut variables = BTreeSet::new();
                    let directives = render_directives(&fragment.directives, &mut variables);

                    NormalizedSelection::InlineFragment(NormalizedFragment {
                        type_condition: fragment
                            .type_condition
                            .as_ref()
                            .map(|TypeCondition::On(name)| name.clone()),
                        directives,
                        variables,
                        selections: self.selection_set(&fragment.selection_set, spreading)?,
                    })
                }
                Selection::FragmentSpread(spread) => {
                    let (name, fragment) = self
                        .fragments
                        .get_key_value(spread.fragment_name.as_str())
                        .ok_or_else(|| {
                            PlanningError::UnknownFragment(spread.fragment_name.clone())
                        })?;

                    if spreading.contains(name) {
                        return Err(PlanningError::FragmentCycle(name.to_string()));
                    }

                    let mut variables = BTreeSet::new();
                    let directives = render_directives(&spread.directives, &mut variables);
                    let TypeCondition::On(type_condition) = &fragment.type_condition;

                    spreading.push(*name);
                    let inner = self.selection_set(&fragment.selection_set, spreading);
                    spreading.pop();

                    NormalizedSelection::InlineFragment(NormalizedFragment {
                        type_condition: Some(type_condition.clone()),
                        directives,
                        variables,
                        selections: inner?,
                    })
                }
            };

            selections.push(selection);
        }

        Ok(selections)
    }
}

fn render_variable_definition(
    definition: &AstVariableDefinition<'_, String>,
) -> VariableDefinition {
    let mut rendered = format!("${}: {}", definition.name, render_type(&definition.var_type));

    if let Some(default) = &definition.default_value {
        rendered.push_str(" = ");
        render_value(default, &mut rendered, &mut BTreeSet::new());
    }

    VariableDefinition {
        name: definition.name.clone(),
        rendered,
    }
}

fn render_arguments(
    arguments: &[(String, Value<'_, String>)],
    variables: &mut BTreeSet<String>,
) -> String {
    if arguments.is_empty() {
        return String::new();
    }

    let mut out = String::from("(");
    for (i, (name, value)) in arguments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(name);
        out.push_str(": ");
        render_value(value, &mut out, variables);
    }
    out.push(')');
    out
}

fn render_directives(
    directives: &[Directive<'_, String>],
    variables: &mut BTreeSet<String>,
) -> String {
    let mut out = String::new();

    for directive in directives {
        out.push_str(" @");
        out.push_str(&directive.name);
        out.push_str(&render_arguments(&directive.arguments, variables));
    }

    out
}

pub(crate) fn render_value(
    value: &Value<'_, String>,
    out: &mut String,
    variables: &mut BTreeSet<String>,
) {
    match value {
        Value::Variable(name) => {
            variables.insert(name.clone());
            out.push('$');
            out.push_str(name);
        }
        Value::Int(number) => out.push_str(&number.as_i64().unwrap_or_default().to_string()),
        Value::Float(number) => out.push_str(&format!("{number:?}")),
        Value::String(string) => {
            out.push_str(&serde_json::Value::String(string.clone()).to_string());
        }
        Value::Boolean(boolean) => out.push_str(&boolean.to_string()),
        Value::Null => out.push_str("null"),
        Value::Enum(name) => out.push_str(name),
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                render_value(item, out, variables);
            }
            out.push(']');
        }
        Value::Object(fields) => {
            out.push('{');
            for (i, (name, item)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(name);
                out.push_str(": ");
                render_value(item, out, variables);
            }
            out.push('}');
        }
    }
}

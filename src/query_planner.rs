//! Turns a client operation into a set of subgraph requests.
//!
//! Root fields are grouped by the subgraph that owns them. Whenever a nested
//! field lives in another subgraph, the planner adds an entity step that
//! depends on the step producing the parent object and injects the key
//! fields that step needs into the parent selection.

use std::{collections::BTreeSet, iter, sync::Arc};

use crate::{
    error::PlanningError,
    operation::{NormalizedField, NormalizedSelection, Operation, OperationKind, parse_operation},
    response::{Shape, ShapeField},
    subgraph_registry::SubgraphDescriptor,
    supergraph::{ComposedSchema, KeySelection, TypeKind},
};

pub type StepId = usize;

/// One hop from a step's insertion point into the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Descend into the named response key.
    Field(String),
    /// Fan out over every element of a list.
    Flatten,
}

/// The entity type an `_entities` step resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTarget {
    pub type_name: String,
    pub key: KeySelection,
}

#[derive(Debug, Clone)]
pub struct PlanStep {
    pub id: StepId,
    pub subgraph: Arc<SubgraphDescriptor>,
    /// GraphQL document sent to the subgraph.
    pub query: String,
    pub depends_on: BTreeSet<StepId>,
    /// Where the step's results land in the merged response. Empty for root steps.
    pub path: Vec<PathSegment>,
    pub entity: Option<EntityTarget>,
    /// Client variables the sub-query declares.
    pub variables: BTreeSet<String>,
    /// Response keys of the fields this step selects at its insertion point.
    pub response_keys: Vec<String>,
}

impl PlanStep {
    pub fn is_root(&self) -> bool {
        self.entity.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub kind: OperationKind,
    pub root_type: String,
    /// Steps in creation order; a step only depends on earlier steps.
    pub steps: Vec<PlanStep>,
    /// Fields the client asked for, used to strip planner-injected keys.
    pub shape: Shape,
    /// Response keys of root `__typename` selections, aliases included.
    pub typename_keys: Vec<String>,
}

pub trait QueryPlanner: Send + Sync {
    fn plan(
        &self,
        query: &str,
        operation_name: Option<&str>,
        schema: &ComposedSchema,
    ) -> Result<ExecutionPlan, PlanningError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FederatedQueryPlanner;

impl FederatedQueryPlanner {
    pub fn new() -> Self {
        FederatedQueryPlanner
    }
}

impl QueryPlanner for FederatedQueryPlanner {
    fn plan(
        &self,
        query: &str,
        operation_name: Option<&str>,
        schema: &ComposedSchema,
    ) -> Result<ExecutionPlan, PlanningError> {
        let operation = parse_operation(query, operation_name)?;

        let root_type = match operation.kind {
            OperationKind::Query => schema.query_type(),
            OperationKind::Mutation => schema
                .mutation_type()
                .ok_or_else(|| PlanningError::UnknownType(ComposedSchema::MUTATION.to_string()))?,
        };

        let root_fields = flatten_root(schema, root_type, &operation.selections)?;

        let typename_keys = root_fields
            .iter()
            .filter(|field| field.name == "__typename")
            .map(|field| field.response_key().to_string())
            .collect();

        let mut builder = PlanBuilder {
            schema,
            steps: Vec::new(),
        };
        builder.plan_root(operation.kind, root_type, &root_fields)?;
        let steps = builder.finish(&operation)?;

        let mut shape = Shape::default();
        build_shape(schema, root_type, &operation.selections, None, &mut shape);

        tracing::debug!(
            operation = operation.name.as_deref().unwrap_or("<anonymous>"),
            steps = steps.len(),
            "planned operation"
        );

        Ok(ExecutionPlan {
            kind: operation.kind,
            root_type: root_type.to_string(),
            steps,
            shape,
            typename_keys,
        })
    }
}

/// Selection being assembled for one subgraph request.
#[derive(Debug, Clone)]
enum SubSelection {
    Field(SubField),
    Fragment(SubFragment),
}

#[derive(Debug, Clone)]
struct SubField {
    alias: Option<String>,
    name: String,
    arguments: String,
    directives: String,
    variables: BTreeSet<String>,
    selections: Option<Vec<SubSelection>>,
}

#[derive(Debug, Clone)]
struct SubFragment {
    type_condition: Option<String>,
    directives: String,
    variables: BTreeSet<String>,
    selections: Vec<SubSelection>,
}

impl SubField {
    fn plain(name: &str, selections: Option<Vec<SubSelection>>) -> Self {
        SubField {
            alias: None,
            name: name.to_string(),
            arguments: String::new(),
            directives: String::new(),
            variables: BTreeSet::new(),
            selections,
        }
    }

    fn typename() -> Self {
        Self::plain("__typename", None)
    }

    fn from_key(key: &KeySelection) -> Vec<SubSelection> {
        key.0
            .iter()
            .map(|field| {
                let children =
                    (!field.selection.0.is_empty()).then(|| Self::from_key(&field.selection));
                SubSelection::Field(Self::plain(&field.name, children))
            })
            .collect()
    }

    fn same_field(&self, other: &SubField) -> bool {
        self.alias == other.alias
            && self.name == other.name
            && self.arguments == other.arguments
            && self.directives == other.directives
    }
}

struct StepDraft {
    subgraph: String,
    parent: Option<StepId>,
    depends_on: BTreeSet<StepId>,
    path: Vec<PathSegment>,
    entity: Option<EntityTarget>,
    selections: Vec<SubSelection>,
    response_keys: Vec<String>,
}

impl StepDraft {
    fn push(&mut self, selection: SubSelection, response_key: &str) {
        self.selections.push(selection);
        if !self.response_keys.iter().any(|key| key == response_key) {
            self.response_keys.push(response_key.to_string());
        }
    }
}

enum Route {
    Local,
    Entity { owner: String, key: KeySelection },
}

struct PlanBuilder<'s> {
    schema: &'s ComposedSchema,
    steps: Vec<StepDraft>,
}

impl<'s> PlanBuilder<'s> {
    fn plan_root(
        &mut self,
        kind: OperationKind,
        root_type: &str,
        fields: &[NormalizedField],
    ) -> Result<(), PlanningError> {
        let mut previous: Option<StepId> = None;

        for field in fields {
            // Answered by the gateway itself.
            if field.name == "__typename" {
                continue;
            }

            let definition = self
                .schema
                .field(root_type, &field.name)
                .ok_or_else(|| unknown_field(root_type, &field.name))?;

            let owner = match definition.owners() {
                [owner] => owner.clone(),
                owners => {
                    return Err(PlanningError::AmbiguousOwnership {
                        type_name: root_type.to_string(),
                        field: field.name.clone(),
                        owners: owners.to_vec(),
                    });
                }
            };

            let step = match kind {
                OperationKind::Query => self
                    .steps
                    .iter()
                    .position(|step| step.entity.is_none() && step.subgraph == owner)
                    .unwrap_or_else(|| {
                        self.add_step(owner, None, BTreeSet::new(), Vec::new(), None)
                    }),
                // Mutation fields run in document order, one subgraph at a time.
                OperationKind::Mutation => match previous {
                    Some(id) if self.steps[id].subgraph == owner => id,
                    _ => {
                        let depends_on = (0..self.steps.len()).collect();
                        self.add_step(owner, None, depends_on, Vec::new(), None)
                    }
                },
            };
            previous = Some(step);

            let selection = self.plan_field(step, root_type, field, &[])?;
            self.steps[step].push(selection, field.response_key());
        }

        Ok(())
    }

    fn add_step(
        &mut self,
        subgraph: String,
        parent: Option<StepId>,
        depends_on: BTreeSet<StepId>,
        path: Vec<PathSegment>,
        entity: Option<EntityTarget>,
    ) -> StepId {
        self.steps.push(StepDraft {
            subgraph,
            parent,
            depends_on,
            path,
            entity,
            selections: Vec::new(),
            response_keys: Vec::new(),
        });
        self.steps.len() - 1
    }

    /// Finds or creates the entity step fetching `type_name` from `owner`
    /// for objects produced by `parent` at `path`.
    fn entity_step(
        &mut self,
        parent: StepId,
        type_name: &str,
        owner: &str,
        key: KeySelection,
        path: &[PathSegment],
    ) -> StepId {
        let existing = self.steps.iter().position(|step| {
            step.parent == Some(parent)
                && step.subgraph == owner
                && step.path == path
                && step
                    .entity
                    .as_ref()
                    .is_some_and(|entity| entity.type_name == type_name)
        });

        existing.unwrap_or_else(|| {
            self.add_step(
                owner.to_string(),
                Some(parent),
                BTreeSet::from([parent]),
                path.to_vec(),
                Some(EntityTarget {
                    type_name: type_name.to_string(),
                    key,
                }),
            )
        })
    }

    fn plan_field(
        &mut self,
        step: StepId,
        parent_type: &str,
        field: &NormalizedField,
        path: &[PathSegment],
    ) -> Result<SubSelection, PlanningError> {
        let mut planned = SubField {
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: field.arguments.clone(),
            directives: field.directives.clone(),
            variables: field.variables.clone(),
            selections: None,
        };

        if field.name == "__typename" {
            return Ok(SubSelection::Field(planned));
        }

        let schema = self.schema;
        let definition = schema
            .field(parent_type, &field.name)
            .ok_or_else(|| unknown_field(parent_type, &field.name))?;
        let field_type = definition.ty.named.as_str();

        if schema.is_leaf(field_type) {
            if !field.selections.is_empty() {
                return Err(invalid_selection(
                    parent_type,
                    field,
                    "is a leaf and cannot have a selection set",
                ));
            }
            return Ok(SubSelection::Field(planned));
        }

        if field.selections.is_empty() {
            return Err(invalid_selection(
                parent_type,
                field,
                "must have a selection of subfields",
            ));
        }

        let mut field_path = path.to_vec();
        field_path.push(PathSegment::Field(field.response_key().to_string()));
        field_path.extend(iter::repeat_n(PathSegment::Flatten, definition.ty.list_depth));

        let selections = self.plan_selections(step, field_type, &field.selections, &field_path)?;
        planned.selections = Some(selections);
        Ok(SubSelection::Field(planned))
    }

    fn plan_selections(
        &mut self,
        step: StepId,
        parent_type: &str,
        selections: &[NormalizedSelection],
        path: &[PathSegment],
    ) -> Result<Vec<SubSelection>, PlanningError> {
        let mut planned = Vec::with_capacity(selections.len());
        let mut required: Vec<SubSelection> = Vec::new();
        let mut needs_typename = false;

        for selection in selections {
            match selection {
                NormalizedSelection::Field(field) => {
                    if field.name == "__typename" {
                        planned.push(self.plan_field(step, parent_type, field, path)?);
                        continue;
                    }

                    match self.route(parent_type, &field.name, step)? {
                        Route::Local => {
                            planned.push(self.plan_field(step, parent_type, field, path)?);
                        }
                        Route::Entity { owner, key } => {
                            // The parent returns what the owner needs for a representation.
                            required.extend(SubField::from_key(&key));
                            needs_typename = true;

                            let entity = self.entity_step(step, parent_type, &owner, key, path);
                            let selection = self.plan_field(entity, parent_type, field, path)?;
                            self.steps[entity].push(selection, field.response_key());
                        }
                    }
                }
                NormalizedSelection::InlineFragment(fragment) => {
                    let fragment_type = fragment.type_condition.as_deref().unwrap_or(parent_type);
                    if self.schema.type_definition(fragment_type).is_none() {
                        return Err(PlanningError::UnknownType(fragment_type.to_string()));
                    }
                    if fragment_type != parent_type {
                        needs_typename = true;
                    }

                    let selections =
                        self.plan_selections(step, fragment_type, &fragment.selections, path)?;
                    planned.push(SubSelection::Fragment(SubFragment {
                        type_condition: fragment.type_condition.clone(),
                        directives: fragment.directives.clone(),
                        variables: fragment.variables.clone(),
                        selections,
                    }));
                }
            }
        }

        planned.extend(required);
        if needs_typename {
            planned.push(SubSelection::Field(SubField::typename()));
        }

        Ok(planned)
    }

    fn route(&self, type_name: &str, field: &str, step: StepId) -> Result<Route, PlanningError> {
        let subgraph = self.steps[step].subgraph.as_str();
        let ty = self
            .schema
            .type_definition(type_name)
            .ok_or_else(|| PlanningError::UnknownType(type_name.to_string()))?;
        let definition = ty.fields.get(field).ok_or_else(|| unknown_field(type_name, field))?;

        if definition.owners().iter().any(|owner| owner == subgraph)
            || ty.key_for(subgraph).is_some_and(|key| key.contains(field))
        {
            return Ok(Route::Local);
        }

        if ty.kind == TypeKind::Object && ty.is_entity() {
            match definition.owners() {
                [owner] => {
                    if let Some(key) = ty.key_for(owner) {
                        return Ok(Route::Entity {
                            owner: owner.clone(),
                            key: key.clone(),
                        });
                    }
                }
                [] => {}
                owners => {
                    return Err(PlanningError::AmbiguousOwnership {
                        type_name: type_name.to_string(),
                        field: field.to_string(),
                        owners: owners.to_vec(),
                    });
                }
            }
        }

        Err(PlanningError::Unreachable {
            type_name: type_name.to_string(),
            field: field.to_string(),
            subgraph: subgraph.to_string(),
        })
    }

    fn finish(self, operation: &Operation) -> Result<Vec<PlanStep>, PlanningError> {
        let schema = self.schema;

        self.steps
            .into_iter()
            .enumerate()
            .map(|(id, draft)| {
                let selections = dedupe(draft.selections);

                let mut variables = BTreeSet::new();
                collect_variables(&selections, &mut variables);

                let mut definitions = Vec::new();
                if draft.entity.is_some() {
                    definitions.push("$representations: [_Any!]!".to_string());
                }
                for name in &variables {
                    let definition = operation
                        .variables
                        .iter()
                        .find(|definition| &definition.name == name)
                        .ok_or_else(|| PlanningError::UndefinedVariable(name.clone()))?;
                    definitions.push(definition.rendered.clone());
                }

                let mut query = operation.kind.keyword().to_string();
                if let Some(name) = &operation.name {
                    query.push(' ');
                    query.push_str(&sub_operation_name(name, &draft.subgraph, id));
                }
                if !definitions.is_empty() {
                    query.push('(');
                    query.push_str(&definitions.join(", "));
                    query.push(')');
                }
                query.push(' ');

                let body = print_selections(&selections);
                match &draft.entity {
                    Some(entity) => query.push_str(&format!(
                        "{{ _entities(representations: $representations) {{ ... on {} {body} }} }}",
                        entity.type_name
                    )),
                    None => query.push_str(&body),
                }

                let subgraph = schema.subgraph(&draft.subgraph).cloned().ok_or_else(|| {
                    PlanningError::Unreachable {
                        type_name: draft
                            .entity
                            .as_ref()
                            .map_or_else(
                                || operation.kind.keyword().to_string(),
                                |e| e.type_name.clone(),
                            ),
                        field: draft.response_keys.join(", "),
                        subgraph: draft.subgraph.clone(),
                    }
                })?;

                Ok(PlanStep {
                    id,
                    subgraph,
                    query,
                    depends_on: draft.depends_on,
                    path: draft.path,
                    entity: draft.entity,
                    variables,
                    response_keys: draft.response_keys,
                })
            })
            .collect()
    }
}

/// Hoists root-level inline fragments so every root field can be routed on
/// its own. Fragment directives move onto the fields they wrapped.
fn flatten_root(
    schema: &ComposedSchema,
    root_type: &str,
    selections: &[NormalizedSelection],
) -> Result<Vec<NormalizedField>, PlanningError> {
    let mut fields = Vec::new();

    for selection in selections {
        match selection {
            NormalizedSelection::Field(field) => fields.push(field.clone()),
            NormalizedSelection::InlineFragment(fragment) => {
                if let Some(condition) = fragment.type_condition.as_deref() {
                    if schema.type_definition(condition).is_none() {
                        return Err(PlanningError::UnknownType(condition.to_string()));
                    }
                    if condition != root_type {
                        continue;
                    }
                }

                for mut field in flatten_root(schema, root_type, &fragment.selections)? {
                    field.directives.push_str(&fragment.directives);
                    field.variables.extend(fragment.variables.iter().cloned());
                    fields.push(field);
                }
            }
        }
    }

    Ok(fields)
}

/// Merges repeated selections of the same field so every sub-query asks for
/// each field once.
fn dedupe(selections: Vec<SubSelection>) -> Vec<SubSelection> {
    let mut merged: Vec<SubSelection> = Vec::with_capacity(selections.len());

    for selection in selections {
        match selection {
            SubSelection::Field(field) => {
                let existing = merged.iter_mut().find(|candidate| {
                    matches!(candidate, SubSelection::Field(other) if other.same_field(&field))
                });
                if let Some(SubSelection::Field(existing)) = existing {
                    if let (Some(into), Some(more)) =
                        (existing.selections.as_mut(), field.selections)
                    {
                        into.extend(more);
                    }
                } else {
                    merged.push(SubSelection::Field(field));
                }
            }
            SubSelection::Fragment(fragment) => {
                let existing = merged.iter_mut().find(|candidate| {
                    matches!(candidate, SubSelection::Fragment(other)
                        if other.type_condition == fragment.type_condition
                            && other.directives == fragment.directives)
                });
                if let Some(SubSelection::Fragment(existing)) = existing {
                    existing.selections.extend(fragment.selections);
                } else {
                    merged.push(SubSelection::Fragment(fragment));
                }
            }
        }
    }

    for selection in &mut merged {
        match selection {
            SubSelection::Field(field) => {
                if let Some(children) = field.selections.take() {
                    field.selections = Some(dedupe(children));
                }
            }
            SubSelection::Fragment(fragment) => {
                fragment.selections = dedupe(std::mem::take(&mut fragment.selections));
            }
        }
    }

    merged
}

fn collect_variables(selections: &[SubSelection], variables: &mut BTreeSet<String>) {
    for selection in selections {
        match selection {
            SubSelection::Field(field) => {
                variables.extend(field.variables.iter().cloned());
                if let Some(children) = &field.selections {
                    collect_variables(children, variables);
                }
            }
            SubSelection::Fragment(fragment) => {
                variables.extend(fragment.variables.iter().cloned());
                collect_variables(&fragment.selections, variables);
            }
        }
    }
}

fn print_selections(selections: &[SubSelection]) -> String {
    let mut out = String::from("{");

    for selection in selections {
        out.push(' ');
        match selection {
            SubSelection::Field(field) => {
                if let Some(alias) = &field.alias {
                    out.push_str(alias);
                    out.push_str(": ");
                }
                out.push_str(&field.name);
                out.push_str(&field.arguments);
                out.push_str(&field.directives);
                if let Some(children) = &field.selections {
                    out.push(' ');
                    out.push_str(&print_selections(children));
                }
            }
            SubSelection::Fragment(fragment) => {
                out.push_str("...");
                if let Some(condition) = &fragment.type_condition {
                    out.push_str(" on ");
                    out.push_str(condition);
                }
                out.push_str(&fragment.directives);
                out.push(' ');
                out.push_str(&print_selections(&fragment.selections));
            }
        }
    }

    out.push_str(" }");
    out
}

fn build_shape(
    schema: &ComposedSchema,
    parent_type: &str,
    selections: &[NormalizedSelection],
    conditions: Option<&BTreeSet<String>>,
    shape: &mut Shape,
) {
    for selection in selections {
        match selection {
            NormalizedSelection::Field(field) => {
                let children = if field.selections.is_empty() {
                    None
                } else {
                    schema.field(parent_type, &field.name).map(|definition| {
                        let mut children = Shape::default();
                        let field_type = &definition.ty.named;
                        build_shape(schema, field_type, &field.selections, None, &mut children);
                        children
                    })
                };

                shape.add(ShapeField {
                    key: field.response_key().to_string(),
                    type_conditions: conditions.cloned(),
                    children,
                });
            }
            NormalizedSelection::InlineFragment(fragment) => {
                let fragment_type = fragment.type_condition.as_deref().unwrap_or(parent_type);
                let narrowed = if fragment_type == parent_type {
                    conditions.cloned()
                } else {
                    let possible = schema.possible_types(fragment_type);
                    Some(match conditions {
                        Some(outer) => outer.intersection(&possible).cloned().collect(),
                        None => possible,
                    })
                };

                build_shape(schema, fragment_type, &fragment.selections, narrowed.as_ref(), shape);
            }
        }
    }
}

fn unknown_field(type_name: &str, field: &str) -> PlanningError {
    PlanningError::UnknownField {
        type_name: type_name.to_string(),
        field: field.to_string(),
    }
}

/// `Name__subgraph__id`, with characters GraphQL names disallow replaced by `_`.
fn sub_operation_name(operation: &str, subgraph: &str, id: StepId) -> String {
    let subgraph: String = subgraph
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("{operation}__{subgraph}__{id}")
}

fn invalid_selection(
    type_name: &str,
    field: &NormalizedField,
    reason: &'static str,
) -> PlanningError {
    PlanningError::InvalidSelection {
        type_name: type_name.to_string(),
        field: field.name.clone(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supergraph::tests::schema;
    use pretty_assertions::assert_eq;

    fn plan(query: &str) -> Result<ExecutionPlan, PlanningError> {
        FederatedQueryPlanner::new().plan(query, None, &schema())
    }

    fn subgraphs(plan: &ExecutionPlan) -> Vec<&str> {
        plan.steps.iter().map(|step| step.subgraph.name()).collect()
    }

    #[test]
    fn single_subgraph_query_is_one_step() {
        let plan = plan("{ me { id name } users { username } }").unwrap();

        assert_eq!(subgraphs(&plan), vec!["accounts"]);
        let step = &plan.steps[0];
        assert!(step.is_root());
        assert!(step.depends_on.is_empty());
        assert_eq!(step.query, "query { me { id name } users { username } }");
        assert_eq!(step.response_keys, vec!["me", "users"]);
    }

    #[test]
    fn independent_root_fields_run_in_parallel() {
        let plan = plan("{ me { name } topProducts { name } }").unwrap();

        assert_eq!(subgraphs(&plan), vec!["accounts", "products"]);
        assert!(plan.steps.iter().all(|step| step.depends_on.is_empty()));
    }

    #[test]
    fn entity_fields_depend_on_their_parent() {
        let plan = plan("{ me { name reviews { body } } }").unwrap();

        assert_eq!(subgraphs(&plan), vec!["accounts", "reviews"]);
        assert_eq!(plan.steps[0].query, "query { me { name id __typename } }");

        let reviews = &plan.steps[1];
        assert_eq!(reviews.depends_on, BTreeSet::from([0]));
        assert_eq!(reviews.path, vec![PathSegment::Field("me".to_string())]);
        assert_eq!(reviews.entity.as_ref().map(|e| e.type_name.as_str()), Some("User"));
        assert_eq!(
            reviews.query,
            "query($representations: [_Any!]!) { \
             _entities(representations: $representations) { ... on User { reviews { body } } } }"
        );
    }

    #[test]
    fn nested_entity_hops_chain_through_lists() {
        let plan = plan("{ topProducts { name reviews { body author { name } } } }").unwrap();

        assert_eq!(subgraphs(&plan), vec!["products", "reviews", "accounts"]);
        assert_eq!(
            plan.steps[1].path,
            vec![PathSegment::Field("topProducts".into()), PathSegment::Flatten]
        );
        assert_eq!(plan.steps[2].depends_on, BTreeSet::from([1]));
        assert_eq!(
            plan.steps[2].path,
            vec![
                PathSegment::Field("topProducts".into()),
                PathSegment::Flatten,
                PathSegment::Field("reviews".into()),
                PathSegment::Flatten,
                PathSegment::Field("author".into()),
            ]
        );
        assert_eq!(
            plan.steps[1].query,
            "query($representations: [_Any!]!) { \
             _entities(representations: $representations) { \
             ... on Product { reviews { body author { id __typename } } } } }"
        );
    }

    #[test]
    fn sibling_entity_fields_share_a_step() {
        let plan = plan("{ me { reviews { id } name rev: reviews { body } } }").unwrap();

        assert_eq!(subgraphs(&plan), vec!["accounts", "reviews"]);
        assert_eq!(plan.steps[0].query, "query { me { name id __typename } }");
        assert_eq!(plan.steps[1].response_keys, vec!["reviews", "rev"]);
    }

    #[test]
    fn mutations_run_serially() {
        let schema = schema();
        let plan = FederatedQueryPlanner::new()
            .plan(
                "mutation Add($name: String!) { \
                 a: createProduct(name: $name) { upc } b: createProduct(name: \"x\") { upc } }",
                None,
                &schema,
            )
            .unwrap();

        assert_eq!(plan.kind, OperationKind::Mutation);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(
            plan.steps[0].query,
            "mutation Add__products__0($name: String!) { \
             a: createProduct(name: $name) { upc } b: createProduct(name: \"x\") { upc } }"
        );
    }

    #[test]
    fn mutation_steps_depend_on_earlier_steps() {
        let plan =
            plan(r#"mutation { createProduct(name: "a") { name reviews { body } } }"#).unwrap();

        assert_eq!(subgraphs(&plan), vec!["products", "reviews"]);
        assert_eq!(plan.steps[1].depends_on, BTreeSet::from([0]));
    }

    #[test]
    fn declares_only_variables_each_step_uses() {
        let schema = schema();
        let plan = FederatedQueryPlanner::new()
            .plan(
                "query Home($first: Int, $skip: Boolean!) { \
                 topProducts(first: $first) { name } me @skip(if: $skip) { name } }",
                Some("Home"),
                &schema,
            )
            .unwrap();

        let products = plan.steps.iter().find(|step| step.subgraph.name() == "products").unwrap();
        let accounts = plan.steps.iter().find(|step| step.subgraph.name() == "accounts").unwrap();

        assert_eq!(products.variables, BTreeSet::from(["first".to_string()]));
        assert!(products.query.starts_with("query Home__products__"));
        assert!(products.query.contains("($first: Int)"));
        assert_eq!(accounts.variables, BTreeSet::from(["skip".to_string()]));
        assert!(accounts.query.contains("me @skip(if: $skip)"));
    }

    #[test]
    fn operation_names_stay_valid_for_any_subgraph_name() {
        let schema = ComposedSchema::compose(&crate::supergraph::tests::sources(&[(
            "user-service.v2",
            "type Query { me: String }",
        )]))
        .unwrap();

        let plan = FederatedQueryPlanner::new()
            .plan("query Me { me }", None, &schema)
            .unwrap();

        assert_eq!(plan.steps[0].query, "query Me__user_service_v2__0 { me }");
        assert!(graphql_parser::parse_query::<String>(&plan.steps[0].query).is_ok());
    }

    #[test]
    fn root_typename_is_answered_locally() {
        let plan = plan("{ __typename me { __typename name } }").unwrap();

        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].query, "query { me { __typename name } }");
        assert_eq!(plan.root_type, "Query");
        assert_eq!(plan.typename_keys, vec!["__typename"]);

        let aliased = FederatedQueryPlanner::new()
            .plan("{ kind: __typename }", None, &schema())
            .unwrap();
        assert!(aliased.steps.is_empty());
        assert_eq!(aliased.typename_keys, vec!["kind"]);
    }

    #[test]
    fn root_fragments_are_flattened() {
        let plan = plan(
            "query { ... on Query { me { name } } ...Top } \
             fragment Top on Query { topProducts { upc } }",
        )
        .unwrap();

        assert_eq!(subgraphs(&plan), vec!["accounts", "products"]);
    }

    #[test]
    fn shape_tracks_only_client_fields() {
        let plan = plan("{ me { name reviews { body } } }").unwrap();

        let me = &plan.shape.fields()[0];
        assert_eq!(me.key, "me");
        let keys: Vec<_> = me
            .children
            .as_ref()
            .unwrap()
            .fields()
            .iter()
            .map(|field| field.key.as_str())
            .collect();
        assert_eq!(keys, vec!["name", "reviews"]);
    }

    #[test]
    fn rejects_invalid_selections() {
        assert_eq!(
            plan("{ me { email } }").unwrap_err(),
            PlanningError::UnknownField {
                type_name: "User".to_string(),
                field: "email".to_string()
            }
        );
        assert!(matches!(
            plan("{ me }").unwrap_err(),
            PlanningError::InvalidSelection { reason: "must have a selection of subfields", .. }
        ));
        assert!(matches!(
            plan("{ me { name { x } } }").unwrap_err(),
            PlanningError::InvalidSelection { .. }
        ));
        assert_eq!(
            plan("{ topProducts(first: $n) { upc } }").unwrap_err(),
            PlanningError::UndefinedVariable("n".to_string())
        );
    }
}

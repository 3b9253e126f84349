//! The composed schema: every subgraph's types merged into one type system,
//! together with the subgraphs that own each field.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use graphql_parser::{
    parse_schema,
    query::{Definition as QueryDefinition, OperationDefinition, Selection, parse_query},
    schema::{Definition, Directive, Field, InputValue, Type, TypeDefinition, TypeExtension, Value},
};

use crate::{error::CompositionError, subgraph_registry::SubgraphDescriptor};

const BUILTIN_SCALARS: &[&str] = &["Boolean", "Float", "ID", "Int", "String"];
const FEDERATION_TYPES: &[&str] = &["_Any", "_Entity", "_FieldSet", "_Service", "FieldSet"];
const FEDERATION_ROOT_FIELDS: &[&str] = &["_entities", "_service"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Object,
    Interface,
    Union,
    Enum,
    Scalar,
    InputObject,
}

impl TypeKind {
    fn keyword(self) -> &'static str {
        match self {
            TypeKind::Object => "type",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input",
        }
    }
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Object => "object",
            TypeKind::Interface => "interface",
            TypeKind::Union => "union",
            TypeKind::Enum => "enum",
            TypeKind::Scalar => "scalar",
            TypeKind::InputObject => "input object",
        };
        f.write_str(name)
    }
}

/// A field's output type, e.g. `[Review!]!`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldType {
    pub named: String,
    pub list_depth: usize,
    rendered: String,
}

impl FieldType {
    fn from_ast(ty: &Type<'_, String>) -> Self {
        FieldType {
            named: named_type(ty).to_string(),
            list_depth: list_depth(ty),
            rendered: render_type(ty),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

#[derive(Debug, Clone)]
pub struct ComposedField {
    pub name: String,
    pub ty: FieldType,
    pub arguments: Vec<(String, String)>,
    owners: Vec<String>,
    external_in: Vec<String>,
}

impl ComposedField {
    /// Subgraphs that resolve this field.
    pub fn owners(&self) -> &[String] {
        &self.owners
    }
}

#[derive(Debug, Clone)]
pub struct ComposedType {
    pub name: String,
    pub kind: TypeKind,
    pub fields: BTreeMap<String, ComposedField>,
    /// Union members, or the interfaces an object implements.
    pub related: BTreeSet<String>,
    pub enum_values: BTreeSet<String>,
    keys: BTreeMap<String, KeySelection>,
    defined_in: BTreeSet<String>,
}

impl ComposedType {
    fn new(name: &str, kind: TypeKind) -> Self {
        ComposedType {
            name: name.to_string(),
            kind,
            fields: BTreeMap::new(),
            related: BTreeSet::new(),
            enum_values: BTreeSet::new(),
            keys: BTreeMap::new(),
            defined_in: BTreeSet::new(),
        }
    }

    /// Entities carry a `@key` in at least one subgraph and can be fetched by reference.
    pub fn is_entity(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, TypeKind::Object | TypeKind::Interface | TypeKind::Union)
    }

    pub fn key_for(&self, subgraph: &str) -> Option<&KeySelection> {
        self.keys.get(subgraph)
    }

    pub fn is_defined_in(&self, subgraph: &str) -> bool {
        self.defined_in.contains(subgraph)
    }

    fn is_key_field(&self, field: &str) -> bool {
        self.keys.values().any(|key| key.contains(field))
    }
}

/// The field set of a `@key` directive, e.g. `id` or `sku owner { id }`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySelection(pub Vec<KeyField>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyField {
    pub name: String,
    pub selection: KeySelection,
}

impl KeySelection {
    pub fn parse(fields: &str) -> Result<Self, String> {
        let source = format!("{{ {fields} }}");
        let document = parse_query::<String>(&source).map_err(|e| e.to_string())?;

        match document.definitions.as_slice() {
            [QueryDefinition::Operation(OperationDefinition::SelectionSet(set))] => {
                Self::from_items(&set.items)
            }
            _ => Err(format!("`{fields}` is not a field set")),
        }
    }

    fn from_items(items: &[Selection<'_, String>]) -> Result<Self, String> {
        let fields = items
            .iter()
            .map(|item| match item {
                Selection::Field(field) => Ok(KeyField {
                    name: field.name.clone(),
                    selection: if field.selection_set.items.is_empty() {
                        KeySelection::default()
                    } else {
                        Self::from_items(&field.selection_set.items)?
                    },
                }),
                _ => Err("fragments are not allowed in key fields".to_string()),
            })
            .collect::<Result<Vec<_>, _>>()?;

        if fields.is_empty() {
            return Err("key field set is empty".to_string());
        }

        Ok(KeySelection(fields))
    }

    pub(crate) fn contains(&self, field: &str) -> bool {
        self.0.iter().any(|key| key.name == field)
    }
}

impl fmt::Display for KeySelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(&field.name)?;
            if !field.selection.0.is_empty() {
                write!(f, " {{ {} }}", field.selection)?;
            }
        }
        Ok(())
    }
}

/// An immutable snapshot of the federated type system.
#[derive(Debug)]
pub struct ComposedSchema {
    subgraphs: Vec<Arc<SubgraphDescriptor>>,
    types: BTreeMap<String, ComposedType>,
    mutation_type: Option<String>,
    sdl: String,
}

impl ComposedSchema {
    pub const QUERY: &'static str = "Query";
    pub const MUTATION: &'static str = "Mutation";

    /// Merges subgraph SDL documents, in registry order, into one schema.
    pub fn compose(
        sources: &[(Arc<SubgraphDescriptor>, String)],
    ) -> Result<Self, CompositionError> {
        let mut types = BTreeMap::new();

        for (subgraph, sdl) in sources {
            merge_subgraph(&mut types, subgraph.name(), sdl)?;
        }

        validate(&types, sources)?;

        let mutation_type = types.contains_key(Self::MUTATION).then(|| Self::MUTATION.to_string());
        let sdl = print_sdl(&types);

        Ok(ComposedSchema {
            subgraphs: sources.iter().map(|(subgraph, _)| Arc::clone(subgraph)).collect(),
            types,
            mutation_type,
            sdl,
        })
    }

    pub fn subgraphs(&self) -> &[Arc<SubgraphDescriptor>] {
        &self.subgraphs
    }

    pub fn subgraph(&self, name: &str) -> Option<&Arc<SubgraphDescriptor>> {
        self.subgraphs.iter().find(|subgraph| subgraph.name() == name)
    }

    pub fn query_type(&self) -> &str {
        Self::QUERY
    }

    pub fn mutation_type(&self) -> Option<&str> {
        self.mutation_type.as_deref()
    }

    pub fn type_definition(&self, name: &str) -> Option<&ComposedType> {
        self.types.get(name)
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&ComposedField> {
        self.types.get(type_name)?.fields.get(field)
    }

    pub fn is_leaf(&self, type_name: &str) -> bool {
        BUILTIN_SCALARS.contains(&type_name)
            || self
                .types
                .get(type_name)
                .is_some_and(|ty| matches!(ty.kind, TypeKind::Scalar | TypeKind::Enum))
    }

    /// Concrete object types a value of `type_name` can have at runtime.
    pub fn possible_types(&self, type_name: &str) -> BTreeSet<String> {
        let Some(ty) = self.types.get(type_name) else {
            return BTreeSet::new();
        };

        match ty.kind {
            TypeKind::Object => BTreeSet::from([ty.name.clone()]),
            TypeKind::Union => ty.related.clone(),
            TypeKind::Interface => self
                .types
                .values()
                .filter(|candidate| {
                    candidate.kind == TypeKind::Object && candidate.related.contains(type_name)
                })
                .map(|candidate| candidate.name.clone())
                .collect(),
            _ => BTreeSet::new(),
        }
    }

    /// Printed supergraph SDL with ownership annotations.
    pub fn sdl(&self) -> &str {
        &self.sdl
    }
}

fn merge_subgraph(
    types: &mut BTreeMap<String, ComposedType>,
    subgraph: &str,
    sdl: &str,
) -> Result<(), CompositionError> {
    let document = parse_schema::<String>(sdl).map_err(|e| CompositionError::InvalidSchema {
        subgraph: subgraph.to_string(),
        cause: e.to_string(),
    })?;

    let mut roots = BTreeMap::new();
    for definition in &document.definitions {
        if let Definition::SchemaDefinition(schema) = definition {
            if let Some(query) = &schema.query {
                roots.insert(query.clone(), ComposedSchema::QUERY);
            }
            if let Some(mutation) = &schema.mutation {
                roots.insert(mutation.clone(), ComposedSchema::MUTATION);
            }
        }
    }

    let mut merger = SubgraphMerger {
        types,
        subgraph,
        roots,
    };

    for definition in &document.definitions {
        match definition {
            Definition::TypeDefinition(definition) => merger.type_definition(definition)?,
            Definition::TypeExtension(extension) => merger.type_extension(extension)?,
            Definition::SchemaDefinition(_) | Definition::DirectiveDefinition(_) => {}
        }
    }

    Ok(())
}

struct SubgraphMerger<'a> {
    types: &'a mut BTreeMap<String, ComposedType>,
    subgraph: &'a str,
    roots: BTreeMap<String, &'static str>,
}

impl SubgraphMerger<'_> {
    fn type_definition(
        &mut self,
        definition: &TypeDefinition<'_, String>,
    ) -> Result<(), CompositionError> {
        match definition {
            TypeDefinition::Object(object) => self.object(
                &object.name,
                &object.implements_interfaces,
                &object.directives,
                &object.fields,
            ),
            TypeDefinition::Interface(interface) => {
                let Some(ty) = self.entry(&interface.name, TypeKind::Interface)? else {
                    return Ok(());
                };
                let ty_name = ty.name.clone();
                self.fields(&ty_name, &interface.fields)
            }
            TypeDefinition::Union(union) => {
                if let Some(ty) = self.entry(&union.name, TypeKind::Union)? {
                    ty.related.extend(union.types.iter().cloned());
                }
                Ok(())
            }
            TypeDefinition::Enum(enumeration) => {
                if let Some(ty) = self.entry(&enumeration.name, TypeKind::Enum)? {
                    ty.enum_values
                        .extend(enumeration.values.iter().map(|value| value.name.clone()));
                }
                Ok(())
            }
            TypeDefinition::Scalar(scalar) => {
                self.entry(&scalar.name, TypeKind::Scalar).map(|_| ())
            }
            TypeDefinition::InputObject(input) => {
                let Some(ty) = self.entry(&input.name, TypeKind::InputObject)? else {
                    return Ok(());
                };
                let ty_name = ty.name.clone();
                self.input_fields(&ty_name, &input.fields)
            }
        }
    }

    fn type_extension(
        &mut self,
        extension: &TypeExtension<'_, String>,
    ) -> Result<(), CompositionError> {
        match extension {
            TypeExtension::Object(object) => self.object(
                &object.name,
                &object.implements_interfaces,
                &object.directives,
                &object.fields,
            ),
            TypeExtension::Interface(interface) => {
                let Some(ty) = self.entry(&interface.name, TypeKind::Interface)? else {
                    return Ok(());
                };
                let ty_name = ty.name.clone();
                self.fields(&ty_name, &interface.fields)
            }
            TypeExtension::Union(union) => {
                if let Some(ty) = self.entry(&union.name, TypeKind::Union)? {
                    ty.related.extend(union.types.iter().cloned());
                }
                Ok(())
            }
            TypeExtension::Enum(enumeration) => {
                if let Some(ty) = self.entry(&enumeration.name, TypeKind::Enum)? {
                    ty.enum_values
                        .extend(enumeration.values.iter().map(|value| value.name.clone()));
                }
                Ok(())
            }
            TypeExtension::Scalar(scalar) => {
                self.entry(&scalar.name, TypeKind::Scalar).map(|_| ())
            }
            TypeExtension::InputObject(input) => {
                let Some(ty) = self.entry(&input.name, TypeKind::InputObject)? else {
                    return Ok(());
                };
                let ty_name = ty.name.clone();
                self.input_fields(&ty_name, &input.fields)
            }
        }
    }

    fn object(
        &mut self,
        name: &str,
        implements: &[String],
        directives: &[Directive<'_, String>],
        fields: &[Field<'_, String>],
    ) -> Result<(), CompositionError> {
        let subgraph = self.subgraph;
        let Some(ty) = self.entry(name, TypeKind::Object)? else {
            return Ok(());
        };

        ty.related.extend(implements.iter().cloned());

        for directive in directives.iter().filter(|directive| directive.name == "key") {
            let fields =
                string_argument(directive, "fields").ok_or_else(|| CompositionError::InvalidSchema {
                    subgraph: subgraph.to_string(),
                    cause: format!("@key on `{name}` is missing its `fields` argument"),
                })?;

            let key = KeySelection::parse(fields).map_err(|cause| CompositionError::InvalidSchema {
                subgraph: subgraph.to_string(),
                cause: format!("@key(fields: \"{fields}\") on `{name}`: {cause}"),
            })?;

            // The first key a subgraph declares is the one used to fetch from it.
            ty.keys.entry(subgraph.to_string()).or_insert(key);
        }

        let ty_name = ty.name.clone();
        self.fields(&ty_name, fields)
    }

    /// Returns the composed type for `name`, or `None` for federation plumbing.
    fn entry(
        &mut self,
        name: &str,
        kind: TypeKind,
    ) -> Result<Option<&mut ComposedType>, CompositionError> {
        if FEDERATION_TYPES.contains(&name)
            || BUILTIN_SCALARS.contains(&name)
            || name.starts_with("link__")
            || name.starts_with("join__")
        {
            return Ok(None);
        }

        let name = self.roots.get(name).copied().unwrap_or(name);
        let ty = self
            .types
            .entry(name.to_string())
            .or_insert_with(|| ComposedType::new(name, kind));

        if ty.kind != kind {
            return Err(CompositionError::Conflict {
                subgraph: self.subgraph.to_string(),
                cause: format!(
                    "type `{name}` is defined as {kind} here but as {} elsewhere",
                    ty.kind
                ),
            });
        }

        ty.defined_in.insert(self.subgraph.to_string());

        Ok(Some(ty))
    }

    fn fields(
        &mut self,
        type_name: &str,
        fields: &[Field<'_, String>],
    ) -> Result<(), CompositionError> {
        for field in fields {
            if type_name == ComposedSchema::QUERY
                && FEDERATION_ROOT_FIELDS.contains(&field.name.as_str())
            {
                continue;
            }

            let external = field.directives.iter().any(|directive| directive.name == "external");
            let arguments = field
                .arguments
                .iter()
                .map(|argument| (argument.name.clone(), render_type(&argument.value_type)))
                .collect();

            let ty = FieldType::from_ast(&field.field_type);
            self.add_field(type_name, &field.name, ty, arguments, external)?;
        }

        Ok(())
    }

    fn input_fields(
        &mut self,
        type_name: &str,
        fields: &[InputValue<'_, String>],
    ) -> Result<(), CompositionError> {
        for field in fields {
            let ty = FieldType::from_ast(&field.value_type);
            self.add_field(type_name, &field.name, ty, Vec::new(), false)?;
        }

        Ok(())
    }

    fn add_field(
        &mut self,
        type_name: &str,
        name: &str,
        ty: FieldType,
        arguments: Vec<(String, String)>,
        external: bool,
    ) -> Result<(), CompositionError> {
        let subgraph = self.subgraph.to_string();
        let Some(composed) = self.types.get_mut(type_name) else {
            return Ok(());
        };

        let field = composed
            .fields
            .entry(name.to_string())
            .or_insert_with(|| ComposedField {
                name: name.to_string(),
                ty: ty.clone(),
                arguments,
                owners: Vec::new(),
                external_in: Vec::new(),
            });

        if field.ty != ty {
            return Err(CompositionError::Conflict {
                subgraph,
                cause: format!(
                    "field `{type_name}.{name}` has type `{ty}` here but `{}` elsewhere",
                    field.ty
                ),
            });
        }

        let list = if external {
            &mut field.external_in
        } else {
            &mut field.owners
        };

        if !list.contains(&subgraph) {
            list.push(subgraph);
        }

        Ok(())
    }
}

fn validate(
    types: &BTreeMap<String, ComposedType>,
    sources: &[(Arc<SubgraphDescriptor>, String)],
) -> Result<(), CompositionError> {
    if !types.contains_key(ComposedSchema::QUERY) {
        let subgraph = sources
            .first()
            .map(|(subgraph, _)| subgraph.name().to_string())
            .unwrap_or_default();

        return Err(CompositionError::InvalidSchema {
            subgraph,
            cause: "no subgraph defines any Query field".to_string(),
        });
    }

    for ty in types.values() {
        let is_root = ty.name == ComposedSchema::QUERY || ty.name == ComposedSchema::MUTATION;

        for field in ty.fields.values() {
            let referenced_by = field
                .owners
                .first()
                .or_else(|| field.external_in.first())
                .cloned()
                .unwrap_or_default();

            if !BUILTIN_SCALARS.contains(&field.ty.named.as_str())
                && !types.contains_key(&field.ty.named)
            {
                return Err(CompositionError::InvalidSchema {
                    subgraph: referenced_by,
                    cause: format!(
                        "field `{}.{}` references unknown type `{}`",
                        ty.name, field.name, field.ty.named
                    ),
                });
            }

            if ty.kind != TypeKind::Object {
                continue;
            }

            if field.owners.is_empty() {
                return Err(CompositionError::Conflict {
                    subgraph: referenced_by,
                    cause: format!(
                        "field `{}.{}` is marked @external but no subgraph defines it",
                        ty.name, field.name
                    ),
                });
            }

            let shareable = if is_root {
                false
            } else {
                !ty.is_entity() || ty.is_key_field(&field.name)
            };

            if field.owners.len() > 1 && !shareable {
                return Err(CompositionError::Conflict {
                    subgraph: field.owners[1].clone(),
                    cause: format!(
                        "field `{}.{}` is already resolved by subgraph `{}`",
                        ty.name, field.name, field.owners[0]
                    ),
                });
            }
        }

        if ty.kind == TypeKind::Union {
            if let Some(member) = ty.related.iter().find(|member| !types.contains_key(*member)) {
                return Err(CompositionError::InvalidSchema {
                    subgraph: ty.defined_in.iter().next().cloned().unwrap_or_default(),
                    cause: format!("union `{}` includes unknown type `{member}`", ty.name),
                });
            }
        }
    }

    Ok(())
}

fn string_argument<'a>(directive: &'a Directive<'_, String>, name: &str) -> Option<&'a str> {
    directive.arguments.iter().find_map(|(argument, value)| match value {
        Value::String(value) if argument == name => Some(value.as_str()),
        _ => None,
    })
}

pub(crate) fn named_type<'t>(ty: &'t Type<'_, String>) -> &'t str {
    match ty {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

fn list_depth(ty: &Type<'_, String>) -> usize {
    match ty {
        Type::NamedType(_) => 0,
        Type::ListType(inner) => 1 + list_depth(inner),
        Type::NonNullType(inner) => list_depth(inner),
    }
}

pub(crate) fn render_type(ty: &Type<'_, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", render_type(inner)),
        Type::NonNullType(inner) => format!("{}!", render_type(inner)),
    }
}

fn print_sdl(types: &BTreeMap<String, ComposedType>) -> String {
    let mut sdl = String::new();

    for ty in types.values() {
        if !sdl.is_empty() {
            sdl.push('\n');
        }

        sdl.push_str(&format!("{} {}", ty.kind.keyword(), ty.name));

        match ty.kind {
            TypeKind::Scalar => {
                sdl.push('\n');
                continue;
            }
            TypeKind::Union => {
                let members: Vec<_> = ty.related.iter().map(String::as_str).collect();
                sdl.push_str(&format!(" = {}\n", members.join(" | ")));
                continue;
            }
            TypeKind::Enum => {
                sdl.push_str(" {\n");
                for value in &ty.enum_values {
                    sdl.push_str(&format!("  {value}\n"));
                }
                sdl.push_str("}\n");
                continue;
            }
            _ => {}
        }

        if ty.kind == TypeKind::Object && !ty.related.is_empty() {
            let interfaces: Vec<_> = ty.related.iter().map(String::as_str).collect();
            sdl.push_str(" implements ");
            sdl.push_str(&interfaces.join(" & "));
        }

        for (subgraph, key) in &ty.keys {
            sdl.push_str(&format!(" @join__type(graph: \"{subgraph}\", key: \"{key}\")"));
        }

        sdl.push_str(" {\n");

        for field in ty.fields.values() {
            sdl.push_str("  ");
            sdl.push_str(&field.name);

            if !field.arguments.is_empty() {
                let arguments: Vec<_> = field
                    .arguments
                    .iter()
                    .map(|(name, ty)| format!("{name}: {ty}"))
                    .collect();
                sdl.push_str(&format!("({})", arguments.join(", ")));
            }

            sdl.push_str(&format!(": {}", field.ty));

            if ty.kind == TypeKind::Object {
                for owner in &field.owners {
                    sdl.push_str(&format!(" @join__field(graph: \"{owner}\")"));
                }
            }

            sdl.push('\n');
        }

        sdl.push_str("}\n");
    }

    sdl
}

//! Request, operation, fragment and selector descriptors.
//!
//! Descriptors are produced by an external compiler in a real deployment; here
//! they are plain data built with small builder helpers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::RelayError;

use super::data::Data;

pub type DataId = String;
pub type Variables = Map<String, Value>;

/// Id of the record every query's root selection is read from.
pub const ROOT_ID: &str = "client:root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentValue {
    Literal(Value),
    Variable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: ArgumentValue,
}

impl Argument {
    pub fn resolve(&self, variables: &Variables) -> Value {
        match &self.value {
            ArgumentValue::Literal(value) => value.clone(),
            ArgumentValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        }
    }
}

/// What a reader does when a `@required` field is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredAction {
    Log,
    Throw,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Scalar,
    Linked {
        plural: bool,
        connection: bool,
        selections: Vec<Selection>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub args: Vec<Argument>,
    pub required: Option<RequiredAction>,
    pub kind: FieldKind,
}

const PAGINATION_ARGS: [&str; 4] = ["after", "before", "first", "last"];

impl Field {
    pub fn scalar(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            args: Vec::new(),
            required: None,
            kind: FieldKind::Scalar,
        }
    }

    pub fn linked(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            kind: FieldKind::Linked {
                plural: false,
                connection: false,
                selections,
            },
            ..Self::scalar(name)
        }
    }

    pub fn plural(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            kind: FieldKind::Linked {
                plural: true,
                connection: false,
                selections,
            },
            ..Self::scalar(name)
        }
    }

    /// Marks a linked field as a paginated connection: its storage key ignores
    /// the cursor and count arguments so pages accumulate in one record.
    pub fn connection(mut self) -> Self {
        if let FieldKind::Linked { connection, .. } = &mut self.kind {
            *connection = true;
        }
        self
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.push(Argument {
            name: name.into(),
            value: ArgumentValue::Literal(value.into()),
        });
        self
    }

    pub fn arg_var(mut self, name: impl Into<String>, variable: impl Into<String>) -> Self {
        self.args.push(Argument {
            name: name.into(),
            value: ArgumentValue::Variable(variable.into()),
        });
        self
    }

    pub fn required(mut self, action: RequiredAction) -> Self {
        self.required = Some(action);
        self
    }

    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn is_connection(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Linked {
                connection: true,
                ..
            }
        )
    }

    /// Key under which the field's value is stored on its record.
    pub fn storage_key(&self, variables: &Variables) -> String {
        let connection = self.is_connection();
        let mut args: Vec<(&str, Value)> = self
            .args
            .iter()
            .filter(|arg| !(connection && PAGINATION_ARGS.contains(&arg.name.as_str())))
            .map(|arg| (arg.name.as_str(), arg.resolve(variables)))
            .filter(|(_, value)| !value.is_null())
            .collect();
        if args.is_empty() {
            return self.name.clone();
        }
        args.sort_by(|a, b| a.0.cmp(b.0));
        let rendered: Vec<String> = args
            .into_iter()
            .map(|(name, value)| format!("{name}:{value}"))
            .collect();
        format!("{}({})", self.name, rendered.join(","))
    }

    /// Resolved value of a named argument, `None` when absent or null.
    pub fn argument(&self, name: &str, variables: &Variables) -> Option<Value> {
        self.args
            .iter()
            .find(|arg| arg.name == name)
            .map(|arg| arg.resolve(variables))
            .filter(|value| !value.is_null())
    }
}

/// Edge resolved by a secondary query: the record stores the destination id in
/// `backing_field`, and the destination is read with `selections`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEdge {
    pub name: String,
    pub backing_field: String,
    pub request: Arc<ConcreteRequest>,
    pub selections: Vec<Selection>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Field(Field),
    FragmentSpread {
        fragment: Arc<ReaderFragment>,
        args: Vec<Argument>,
    },
    ClientEdge(ClientEdge),
    LiveResolver {
        name: String,
        live_state_id: String,
    },
}

impl Selection {
    pub fn spread(fragment: &Arc<ReaderFragment>) -> Self {
        Selection::FragmentSpread {
            fragment: fragment.clone(),
            args: Vec::new(),
        }
    }

    pub fn client_edge(
        name: impl Into<String>,
        backing_field: impl Into<String>,
        request: &Arc<ConcreteRequest>,
        selections: Vec<Selection>,
    ) -> Self {
        Selection::ClientEdge(ClientEdge {
            name: name.into(),
            backing_field: backing_field.into(),
            request: request.clone(),
            selections,
        })
    }

    pub fn live_resolver(name: impl Into<String>, live_state_id: impl Into<String>) -> Self {
        Selection::LiveResolver {
            name: name.into(),
            live_state_id: live_state_id.into(),
        }
    }
}

impl From<Field> for Selection {
    fn from(field: Field) -> Self {
        Selection::Field(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorVariables {
    pub count: String,
    pub cursor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetadata {
    /// Path from the fragment's data to the connection object.
    pub path: Vec<String>,
    pub forward: Option<CursorVariables>,
    pub backward: Option<CursorVariables>,
}

impl ConnectionMetadata {
    pub fn forward(path: &[&str]) -> Self {
        Self {
            path: path.iter().map(|segment| segment.to_string()).collect(),
            forward: Some(CursorVariables {
                count: "first".to_string(),
                cursor: "after".to_string(),
            }),
            backward: None,
        }
    }

    pub fn bidirectional(path: &[&str]) -> Self {
        Self {
            backward: Some(CursorVariables {
                count: "last".to_string(),
                cursor: "before".to_string(),
            }),
            ..Self::forward(path)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefetchMetadata {
    pub request: Arc<ConcreteRequest>,
    /// Where the refetched fragment reference sits in the refetch query's data.
    pub fragment_path_in_response: Vec<String>,
    pub identifier_field: Option<String>,
    pub identifier_query_variable_name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentMetadata {
    pub plural: bool,
    pub throw_on_field_error: bool,
    pub connection: Option<ConnectionMetadata>,
    pub refetch: Option<RefetchMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReaderFragment {
    pub name: String,
    pub selections: Vec<Selection>,
    pub metadata: FragmentMetadata,
    pub has_client_edges: bool,
}

impl ReaderFragment {
    pub fn new(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        let has_client_edges = selections
            .iter()
            .any(|selection| matches!(selection, Selection::ClientEdge(_)));
        Self {
            name: name.into(),
            selections,
            metadata: FragmentMetadata::default(),
            has_client_edges,
        }
    }

    pub fn plural(mut self) -> Self {
        self.metadata.plural = true;
        self
    }

    pub fn throw_on_field_error(mut self) -> Self {
        self.metadata.throw_on_field_error = true;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionMetadata) -> Self {
        self.metadata.connection = Some(connection);
        self
    }

    pub fn with_refetch(mut self, refetch: RefetchMetadata) -> Self {
        self.metadata.refetch = Some(refetch);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcreteRequest {
    pub id: String,
    pub name: String,
    pub kind: OperationKind,
    pub fragment: Arc<ReaderFragment>,
    /// `@live` queries stay open until cancelled.
    pub live: bool,
}

impl ConcreteRequest {
    pub fn query(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(name, OperationKind::Query, selections)
    }

    pub fn mutation(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(name, OperationKind::Mutation, selections)
    }

    pub fn subscription(name: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self::new(name, OperationKind::Subscription, selections)
    }

    fn new(name: impl Into<String>, kind: OperationKind, selections: Vec<Selection>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            fragment: Arc::new(ReaderFragment::new(name.clone(), selections)),
            name,
            kind,
            live: false,
        }
    }

    pub fn live(mut self) -> Self {
        self.live = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheConfig {
    pub force: bool,
}

/// A request bound to concrete variables.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub identifier: String,
    pub node: Arc<ConcreteRequest>,
    pub variables: Variables,
    pub cache_config: CacheConfig,
}

impl PartialEq for RequestDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier && self.cache_config == other.cache_config
    }
}

impl RequestDescriptor {
    pub fn new(node: Arc<ConcreteRequest>, variables: Variables, cache_config: CacheConfig) -> Self {
        let identifier = request_identifier(&node.id, &variables);
        Self {
            identifier,
            node,
            variables,
            cache_config,
        }
    }
}

/// Request id followed by the canonical JSON encoding of the variables.
pub fn request_identifier(id: &str, variables: &Variables) -> String {
    let canonical: BTreeMap<&String, &Value> = variables.iter().collect();
    let encoded = serde_json::to_string(&canonical).unwrap_or_default();
    format!("{id}{encoded}")
}

#[derive(Debug, Clone, PartialEq)]
pub struct SingularSelector {
    pub data_id: DataId,
    pub node: Arc<ReaderFragment>,
    pub variables: Variables,
    pub owner: Arc<RequestDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Single(SingularSelector),
    Plural(Vec<SingularSelector>),
}

impl Selector {
    pub fn owner(&self) -> Option<&Arc<RequestDescriptor>> {
        match self {
            Selector::Single(selector) => Some(&selector.owner),
            Selector::Plural(selectors) => selectors.first().map(|selector| &selector.owner),
        }
    }

    pub fn selectors(&self) -> Vec<&SingularSelector> {
        match self {
            Selector::Single(selector) => vec![selector],
            Selector::Plural(selectors) => selectors.iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub request: Arc<RequestDescriptor>,
    pub fragment: SingularSelector,
}

impl OperationDescriptor {
    pub fn new(node: &Arc<ConcreteRequest>, variables: Variables) -> Self {
        Self::with_cache_config(node, variables, CacheConfig::default())
    }

    pub fn with_cache_config(
        node: &Arc<ConcreteRequest>,
        variables: Variables,
        cache_config: CacheConfig,
    ) -> Self {
        let request = Arc::new(RequestDescriptor::new(
            node.clone(),
            variables.clone(),
            cache_config,
        ));
        Self {
            fragment: SingularSelector {
                data_id: ROOT_ID.to_string(),
                node: node.fragment.clone(),
                variables,
                owner: request.clone(),
            },
            request,
        }
    }

    pub fn name(&self) -> &str {
        &self.request.node.name
    }

    pub fn is_live(&self) -> bool {
        self.request.node.live || self.request.node.kind == OperationKind::Subscription
    }

    /// Fragment reference pointing at the operation's root selection.
    pub fn root_ref(&self) -> Arc<FragmentRef> {
        let mut fragments = BTreeMap::new();
        fragments.insert(
            self.fragment.node.name.clone(),
            self.request.variables.clone(),
        );
        Arc::new(FragmentRef {
            id: self.fragment.data_id.clone(),
            fragments,
            owner: self.request.clone(),
        })
    }
}

/// What a fragment spread leaves behind in its parent's data.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentRef {
    pub id: DataId,
    pub fragments: BTreeMap<String, Variables>,
    pub owner: Arc<RequestDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentKey {
    Single(Arc<FragmentRef>),
    Plural(Vec<Arc<FragmentRef>>),
}

impl FragmentKey {
    /// Extracts a key from data containing `__fragments` (or a list of such).
    pub fn from_data(data: &Data) -> Option<Self> {
        match data {
            Data::Fragment(reference) => Some(FragmentKey::Single(reference.clone())),
            Data::Object(_) => data.fragment_ref().map(FragmentKey::Single),
            Data::List(items) => items
                .iter()
                .map(Data::fragment_ref)
                .collect::<Option<Vec<_>>>()
                .map(FragmentKey::Plural),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, FragmentKey::Plural(refs) if refs.is_empty())
    }

    fn refs(&self) -> Vec<&Arc<FragmentRef>> {
        match self {
            FragmentKey::Single(reference) => vec![reference],
            FragmentKey::Plural(refs) => refs.iter().collect(),
        }
    }
}

impl fmt::Display for FragmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids: Vec<&str> = self.refs().iter().map(|r| r.id.as_str()).collect();
        write!(f, "[{}]", ids.join(","))
    }
}

fn singular_selector(
    fragment: &Arc<ReaderFragment>,
    reference: &FragmentRef,
) -> Option<SingularSelector> {
    let fragment_variables = reference.fragments.get(&fragment.name)?;
    let mut variables = reference.owner.variables.clone();
    for (name, value) in fragment_variables {
        variables.insert(name.clone(), value.clone());
    }
    Some(SingularSelector {
        data_id: reference.id.clone(),
        node: fragment.clone(),
        variables,
        owner: reference.owner.clone(),
    })
}

/// Resolves a key against a fragment. `Ok(None)` means the key does not carry
/// this fragment; a plural/singular mismatch is a caller contract violation.
pub fn get_selector(
    fragment: &Arc<ReaderFragment>,
    key: &FragmentKey,
) -> Result<Option<Selector>, RelayError> {
    match (fragment.metadata.plural, key) {
        (false, FragmentKey::Single(reference)) => {
            Ok(singular_selector(fragment, reference).map(Selector::Single))
        }
        (true, FragmentKey::Plural(refs)) => Ok(refs
            .iter()
            .map(|reference| singular_selector(fragment, reference))
            .collect::<Option<Vec<_>>>()
            .map(Selector::Plural)),
        (true, FragmentKey::Single(_)) => Err(RelayError::invariant(format!(
            "expected fragment pointer for fragment `{}` to be a list; the fragment is plural",
            fragment.name
        ))),
        (false, FragmentKey::Plural(_)) => Err(RelayError::invariant(format!(
            "expected fragment pointer for fragment `{}` to be an object; the fragment is not plural",
            fragment.name
        ))),
    }
}

/// Variables the fragment is read with: owner variables overlaid with the
/// spread's own variables.
pub fn variables_from_fragment(fragment: &ReaderFragment, key: &FragmentKey) -> Variables {
    key.refs()
        .first()
        .map(|reference| {
            let mut variables = reference.owner.variables.clone();
            if let Some(local) = reference.fragments.get(&fragment.name) {
                for (name, value) in local {
                    variables.insert(name.clone(), value.clone());
                }
            }
            variables
        })
        .unwrap_or_default()
}

/// Stable cache identifier for reading `fragment` through `key`.
pub fn fragment_identifier(fragment: &ReaderFragment, key: Option<&FragmentKey>) -> String {
    let Some(key) = key else {
        return format!("null/{}", fragment.name);
    };
    let owner = key
        .refs()
        .first()
        .map(|reference| reference.owner.identifier.clone())
        .unwrap_or_else(|| "null".to_string());
    let variables = serde_json::to_string(&variables_from_fragment(fragment, key)).unwrap_or_default();
    format!("{owner}/{}/{variables}/{key}", fragment.name)
}

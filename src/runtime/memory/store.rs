//! Normalized record store: records keyed by id, a write epoch, ordered
//! snapshot subscriptions and per-operation retain counts.
//!
//! Every mutating method returns the subscription callbacks to run; the
//! caller invokes them after releasing its lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::runtime::data::{Data, FRAGMENTS_KEY, ID_KEY, recycle_nodes_into};
use crate::runtime::descriptor::{
    DataId, Field, FieldKind, FragmentRef, OperationDescriptor, RequestDescriptor, RequiredAction,
    Selection, SingularSelector, Variables,
};
use crate::runtime::environment::SnapshotCallback;
use crate::runtime::pending::Resolver;
use crate::runtime::policy::Epoch;
use crate::runtime::snapshot::{
    AvailabilityStatus, FieldError, GraphQlError, MissingClientEdge, MissingLiveResolverField,
    MissingRequiredFields, OperationAvailability, Snapshot,
};

/// Callbacks to invoke, in subscription order, once the store lock is released.
pub(crate) type Notifications = Vec<(SnapshotCallback, Snapshot)>;

#[derive(Debug, Clone, PartialEq)]
enum FieldValue {
    Scalar(Value),
    Link(Option<DataId>),
    Links(Vec<Option<DataId>>),
}

#[derive(Debug, Clone, Default)]
struct Record {
    fields: HashMap<String, FieldValue>,
    errors: HashMap<String, String>,
}

struct StoreSubscription {
    snapshot: Snapshot,
    callback: SnapshotCallback,
}

#[derive(Default)]
pub(crate) struct RecordStore {
    records: HashMap<DataId, Record>,
    epoch: Epoch,
    subscriptions: Vec<(u64, StoreSubscription)>,
    next_subscription_id: u64,
    roots: HashMap<String, usize>,
    write_epochs: HashMap<String, (Epoch, OffsetDateTime)>,
    invalidated_at: HashMap<String, Epoch>,
    store_invalidated_at: Option<Epoch>,
    live_values: HashMap<String, Value>,
    live_waiters: HashMap<String, Vec<Resolver>>,
}

fn live_record_id(live_state_id: &str) -> DataId {
    format!("client:live:{live_state_id}")
}

impl RecordStore {
    pub(crate) fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) fn has_record(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub(crate) fn lookup(&self, selector: &SingularSelector) -> Snapshot {
        let mut reader = Reader {
            store: self,
            variables: &selector.variables,
            owner: &selector.owner,
            fragment_name: &selector.node.name,
            is_missing_data: false,
            missing_client_edges: Vec::new(),
            missing_live_resolver_fields: Vec::new(),
            missing_required_fields: None,
            field_errors: Vec::new(),
            seen_records: BTreeSet::new(),
        };
        let data = reader.read_record(&selector.data_id, &selector.node.selections, "");
        Snapshot {
            data,
            is_missing_data: reader.is_missing_data,
            missing_client_edges: reader.missing_client_edges,
            missing_live_resolver_fields: reader.missing_live_resolver_fields,
            missing_required_fields: reader.missing_required_fields,
            field_errors: reader.field_errors,
            seen_records: reader.seen_records,
            selector: selector.clone(),
        }
    }

    pub(crate) fn subscribe(&mut self, snapshot: &Snapshot, callback: SnapshotCallback) -> u64 {
        self.next_subscription_id += 1;
        let id = self.next_subscription_id;
        self.subscriptions.push((
            id,
            StoreSubscription {
                snapshot: snapshot.clone(),
                callback,
            },
        ));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: u64) {
        self.subscriptions.retain(|(subscription_id, _)| *subscription_id != id);
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub(crate) fn retain(&mut self, identifier: &str) {
        *self.roots.entry(identifier.to_string()).or_default() += 1;
    }

    pub(crate) fn release(&mut self, identifier: &str) {
        if let Some(count) = self.roots.get_mut(identifier) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.roots.remove(identifier);
            }
        }
    }

    pub(crate) fn retain_count(&self, identifier: &str) -> usize {
        self.roots.get(identifier).copied().unwrap_or(0)
    }

    pub(crate) fn check(&self, operation: &OperationDescriptor) -> OperationAvailability {
        let identifier = &operation.request.identifier;
        let written = self.write_epochs.get(identifier).copied();
        let invalidated = self
            .invalidated_at
            .get(identifier)
            .copied()
            .max(self.store_invalidated_at);
        if let Some(invalidated) = invalidated
            && written.is_none_or(|(epoch, _)| epoch < invalidated)
        {
            return OperationAvailability {
                status: AvailabilityStatus::Stale,
                fetch_time: written.map(|(_, at)| at),
            };
        }
        if self.lookup(&operation.fragment).is_missing_data {
            return OperationAvailability::missing();
        }
        OperationAvailability {
            status: AvailabilityStatus::Available,
            fetch_time: written.map(|(_, at)| at),
        }
    }

    /// Normalizes a response payload for `operation` into records.
    pub(crate) fn commit_payload(
        &mut self,
        operation: &OperationDescriptor,
        data: &Map<String, Value>,
        errors: &[GraphQlError],
    ) -> Notifications {
        let mut normalizer = Normalizer {
            records: &mut self.records,
            variables: &operation.request.variables,
            errors,
            updated: BTreeSet::new(),
        };
        normalizer.ensure_record(&operation.fragment.data_id);
        normalizer.normalize(
            &operation.fragment.data_id,
            &operation.request.node.fragment.selections,
            data,
            &[],
        );
        let updated = normalizer.updated;

        self.epoch += 1;
        self.write_epochs.insert(
            operation.request.identifier.clone(),
            (self.epoch, OffsetDateTime::now_utc()),
        );
        self.publish(&updated)
    }

    /// Writes one scalar field directly, as a local update would.
    pub(crate) fn set_value(&mut self, id: &str, field: &str, value: Value) -> Notifications {
        let record = self.records.entry(id.to_string()).or_default();
        record.fields.insert(field.to_string(), FieldValue::Scalar(value));
        record.errors.remove(field);
        self.epoch += 1;
        self.publish(&BTreeSet::from([id.to_string()]))
    }

    pub(crate) fn set_field_error(&mut self, id: &str, field: &str, message: &str) -> Notifications {
        let record = self.records.entry(id.to_string()).or_default();
        record
            .fields
            .insert(field.to_string(), FieldValue::Scalar(Value::Null));
        record.errors.insert(field.to_string(), message.to_string());
        self.epoch += 1;
        self.publish(&BTreeSet::from([id.to_string()]))
    }

    pub(crate) fn delete_record(&mut self, id: &str) -> Notifications {
        self.records.remove(id);
        self.epoch += 1;
        self.publish(&BTreeSet::from([id.to_string()]))
    }

    pub(crate) fn invalidate(&mut self, operation: &OperationDescriptor) {
        self.epoch += 1;
        self.invalidated_at
            .insert(operation.request.identifier.clone(), self.epoch);
    }

    pub(crate) fn invalidate_store(&mut self) {
        self.epoch += 1;
        self.store_invalidated_at = Some(self.epoch);
    }

    pub(crate) fn has_live_value(&self, live_state_id: &str) -> bool {
        self.live_values.contains_key(live_state_id)
    }

    pub(crate) fn add_live_waiter(&mut self, live_state_id: &str, resolver: Resolver) {
        self.live_waiters
            .entry(live_state_id.to_string())
            .or_default()
            .push(resolver);
    }

    /// Returns the waiters to settle alongside the notifications.
    pub(crate) fn set_live_value(
        &mut self,
        live_state_id: &str,
        value: Value,
    ) -> (Notifications, Vec<Resolver>) {
        self.live_values.insert(live_state_id.to_string(), value);
        self.epoch += 1;
        let waiters = self.live_waiters.remove(live_state_id).unwrap_or_default();
        let notifications = self.publish(&BTreeSet::from([live_record_id(live_state_id)]));
        (notifications, waiters)
    }

    fn publish(&mut self, updated: &BTreeSet<DataId>) -> Notifications {
        if updated.is_empty() {
            return Vec::new();
        }
        let mut notifications = Vec::new();
        for index in 0..self.subscriptions.len() {
            let (selector, previous) = {
                let (_, subscription) = &self.subscriptions[index];
                if subscription.snapshot.seen_records.is_disjoint(updated) {
                    continue;
                }
                (
                    subscription.snapshot.selector.clone(),
                    subscription.snapshot.clone(),
                )
            };
            let next = self.lookup(&selector);
            let data = recycle_nodes_into(&previous.data, next.data.clone());
            let changed = !data.same_node(&previous.data)
                || next.is_missing_data != previous.is_missing_data
                || next.field_errors != previous.field_errors;
            let next = next.with_data(data);
            let (_, subscription) = &mut self.subscriptions[index];
            subscription.snapshot = next.clone();
            if changed {
                notifications.push((subscription.callback.clone(), next));
            }
        }
        notifications
    }
}

struct Reader<'a> {
    store: &'a RecordStore,
    variables: &'a Variables,
    owner: &'a Arc<RequestDescriptor>,
    fragment_name: &'a str,
    is_missing_data: bool,
    missing_client_edges: Vec<MissingClientEdge>,
    missing_live_resolver_fields: Vec<MissingLiveResolverField>,
    missing_required_fields: Option<MissingRequiredFields>,
    field_errors: Vec<FieldError>,
    seen_records: BTreeSet<DataId>,
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

impl Reader<'_> {
    fn read_record(&mut self, id: &str, selections: &[Selection], path: &str) -> Data {
        self.seen_records.insert(id.to_string());
        let Some(record) = self.store.records.get(id) else {
            self.is_missing_data = true;
            return Data::Null;
        };

        let mut fields = BTreeMap::new();
        let mut spreads = BTreeMap::new();
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let key = field.response_key();
                    let field_path = child_path(path, key);
                    let Some(value) = self.read_field(record, field, &field_path) else {
                        self.is_missing_data = true;
                        continue;
                    };
                    if value.is_null()
                        && let Some(action) = field.required
                    {
                        self.note_required(action, field_path);
                        return Data::Null;
                    }
                    fields.insert(key.to_string(), value);
                }
                Selection::FragmentSpread { fragment, args } => {
                    let variables: Variables = args
                        .iter()
                        .map(|arg| (arg.name.clone(), arg.resolve(self.variables)))
                        .collect();
                    spreads.insert(fragment.name.clone(), variables);
                }
                Selection::ClientEdge(edge) => {
                    let edge_path = child_path(path, &edge.name);
                    match record.fields.get(&edge.backing_field) {
                        Some(FieldValue::Scalar(Value::String(destination))) => {
                            if self.store.has_record(destination) {
                                let value =
                                    self.read_record(destination, &edge.selections, &edge_path);
                                fields.insert(edge.name.clone(), value);
                            } else {
                                self.seen_records.insert(destination.clone());
                                self.is_missing_data = true;
                                self.missing_client_edges.push(MissingClientEdge {
                                    request: edge.request.clone(),
                                    destination_id: destination.clone(),
                                });
                            }
                        }
                        Some(_) => {
                            fields.insert(edge.name.clone(), Data::Null);
                        }
                        None => self.is_missing_data = true,
                    }
                }
                Selection::LiveResolver {
                    name,
                    live_state_id,
                } => {
                    self.seen_records.insert(live_record_id(live_state_id));
                    match self.store.live_values.get(live_state_id) {
                        Some(value) => {
                            fields.insert(name.clone(), Data::from(value.clone()));
                        }
                        None => {
                            self.is_missing_data = true;
                            self.missing_live_resolver_fields
                                .push(MissingLiveResolverField {
                                    path: child_path(path, name),
                                    live_state_id: live_state_id.clone(),
                                });
                        }
                    }
                }
            }
        }

        if !spreads.is_empty() {
            fields.insert(ID_KEY.to_string(), Data::string(id));
            fields.insert(
                FRAGMENTS_KEY.to_string(),
                Data::Fragment(Arc::new(FragmentRef {
                    id: id.to_string(),
                    fragments: spreads,
                    owner: self.owner.clone(),
                })),
            );
        }
        Data::Object(Arc::new(fields))
    }

    /// `None` when the field has never been written.
    fn read_field(&mut self, record: &Record, field: &Field, path: &str) -> Option<Data> {
        let storage_key = field.storage_key(self.variables);
        if let Some(message) = record.errors.get(&storage_key) {
            self.field_errors.push(FieldError {
                owner: self.fragment_name.to_string(),
                path: path.to_string(),
                message: message.clone(),
            });
            return Some(Data::Null);
        }
        let value = record.fields.get(&storage_key)?;
        let data = match (&field.kind, value) {
            (FieldKind::Scalar, FieldValue::Scalar(value)) => Data::from(value.clone()),
            (FieldKind::Linked { selections, .. }, FieldValue::Link(Some(id))) => {
                self.read_record(id, selections, path)
            }
            (FieldKind::Linked { selections, .. }, FieldValue::Links(ids)) => Data::list(
                ids.iter()
                    .enumerate()
                    .map(|(index, id)| match id {
                        Some(id) => {
                            self.read_record(id, selections, &child_path(path, &index.to_string()))
                        }
                        None => Data::Null,
                    })
                    .collect::<Vec<_>>(),
            ),
            _ => Data::Null,
        };
        Some(data)
    }

    fn note_required(&mut self, action: RequiredAction, path: String) {
        let missing = self
            .missing_required_fields
            .get_or_insert_with(|| MissingRequiredFields {
                action,
                owner: self.fragment_name.to_string(),
                paths: Vec::new(),
            });
        if action == RequiredAction::Throw {
            missing.action = RequiredAction::Throw;
        }
        missing.paths.push(path);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PageDirection {
    Forward,
    Backward,
}

struct Normalizer<'a> {
    records: &'a mut HashMap<DataId, Record>,
    variables: &'a Variables,
    errors: &'a [GraphQlError],
    updated: BTreeSet<DataId>,
}

fn path_matches(error_path: &[Value], path: &[String]) -> bool {
    error_path.len() == path.len()
        && error_path.iter().zip(path).all(|(segment, expected)| match segment {
            Value::String(segment) => segment == expected,
            Value::Number(index) => index.to_string() == *expected,
            _ => false,
        })
}

fn extend_path(path: &[String], segment: &str) -> Vec<String> {
    let mut next = path.to_vec();
    next.push(segment.to_string());
    next
}

impl Normalizer<'_> {
    fn ensure_record(&mut self, id: &str) {
        if !self.records.contains_key(id) {
            self.records.insert(id.to_string(), Record::default());
            self.updated.insert(id.to_string());
        }
    }

    fn set_field(&mut self, id: &str, storage_key: String, value: FieldValue) {
        self.ensure_record(id);
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        if record.fields.get(&storage_key) != Some(&value) {
            record.fields.insert(storage_key, value);
            self.updated.insert(id.to_string());
        }
    }

    fn set_error(&mut self, id: &str, storage_key: &str, path: &[String]) {
        let message = self
            .errors
            .iter()
            .find(|error| path_matches(&error.path, path))
            .map(|error| error.message.clone());
        self.ensure_record(id);
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        let changed = match message {
            Some(message) => record.errors.insert(storage_key.to_string(), message.clone())
                != Some(message),
            None => record.errors.remove(storage_key).is_some(),
        };
        if changed {
            self.updated.insert(id.to_string());
        }
    }

    fn link(&self, id: &str, storage_key: &str) -> Option<FieldValue> {
        self.records
            .get(id)
            .and_then(|record| record.fields.get(storage_key))
            .cloned()
    }

    fn normalize(
        &mut self,
        id: &str,
        selections: &[Selection],
        value: &Map<String, Value>,
        path: &[String],
    ) {
        for selection in selections {
            match selection {
                Selection::Field(field) => {
                    let key = field.response_key();
                    let Some(field_value) = value.get(key) else {
                        continue;
                    };
                    let storage_key = field.storage_key(self.variables);
                    let field_path = extend_path(path, key);
                    self.set_error(id, &storage_key, &field_path);
                    self.normalize_field(id, field, storage_key, field_value, &field_path);
                }
                Selection::FragmentSpread { fragment, .. } => {
                    self.normalize(id, &fragment.selections, value, path);
                }
                Selection::ClientEdge(_) | Selection::LiveResolver { .. } => {}
            }
        }
    }

    fn normalize_field(
        &mut self,
        id: &str,
        field: &Field,
        storage_key: String,
        value: &Value,
        path: &[String],
    ) {
        let FieldKind::Linked {
            plural, selections, ..
        } = &field.kind
        else {
            self.set_field(id, storage_key, FieldValue::Scalar(value.clone()));
            return;
        };

        if *plural {
            let Value::Array(items) = value else {
                self.set_field(id, storage_key, FieldValue::Link(None));
                return;
            };
            let mut links = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let Value::Object(object) = item else {
                    links.push(None);
                    continue;
                };
                let child = child_id(object, &format!("{id}:{storage_key}:{index}"));
                self.ensure_record(&child);
                self.normalize(
                    &child,
                    selections,
                    object,
                    &extend_path(path, &index.to_string()),
                );
                links.push(Some(child));
            }
            self.set_field(id, storage_key, FieldValue::Links(links));
            return;
        }

        let Value::Object(object) = value else {
            self.set_field(id, storage_key, FieldValue::Link(None));
            return;
        };

        let direction = if field.argument("after", self.variables).is_some() {
            Some(PageDirection::Forward)
        } else if field.argument("before", self.variables).is_some() {
            Some(PageDirection::Backward)
        } else {
            None
        };
        if field.is_connection()
            && let Some(direction) = direction
            && let Some(FieldValue::Link(Some(existing))) = self.link(id, &storage_key)
        {
            self.merge_connection(&existing, selections, object, path, direction);
            return;
        }

        let child = child_id(object, &format!("{id}:{storage_key}"));
        self.ensure_record(&child);
        self.normalize(&child, selections, object, path);
        self.set_field(id, storage_key, FieldValue::Link(Some(child)));
    }

    /// Appends (forward) or prepends (backward) a fetched page onto the
    /// connection record already in the store.
    fn merge_connection(
        &mut self,
        connection_id: &str,
        selections: &[Selection],
        object: &Map<String, Value>,
        path: &[String],
        direction: PageDirection,
    ) {
        for selection in selections {
            let Selection::Field(field) = selection else {
                self.normalize(connection_id, std::slice::from_ref(selection), object, path);
                continue;
            };
            let key = field.response_key();
            let storage_key = field.storage_key(self.variables);
            match (key, &field.kind, object.get(key)) {
                ("edges", FieldKind::Linked { selections, .. }, Some(Value::Array(edges))) => {
                    let existing = match self.link(connection_id, &storage_key) {
                        Some(FieldValue::Links(links)) => links,
                        _ => Vec::new(),
                    };
                    let mut fetched = Vec::with_capacity(edges.len());
                    for (index, edge) in edges.iter().enumerate() {
                        let Value::Object(edge) = edge else {
                            fetched.push(None);
                            continue;
                        };
                        let edge_id = format!(
                            "{connection_id}:{storage_key}:{}",
                            existing.len() + index
                        );
                        self.ensure_record(&edge_id);
                        self.normalize(
                            &edge_id,
                            selections,
                            edge,
                            &extend_path(&extend_path(path, key), &index.to_string()),
                        );
                        fetched.push(Some(edge_id));
                    }
                    let links = match direction {
                        PageDirection::Forward => existing.into_iter().chain(fetched).collect(),
                        PageDirection::Backward => fetched.into_iter().chain(existing).collect(),
                    };
                    self.set_field(connection_id, storage_key, FieldValue::Links(links));
                }
                ("pageInfo", FieldKind::Linked { selections, .. }, Some(Value::Object(info))) => {
                    let skipped: [&str; 2] = match direction {
                        PageDirection::Forward => ["startCursor", "hasPreviousPage"],
                        PageDirection::Backward => ["endCursor", "hasNextPage"],
                    };
                    let filtered: Map<String, Value> = info
                        .iter()
                        .filter(|(name, _)| !skipped.contains(&name.as_str()))
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect();
                    let page_info_id = match self.link(connection_id, &storage_key) {
                        Some(FieldValue::Link(Some(existing))) => existing,
                        _ => child_id(info, &format!("{connection_id}:{storage_key}")),
                    };
                    self.ensure_record(&page_info_id);
                    self.normalize(&page_info_id, selections, &filtered, &extend_path(path, key));
                    self.set_field(connection_id, storage_key, FieldValue::Link(Some(page_info_id)));
                }
                _ => self.normalize(connection_id, std::slice::from_ref(selection), object, path),
            }
        }
    }
}

fn child_id(object: &Map<String, Value>, fallback: &str) -> DataId {
    object
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| fallback.to_string())
}

use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{canonical_id, compare_values, type_order, values_equal, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn matches(&self, document: &Document) -> bool {
        let key_value;
        let other = if self.field.is_key_field() {
            key_value = key_reference(document.key());
            Some(&key_value)
        } else {
            document.field(&self.field)
        };

        match self.op {
            Operator::NotEqual => match other {
                Some(other) if !other.is_null() => !values_equal(other, &self.value),
                _ => false,
            },
            Operator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            Operator::ArrayContainsAny => match (other.and_then(FirestoreValue::as_array), self.value.as_array()) {
                (Some(array), Some(needles)) => array.values().iter().any(|value| needles.contains(value)),
                _ => false,
            },
            Operator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            Operator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match other {
                    Some(other) if !other.is_null() => !candidates.contains(other),
                    _ => false,
                }
            }
            _ => match other {
                Some(other) if type_order(other) == type_order(&self.value) => {
                    self.matches_comparison(compare_values(other, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    fn canonical_id(&self) -> String {
        format!("{}{}{}", self.field.canonical_string(), self.op.as_str(), canonical_id(&self.value))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    Field(FieldFilter),
    Composite { op: CompositeOperator, filters: Vec<Filter> },
}

impl Filter {
    pub fn field(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::And,
            filters,
        }
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite {
            op: CompositeOperator::Or,
            filters,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => filters.iter().all(|filter| filter.matches(document)),
            Filter::Composite {
                op: CompositeOperator::Or,
                filters,
            } => filters.iter().any(|filter| filter.matches(document)),
        }
    }

    /// All field filters reachable from this filter, regardless of composite operator.
    pub fn flattened(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite { filters, .. } => filters.iter().flat_map(Filter::flattened).collect(),
        }
    }

    /// Field filters when this filter is a pure conjunction; `None` if a disjunction is involved.
    pub fn conjunction(&self) -> Option<Vec<&FieldFilter>> {
        match self {
            Filter::Field(filter) => Some(vec![filter]),
            Filter::Composite {
                op: CompositeOperator::And,
                filters,
            } => {
                let mut out = Vec::new();
                for filter in filters {
                    out.extend(filter.conjunction()?);
                }
                Some(out)
            }
            Filter::Composite {
                op: CompositeOperator::Or,
                ..
            } => None,
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite { op, filters } => {
                let parts: Vec<String> = filters.iter().map(Filter::canonical_id).collect();
                let name = match op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                format!("{name}({})", parts.join(","))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flip(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub(crate) fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flip())
    }

    pub(crate) fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let l = left.field(&self.field).unwrap_or(&null);
            let r = right.field(&self.field).unwrap_or(&null);
            compare_values(l, r)
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let dir = match self.direction {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        };
        format!("{}{dir}", self.field.canonical_string())
    }
}

/// A cursor position over the order-by fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by.iter()) {
            let ordering = if order.field.is_key_field() {
                compare_values(component, &key_reference(document.key()))
            } else {
                match document.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let parts: Vec<String> = self.position.iter().map(canonical_id).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, parts.join(","))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// Reference value naming a document, as compared by `__name__` filters and order-bys.
pub fn key_reference(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

/// A query over a collection, a collection group or a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<Filter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// A query at `path`: a document query when the path names a document, otherwise a
    /// collection query.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// A query over every collection named `collection_id` under `parent`.
    pub fn collection_group(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(parent);
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit(mut self, limit: u32, limit_type: LimitType) -> Self {
        self.limit = Some(limit);
        self.limit_type = limit_type;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns the full collection with no filtering, limit or cursor.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Fields constrained by inequality filters, in field order.
    pub fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened)
            .filter(|filter| filter.op.is_inequality())
            .map(|filter| filter.field.clone())
            .collect()
    }

    /// Explicit orderings, then inequality fields, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|o| o.field.clone()).collect();
        let last_direction = result
            .last()
            .map(|o| o.direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !field.is_key_field() && seen.insert(field.clone()) {
                result.push(OrderBy::new(field, last_direction));
            }
        }
        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    /// Collection id used to look up indexes for this query.
    pub fn index_collection_group(&self) -> Option<String> {
        match &self.collection_group {
            Some(group) => Some(group.clone()),
            None if !DocumentKey::is_document_key(&self.path) => self.path.last_segment().map(str::to_string),
            None => None,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, document: &Document) -> bool {
        let doc_path = document.key().path();
        match &self.collection_group {
            Some(group) => document.key().has_collection_id(group) && self.path.is_prefix_of(doc_path),
            None if DocumentKey::is_document_key(&self.path) => &self.path == doc_path,
            None => self.path.is_immediate_parent_of(doc_path),
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way this query returns them.
    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        for order in self.normalized_order_by() {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Applies ordering and limit to an unordered candidate set of matching documents.
    pub fn apply_to(&self, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut matching: Vec<Document> = documents.into_iter().filter(|doc| self.matches(doc)).collect();
        matching.sort_by(|a, b| self.compare_documents(a, b));
        if let Some(limit) = self.limit {
            let limit = limit as usize;
            if matching.len() > limit {
                match self.limit_type {
                    LimitType::First => matching.truncate(limit),
                    LimitType::Last => {
                        let start = matching.len() - limit;
                        matching.drain(0..start);
                    }
                }
            }
        }
        matching
    }

    /// Converts to the server target. Limit-to-last queries flip ordering and swap cursors.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by.iter().map(OrderBy::flipped).collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            ),
        }
    }

    /// Identity of the query, used to share views between listeners.
    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::{Bound, CompositeOperator, Direction, FieldFilter, Filter, Operator};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::ValueKind;

/// Encodes a query target as `(parent, structuredQuery)`.
pub(crate) fn encode_structured_query(
    serializer: &JsonProtoSerializer,
    target: &Target,
) -> FirestoreResult<(String, JsonValue)> {
    let mut structured = serde_json::Map::new();

    let (parent_path, collection_id, all_descendants) = match target.collection_group() {
        Some(group) => (target.path().clone(), group.to_string(), true),
        None => {
            let collection_id = target
                .path()
                .last_segment()
                .ok_or_else(|| invalid_argument("Query targets need a collection path"))?
                .to_string();
            (target.path().without_last(), collection_id, false)
        }
    };

    structured.insert(
        "from".to_string(),
        json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
    );

    match target.filters() {
        [] => {}
        [single] => {
            structured.insert("where".to_string(), encode_filter(serializer, single));
        }
        filters => {
            let nested: Vec<_> = filters.iter().map(|filter| encode_filter(serializer, filter)).collect();
            structured.insert(
                "where".to_string(),
                json!({ "compositeFilter": { "op": "AND", "filters": nested } }),
            );
        }
    }

    if !target.order_by().is_empty() {
        let orders: Vec<_> = target
            .order_by()
            .iter()
            .map(|order| {
                json!({
                    "field": { "fieldPath": order.field.canonical_string() },
                    "direction": match order.direction {
                        Direction::Ascending => "ASCENDING",
                        Direction::Descending => "DESCENDING",
                    },
                })
            })
            .collect();
        structured.insert("orderBy".to_string(), JsonValue::Array(orders));
    }

    if let Some(limit) = target.limit() {
        structured.insert("limit".to_string(), json!(limit));
    }

    if let Some(start) = target.start_at() {
        structured.insert("startAt".to_string(), encode_cursor(serializer, start, true));
    }

    if let Some(end) = target.end_at() {
        structured.insert("endAt".to_string(), encode_cursor(serializer, end, false));
    }

    Ok((serializer.resource_name(&parent_path), JsonValue::Object(structured)))
}

fn encode_filter(serializer: &JsonProtoSerializer, filter: &Filter) -> JsonValue {
    match filter {
        Filter::Field(field_filter) => encode_field_filter(serializer, field_filter),
        Filter::Composite { op, filters } => {
            let nested: Vec<_> = filters.iter().map(|filter| encode_filter(serializer, filter)).collect();
            let op = match op {
                CompositeOperator::And => "AND",
                CompositeOperator::Or => "OR",
            };
            json!({ "compositeFilter": { "op": op, "filters": nested } })
        }
    }
}

fn encode_field_filter(serializer: &JsonProtoSerializer, filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field.canonical_string() });

    // Equality against null and NaN travels as a unary filter.
    let unary = match (filter.op, filter.value.kind()) {
        (Operator::Equal, ValueKind::Null) => Some("IS_NULL"),
        (Operator::NotEqual, ValueKind::Null) => Some("IS_NOT_NULL"),
        (Operator::Equal, ValueKind::Double(value)) if value.is_nan() => Some("IS_NAN"),
        (Operator::NotEqual, ValueKind::Double(value)) if value.is_nan() => Some("IS_NOT_NAN"),
        _ => None,
    };
    if let Some(op) = unary {
        return json!({ "unaryFilter": { "field": field, "op": op } });
    }

    json!({
        "fieldFilter": {
            "field": field,
            "op": operator_name(filter.op),
            "value": serializer.encode_value(&filter.value)
        }
    })
}

fn operator_name(op: Operator) -> &'static str {
    match op {
        Operator::LessThan => "LESS_THAN",
        Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
        Operator::Equal => "EQUAL",
        Operator::NotEqual => "NOT_EQUAL",
        Operator::GreaterThan => "GREATER_THAN",
        Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        Operator::ArrayContains => "ARRAY_CONTAINS",
        Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        Operator::In => "IN",
        Operator::NotIn => "NOT_IN",
    }
}

fn encode_cursor(serializer: &JsonProtoSerializer, bound: &Bound, start: bool) -> JsonValue {
    json!({
        "values": bound
            .position
            .iter()
            .map(|value| serializer.encode_value(value))
            .collect::<Vec<_>>(),
        "before": if start { bound.inclusive } else { !bound.inclusive },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{LimitType, Query};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::test_support::{filter, order_by, path, query};

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    #[test]
    fn nested_collection_query() {
        let target = query("rooms/a/messages")
            .with_filter(filter("score", ">", serde_json::json!(3)))
            .with_limit(5, LimitType::First)
            .to_target();
        let (parent, structured) = encode_structured_query(&serializer(), &target).unwrap();
        assert_eq!(parent, "projects/project/databases/(default)/documents/rooms/a");
        assert_eq!(structured["from"][0]["collectionId"], json!("messages"));
        assert_eq!(structured["from"][0]["allDescendants"], json!(false));
        assert_eq!(structured["where"]["fieldFilter"]["op"], json!("GREATER_THAN"));
        assert_eq!(structured["limit"], json!(5));
        // Inequality field plus the implicit key ordering.
        assert_eq!(structured["orderBy"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn collection_group_and_unary_filters() {
        let target = Query::collection_group(path(""), "messages")
            .with_filter(filter("deleted", "==", serde_json::Value::Null))
            .with_order_by(order_by("sent", "desc"))
            .to_target();
        let (parent, structured) = encode_structured_query(&serializer(), &target).unwrap();
        assert_eq!(parent, "projects/project/databases/(default)/documents");
        assert_eq!(structured["from"][0]["allDescendants"], json!(true));
        assert_eq!(structured["where"]["unaryFilter"]["op"], json!("IS_NULL"));
        assert_eq!(structured["orderBy"][0]["direction"], json!("DESCENDING"));
    }
}

use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, ValueKind};

/// Position of a value's type in the cross-type sort order.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::String(_) => 4,
        ValueKind::Bytes(_) => 5,
        ValueKind::Reference(_) => 6,
        ValueKind::GeoPoint(_) => 7,
        ValueKind::Array(_) => 8,
        ValueKind::Map(_) => 9,
    }
}

/// Total order over values. NaN sorts before every other number.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_order = type_order(left);
    let right_order = type_order(right);
    if left_order != right_order {
        return left_order.cmp(&right_order);
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => a.split('/').cmp(b.split('/')),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => compare_doubles(a.latitude(), b.latitude())
            .then_with(|| compare_doubles(a.longitude(), b.longitude())),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values().iter()) {
                let ordering = compare_values(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            for ((lk, lv), (rk, rv)) in a.fields().iter().zip(b.fields().iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.fields().len().cmp(&b.fields().len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality as used by query filters: numbers compare across integer/double, NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            a.values().len() == b.values().len()
                && a.values().iter().zip(b.values().iter()).all(|(l, r)| values_equal(l, r))
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => {
            a.fields().len() == b.fields().len()
                && a.fields().iter().zip(b.fields().iter()).all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        _ => type_order(left) == type_order(right) && compare_values(left, right) == Ordering::Equal,
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    let as_double = integer as f64;
    match as_double.partial_cmp(&double) {
        Some(Ordering::Equal) => {
            // Equal after widening; compare exactly when the double is integral and in range.
            if double >= i64::MIN as f64 && double < i64::MAX as f64 && double.fract() == 0.0 {
                integer.cmp(&(double as i64))
            } else {
                Ordering::Equal
            }
        }
        Some(ordering) => ordering,
        None => Ordering::Equal,
    }
}

/// Stable textual form used to build query and target canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(b) => b.to_string(),
        ValueKind::Integer(i) => i.to_string(),
        ValueKind::Double(d) => format!("{d:?}"),
        ValueKind::Timestamp(t) => format!("time({},{})", t.seconds, t.nanos),
        ValueKind::String(s) => s.clone(),
        ValueKind::Bytes(b) => b.to_base64(),
        ValueKind::Reference(r) => r.clone(),
        ValueKind::GeoPoint(g) => format!("geo({},{})", g.latitude(), g.longitude()),
        ValueKind::Array(a) => {
            let parts: Vec<String> = a.values().iter().map(canonical_id).collect();
            format!("[{}]", parts.join(","))
        }
        ValueKind::Map(m) => {
            let parts: Vec<String> = m
                .fields()
                .iter()
                .map(|(k, v)| format!("{k}:{}", canonical_id(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

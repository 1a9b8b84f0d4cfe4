//! Plan interpretation over in-memory JSON documents.
//!
//! Semantics follow the PostgreSQL engine's `jsonb` behaviour so results are
//! interchangeable: a comparison against a missing field is false, missing
//! sort keys go last ascending and first descending, and values of different
//! JSON types order as `null < string < number < bool < array < object`.

use std::cmp::Ordering;

use document_storage::{Aggregate, Filter, Operation, Path, Projection, SortKey, StorageError};
use serde_json::{Map, Value as Json};

/// Apply `operations` in order to the source documents.
pub(crate) fn execute(
    mut documents: Vec<Json>,
    operations: &[Operation],
) -> Result<Vec<Json>, StorageError> {
    for operation in operations {
        documents = apply(documents, operation);
    }
    Ok(documents)
}

fn apply(documents: Vec<Json>, operation: &Operation) -> Vec<Json> {
    match operation {
        Operation::Filter(filter) => documents
            .into_iter()
            .zip(0_u64..)
            .filter(|(document, index)| matches(filter, document, *index))
            .map(|(document, _)| document)
            .collect(),
        Operation::Select(projection) => documents
            .iter()
            .zip(0_u64..)
            .map(|(document, index)| project(projection, document, index))
            .collect(),
        Operation::SelectMany {
            collection,
            combiner,
        } => {
            let mut flattened = Vec::new();
            for document in &documents {
                let Some(Json::Array(items)) = collection.resolve(document) else {
                    continue;
                };
                for item in items {
                    flattened.push(match combiner {
                        Some(combiner) => combiner.apply(document, item),
                        None => item.clone(),
                    });
                }
            }
            flattened
        }
        Operation::OrderBy(keys) => {
            let mut sorted = documents;
            sorted.sort_by(|a, b| compare_by_keys(keys, a, b));
            sorted
        }
        Operation::Skip(count) => documents
            .into_iter()
            .skip(to_usize(*count))
            .collect(),
        Operation::Take(count) => {
            let mut taken = documents;
            taken.truncate(to_usize(*count));
            taken
        }
        Operation::Distinct(equality) => {
            let mut kept: Vec<Json> = Vec::with_capacity(documents.len());
            for document in documents {
                let seen = kept.iter().any(|existing| match equality {
                    Some(equality) => equality.equals(existing, &document),
                    None => json_equal(existing, &document),
                });
                if !seen {
                    kept.push(document);
                }
            }
            kept
        }
    }
}

fn to_usize(count: u64) -> usize {
    usize::try_from(count).unwrap_or(usize::MAX)
}

fn matches(filter: &Filter, document: &Json, index: u64) -> bool {
    let compare = |field: &Path, value: &document_storage::Value, accept: fn(Ordering) -> bool| {
        field
            .resolve(document)
            .is_some_and(|found| accept(compare_json(found, &value.to_json())))
    };

    match filter {
        Filter::Eq(field, value) => compare(field, value, Ordering::is_eq),
        Filter::Ne(field, value) => compare(field, value, Ordering::is_ne),
        Filter::Gt(field, value) => compare(field, value, Ordering::is_gt),
        Filter::Gte(field, value) => compare(field, value, Ordering::is_ge),
        Filter::Lt(field, value) => compare(field, value, Ordering::is_lt),
        Filter::Lte(field, value) => compare(field, value, Ordering::is_le),
        Filter::In(field, values) => {
            let Json::Array(candidates) = values.to_json() else {
                return false;
            };
            field
                .resolve(document)
                .is_some_and(|found| candidates.iter().any(|c| json_equal(found, c)))
        }
        Filter::IsNull(field) => field.resolve(document).is_none_or(Json::is_null),
        Filter::IsNotNull(field) => field.resolve(document).is_some_and(|v| !v.is_null()),
        Filter::Contains(field, needle) => field
            .resolve(document)
            .and_then(Json::as_str)
            .is_some_and(|s| s.contains(needle.as_str())),
        Filter::StartsWith(field, prefix) => field
            .resolve(document)
            .and_then(Json::as_str)
            .is_some_and(|s| s.starts_with(prefix.as_str())),
        Filter::And(filters) => filters.iter().all(|f| matches(f, document, index)),
        Filter::Or(filters) => filters.iter().any(|f| matches(f, document, index)),
        Filter::Not(inner) => !matches(inner, document, index),
        Filter::Custom(predicate) => predicate.test(document),
        Filter::Indexed(predicate) => predicate.test(document, index),
    }
}

fn project(projection: &Projection, document: &Json, index: u64) -> Json {
    match projection {
        Projection::Field(path) => path.resolve(document).cloned().unwrap_or(Json::Null),
        Projection::Object(fields) => {
            let mut object = Map::with_capacity(fields.len());
            for (alias, path) in fields {
                object.insert(
                    alias.clone(),
                    path.resolve(document).cloned().unwrap_or(Json::Null),
                );
            }
            Json::Object(object)
        }
        Projection::Custom(mapper) => mapper.apply(document),
        Projection::Indexed(mapper) => mapper.apply(document, index),
    }
}

fn compare_by_keys(keys: &[SortKey], a: &Json, b: &Json) -> Ordering {
    for key in keys {
        let left = key.path.resolve(a);
        let right = key.path.resolve(b);
        let ordering = match &key.comparer {
            Some(comparer) => comparer.compare(
                left.unwrap_or(&Json::Null),
                right.unwrap_or(&Json::Null),
            ),
            None => match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(left), Some(right)) => compare_json(left, right),
            },
        };
        let ordering = match key.order {
            document_storage::Order::Asc => ordering,
            document_storage::Order::Desc => ordering.reverse(),
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}

fn type_rank(value: &Json) -> u8 {
    match value {
        Json::Null => 0,
        Json::String(_) => 1,
        Json::Number(_) => 2,
        Json::Bool(_) => 3,
        Json::Array(_) => 4,
        Json::Object(_) => 5,
    }
}

/// Total order over JSON values.
pub(crate) fn compare_json(a: &Json, b: &Json) -> Ordering {
    match (a, b) {
        (Json::Null, Json::Null) => Ordering::Equal,
        (Json::String(a), Json::String(b)) => a.cmp(b),
        (Json::Number(a), Json::Number(b)) => {
            if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
                return a.cmp(&b);
            }
            if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
                return a.cmp(&b);
            }
            let a = a.as_f64().unwrap_or(f64::NAN);
            let b = b.as_f64().unwrap_or(f64::NAN);
            a.total_cmp(&b)
        }
        (Json::Bool(a), Json::Bool(b)) => a.cmp(b),
        (Json::Array(a), Json::Array(b)) => a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .zip(b)
                .map(|(a, b)| compare_json(a, b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        (Json::Object(a), Json::Object(b)) => a.len().cmp(&b.len()).then_with(|| {
            let mut left: Vec<_> = a.iter().collect();
            let mut right: Vec<_> = b.iter().collect();
            left.sort_by(|x, y| x.0.cmp(y.0));
            right.sort_by(|x, y| x.0.cmp(y.0));
            left.into_iter()
                .zip(right)
                .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| compare_json(va, vb)))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        }),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn json_equal(a: &Json, b: &Json) -> bool {
    compare_json(a, b).is_eq()
}

/// Aggregate the non-null values at `field`. `None` when there are none.
pub(crate) fn aggregate(
    documents: &[Json],
    aggregate: Aggregate,
    field: &Path,
) -> Result<Option<Json>, StorageError> {
    let values: Vec<&Json> = documents
        .iter()
        .filter_map(|document| field.resolve(document))
        .filter(|value| !value.is_null())
        .collect();
    if values.is_empty() {
        return Ok(None);
    }

    match aggregate {
        Aggregate::Max => Ok(values.into_iter().max_by(|a, b| compare_json(a, b)).cloned()),
        Aggregate::Min => Ok(values.into_iter().min_by(|a, b| compare_json(a, b)).cloned()),
        Aggregate::Sum => sum(aggregate, field, &values).map(Some),
        Aggregate::Average => {
            let numbers = numeric(aggregate, field, &values)?;
            let mean = numbers.iter().sum::<f64>() / numbers.len() as f64;
            Ok(Some(Json::from(mean)))
        }
    }
}

fn sum(aggregate: Aggregate, field: &Path, values: &[&Json]) -> Result<Json, StorageError> {
    let integers: Option<Vec<i64>> = values.iter().map(|v| v.as_i64()).collect();
    if let Some(total) = integers.and_then(|ints| ints.into_iter().try_fold(0_i64, i64::checked_add)) {
        return Ok(Json::from(total));
    }
    let numbers = numeric(aggregate, field, values)?;
    Ok(Json::from(numbers.into_iter().sum::<f64>()))
}

fn numeric(aggregate: Aggregate, field: &Path, values: &[&Json]) -> Result<Vec<f64>, StorageError> {
    values
        .iter()
        .map(|value| {
            value.as_f64().ok_or_else(|| {
                StorageError::translation(
                    aggregate.name(),
                    format!("non-numeric value {value} at '{field}'"),
                )
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use document_storage::{Comparer, Order};
    use serde_json::json;

    fn docs() -> Vec<Json> {
        vec![
            json!({"id": "a", "v": 3, "tags": ["x", "y"]}),
            json!({"id": "b", "v": -1, "tags": []}),
            json!({"id": "c", "name": "carol"}),
            json!({"id": "d", "v": 3, "name": "dave", "tags": ["z"]}),
        ]
    }

    fn run(operations: Vec<Operation>) -> Vec<Json> {
        execute(docs(), &operations).unwrap()
    }

    fn ids(documents: &[Json]) -> Vec<&str> {
        documents.iter().filter_map(|d| d["id"].as_str()).collect()
    }

    #[test]
    fn test_missing_fields_never_compare() {
        let positive = run(vec![Operation::Filter(Filter::gt("v", 0))]);
        assert_eq!(ids(&positive), vec!["a", "d"]);

        let not_three = run(vec![Operation::Filter(Filter::ne("v", 3))]);
        assert_eq!(ids(&not_three), vec!["b"]);

        let nulls = run(vec![Operation::Filter(Filter::is_null("v"))]);
        assert_eq!(ids(&nulls), vec!["c"]);
    }

    #[test]
    fn test_order_is_stable_and_puts_missing_last() {
        let ascending = run(vec![Operation::OrderBy(vec![SortKey::new("v", Order::Asc, None)])]);
        assert_eq!(ids(&ascending), vec!["b", "a", "d", "c"]);

        let descending = run(vec![Operation::OrderBy(vec![SortKey::new("v", Order::Desc, None)])]);
        assert_eq!(ids(&descending), vec!["c", "a", "d", "b"]);

        let by_name = run(vec![Operation::OrderBy(vec![
            SortKey::new("v", Order::Desc, None),
            SortKey::new("name", Order::Asc, None),
        ])]);
        assert_eq!(ids(&by_name), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_custom_comparer() {
        let by_length = Comparer::new(|a, b| {
            let len = |v: &Json| v.as_str().map_or(0, str::len);
            len(a).cmp(&len(b))
        });
        let sorted = run(vec![Operation::OrderBy(vec![SortKey::new(
            "name",
            Order::Desc,
            Some(by_length),
        )])]);
        assert_eq!(ids(&sorted), vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_select_many_flattens_arrays_only() {
        let tags = run(vec![Operation::SelectMany {
            collection: "tags".into(),
            combiner: None,
        }]);
        assert_eq!(tags, vec![json!("x"), json!("y"), json!("z")]);
    }

    #[test]
    fn test_distinct_keeps_first_occurrence() {
        let values = run(vec![
            Operation::Select(Projection::field("v")),
            Operation::Distinct(None),
        ]);
        assert_eq!(values, vec![json!(3), json!(-1), Json::Null]);
    }

    #[test]
    fn test_numbers_compare_numerically() {
        assert_eq!(compare_json(&json!(1), &json!(1.0)), Ordering::Equal);
        assert_eq!(compare_json(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_json(&json!("10"), &json!(2)), Ordering::Less);
        assert_eq!(compare_json(&Json::Null, &json!("")), Ordering::Less);
    }

    #[test]
    fn test_aggregates_skip_missing_values() {
        let documents = docs();
        let field = Path::new("v");
        assert_eq!(aggregate(&documents, Aggregate::Sum, &field).unwrap(), Some(json!(5)));
        assert_eq!(aggregate(&documents, Aggregate::Max, &field).unwrap(), Some(json!(3)));
        assert_eq!(aggregate(&documents, Aggregate::Min, &field).unwrap(), Some(json!(-1)));
        let mean = aggregate(&documents, Aggregate::Average, &field).unwrap().unwrap();
        assert!((mean.as_f64().unwrap() - 5.0 / 3.0).abs() < 1e-9);

        let missing = Path::new("weight");
        assert_eq!(aggregate(&documents, Aggregate::Sum, &missing).unwrap(), None);

        let names = Path::new("name");
        assert!(matches!(
            aggregate(&documents, Aggregate::Sum, &names),
            Err(StorageError::Translation { operator: "sum", .. })
        ));
    }
}

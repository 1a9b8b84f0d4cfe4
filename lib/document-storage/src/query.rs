//! Backend-neutral query plans.
//!
//! A [`QueryPlan`] is an immutable chain of operator nodes. Every operator
//! appended produces a new plan that points back at its upstream node; the
//! upstream plan is never touched. Engines receive the chain flattened into
//! an ordered list of [`Operation`]s via [`QueryPlan::operations`], which also
//! rejects malformed shapes with [`StorageError::Translation`].

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as Json;

use crate::StorageError;

/// A value that can be compared against a document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Strings(Vec<String>),
    List(Vec<Value>),
    Datetime(DateTime<Utc>),
    Json(Json),
    Null,
}

impl Value {
    /// The JSON form documents are compared against.
    pub fn to_json(&self) -> Json {
        match self {
            Value::String(s) => Json::String(s.clone()),
            Value::Int(n) => Json::from(*n),
            Value::UInt(n) => Json::from(*n),
            Value::Float(n) => Json::from(*n),
            Value::Bool(b) => Json::Bool(*b),
            Value::Strings(v) => Json::Array(v.iter().cloned().map(Json::String).collect()),
            Value::List(v) => Json::Array(v.iter().map(Value::to_json).collect()),
            Value::Datetime(dt) => {
                Json::String(dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
            }
            Value::Json(json) => json.clone(),
            Value::Null => Json::Null,
        }
    }

    fn is_list(&self) -> bool {
        match self {
            Value::Strings(_) | Value::List(_) => true,
            Value::Json(json) => json.is_array(),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Self {
        Value::String(s.clone())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Strings(v)
    }
}

impl<'a> From<Vec<&'a str>> for Value {
    fn from(v: Vec<&'a str>) -> Self {
        Value::Strings(v.into_iter().map(|s| s.to_string()).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::Datetime(dt)
    }
}

impl From<Json> for Value {
    fn from(json: Json) -> Self {
        Value::Json(json)
    }
}

/// A dotted path into a document, e.g. `"owner.name"` or `"tags.0"`.
///
/// The empty path addresses the element itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(String);

impl Path {
    pub fn new(path: impl Into<String>) -> Self {
        Path(path.into())
    }

    /// The path addressing the whole element.
    pub fn root() -> Self {
        Path(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into segments, rejecting empty segments such as `"a..b"`.
    pub fn segments(&self, operator: &'static str) -> Result<Vec<&str>, StorageError> {
        if self.is_root() {
            return Ok(Vec::new());
        }
        let segments: Vec<&str> = self.0.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StorageError::translation(
                operator,
                format!("malformed field path '{}'", self.0),
            ));
        }
        Ok(segments)
    }

    /// Resolve the path against a document. Numeric segments index arrays.
    pub fn resolve<'a>(&self, document: &'a Json) -> Option<&'a Json> {
        if self.is_root() {
            return Some(document);
        }
        self.0.split('.').try_fold(document, |current, segment| match current {
            Json::Object(map) => map.get(segment),
            Json::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::new(s)
    }
}

impl From<String> for Path {
    fn from(s: String) -> Self {
        Path(s)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "<element>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

macro_rules! closure_type {
    ($(#[$meta:meta])* $name:ident, $($sig:tt)*) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<dyn $($sig)* + Send + Sync>);

        impl $name {
            pub fn new(f: impl $($sig)* + Send + Sync + 'static) -> Self {
                $name(Arc::new(f))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(concat!(stringify!($name), "(..)"))
            }
        }
    };
}

closure_type!(
    /// A predicate evaluated by the engine against each element.
    Predicate, Fn(&Json) -> bool
);
closure_type!(
    /// A projection evaluated by the engine against each element.
    Mapper, Fn(&Json) -> Json
);
closure_type!(
    /// A predicate that also sees the element's position in its input.
    IndexedPredicate, Fn(&Json, u64) -> bool
);
closure_type!(
    /// A projection that also sees the element's position in its input.
    IndexedMapper, Fn(&Json, u64) -> Json
);
closure_type!(
    /// Combines a source element with one item of its nested collection.
    Combiner, Fn(&Json, &Json) -> Json
);
closure_type!(
    /// A custom ordering over sort keys.
    Comparer, Fn(&Json, &Json) -> Ordering
);
closure_type!(
    /// A custom equality used for de-duplication.
    Equality, Fn(&Json, &Json) -> bool
);

impl Predicate {
    pub fn test(&self, value: &Json) -> bool {
        (self.0)(value)
    }
}

impl Mapper {
    pub fn apply(&self, value: &Json) -> Json {
        (self.0)(value)
    }
}

impl IndexedPredicate {
    pub fn test(&self, value: &Json, index: u64) -> bool {
        (self.0)(value, index)
    }
}

impl IndexedMapper {
    pub fn apply(&self, value: &Json, index: u64) -> Json {
        (self.0)(value, index)
    }
}

impl Combiner {
    pub fn apply(&self, source: &Json, item: &Json) -> Json {
        (self.0)(source, item)
    }
}

impl Comparer {
    pub fn compare(&self, a: &Json, b: &Json) -> Ordering {
        (self.0)(a, b)
    }
}

impl Equality {
    pub fn equals(&self, a: &Json, b: &Json) -> bool {
        (self.0)(a, b)
    }
}

/// Filter conditions for queries.
#[derive(Debug, Clone)]
pub enum Filter {
    /// field = value
    Eq(Path, Value),
    /// field != value
    Ne(Path, Value),
    /// field > value
    Gt(Path, Value),
    /// field >= value
    Gte(Path, Value),
    /// field < value
    Lt(Path, Value),
    /// field <= value
    Lte(Path, Value),
    /// field IN (values)
    In(Path, Value),
    /// field is missing or JSON null
    IsNull(Path),
    /// field is present and not JSON null
    IsNotNull(Path),
    /// string field contains the substring
    Contains(Path, String),
    /// string field starts with the prefix
    StartsWith(Path, String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Arbitrary predicate; only engines that evaluate in-process can run it.
    Custom(Predicate),
    /// Arbitrary predicate over the element and its zero-based position in
    /// the operator's input.
    Indexed(IndexedPredicate),
}

impl Filter {
    pub fn eq(field: impl Into<Path>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<Path>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<Path>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<Path>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<Path>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<Path>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    pub fn r#in(field: impl Into<Path>, values: impl Into<Value>) -> Self {
        Filter::In(field.into(), values.into())
    }

    pub fn is_null(field: impl Into<Path>) -> Self {
        Filter::IsNull(field.into())
    }

    pub fn is_not_null(field: impl Into<Path>) -> Self {
        Filter::IsNotNull(field.into())
    }

    pub fn contains(field: impl Into<Path>, needle: impl Into<String>) -> Self {
        Filter::Contains(field.into(), needle.into())
    }

    pub fn starts_with(field: impl Into<Path>, prefix: impl Into<String>) -> Self {
        Filter::StartsWith(field.into(), prefix.into())
    }

    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::And(mut filters) => {
                filters.push(other);
                Filter::And(filters)
            }
            first => Filter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut filters) => {
                filters.push(other);
                Filter::Or(filters)
            }
            first => Filter::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    pub fn custom(predicate: impl Fn(&Json) -> bool + Send + Sync + 'static) -> Self {
        Filter::Custom(Predicate::new(predicate))
    }

    pub fn indexed(predicate: impl Fn(&Json, u64) -> bool + Send + Sync + 'static) -> Self {
        Filter::Indexed(IndexedPredicate::new(predicate))
    }

    fn validate(&self) -> Result<(), StorageError> {
        match self {
            Filter::In(field, values) => {
                field.segments("filter")?;
                if !values.is_list() {
                    return Err(StorageError::translation(
                        "filter",
                        format!("IN on '{}' requires a list value", field),
                    ));
                }
                Ok(())
            }
            Filter::Eq(field, _)
            | Filter::Ne(field, _)
            | Filter::Gt(field, _)
            | Filter::Gte(field, _)
            | Filter::Lt(field, _)
            | Filter::Lte(field, _)
            | Filter::IsNull(field)
            | Filter::IsNotNull(field)
            | Filter::Contains(field, _)
            | Filter::StartsWith(field, _) => field.segments("filter").map(|_| ()),
            Filter::And(filters) | Filter::Or(filters) => {
                if filters.is_empty() {
                    return Err(StorageError::translation(
                        "filter",
                        "empty conjunction or disjunction",
                    ));
                }
                filters.iter().try_for_each(Filter::validate)
            }
            Filter::Not(inner) => inner.validate(),
            Filter::Custom(_) | Filter::Indexed(_) => Ok(()),
        }
    }
}

/// What a `select` produces from each element.
#[derive(Debug, Clone)]
pub enum Projection {
    /// The value at a path (the element itself for the root path).
    Field(Path),
    /// An object of `alias -> value at path`.
    Object(Vec<(String, Path)>),
    /// Arbitrary mapping; only engines that evaluate in-process can run it.
    Custom(Mapper),
    /// Arbitrary mapping over the element and its zero-based position.
    Indexed(IndexedMapper),
}

impl Projection {
    pub fn field(path: impl Into<Path>) -> Self {
        Projection::Field(path.into())
    }

    pub fn object<A: Into<String>, P: Into<Path>>(fields: impl IntoIterator<Item = (A, P)>) -> Self {
        Projection::Object(
            fields
                .into_iter()
                .map(|(alias, path)| (alias.into(), path.into()))
                .collect(),
        )
    }

    pub fn custom(mapper: impl Fn(&Json) -> Json + Send + Sync + 'static) -> Self {
        Projection::Custom(Mapper::new(mapper))
    }

    pub fn indexed(mapper: impl Fn(&Json, u64) -> Json + Send + Sync + 'static) -> Self {
        Projection::Indexed(IndexedMapper::new(mapper))
    }
}

impl From<&str> for Projection {
    fn from(path: &str) -> Self {
        Projection::Field(path.into())
    }
}

impl From<Path> for Projection {
    fn from(path: Path) -> Self {
        Projection::Field(path)
    }
}

/// Sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// One key of a (possibly compound) ordering.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub path: Path,
    pub order: Order,
    pub comparer: Option<Comparer>,
}

impl SortKey {
    pub fn new(path: impl Into<Path>, order: Order, comparer: Option<Comparer>) -> Self {
        Self {
            path: path.into(),
            order,
            comparer,
        }
    }
}

/// Aggregates computed over a numeric (or otherwise comparable) projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Average,
    Max,
    Min,
}

impl Aggregate {
    pub fn name(&self) -> &'static str {
        match self {
            Aggregate::Sum => "sum",
            Aggregate::Average => "average",
            Aggregate::Max => "max",
            Aggregate::Min => "min",
        }
    }
}

/// A single step of a flattened plan, applied in order.
#[derive(Debug, Clone)]
pub enum Operation {
    Filter(Filter),
    Select(Projection),
    SelectMany {
        collection: Path,
        combiner: Option<Combiner>,
    },
    /// Stable sort by the keys in priority order.
    OrderBy(Vec<SortKey>),
    Skip(u64),
    Take(u64),
    Distinct(Option<Equality>),
}

impl Operation {
    /// Operator name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Filter(_) => "filter",
            Operation::Select(_) => "select",
            Operation::SelectMany { .. } => "select_many",
            Operation::OrderBy(_) => "order_by",
            Operation::Skip(_) => "skip",
            Operation::Take(_) => "take",
            Operation::Distinct(_) => "distinct",
        }
    }

    fn validate(&self) -> Result<(), StorageError> {
        match self {
            Operation::Filter(filter) => filter.validate(),
            Operation::Select(Projection::Field(path)) => path.segments("select").map(|_| ()),
            Operation::Select(Projection::Object(fields)) => {
                if fields.is_empty() {
                    return Err(StorageError::translation("select", "empty object projection"));
                }
                fields
                    .iter()
                    .try_for_each(|(_, path)| path.segments("select").map(|_| ()))
            }
            Operation::Select(Projection::Custom(_) | Projection::Indexed(_)) => Ok(()),
            Operation::SelectMany { collection, .. } => {
                collection.segments("select_many").map(|_| ())
            }
            Operation::OrderBy(keys) => keys
                .iter()
                .try_for_each(|key| key.path.segments("order_by").map(|_| ())),
            Operation::Skip(_) | Operation::Take(_) | Operation::Distinct(_) => Ok(()),
        }
    }
}

#[derive(Debug)]
enum Step {
    Op(Operation),
    /// Secondary key layered onto the nearest upstream ordering.
    ThenBy(SortKey),
}

#[derive(Debug)]
enum Node {
    Source,
    Step { upstream: Arc<Node>, step: Step },
}

/// An immutable, cheaply clonable query over one collection.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    collection: String,
    head: Arc<Node>,
}

impl QueryPlan {
    /// A plan returning every document of the collection.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            head: Arc::new(Node::Source),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// A new plan with `operation` appended. `self` is unchanged.
    pub fn push(&self, operation: Operation) -> Self {
        self.extend(Step::Op(operation))
    }

    /// A new plan adding a lower-priority key to the latest ordering.
    pub fn then_by(&self, key: SortKey) -> Self {
        self.extend(Step::ThenBy(key))
    }

    fn extend(&self, step: Step) -> Self {
        Self {
            collection: self.collection.clone(),
            head: Arc::new(Node::Step {
                upstream: Arc::clone(&self.head),
                step,
            }),
        }
    }

    /// Flatten the chain into operations in application order and validate
    /// every operator.
    pub fn operations(&self) -> Result<Vec<Operation>, StorageError> {
        let mut steps = Vec::new();
        let mut node = &self.head;
        while let Node::Step { upstream, step } = node.as_ref() {
            steps.push(step);
            node = upstream;
        }

        let mut operations: Vec<Operation> = Vec::with_capacity(steps.len());
        for step in steps.into_iter().rev() {
            match step {
                Step::Op(operation) => {
                    operation.validate()?;
                    operations.push(operation.clone());
                }
                Step::ThenBy(key) => {
                    key.path.segments("then_by")?;
                    match operations.last_mut() {
                        Some(Operation::OrderBy(keys)) => keys.push(key.clone()),
                        _ => {
                            return Err(StorageError::translation(
                                "then_by",
                                "no preceding ordering to extend",
                            ));
                        }
                    }
                }
            }
        }
        Ok(operations)
    }

    /// Operator names in application order, for logging.
    pub fn describe(&self) -> String {
        let mut names = Vec::new();
        let mut node = &self.head;
        while let Node::Step { upstream, step } = node.as_ref() {
            names.push(match step {
                Step::Op(operation) => operation.name(),
                Step::ThenBy(_) => "then_by",
            });
            node = upstream;
        }
        names.reverse();
        if names.is_empty() {
            self.collection.clone()
        } else {
            format!("{} | {}", self.collection, names.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_leaves_upstream_plan_untouched() {
        let base = QueryPlan::new("widgets");
        let filtered = base.push(Operation::Filter(Filter::gt("v", 0)));
        let limited = filtered.push(Operation::Take(2));

        assert!(base.operations().unwrap().is_empty());
        assert_eq!(filtered.operations().unwrap().len(), 1);
        assert_eq!(limited.operations().unwrap().len(), 2);
        assert_eq!(limited.describe(), "widgets | filter | take");
    }

    #[test]
    fn test_then_by_merges_into_preceding_order() {
        let plan = QueryPlan::new("widgets")
            .push(Operation::OrderBy(vec![SortKey::new("a", Order::Asc, None)]))
            .then_by(SortKey::new("b", Order::Desc, None))
            .then_by(SortKey::new("c", Order::Asc, None));

        let operations = plan.operations().unwrap();
        assert_eq!(operations.len(), 1);
        match &operations[0] {
            Operation::OrderBy(keys) => {
                let paths: Vec<&str> = keys.iter().map(|k| k.path.as_str()).collect();
                assert_eq!(paths, vec!["a", "b", "c"]);
                assert_eq!(keys[1].order, Order::Desc);
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn test_malformed_path_is_a_translation_error() {
        let plan = QueryPlan::new("widgets").push(Operation::Filter(Filter::eq("a..b", 1)));
        match plan.operations() {
            Err(StorageError::Translation { operator, .. }) => assert_eq!(operator, "filter"),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_in_requires_list() {
        let plan = QueryPlan::new("widgets").push(Operation::Filter(Filter::r#in("a", 1)));
        assert!(matches!(
            plan.operations(),
            Err(StorageError::Translation { .. })
        ));

        let plan = QueryPlan::new("widgets")
            .push(Operation::Filter(Filter::r#in("a", vec!["x", "y"])));
        assert!(plan.operations().is_ok());
    }

    #[test]
    fn test_path_resolution() {
        let doc = json!({"owner": {"name": "ann"}, "tags": ["x", "y"]});
        assert_eq!(Path::from("owner.name").resolve(&doc), Some(&json!("ann")));
        assert_eq!(Path::from("tags.1").resolve(&doc), Some(&json!("y")));
        assert_eq!(Path::from("missing").resolve(&doc), None);
        assert_eq!(Path::root().resolve(&doc), Some(&doc));
    }

    #[test]
    fn test_filter_combinators_flatten() {
        let filter = Filter::gt("a", 1).and(Filter::lt("a", 5)).and(Filter::ne("b", "x"));
        match filter {
            Filter::And(filters) => assert_eq!(filters.len(), 3),
            other => panic!("unexpected filter {other:?}"),
        }
    }
}

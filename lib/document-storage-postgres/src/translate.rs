//! Query plan translation to PostgreSQL.
//!
//! Documents live in one `documents` table as `jsonb`. A plan becomes a chain
//! of nested selects, each producing `(doc jsonb, ord bigint)`: `doc` is the
//! current element and `ord` its position, so every stage preserves the
//! element order of its source unless it reorders on purpose. Leaf
//! predicates are wrapped in `COALESCE(..., false)` so a missing field makes
//! a comparison false rather than unknown.

use document_storage::{
    Aggregate, Filter, Operation, Order, Path, Projection, SortKey, StorageError,
};
use serde_json::Value as Json;
use sqlx::Arguments;
use sqlx::postgres::PgArguments;

pub(crate) const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS documents (\
     collection TEXT NOT NULL, \
     id TEXT NOT NULL, \
     data JSONB NOT NULL, \
     PRIMARY KEY (collection, id))";

pub(crate) const LOAD: &str = "SELECT data FROM documents WHERE collection = $1 AND id = $2";

pub(crate) const UPSERT: &str = "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3) \
     ON CONFLICT (collection, id) DO UPDATE SET data = EXCLUDED.data";

pub(crate) const DELETE: &str = "DELETE FROM documents WHERE collection = $1 AND id = $2";

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Param {
    Text(String),
    TextArray(Vec<String>),
    Json(Json),
    Int(i64),
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub sql: String,
    pub params: Vec<Param>,
}

impl Statement {
    /// Bind the parameters in order.
    pub(crate) fn arguments(&self) -> Result<PgArguments, StorageError> {
        let mut args = PgArguments::default();
        for param in &self.params {
            match param {
                Param::Text(s) => args.add(s.as_str()),
                Param::TextArray(v) => args.add(v.as_slice()),
                Param::Json(json) => args.add(json),
                Param::Int(n) => args.add(*n),
            }
            .map_err(StorageError::Backend)?;
        }
        Ok(args)
    }
}

/// Accumulates parameters while stages are rendered.
struct Builder {
    params: Vec<Param>,
}

impl Builder {
    fn new() -> Self {
        Self { params: Vec::new() }
    }

    fn param(&mut self, param: Param) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn path(&mut self, path: &Path, operator: &'static str) -> Result<String, StorageError> {
        let segments = path
            .segments(operator)?
            .into_iter()
            .map(str::to_string)
            .collect();
        Ok(self.param(Param::TextArray(segments)))
    }

    fn count(&mut self, count: u64) -> String {
        self.param(Param::Int(i64::try_from(count).unwrap_or(i64::MAX)))
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }

    /// Render the stages of `operations` over `collection` as one subquery.
    fn source(&mut self, collection: &str, operations: &[Operation]) -> Result<String, StorageError> {
        let collection = self.param(Param::Text(collection.to_string()));
        let mut sql = format!(
            "SELECT data AS doc, row_number() OVER (ORDER BY id) AS ord \
             FROM documents WHERE collection = {collection}"
        );
        for operation in operations {
            sql = self.stage(sql, operation)?;
        }
        Ok(sql)
    }

    fn stage(&mut self, upstream: String, operation: &Operation) -> Result<String, StorageError> {
        let sql = match operation {
            Operation::Filter(filter) => {
                let condition = self.condition(filter)?;
                format!("SELECT s.doc, s.ord FROM ({upstream}) AS s WHERE {condition}")
            }
            Operation::Select(projection) => {
                let value = self.projection(projection)?;
                format!("SELECT {value} AS doc, s.ord FROM ({upstream}) AS s")
            }
            Operation::SelectMany {
                collection,
                combiner,
            } => {
                if combiner.is_some() {
                    return Err(StorageError::translation(
                        "select_many",
                        "custom result combiners cannot be expressed in SQL",
                    ));
                }
                let path = self.path(collection, "select_many")?;
                format!(
                    "SELECT e.item AS doc, row_number() OVER (ORDER BY s.ord, e.n) AS ord \
                     FROM ({upstream}) AS s CROSS JOIN LATERAL jsonb_array_elements(\
                     CASE WHEN jsonb_typeof(s.doc #> {path}) = 'array' \
                     THEN s.doc #> {path} ELSE '[]'::jsonb END) \
                     WITH ORDINALITY AS e(item, n)"
                )
            }
            Operation::OrderBy(keys) => {
                let keys = self.sort_keys(keys)?;
                format!(
                    "SELECT s.doc, row_number() OVER (ORDER BY {keys}, s.ord) AS ord \
                     FROM ({upstream}) AS s"
                )
            }
            Operation::Skip(count) => {
                let count = self.count(*count);
                format!("SELECT s.doc, s.ord FROM ({upstream}) AS s ORDER BY s.ord OFFSET {count}")
            }
            Operation::Take(count) => {
                let count = self.count(*count);
                format!("SELECT s.doc, s.ord FROM ({upstream}) AS s ORDER BY s.ord LIMIT {count}")
            }
            Operation::Distinct(equality) => {
                if equality.is_some() {
                    return Err(StorageError::UnsupportedComparer {
                        operator: "distinct",
                    });
                }
                format!("SELECT s.doc, min(s.ord) AS ord FROM ({upstream}) AS s GROUP BY s.doc")
            }
        };
        Ok(sql)
    }

    fn sort_keys(&mut self, keys: &[SortKey]) -> Result<String, StorageError> {
        let mut rendered = Vec::with_capacity(keys.len());
        for key in keys {
            if key.comparer.is_some() {
                return Err(StorageError::UnsupportedComparer {
                    operator: "order_by",
                });
            }
            let path = self.path(&key.path, "order_by")?;
            let direction = match key.order {
                Order::Asc => "ASC NULLS LAST",
                Order::Desc => "DESC NULLS FIRST",
            };
            rendered.push(format!("s.doc #> {path} {direction}"));
        }
        Ok(rendered.join(", "))
    }

    fn projection(&mut self, projection: &Projection) -> Result<String, StorageError> {
        match projection {
            Projection::Field(path) => {
                let path = self.path(path, "select")?;
                Ok(format!("COALESCE(s.doc #> {path}, 'null'::jsonb)"))
            }
            Projection::Object(fields) => {
                let mut pairs = Vec::with_capacity(fields.len());
                for (alias, path) in fields {
                    let alias = self.param(Param::Text(alias.clone()));
                    let path = self.path(path, "select")?;
                    pairs.push(format!(
                        "{alias}::text, COALESCE(s.doc #> {path}, 'null'::jsonb)"
                    ));
                }
                Ok(format!("jsonb_build_object({})", pairs.join(", ")))
            }
            Projection::Custom(_) | Projection::Indexed(_) => Err(StorageError::translation(
                "select",
                "custom projections cannot be expressed in SQL",
            )),
        }
    }

    fn condition(&mut self, filter: &Filter) -> Result<String, StorageError> {
        let comparison = |builder: &mut Self, field: &Path, value: &document_storage::Value, op: &str| {
            let path = builder.path(field, "filter")?;
            let value = builder.param(Param::Json(value.to_json()));
            Ok::<_, StorageError>(format!("COALESCE(s.doc #> {path} {op} {value}::jsonb, false)"))
        };

        match filter {
            Filter::Eq(field, value) => comparison(self, field, value, "="),
            Filter::Ne(field, value) => comparison(self, field, value, "<>"),
            Filter::Gt(field, value) => comparison(self, field, value, ">"),
            Filter::Gte(field, value) => comparison(self, field, value, ">="),
            Filter::Lt(field, value) => comparison(self, field, value, "<"),
            Filter::Lte(field, value) => comparison(self, field, value, "<="),
            Filter::In(field, values) => {
                let path = self.path(field, "filter")?;
                let values = self.param(Param::Json(values.to_json()));
                Ok(format!(
                    "COALESCE(s.doc #> {path} IS NOT NULL \
                     AND {values}::jsonb @> jsonb_build_array(s.doc #> {path}), false)"
                ))
            }
            Filter::IsNull(field) => {
                let path = self.path(field, "filter")?;
                Ok(format!("COALESCE(s.doc #> {path}, 'null'::jsonb) = 'null'::jsonb"))
            }
            Filter::IsNotNull(field) => {
                let path = self.path(field, "filter")?;
                Ok(format!("COALESCE(s.doc #> {path}, 'null'::jsonb) <> 'null'::jsonb"))
            }
            Filter::Contains(field, needle) => {
                let path = self.path(field, "filter")?;
                let needle = self.param(Param::Text(needle.clone()));
                Ok(format!(
                    "COALESCE(jsonb_typeof(s.doc #> {path}) = 'string' \
                     AND strpos(s.doc #>> {path}, {needle}) > 0, false)"
                ))
            }
            Filter::StartsWith(field, prefix) => {
                let path = self.path(field, "filter")?;
                let prefix = self.param(Param::Text(prefix.clone()));
                Ok(format!(
                    "COALESCE(jsonb_typeof(s.doc #> {path}) = 'string' \
                     AND starts_with(s.doc #>> {path}, {prefix}), false)"
                ))
            }
            Filter::And(filters) => self.junction(filters, " AND "),
            Filter::Or(filters) => self.junction(filters, " OR "),
            Filter::Not(inner) => Ok(format!("NOT ({})", self.condition(inner)?)),
            Filter::Custom(_) | Filter::Indexed(_) => Err(StorageError::translation(
                "filter",
                "custom predicates cannot be expressed in SQL",
            )),
        }
    }

    fn junction(&mut self, filters: &[Filter], separator: &str) -> Result<String, StorageError> {
        let parts = filters
            .iter()
            .map(|filter| self.condition(filter))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(format!("({})", parts.join(separator)))
    }
}

/// All elements in order.
pub(crate) fn fetch(collection: &str, operations: &[Operation]) -> Result<Statement, StorageError> {
    let mut builder = Builder::new();
    let source = builder.source(collection, operations)?;
    Ok(builder.finish(format!("SELECT q.doc FROM ({source}) AS q ORDER BY q.ord")))
}

/// Number of elements as `bigint`.
pub(crate) fn count(collection: &str, operations: &[Operation]) -> Result<Statement, StorageError> {
    let mut builder = Builder::new();
    let source = builder.source(collection, operations)?;
    Ok(builder.finish(format!("SELECT count(*) FROM ({source}) AS q")))
}

/// One page of elements, each row carrying the total element count.
pub(crate) fn page(
    collection: &str,
    operations: &[Operation],
    offset: u64,
    limit: u64,
) -> Result<Statement, StorageError> {
    let mut builder = Builder::new();
    let source = builder.source(collection, operations)?;
    let offset = builder.count(offset);
    let limit = builder.count(limit);
    Ok(builder.finish(format!(
        "SELECT q.doc, count(*) OVER () AS total FROM ({source}) AS q \
         ORDER BY q.ord OFFSET {offset} LIMIT {limit}"
    )))
}

/// A single-row aggregate. Sum and average come back as `numeric` text,
/// max and min as `jsonb`.
pub(crate) fn aggregate(
    collection: &str,
    operations: &[Operation],
    aggregate: Aggregate,
    field: &Path,
) -> Result<Statement, StorageError> {
    let mut builder = Builder::new();
    let source = builder.source(collection, operations)?;
    let path = builder.path(field, aggregate.name())?;
    let present = format!("q.doc #> {path} IS NOT NULL AND q.doc #> {path} <> 'null'::jsonb");

    let sql = match aggregate {
        Aggregate::Sum | Aggregate::Average => {
            let function = if aggregate == Aggregate::Sum { "sum" } else { "avg" };
            format!(
                "SELECT {function}((q.doc #> {path})::numeric)::text \
                 FROM ({source}) AS q WHERE {present}"
            )
        }
        Aggregate::Max | Aggregate::Min => {
            let direction = if aggregate == Aggregate::Max { "DESC" } else { "ASC" };
            format!(
                "SELECT q.doc #> {path} FROM ({source}) AS q WHERE {present} \
                 ORDER BY q.doc #> {path} {direction} LIMIT 1"
            )
        }
    };
    Ok(builder.finish(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use document_storage::{Comparer, QueryPlan};
    use serde_json::json;

    fn operations(plan: QueryPlan) -> Vec<Operation> {
        plan.operations().unwrap()
    }

    #[test]
    fn test_source_only() {
        let statement = fetch("widgets", &[]).unwrap();
        assert_eq!(
            statement.sql,
            "SELECT q.doc FROM (SELECT data AS doc, row_number() OVER (ORDER BY id) AS ord \
             FROM documents WHERE collection = $1) AS q ORDER BY q.ord"
        );
        assert_eq!(statement.params, vec![Param::Text("widgets".into())]);
    }

    #[test]
    fn test_filter_order_skip_take() {
        let plan = QueryPlan::new("widgets")
            .push(Operation::Filter(Filter::gt("v", 0)))
            .push(Operation::OrderBy(vec![SortKey::new("v", Order::Asc, None)]))
            .then_by(SortKey::new("name", Order::Desc, None))
            .push(Operation::Skip(1))
            .push(Operation::Take(2));
        let statement = fetch("widgets", &operations(plan)).unwrap();

        assert!(statement.sql.contains("WHERE COALESCE(s.doc #> $2 > $3::jsonb, false)"));
        assert!(statement.sql.contains(
            "row_number() OVER (ORDER BY s.doc #> $4 ASC NULLS LAST, s.doc #> $5 DESC NULLS FIRST, s.ord)"
        ));
        assert!(statement.sql.contains("ORDER BY s.ord OFFSET $6"));
        assert!(statement.sql.contains("ORDER BY s.ord LIMIT $7"));
        assert!(statement.sql.ends_with("AS q ORDER BY q.ord"));
        assert_eq!(
            statement.params,
            vec![
                Param::Text("widgets".into()),
                Param::TextArray(vec!["v".into()]),
                Param::Json(json!(0)),
                Param::TextArray(vec!["v".into()]),
                Param::TextArray(vec!["name".into()]),
                Param::Int(1),
                Param::Int(2),
            ]
        );
    }

    #[test]
    fn test_nested_paths_and_whole_element() {
        let plan = QueryPlan::new("widgets")
            .push(Operation::Select(Projection::field("owner.name")))
            .push(Operation::OrderBy(vec![SortKey::new(Path::root(), Order::Desc, None)]));
        let statement = fetch("widgets", &operations(plan)).unwrap();

        assert!(statement.sql.contains("SELECT COALESCE(s.doc #> $2, 'null'::jsonb) AS doc"));
        assert_eq!(statement.params[1], Param::TextArray(vec!["owner".into(), "name".into()]));
        assert_eq!(statement.params[2], Param::TextArray(vec![]));
    }

    #[test]
    fn test_boolean_filters() {
        let filter = Filter::eq("a", 1)
            .or(Filter::r#in("b", vec!["x", "y"]))
            .not();
        let plan = QueryPlan::new("widgets").push(Operation::Filter(filter));
        let statement = count("widgets", &operations(plan)).unwrap();

        assert!(statement.sql.starts_with("SELECT count(*) FROM ("));
        assert!(statement.sql.contains(
            "WHERE NOT ((COALESCE(s.doc #> $2 = $3::jsonb, false) OR \
             COALESCE(s.doc #> $4 IS NOT NULL AND $5::jsonb @> jsonb_build_array(s.doc #> $4), false)))"
        ));
        assert_eq!(statement.params[4], Param::Json(json!(["x", "y"])));
    }

    #[test]
    fn test_page_binds_offset_and_limit_last() {
        let statement = page("widgets", &[], 6, 3).unwrap();
        assert!(statement.sql.contains("count(*) OVER () AS total"));
        assert!(statement.sql.ends_with("ORDER BY q.ord OFFSET $2 LIMIT $3"));
        assert_eq!(&statement.params[1..], &[Param::Int(6), Param::Int(3)]);
    }

    #[test]
    fn test_aggregates() {
        let sum = aggregate("widgets", &[], Aggregate::Sum, &Path::new("v")).unwrap();
        assert!(sum.sql.starts_with("SELECT sum((q.doc #> $2)::numeric)::text"));

        let max = aggregate("widgets", &[], Aggregate::Max, &Path::new("v")).unwrap();
        assert!(max.sql.ends_with("ORDER BY q.doc #> $2 DESC LIMIT 1"));
    }

    #[test]
    fn test_select_many_and_distinct() {
        let plan = QueryPlan::new("widgets")
            .push(Operation::SelectMany {
                collection: "tags".into(),
                combiner: None,
            })
            .push(Operation::Distinct(None));
        let statement = fetch("widgets", &operations(plan)).unwrap();

        assert!(statement.sql.contains("jsonb_array_elements("));
        assert!(statement.sql.contains("WITH ORDINALITY AS e(item, n)"));
        assert!(statement.sql.contains("GROUP BY s.doc"));
    }

    #[test]
    fn test_custom_closures_are_rejected() {
        let custom_filter = QueryPlan::new("widgets").push(Operation::Filter(Filter::custom(|_| true)));
        assert!(matches!(
            fetch("widgets", &operations(custom_filter)),
            Err(StorageError::Translation { operator: "filter", .. })
        ));

        let custom_select =
            QueryPlan::new("widgets").push(Operation::Select(Projection::custom(|d| d.clone())));
        assert!(matches!(
            fetch("widgets", &operations(custom_select)),
            Err(StorageError::Translation { operator: "select", .. })
        ));

        let indexed_filter = QueryPlan::new("widgets")
            .push(Operation::Filter(Filter::gt("v", 0).and(Filter::indexed(|_, i| i < 3))));
        assert!(matches!(
            fetch("widgets", &operations(indexed_filter)),
            Err(StorageError::Translation { operator: "filter", .. })
        ));

        let indexed_select = QueryPlan::new("widgets")
            .push(Operation::Select(Projection::indexed(|_, i| serde_json::json!(i))));
        assert!(matches!(
            fetch("widgets", &operations(indexed_select)),
            Err(StorageError::Translation { operator: "select", .. })
        ));

        let comparer = Comparer::new(|a, b| a.to_string().cmp(&b.to_string()));
        let custom_order = QueryPlan::new("widgets").push(Operation::OrderBy(vec![SortKey::new(
            "v",
            Order::Asc,
            Some(comparer),
        )]));
        assert!(matches!(
            fetch("widgets", &operations(custom_order)),
            Err(StorageError::UnsupportedComparer { operator: "order_by" })
        ));

        let custom_distinct = QueryPlan::new("widgets").push(Operation::Distinct(Some(
            document_storage::Equality::new(|a, b| a == b),
        )));
        assert!(matches!(
            count("widgets", &operations(custom_distinct)),
            Err(StorageError::UnsupportedComparer { operator: "distinct" })
        ));
    }
}

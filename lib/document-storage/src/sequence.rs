//! Lazy, composable query sequences.
//!
//! Transformations consume the sequence and return a new one wrapping an
//! extended [`QueryPlan`]; nothing reaches the engine until a materializing
//! operation (`to_list`, `count`, `get_page`, ...) runs. The engine session
//! moves along the chain and is released when the last sequence is dropped
//! or [`close`](QueryableSequence::close)d.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut, Range};

use futures_util::{Stream, StreamExt, stream};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use tracing::debug;

use crate::{
    Aggregate, Combiner, Comparer, Equality, Filter, Operation, Order, PagedResult, Path,
    Projection, QueryPlan, QuerySession, SortKey, StorageError,
};

/// A lazily evaluated query over elements of type `T`.
pub struct QueryableSequence<T> {
    session: Box<dyn QuerySession>,
    plan: QueryPlan,
    _marker: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for QueryableSequence<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryableSequence")
            .field("plan", &self.plan.describe())
            .finish_non_exhaustive()
    }
}

impl<T> QueryableSequence<T> {
    /// Wrap an engine session with a plan over `collection`.
    pub fn new(session: Box<dyn QuerySession>, collection: impl Into<String>) -> Self {
        Self::from_plan(session, QueryPlan::new(collection))
    }

    fn from_plan(session: Box<dyn QuerySession>, plan: QueryPlan) -> Self {
        Self {
            session,
            plan,
            _marker: PhantomData,
        }
    }

    fn with<U>(self, operation: Operation) -> QueryableSequence<U> {
        let plan = self.plan.push(operation);
        QueryableSequence::from_plan(self.session, plan)
    }

    fn ordered(self, key: SortKey) -> OrderedQueryableSequence<T> {
        OrderedQueryableSequence {
            inner: self.with(Operation::OrderBy(vec![key])),
        }
    }

    /// The plan this sequence will execute.
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Keep elements matching `filter`.
    pub fn filter(self, filter: Filter) -> Self {
        self.with(Operation::Filter(filter))
    }

    /// Project each element; source order is preserved.
    pub fn select<U>(self, projection: impl Into<Projection>) -> QueryableSequence<U> {
        self.with(Operation::Select(projection.into()))
    }

    /// Flatten the array at `collection` of each element.
    pub fn select_many<U>(self, collection: impl Into<Path>) -> QueryableSequence<U> {
        self.with(Operation::SelectMany {
            collection: collection.into(),
            combiner: None,
        })
    }

    /// Flatten the array at `collection`, combining each item with its source element.
    pub fn select_many_with<U>(
        self,
        collection: impl Into<Path>,
        combiner: impl Fn(&Json, &Json) -> Json + Send + Sync + 'static,
    ) -> QueryableSequence<U> {
        self.with(Operation::SelectMany {
            collection: collection.into(),
            combiner: Some(Combiner::new(combiner)),
        })
    }

    /// Flatten the array `selector` returns for each element and its
    /// zero-based position. Non-array results contribute nothing.
    pub fn select_many_indexed<U>(
        self,
        selector: impl Fn(&Json, u64) -> Json + Send + Sync + 'static,
    ) -> QueryableSequence<U> {
        self.select::<Json>(Projection::indexed(selector))
            .select_many(Path::root())
    }

    /// Order by the element itself.
    pub fn order(self) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(Path::root(), Order::Asc, None))
    }

    pub fn order_with(self, comparer: Comparer) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(Path::root(), Order::Asc, Some(comparer)))
    }

    pub fn order_descending(self) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(Path::root(), Order::Desc, None))
    }

    pub fn order_descending_with(self, comparer: Comparer) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(Path::root(), Order::Desc, Some(comparer)))
    }

    pub fn order_by(self, key: impl Into<Path>) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(key, Order::Asc, None))
    }

    pub fn order_by_with(self, key: impl Into<Path>, comparer: Comparer) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(key, Order::Asc, Some(comparer)))
    }

    pub fn order_by_descending(self, key: impl Into<Path>) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(key, Order::Desc, None))
    }

    pub fn order_by_descending_with(
        self,
        key: impl Into<Path>,
        comparer: Comparer,
    ) -> OrderedQueryableSequence<T> {
        self.ordered(SortKey::new(key, Order::Desc, Some(comparer)))
    }

    /// Bypass the first `count` elements.
    pub fn skip(self, count: u64) -> Self {
        self.with(Operation::Skip(count))
    }

    /// Return at most `count` elements.
    pub fn take(self, count: u64) -> Self {
        self.with(Operation::Take(count))
    }

    /// Elements at offsets `range.start..range.end`; an inverted range is empty.
    pub fn take_range(self, range: Range<u64>) -> Self {
        let count = range.end.saturating_sub(range.start);
        self.skip(range.start).take(count)
    }

    /// Remove duplicate elements, keeping the first occurrence.
    pub fn distinct(self) -> Self {
        self.with(Operation::Distinct(None))
    }

    pub fn distinct_by(self, equality: Equality) -> Self {
        self.with(Operation::Distinct(Some(equality)))
    }

    /// Release the engine session.
    pub async fn close(self) -> Result<(), StorageError> {
        debug!(plan = %self.plan.describe(), "closing query session");
        self.session.close().await
    }
}

impl<T: DeserializeOwned> QueryableSequence<T> {
    async fn fetch_plan(&mut self, plan: &QueryPlan) -> Result<Vec<T>, StorageError> {
        debug!(plan = %plan.describe(), "executing query");
        let documents = self.session.fetch(plan).await?;
        documents
            .into_iter()
            .map(|document| serde_json::from_value(document).map_err(StorageError::from))
            .collect()
    }

    async fn fetch_at_most(
        &mut self,
        filter: Option<Filter>,
        limit: u64,
    ) -> Result<Vec<T>, StorageError> {
        let mut plan = self.plan.clone();
        if let Some(filter) = filter {
            plan = plan.push(Operation::Filter(filter));
        }
        let plan = plan.push(Operation::Take(limit));
        self.fetch_plan(&plan).await
    }

    async fn count_plan(&mut self, filter: Option<Filter>) -> Result<u64, StorageError> {
        let plan = match filter {
            Some(filter) => self.plan.push(Operation::Filter(filter)),
            None => self.plan.clone(),
        };
        debug!(plan = %plan.describe(), "counting query");
        self.session.count(&plan).await
    }

    /// Execute the query and collect every element.
    pub async fn to_list(&mut self) -> Result<Vec<T>, StorageError> {
        let plan = self.plan.clone();
        self.fetch_plan(&plan).await
    }

    /// Execute the query lazily as a stream of elements.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<T, StorageError>> + Send
    where
        T: Send + 'static,
    {
        stream::once(async move { self.to_list().await })
            .map(|result| match result {
                Ok(items) => stream::iter(items.into_iter().map(Ok::<T, StorageError>)).left_stream(),
                Err(err) => stream::iter(std::iter::once(Err(err))).right_stream(),
            })
            .flatten()
    }

    /// The first element; an empty sequence is a cardinality error.
    pub async fn first(&mut self) -> Result<T, StorageError> {
        self.first_or_default()
            .await?
            .ok_or_else(|| no_elements("first"))
    }

    pub async fn first_where(&mut self, filter: Filter) -> Result<T, StorageError> {
        self.first_or_default_where(filter)
            .await?
            .ok_or_else(|| no_elements("first"))
    }

    /// The first element, or `None` for an empty sequence.
    pub async fn first_or_default(&mut self) -> Result<Option<T>, StorageError> {
        Ok(self.fetch_at_most(None, 1).await?.into_iter().next())
    }

    pub async fn first_or_default_where(&mut self, filter: Filter) -> Result<Option<T>, StorageError> {
        Ok(self.fetch_at_most(Some(filter), 1).await?.into_iter().next())
    }

    /// The only element. Fails when the sequence is empty or has more than one.
    pub async fn single(&mut self) -> Result<T, StorageError> {
        self.single_or_default()
            .await?
            .ok_or_else(|| no_elements("single"))
    }

    pub async fn single_where(&mut self, filter: Filter) -> Result<T, StorageError> {
        self.single_or_default_where(filter)
            .await?
            .ok_or_else(|| no_elements("single"))
    }

    /// The only element, or `None` when empty. More than one is an error.
    pub async fn single_or_default(&mut self) -> Result<Option<T>, StorageError> {
        let items = self.fetch_at_most(None, 2).await?;
        at_most_one(items)
    }

    pub async fn single_or_default_where(&mut self, filter: Filter) -> Result<Option<T>, StorageError> {
        let items = self.fetch_at_most(Some(filter), 2).await?;
        at_most_one(items)
    }

    /// Number of elements, failing with a range error past `i32::MAX`.
    pub async fn count(&mut self) -> Result<i32, StorageError> {
        let count = self.count_plan(None).await?;
        narrow("count", count)
    }

    pub async fn count_where(&mut self, filter: Filter) -> Result<i32, StorageError> {
        let count = self.count_plan(Some(filter)).await?;
        narrow("count", count)
    }

    /// Number of elements as a 64-bit count.
    pub async fn long_count(&mut self) -> Result<i64, StorageError> {
        let count = self.count_plan(None).await?;
        narrow("long_count", count)
    }

    pub async fn long_count_where(&mut self, filter: Filter) -> Result<i64, StorageError> {
        let count = self.count_plan(Some(filter)).await?;
        narrow("long_count", count)
    }

    /// The count, computed without enumerating. Always succeeds for engines
    /// that can count on the server.
    pub async fn try_get_non_enumerated_count(&mut self) -> Result<(bool, i32), StorageError> {
        Ok((true, self.count().await?))
    }

    pub async fn try_get_non_enumerated_long_count(&mut self) -> Result<(bool, i64), StorageError> {
        Ok((true, self.long_count().await?))
    }

    /// Whether the sequence has any element.
    pub async fn any(&mut self) -> Result<bool, StorageError> {
        Ok(!self.fetch_at_most(None, 1).await?.is_empty())
    }

    pub async fn any_where(&mut self, filter: Filter) -> Result<bool, StorageError> {
        Ok(!self.fetch_at_most(Some(filter), 1).await?.is_empty())
    }

    async fn aggregate(
        &mut self,
        aggregate: Aggregate,
        field: Path,
    ) -> Result<Option<Json>, StorageError> {
        debug!(plan = %self.plan.describe(), aggregate = aggregate.name(), %field, "aggregating query");
        field.segments(aggregate.name())?;
        self.session.aggregate(&self.plan, aggregate, &field).await
    }

    /// Sum of the numeric values at `field`; zero when there are none.
    pub async fn sum<N>(&mut self, field: impl Into<Path>) -> Result<N, StorageError>
    where
        N: DeserializeOwned + Default,
    {
        match self.aggregate(Aggregate::Sum, field.into()).await? {
            Some(total) => Ok(serde_json::from_value(total)?),
            None => Ok(N::default()),
        }
    }

    /// Mean of the numeric values at `field`; `None` when there are none.
    pub async fn average(&mut self, field: impl Into<Path>) -> Result<Option<f64>, StorageError> {
        let mean = self.aggregate(Aggregate::Average, field.into()).await?;
        mean.map(|value| {
            value.as_f64().ok_or_else(|| {
                StorageError::translation("average", format!("non-numeric result {value}"))
            })
        })
        .transpose()
    }

    /// Largest value at `field`; `None` when there are none.
    pub async fn max<N: DeserializeOwned>(&mut self, field: impl Into<Path>) -> Result<Option<N>, StorageError> {
        let value = self.aggregate(Aggregate::Max, field.into()).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Smallest value at `field`; `None` when there are none.
    pub async fn min<N: DeserializeOwned>(&mut self, field: impl Into<Path>) -> Result<Option<N>, StorageError> {
        let value = self.aggregate(Aggregate::Min, field.into()).await?;
        Ok(value.map(serde_json::from_value).transpose()?)
    }

    /// Materialize page `page_number` (1-based) of `page_size` elements.
    pub async fn get_page(
        &mut self,
        page_number: u64,
        page_size: u64,
    ) -> Result<PagedResult<T>, StorageError> {
        if page_size == 0 {
            return Err(StorageError::InvalidArgument(
                "page size must be at least 1".to_string(),
            ));
        }
        if page_number == 0 {
            return Err(StorageError::InvalidArgument(
                "page number is 1-based".to_string(),
            ));
        }
        let offset = (page_number - 1).checked_mul(page_size).ok_or_else(|| {
            StorageError::InvalidArgument(format!(
                "page {page_number} of size {page_size} is out of range"
            ))
        })?;

        debug!(plan = %self.plan.describe(), page_number, page_size, "fetching page");
        let slice = self.session.fetch_page(&self.plan, offset, page_size).await?;
        PagedResult::from_slice(slice, page_number, page_size)
    }
}

fn no_elements(operator: &'static str) -> StorageError {
    StorageError::Cardinality {
        operator,
        reason: "sequence contains no elements".to_string(),
    }
}

fn at_most_one<T>(items: Vec<T>) -> Result<Option<T>, StorageError> {
    if items.len() > 1 {
        return Err(StorageError::Cardinality {
            operator: "single",
            reason: "sequence contains more than one element".to_string(),
        });
    }
    Ok(items.into_iter().next())
}

fn narrow<N: TryFrom<u64>>(operator: &'static str, count: u64) -> Result<N, StorageError>
where
    N: Bounded,
{
    N::try_from(count).map_err(|_| StorageError::Range {
        operator,
        count,
        limit: N::MAX_COUNT,
    })
}

trait Bounded {
    const MAX_COUNT: u64;
}

impl Bounded for i32 {
    const MAX_COUNT: u64 = i32::MAX as u64;
}

impl Bounded for i64 {
    const MAX_COUNT: u64 = i64::MAX as u64;
}

/// A [`QueryableSequence`] after an ordering, accepting secondary keys.
///
/// Materializing operations are available through `Deref`.
#[derive(Debug)]
pub struct OrderedQueryableSequence<T> {
    inner: QueryableSequence<T>,
}

impl<T> OrderedQueryableSequence<T> {
    fn then(self, key: SortKey) -> Self {
        let plan = self.inner.plan.then_by(key);
        Self {
            inner: QueryableSequence::from_plan(self.inner.session, plan),
        }
    }

    /// Break ties of the existing ordering by `key`, ascending.
    pub fn then_by(self, key: impl Into<Path>) -> Self {
        self.then(SortKey::new(key, Order::Asc, None))
    }

    pub fn then_by_with(self, key: impl Into<Path>, comparer: Comparer) -> Self {
        self.then(SortKey::new(key, Order::Asc, Some(comparer)))
    }

    pub fn then_by_descending(self, key: impl Into<Path>) -> Self {
        self.then(SortKey::new(key, Order::Desc, None))
    }

    pub fn then_by_descending_with(self, key: impl Into<Path>, comparer: Comparer) -> Self {
        self.then(SortKey::new(key, Order::Desc, Some(comparer)))
    }

    /// Continue with the unordered operator set.
    pub fn into_inner(self) -> QueryableSequence<T> {
        self.inner
    }

    pub fn filter(self, filter: Filter) -> QueryableSequence<T> {
        self.inner.filter(filter)
    }

    pub fn select<U>(self, projection: impl Into<Projection>) -> QueryableSequence<U> {
        self.inner.select(projection)
    }

    pub fn select_many<U>(self, collection: impl Into<Path>) -> QueryableSequence<U> {
        self.inner.select_many(collection)
    }

    pub fn select_many_with<U>(
        self,
        collection: impl Into<Path>,
        combiner: impl Fn(&Json, &Json) -> Json + Send + Sync + 'static,
    ) -> QueryableSequence<U> {
        self.inner.select_many_with(collection, combiner)
    }

    pub fn select_many_indexed<U>(
        self,
        selector: impl Fn(&Json, u64) -> Json + Send + Sync + 'static,
    ) -> QueryableSequence<U> {
        self.inner.select_many_indexed(selector)
    }

    /// Re-sort by a new ordering; ties keep the current order.
    pub fn order(self) -> OrderedQueryableSequence<T> {
        self.inner.order()
    }

    pub fn order_with(self, comparer: Comparer) -> OrderedQueryableSequence<T> {
        self.inner.order_with(comparer)
    }

    pub fn order_descending(self) -> OrderedQueryableSequence<T> {
        self.inner.order_descending()
    }

    pub fn order_descending_with(self, comparer: Comparer) -> OrderedQueryableSequence<T> {
        self.inner.order_descending_with(comparer)
    }

    pub fn order_by(self, key: impl Into<Path>) -> OrderedQueryableSequence<T> {
        self.inner.order_by(key)
    }

    pub fn order_by_with(self, key: impl Into<Path>, comparer: Comparer) -> OrderedQueryableSequence<T> {
        self.inner.order_by_with(key, comparer)
    }

    pub fn order_by_descending(self, key: impl Into<Path>) -> OrderedQueryableSequence<T> {
        self.inner.order_by_descending(key)
    }

    pub fn order_by_descending_with(
        self,
        key: impl Into<Path>,
        comparer: Comparer,
    ) -> OrderedQueryableSequence<T> {
        self.inner.order_by_descending_with(key, comparer)
    }

    pub fn skip(self, count: u64) -> QueryableSequence<T> {
        self.inner.skip(count)
    }

    pub fn take(self, count: u64) -> QueryableSequence<T> {
        self.inner.take(count)
    }

    pub fn take_range(self, range: Range<u64>) -> QueryableSequence<T> {
        self.inner.take_range(range)
    }

    pub fn distinct(self) -> QueryableSequence<T> {
        self.inner.distinct()
    }

    pub fn distinct_by(self, equality: Equality) -> QueryableSequence<T> {
        self.inner.distinct_by(equality)
    }

    pub async fn close(self) -> Result<(), StorageError> {
        self.inner.close().await
    }
}

impl<T> From<OrderedQueryableSequence<T>> for QueryableSequence<T> {
    fn from(ordered: OrderedQueryableSequence<T>) -> Self {
        ordered.inner
    }
}

impl<T> Deref for OrderedQueryableSequence<T> {
    type Target = QueryableSequence<T>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for OrderedQueryableSequence<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

//! Record operations on a [`StorageClient`]
//!
//! Every operation takes something convertible into an
//! [`OperationContext`]: a store name, a transaction mode, an existing
//! transaction or store handle, or a full context. Failures are logged where
//! they happen and returned as `Err`.

use futures::future::{join_all, LocalBoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use crate::client::StorageClient;
use crate::coalesce::coalesce;
use crate::context::{OperationContext, ResolvedContext};
use crate::engine::{Engine, TransactionMode};
use crate::error::{EngineResult, StoreError, StoreResult};
use crate::key::{IndexQuery, Key, KeyQuery, KeyRange};
use crate::logging::prefix;
use crate::settings::SettingsStore;

impl<E: Engine, S: SettingsStore> StorageClient<E, S> {
    async fn resolve_for(
        &self,
        operation: &'static str,
        ctx: OperationContext,
    ) -> StoreResult<ResolvedContext> {
        self.resolve_context(ctx)
            .await
            .inspect_err(|e| error!("{} {}: {}", prefix::REQUEST, operation, e))
    }

    /// Add `items` to one store in a single transaction.
    ///
    /// Resolves once every add has settled, to the primary keys in item
    /// order or to the first failure. An empty batch issues no request.
    pub async fn store_items<T: Serialize>(
        &self,
        items: &[T],
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Vec<Key>> {
        let records = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
            .inspect_err(|e| error!("{} store_items: {}", prefix::REQUEST, e))?;
        if records.is_empty() {
            debug!("{} store_items called with nothing to store", prefix::REQUEST);
            return Ok(Vec::new());
        }

        let resolved = self.resolve_for("store_items", ctx.into()).await?;
        let store = resolved.store.name();
        let requests: Vec<LocalBoxFuture<'static, EngineResult<Key>>> =
            records.iter().map(|record| resolved.store.add(record)).collect();
        let outcomes = join_all(requests).await;

        let mut keys = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for (position, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(key) => keys.push(key),
                Err(e) => {
                    error!("{} add #{} to '{}' failed: {}", prefix::REQUEST, position, store, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(source) = first_error {
            return Err(StoreError::Request {
                operation: "add",
                source,
            });
        }
        debug!("{} stored {} records in '{}'", prefix::REQUEST, keys.len(), store);
        Ok(keys)
    }

    /// Add a single item.
    pub async fn store_item<T: Serialize>(
        &self,
        item: &T,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Key> {
        let mut keys = self.store_items(std::slice::from_ref(item), ctx).await?;
        keys.pop().ok_or_else(|| StoreError::Serialization("no key returned".into()))
    }

    /// Walk every record of a store in primary key order.
    ///
    /// `visitor` receives the key, the record and its position. Resolves to
    /// the number of records visited.
    pub async fn fetch_items<F>(
        &self,
        mut visitor: F,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<usize>
    where
        F: FnMut(&Key, &Value, usize) + 'static,
    {
        let resolved = self.resolve_for("fetch_items", ctx.into()).await?;
        let mut position = 0;
        let visited = resolved
            .store
            .for_each(Box::new(move |key: &Key, value: &Value| {
                visitor(key, value, position);
                position += 1;
            }))
            .await
            .map_err(StoreError::request("cursor"))
            .inspect_err(|e| error!("{} fetch_items: {}", prefix::REQUEST, e))?;
        debug!("{} visited {} records in '{}'", prefix::REQUEST, visited, resolved.store.name());
        Ok(visited)
    }

    /// Records whose `index` value matches `value`.
    pub async fn lookup_items(
        &self,
        index: &str,
        value: impl Into<KeyQuery>,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Vec<Value>> {
        self.lookup_items_with(IndexQuery::new(index).value(value), ctx)
            .await
    }

    pub async fn lookup_items_with(
        &self,
        query: IndexQuery,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Vec<Value>> {
        let resolved = self.resolve_for("lookup_items", ctx.into()).await?;
        resolved
            .store
            .index_get_all(&query)
            .await
            .map_err(StoreError::request("getAll"))
            .inspect_err(|e| error!("{} lookup on index '{}': {}", prefix::REQUEST, query.name, e))
    }

    /// Typed variant of [`lookup_items`](Self::lookup_items).
    pub async fn lookup_records<T: DeserializeOwned>(
        &self,
        index: &str,
        value: impl Into<KeyQuery>,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Vec<T>> {
        self.lookup_items(index, value, ctx)
            .await?
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(StoreError::from))
            .collect::<StoreResult<Vec<T>>>()
            .inspect_err(|e| error!("{} lookup_records: {}", prefix::REQUEST, e))
    }

    /// Number of records whose `index` value matches `value`.
    pub async fn count_items(
        &self,
        index: &str,
        value: impl Into<KeyQuery>,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<u64> {
        self.count_items_with(IndexQuery::new(index).value(value), ctx)
            .await
    }

    pub async fn count_items_with(
        &self,
        query: IndexQuery,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<u64> {
        let resolved = self.resolve_for("count_items", ctx.into()).await?;
        resolved
            .store
            .index_count(&query)
            .await
            .map_err(StoreError::request("count"))
            .inspect_err(|e| error!("{} count on index '{}': {}", prefix::REQUEST, query.name, e))
    }

    /// Primary keys of the records whose `index` value matches `value`.
    pub async fn lookup_store_keys(
        &self,
        index: &str,
        value: impl Into<KeyQuery>,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Vec<Key>> {
        self.lookup_store_keys_with(IndexQuery::new(index).value(value), ctx)
            .await
    }

    pub async fn lookup_store_keys_with(
        &self,
        query: IndexQuery,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<Vec<Key>> {
        let resolved = self.resolve_for("lookup_store_keys", ctx.into()).await?;
        resolved
            .store
            .index_get_all_keys(&query)
            .await
            .map_err(StoreError::request("getAllKeys"))
            .inspect_err(|e| error!("{} key lookup on index '{}': {}", prefix::REQUEST, query.name, e))
    }

    /// Delete every record whose `index` value matches `value`.
    ///
    /// Resolves to the number of records removed.
    pub async fn delete_items(
        &self,
        index: &str,
        value: impl Into<KeyQuery>,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<usize> {
        self.delete_items_with(IndexQuery::new(index).value(value), ctx)
            .await
    }

    /// Delete every record matched by `query`.
    ///
    /// Integer primary keys are coalesced into contiguous ranges, one delete
    /// request per range. Other keys are deleted one at a time.
    pub async fn delete_items_with(
        &self,
        query: IndexQuery,
        ctx: impl Into<OperationContext>,
    ) -> StoreResult<usize> {
        let resolved = self.resolve_for("delete_items", ctx.into()).await?;
        let store = resolved.store.name();
        let keys = resolved
            .store
            .index_get_all_keys(&query)
            .await
            .map_err(StoreError::request("getAllKeys"))
            .inspect_err(|e| error!("{} delete_items on '{}': {}", prefix::REQUEST, store, e))?;
        if keys.is_empty() {
            debug!("{} no records in '{}' match index '{}'", prefix::REQUEST, store, query.name);
            return Ok(0);
        }

        let (mut ints, mut others): (Vec<i64>, Vec<Key>) = (Vec::new(), Vec::new());
        for key in keys {
            match key.as_int() {
                Some(n) => ints.push(n),
                None => others.push(key),
            }
        }
        ints.sort_unstable();
        ints.dedup();
        others.sort();
        others.dedup();

        let ranges: Vec<KeyRange> = coalesce(&ints)
            .into_iter()
            .map(KeyRange::from)
            .chain(others.iter().cloned().map(KeyRange::only))
            .collect();
        debug!(
            "{} deleting {} records from '{}' in {} requests",
            prefix::REQUEST,
            ints.len() + others.len(),
            store,
            ranges.len()
        );

        let requests: Vec<_> = ranges.iter().map(|range| resolved.store.delete(range)).collect();
        let mut first_error = None;
        for (range, outcome) in ranges.iter().zip(join_all(requests).await) {
            if let Err(e) = outcome {
                error!("{} delete of {:?} in '{}' failed: {}", prefix::REQUEST, range, store, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(source) = first_error {
            return Err(StoreError::Request {
                operation: "delete",
                source,
            });
        }
        Ok(ints.len() + others.len())
    }

    /// Remove every record from a store. Key generators keep counting.
    pub async fn clear_object_store(&self, store_name: Option<&str>) -> StoreResult<()> {
        let mut ctx = OperationContext::new().mode(TransactionMode::ReadWrite);
        if let Some(name) = store_name {
            ctx = ctx.store_name(name);
        }
        let resolved = self.resolve_for("clear_object_store", ctx).await?;
        resolved
            .store
            .clear()
            .await
            .map_err(StoreError::request("clear"))
            .inspect_err(|e| error!("{} clear of '{}': {}", prefix::REQUEST, resolved.store.name(), e))?;
        debug!("{} cleared '{}'", prefix::REQUEST, resolved.store.name());
        Ok(())
    }
}

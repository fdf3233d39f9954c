//! Reusable filtering stages.

use crate::pipeline::function::{FnStage, Outcome};
use crate::pipeline::runner::Item;
use anyhow::anyhow;
use dashmap::DashSet;
use serde_json::Value;
use std::hash::Hash;

/// Pass the first item seen for every key and drop the rest.
///
/// The seen set is shared by all workers of the stage. A key extraction
/// error is recorded against the item.
pub fn unique_by<T, K, F>(name: impl Into<String>, key: F) -> FnStage<T>
where
    T: Item,
    K: Hash + Eq + Send + Sync + 'static,
    F: Fn(&T) -> anyhow::Result<K> + Send + Sync + 'static,
{
    let seen = DashSet::new();
    FnStage::map(name, move |item| {
        let key = key(&item)?;
        if seen.insert(key) {
            Ok(Outcome::Emit(item))
        } else {
            Ok(Outcome::Skip)
        }
    })
}

/// [`unique_by`] keyed on one field of a JSON object.
pub fn unique_field(field: impl Into<String>) -> FnStage<Value> {
    let field = field.into();
    let name = format!("unique({field})");
    unique_by(name, move |item: &Value| {
        item.get(&field)
            // Value is not Hash; its canonical text is.
            .map(Value::to_string)
            .ok_or_else(|| anyhow!("item has no field `{field}`"))
    })
}

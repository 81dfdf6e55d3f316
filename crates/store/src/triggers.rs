use futures::future::BoxFuture;
use sqlx::{Postgres, Transaction};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// The context handed to a pre or post trigger. Triggers run inside the
/// request's transaction and may issue further statements through `txn`.
pub struct TriggerCookie<'a> {
    pub bucket: &'a str,
    pub schema: &'a BTreeMap<String, models::FieldIndex>,
    /// Row id, available to post triggers after the write.
    pub id: Option<i64>,
    pub key: Option<&'a str>,
    pub value: Option<&'a serde_json::Value>,
    pub headers: &'a BTreeMap<String, String>,
    /// True when the write replaced an existing row.
    pub update: bool,
    pub txn: &'a mut Transaction<'static, Postgres>,
}

/// A registered trigger callback. Bucket configurations refer to triggers
/// by the name they were registered under.
pub type Trigger =
    Arc<dyn for<'a> Fn(TriggerCookie<'a>) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// The process-wide registry of named triggers, fixed at store construction.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    triggers: HashMap<String, Trigger>,
}

impl TriggerRegistry {
    pub fn register(&mut self, name: impl Into<String>, trigger: Trigger) {
        self.triggers.insert(name.into(), trigger);
    }

    /// Resolve an ordered list of trigger names, failing with `NotFunction`
    /// on the first name with no registered callback.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<(String, Trigger)>> {
        names
            .iter()
            .map(|name| match self.triggers.get(name) {
                Some(trigger) => Ok((name.clone(), trigger.clone())),
                None => Err(Error::NotFunction(name.clone())),
            })
            .collect()
    }
}

/// The request-side context of a trigger invocation, minus the transaction.
#[derive(Copy, Clone)]
pub struct TriggerScope<'a> {
    pub bucket: &'a str,
    pub schema: &'a BTreeMap<String, models::FieldIndex>,
    pub id: Option<i64>,
    pub key: Option<&'a str>,
    pub value: Option<&'a serde_json::Value>,
    pub headers: &'a BTreeMap<String, String>,
    pub update: bool,
}

/// Run an ordered trigger sequence, attributing a failure to the trigger
/// which raised it. Each trigger observes a fresh cookie over the same
/// transaction.
pub async fn run_triggers(
    triggers: &[(String, Trigger)],
    scope: TriggerScope<'_>,
    txn: &mut Transaction<'static, Postgres>,
) -> Result<()> {
    for (name, trigger) in triggers {
        let cookie = TriggerCookie {
            bucket: scope.bucket,
            schema: scope.schema,
            id: scope.id,
            key: scope.key,
            value: scope.value,
            headers: scope.headers,
            update: scope.update,
            txn: &mut *txn,
        };
        trigger(cookie).await.map_err(|source| Error::Trigger {
            name: name.clone(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop(_cookie: TriggerCookie<'_>) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn resolve_unknown_name_is_not_function() {
        let mut registry = TriggerRegistry::default();
        registry.register("audit", Arc::new(noop) as Trigger);

        assert!(registry.resolve(&["audit".to_string()]).is_ok());
        let err = match registry.resolve(&["audit".to_string(), "missing".to_string()]) {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.code(), "NotFunction");
        assert_eq!(err.to_string(), "trigger missing is not registered");
    }
}

//! `{{name}}` template resolution over JSON values.
//!
//! A string that is exactly one placeholder is replaced by the typed
//! value it resolves to; placeholders embedded in longer text are
//! replaced by their textual rendering. Values may themselves contain
//! placeholders, which are resolved in later passes up to
//! [`MAX_PASSES`]. Anything still unresolved after that is left as
//! written.

use crate::error::{Result, StepError};
use crate::model::StepContext;
use crate::source::{SourceKind, VariableSources};
use crate::validator::text_of;
use futures::future::try_join_all;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;
use tracing::{debug, instrument};

/// Number of resolution passes over a template.
pub const MAX_PASSES: usize = 3;

/// Object key whose string values are SQL text.
const SQL_KEY: &str = "sql";
/// Object key naming the test-data entry an action writes.
const STORED_KEY: &str = "storedKey";
/// Prefix of the per-step response entries.
const RESPONSE_PREFIX: &str = "response";

static EMBEDDED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([^{}]*?)\}\}").expect("failed to compile placeholder regex")
});

static WHOLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{([^{}]*)\}\}$").expect("failed to compile placeholder regex")
});

/// Per-call overrides applied on top of the step context.
#[derive(Debug, Clone, Default)]
pub struct ResolveScope {
    /// Placeholder name to source, checked before the context's map.
    pub sources: HashMap<String, SourceKind>,
    /// Test data consulted before the store.
    pub data: Map<String, Value>,
}

impl ResolveScope {
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            sources: HashMap::new(),
            data,
        }
    }
}

/// Resolves placeholders against [`VariableSources`].
#[derive(Clone)]
pub struct PlaceholderResolver {
    sources: VariableSources,
}

impl PlaceholderResolver {
    pub fn new(sources: VariableSources) -> Self {
        Self { sources }
    }

    pub fn sources(&self) -> &VariableSources {
        &self.sources
    }

    /// Resolve every placeholder in `template`.
    #[instrument(skip_all, fields(step_id = ctx.step_id, index = ctx.index))]
    pub async fn resolve(
        &self,
        ctx: &StepContext,
        template: &Value,
        scope: &ResolveScope,
    ) -> Result<Value> {
        let mut current = template.clone();
        for pass in 1..=MAX_PASSES {
            let names = placeholder_names(&current);
            if names.is_empty() {
                break;
            }
            debug!(pass, count = names.len(), "Resolving placeholders");
            let values = self.fetch_all(ctx, &names, scope).await?;
            current = rewrite(&current, &values, false);
        }
        Ok(current)
    }

    /// Resolve a single placeholder name.
    pub async fn resolve_name(
        &self,
        ctx: &StepContext,
        name: &str,
        scope: &ResolveScope,
    ) -> Result<Value> {
        let kind = source_kind(ctx, scope, name);
        self.sources
            .fetch(ctx, kind, name, &scope.data)
            .await
            .map_err(|err| {
                StepError::resolution(format!(
                    "Failed to resolve placeholder '{name}' from {kind}: {err}"
                ))
            })
    }

    async fn fetch_all(
        &self,
        ctx: &StepContext,
        names: &BTreeSet<String>,
        scope: &ResolveScope,
    ) -> Result<HashMap<String, Value>> {
        let values = try_join_all(names.iter().map(|name| async move {
            let value = self.resolve_name(ctx, name, scope).await?;
            Ok::<_, StepError>((name.clone(), value))
        }))
        .await?;
        Ok(values.into_iter().collect())
    }
}

/// Source for `name`: per-call map, then context map, by full name
/// and then by root segment; test data otherwise.
fn source_kind(ctx: &StepContext, scope: &ResolveScope, name: &str) -> SourceKind {
    let root = name.split('.').next().unwrap_or(name);
    [name, root]
        .iter()
        .find_map(|key| {
            scope
                .sources
                .get(*key)
                .or_else(|| ctx.variables.get(*key))
                .copied()
        })
        .unwrap_or_default()
}

/// Trimmed names of every placeholder in strings and object keys.
pub fn placeholder_names(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_names(value, &mut names);
    names
}

fn collect_names(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(text) => names_in_text(text, names),
        Value::Array(items) => items.iter().for_each(|item| collect_names(item, names)),
        Value::Object(map) => {
            for (key, item) in map {
                names_in_text(key, names);
                collect_names(item, names);
            }
        }
        _ => {}
    }
}

fn names_in_text(text: &str, names: &mut BTreeSet<String>) {
    for caps in EMBEDDED_RE.captures_iter(text) {
        let name = caps[1].trim();
        if !name.is_empty() {
            names.insert(name.to_string());
        }
    }
}

/// Values of every `storedKey` field in the tree.
pub fn stored_keys(value: &Value) -> BTreeSet<String> {
    let mut keys = BTreeSet::new();
    collect_stored_keys(value, &mut keys);
    keys
}

fn collect_stored_keys(value: &Value, keys: &mut BTreeSet<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| collect_stored_keys(item, keys)),
        Value::Object(map) => {
            for (key, item) in map {
                match item {
                    Value::String(stored) if key == STORED_KEY => {
                        keys.insert(stored.trim().to_string());
                    }
                    other => collect_stored_keys(other, keys),
                }
            }
        }
        _ => {}
    }
}

/// Placeholders that must be supplied before `value` can run.
///
/// Names written by the steps themselves are excluded: step responses
/// (`response...`) and anything stored through `storedKey`.
pub fn required_placeholders(value: &Value) -> BTreeSet<String> {
    let ignored = stored_keys(value);
    placeholder_names(value)
        .into_iter()
        .filter(|name| {
            let root = name.split('.').next().unwrap_or(name);
            !name.starts_with(RESPONSE_PREFIX) && !ignored.contains(root)
        })
        .collect()
}

/// Double single quotes in every string of `value`, keys included.
pub fn escape_sql_quotes(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(text.replace('\'', "''")),
        Value::Array(items) => Value::Array(items.into_iter().map(escape_sql_quotes).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.replace('\'', "''"), escape_sql_quotes(v)))
                .collect(),
        ),
        other => other,
    }
}

fn rewrite(value: &Value, values: &HashMap<String, Value>, in_sql: bool) -> Value {
    match value {
        Value::String(text) => rewrite_text(text, values, in_sql),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| rewrite(item, values, in_sql)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    let child_in_sql = in_sql || key == SQL_KEY;
                    (
                        embed(key, values, false),
                        rewrite(item, values, child_in_sql),
                    )
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn rewrite_text(text: &str, values: &HashMap<String, Value>, in_sql: bool) -> Value {
    if let Some(caps) = WHOLE_RE.captures(text) {
        if let Some(value) = values.get(caps[1].trim()) {
            let value = value.clone();
            return if in_sql { escape_sql_quotes(value) } else { value };
        }
    }
    Value::String(embed(text, values, in_sql))
}

fn embed(text: &str, values: &HashMap<String, Value>, in_sql: bool) -> String {
    EMBEDDED_RE
        .replace_all(text, |caps: &Captures| match values.get(caps[1].trim()) {
            Some(value) => {
                let rendered = text_of(value);
                if in_sql {
                    rendered.replace('\'', "''")
                } else {
                    rendered
                }
            }
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticVariableCatalog;
    use crate::store::MemoryTestDataStore;
    use serde_json::json;
    use std::sync::Arc;

    fn resolver(data: Value) -> PlaceholderResolver {
        let store = MemoryTestDataStore::seeded("run", "case", data.as_object().cloned().unwrap());
        let catalog = StaticVariableCatalog::new().with_config("env", json!("uat"));
        PlaceholderResolver::new(VariableSources::new(Arc::new(store), Arc::new(catalog)))
    }

    fn ctx() -> StepContext {
        let mut variables = HashMap::new();
        variables.insert("env".to_string(), SourceKind::Config);
        StepContext::new("run", "case", "apac", "uat").with_variables(variables)
    }

    #[tokio::test]
    async fn test_typed_and_textual_substitution() {
        let resolver = resolver(json!({
            "ids": [1, 2],
            "user": {"name": "amy", "age": 30},
            "nothing": null
        }));
        let template = json!({
            "ids": "{{ids}}",
            "age": "{{ user.age }}",
            "greeting": "hi {{user.name}}, ids={{ids}}, n={{nothing}}",
            "missing": "{{user.zip}}",
            "env": "{{env}}",
            "{{user.name}}-key": true
        });
        let resolved = resolver.resolve(&ctx(), &template, &ResolveScope::default()).await.unwrap();
        assert_eq!(
            resolved,
            json!({
                "ids": [1, 2],
                "age": 30,
                "greeting": "hi amy, ids=[1,2], n=null",
                "missing": null,
                "env": "uat",
                "amy-key": true
            })
        );
    }

    #[tokio::test]
    async fn test_three_passes_then_left_literal() {
        let resolver = resolver(json!({
            "a": "{{b}}",
            "b": "{{c}}",
            "c": "{{d}}",
            "d": "deep",
            "x": "{{y}}",
            "y": "{{z}}",
            "z": "found"
        }));
        let scope = ResolveScope::default();
        let four = resolver.resolve(&ctx(), &json!("{{a}}"), &scope).await.unwrap();
        assert_eq!(four, json!("{{d}}"));

        let three = resolver.resolve(&ctx(), &json!("{{x}}"), &scope).await.unwrap();
        assert_eq!(three, json!("found"));
        let again = resolver.resolve(&ctx(), &three, &scope).await.unwrap();
        assert_eq!(again, three);
    }

    #[tokio::test]
    async fn test_sql_values_have_quotes_doubled() {
        let resolver = resolver(json!({"name": "O'Brien"}));
        let template = json!({
            "sql": "select * from t where name = '{{name}}'",
            "note": "{{name}}"
        });
        let resolved = resolver.resolve(&ctx(), &template, &ResolveScope::default()).await.unwrap();
        assert_eq!(resolved["sql"], json!("select * from t where name = 'O''Brien'"));
        assert_eq!(resolved["note"], json!("O'Brien"));
    }

    #[tokio::test]
    async fn test_scope_overrides_context() {
        let resolver = resolver(json!({"env": "from-data"}));
        let mut scope = ResolveScope::with_data(json!({"env": "overlay"}).as_object().cloned().unwrap());
        scope.sources.insert("env".to_string(), SourceKind::Data);
        let resolved = resolver.resolve(&ctx(), &json!("{{env}}"), &scope).await.unwrap();
        assert_eq!(resolved, json!("overlay"));
    }

    #[test]
    fn test_required_placeholders_skip_step_outputs() {
        let step = json!({
            "beforeTest": [{"id": 1, "execute": [{"sql": "select 1", "storedKey": "orderId"}]}],
            "test": {"path": "/orders/{{orderId}}/{{account}}"},
            "afterTest": [{"assert": [{"key": "{{response3.statusCode}}", "value": "{{expected.code}}"}]}]
        });
        let names: Vec<String> = required_placeholders(&step).into_iter().collect();
        assert_eq!(names, vec!["account".to_string(), "expected.code".to_string()]);
        assert!(stored_keys(&step).contains("orderId"));
    }

    #[test]
    fn test_escape_sql_quotes_recurses() {
        let escaped = escape_sql_quotes(json!({"it's": ["a'b", 1]}));
        assert_eq!(escaped, json!({"it''s": ["a''b", 1]}));
    }
}

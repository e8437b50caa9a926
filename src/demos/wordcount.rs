//! Word frequencies over a set of documents: one tokenize task per document,
//! merged by a streaming reduce.

use serde_json::{json, Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::types::{FunctionSpec, ResourceRequest};
use weft_engine::{task_fn, Engine, FunctionRef, TaskContext};

use super::text;

pub fn default_input() -> Value {
    json!([
        "The quick brown fox jumps over the lazy dog.",
        "A lazy afternoon: the dog sleeps, the fox waits.",
        "Quick thinking beats quick typing.",
    ])
}

async fn tokenize(input: Value, _ctx: TaskContext) -> Result<Value> {
    let document = input
        .as_str()
        .ok_or_else(|| WeftError::runtime("document must be a string"))?;
    let mut counts = Map::new();
    for word in text::words(document) {
        let entry = counts.entry(word.to_lowercase()).or_insert(json!(0));
        *entry = json!(entry.as_u64().unwrap_or(0) + 1);
    }
    Ok(Value::Object(counts))
}

async fn merge_counts(input: Value, _ctx: TaskContext) -> Result<Value> {
    let mut acc = input["acc"].as_object().cloned().unwrap_or_default();
    let Some(item) = input["item"].as_object() else {
        return Err(WeftError::runtime("reduce item must be a count object"));
    };
    for (word, count) in item {
        let entry = acc.entry(word.clone()).or_insert(json!(0));
        *entry = json!(entry.as_u64().unwrap_or(0) + count.as_u64().unwrap_or(0));
    }
    Ok(Value::Object(acc))
}

/// Register tokenize/merge and the counting root; returns the root.
pub fn register(engine: &Engine) -> FunctionRef {
    let tokenize = engine.register(
        FunctionSpec::new("wordcount.tokenize")
            .with_resources(ResourceRequest::new(0.5, 0.25))
            .with_retries(1),
        task_fn(tokenize),
    );
    let merge = engine.register(
        FunctionSpec::new("wordcount.merge_counts").with_resources(ResourceRequest::new(0.5, 0.25)),
        task_fn(merge_counts),
    );

    engine.register(
        FunctionSpec::new("wordcount.count_words").with_resources(ResourceRequest::none()),
        task_fn(move |input: Value, ctx: TaskContext| {
            let (tokenize, merge) = (tokenize.clone(), merge.clone());
            async move {
                let documents = match input {
                    Value::Array(docs) => docs,
                    Value::Object(mut fields) => match fields.remove("documents") {
                        Some(Value::Array(docs)) => docs,
                        _ => return Err(WeftError::runtime("expected a `documents` array")),
                    },
                    _ => return Err(WeftError::runtime("expected an array of documents")),
                };
                let document_count = documents.len();
                let output = ctx
                    .scope()
                    .map_reduce(&tokenize, documents, &merge, json!({}))
                    .await?;
                let counts = output
                    .result
                    .into_result()
                    .map_err(|f| WeftError::runtime(f.message))?;

                let mut ranked: Vec<(&String, u64)> = counts
                    .as_object()
                    .map(|m| m.iter().map(|(w, c)| (w, c.as_u64().unwrap_or(0))).collect())
                    .unwrap_or_default();
                ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
                let total: u64 = ranked.iter().map(|(_, c)| c).sum();
                let top: Vec<Value> = ranked
                    .iter()
                    .take(10)
                    .map(|(w, c)| json!({"word": w, "count": c}))
                    .collect();

                Ok(json!({
                    "documents": document_count,
                    "total_words": total,
                    "unique_words": ranked.len(),
                    "top": top,
                    "counts": counts,
                }))
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_across_documents() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let result = engine
            .invoke("wordcount-test", &root, default_input())
            .await
            .unwrap();

        let output = result.outcome.value().cloned().unwrap();
        assert_eq!(output["documents"], 3);
        assert_eq!(output["counts"]["the"], 4);
        assert_eq!(output["counts"]["quick"], 3);
        assert_eq!(output["top"][0]["word"], "the");
    }

    #[tokio::test]
    async fn test_empty_input_folds_to_nothing() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let result = engine
            .invoke("wordcount-empty", &root, json!({"documents": []}))
            .await
            .unwrap();

        let output = result.outcome.value().cloned().unwrap();
        assert_eq!(output["total_words"], 0);
        assert_eq!(output["counts"], json!({}));
    }
}

//! Four-stage document pipeline: download, parse, enrich, summarize.
//!
//! Each stage is a map over the previous stage's results, so a document that
//! fails early only drops out of its own lane. Finished stages are replayed
//! from the durable log when the pipeline is resubmitted.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{json, Map, Value};

use weft_core::error::{Result, WeftError};
use weft_core::types::{FunctionSpec, ResourceRequest};
use weft_engine::{task_fn, Engine, FunctionRef, TaskContext};

use super::text;

pub fn default_input() -> Value {
    json!([
        {
            "url": "https://example.com/guide.html",
            "content_type": "text/html",
            "content": "<html><head><title>Getting Started</title></head><body>\n\
                <h1>Getting Started</h1>\n\
                <p>The engine runs each stage in its own task and records every result. \
                When a run is interrupted, the finished stages are not repeated.</p>\n\
                <h2>Configuration</h2>\n\
                <p>See https://example.com/config for the full list of settings. \
                The defaults are good for a laptop and have been tested on larger machines.</p>\n\
                </body></html>",
        },
        {
            "url": "https://example.com/notes.txt",
            "content_type": "text/plain",
            "content": "Release notes\n\
                This release adds streaming reduction over mapped results. \
                Reduce steps now start as soon as their element is ready. \
                The scheduler also reports replayed tasks separately.",
        },
        {"url": "https://example.com/missing"},
    ])
}

/// Object fields of `doc` plus `fields`, later keys winning.
fn extend(doc: &Value, fields: Vec<(&str, Value)>) -> Value {
    let mut object = doc.as_object().cloned().unwrap_or_else(Map::new);
    for (key, value) in fields {
        object.insert(key.to_string(), value);
    }
    Value::Object(object)
}

fn succeeded(doc: &Value) -> bool {
    doc["success"].as_bool().unwrap_or(false)
}

fn content(doc: &Value) -> &str {
    doc["content"].as_str().unwrap_or_default()
}

async fn download(input: Value, _ctx: TaskContext) -> Result<Value> {
    let url = match &input {
        Value::String(url) => url.clone(),
        other => other["url"].as_str().unwrap_or_default().to_string(),
    };
    let Some(body) = input.get("content").and_then(Value::as_str) else {
        return Ok(json!({
            "url": url,
            "success": false,
            "error": "no inline content for document",
            "stage": "download_failed",
        }));
    };
    let content_type = input["content_type"].as_str().unwrap_or("unknown");
    Ok(json!({
        "url": url,
        "content": body,
        "content_type": content_type,
        "size_bytes": body.len(),
        "stage": "downloaded",
        "success": true,
    }))
}

async fn parse(doc: Value, _ctx: TaskContext) -> Result<Value> {
    if !succeeded(&doc) {
        return Ok(doc);
    }
    let content = content(&doc);
    let lines: Vec<&str> = content.lines().collect();

    let title = lines
        .iter()
        .take(20)
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && l.len() < 200)
        .map(text::strip_tags)
        .find(|l| !l.is_empty() && !l.ends_with([',', ';']))
        .map(|l| l.chars().take(100).collect::<String>());

    let body = text::visible_text(content);
    let links = text::links(content);
    let sections: Vec<String> = lines
        .iter()
        .map(|l| text::strip_tags(l))
        .filter(|l| {
            let len = l.chars().count();
            len > 3
                && len < 80
                && !l.ends_with(['.', ',', ';', ':'])
                && l.chars().next().is_some_and(char::is_uppercase)
        })
        .take(10)
        .collect();

    Ok(extend(
        &doc,
        vec![
            ("stage", json!("parsed")),
            (
                "parsed",
                json!({
                    "title": title,
                    "text_length": body.chars().count(),
                    "text_preview": text::preview(&body, 500),
                    "links_found": links.len().min(20),
                    "links": links.iter().take(10).collect::<Vec<_>>(),
                    "sections": sections,
                }),
            ),
        ],
    ))
}

fn detect_language(words: &[&str]) -> &'static str {
    const EN: [&str; 9] = ["the", "and", "is", "are", "was", "were", "have", "has", "been"];
    const ES: [&str; 9] = ["el", "la", "los", "las", "es", "son", "que", "de", "en"];
    const FR: [&str; 9] = ["le", "la", "les", "est", "sont", "que", "de", "en", "et"];

    let seen: HashSet<String> = words.iter().take(200).map(|w| w.to_lowercase()).collect();
    let score = |list: &[&str]| list.iter().filter(|w| seen.contains(**w)).count();
    let (en, es, fr) = (score(&EN), score(&ES), score(&FR));

    if en >= es && en >= fr {
        "en"
    } else if es > fr {
        "es"
    } else if fr > 0 {
        "fr"
    } else {
        "unknown"
    }
}

async fn enrich(doc: Value, _ctx: TaskContext) -> Result<Value> {
    if !succeeded(&doc) {
        return Ok(doc);
    }
    let content = content(&doc);
    let words = text::words(content);
    let sentences = text::sentences(content);
    let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();

    let metadata = json!({
        "word_count": words.len(),
        "sentence_count": sentences.len(),
        "unique_words": unique.len(),
        "avg_words_per_sentence": text::round(words.len() as f64 / sentences.len().max(1) as f64, 1),
        "estimated_reading_time_mins": text::round(words.len() as f64 / 200.0, 1),
        "detected_language": detect_language(&words),
        "content_type": doc["content_type"],
        "size_bytes": doc["size_bytes"],
    });
    Ok(extend(
        &doc,
        vec![("stage", json!("enriched")), ("metadata", metadata)],
    ))
}

async fn summarize(doc: Value, _ctx: TaskContext) -> Result<Value> {
    if !succeeded(&doc) {
        return Ok(json!({
            "url": doc["url"],
            "success": false,
            "error": doc["error"].as_str().unwrap_or("previous stage failed"),
        }));
    }
    let body = text::visible_text(content(&doc));
    let sentences: Vec<&str> = body
        .split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.chars().count() > 20)
        .take(3)
        .collect();
    let mut summary = sentences.join(" ");
    if summary.chars().count() > 500 {
        summary = text::preview(&summary, 497);
    }
    if summary.is_empty() {
        summary = "No summary available".to_string();
    }

    let parsed = &doc["parsed"];
    Ok(json!({
        "url": doc["url"],
        "success": true,
        "title": parsed["title"],
        "summary": summary,
        "metadata": doc["metadata"],
        "structure": {
            "sections": parsed["sections"],
            "links_count": parsed["links_found"],
        },
    }))
}

/// Stage spec, with the request shrunk to the engine's capacity so the
/// app also runs on small machines.
fn stage(
    engine: &Engine,
    name: &str,
    cpu: f64,
    memory_gb: f64,
    timeout_secs: u64,
    retries: u32,
) -> FunctionSpec {
    let capacity = &engine.config().capacity;
    FunctionSpec::new(format!("pipeline.{}", name))
        .with_resources(ResourceRequest::new(
            cpu.min(capacity.cpu),
            memory_gb.min(capacity.memory_gb),
        ))
        .with_timeout(Duration::from_secs(timeout_secs))
        .with_retries(retries)
}

/// Register the four stages and the pipeline root; returns the root.
pub fn register(engine: &Engine) -> FunctionRef {
    let download = engine.register(stage(engine, "download", 1.0, 1.0, 60, 2), task_fn(download));
    let parse = engine.register(stage(engine, "parse", 2.0, 2.0, 120, 0), task_fn(parse));
    let enrich = engine.register(stage(engine, "enrich", 1.0, 1.0, 60, 0), task_fn(enrich));
    let summarize = engine.register(stage(engine, "summarize", 2.0, 2.0, 60, 0), task_fn(summarize));

    engine.register(
        FunctionSpec::new("pipeline.process_documents").with_resources(ResourceRequest::none()),
        task_fn(move |input: Value, ctx: TaskContext| {
            let (download, parse, enrich, summarize) =
                (download.clone(), parse.clone(), enrich.clone(), summarize.clone());
            async move {
                let Value::Array(documents) = input else {
                    return Err(WeftError::runtime("expected an array of documents"));
                };
                let scope = ctx.scope();
                let graph = scope
                    .graph()
                    .map("download", &download, documents)
                    .map_over("parse", &parse, "download")
                    .map_over("enrich", &enrich, "parse")
                    .map_over("summarize", &summarize, "enrich")
                    .build()?;
                let report = scope.run(graph).await?;

                let summaries: Vec<Value> = report
                    .elements("summarize")
                    .into_iter()
                    .map(|outcome| match outcome.as_result() {
                        Ok(value) => value.clone(),
                        Err(failure) => json!({"success": false, "error": failure.message}),
                    })
                    .collect();
                Ok(Value::Array(summaries))
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipeline_processes_each_document() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let result = engine
            .invoke("pipeline-test", &root, default_input())
            .await
            .unwrap();

        let output = result.outcome.value().cloned().unwrap();
        let docs = output.as_array().unwrap();
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0]["success"], true);
        assert_eq!(docs[0]["title"], "Getting Started");
        assert_eq!(docs[0]["structure"]["links_count"], 1);
        assert_eq!(docs[1]["metadata"]["detected_language"], "en");
        assert_eq!(docs[2]["success"], false);
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language(&["el", "perro", "es", "que"]), "es");
        assert_eq!(detect_language(&["the", "cat", "is"]), "en");
        assert_eq!(detect_language(&["le", "chat", "est", "et"]), "fr");
    }
}

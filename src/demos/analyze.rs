//! Four independent analyses of one text, launched together and joined.

use std::collections::{HashMap, HashSet};

use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::types::{FunctionSpec, ResourceRequest};
use weft_engine::{task_fn, wait, Engine, FunctionRef, ReturnWhen, TaskContext};

use super::text;

const POSITIVE: &[&str] = &[
    "good", "great", "excellent", "amazing", "wonderful", "fantastic", "love", "happy", "joy",
    "pleased", "delighted", "perfect", "best", "beautiful", "brilliant", "outstanding", "superb",
    "positive", "success", "successful", "win", "winner", "awesome", "nice",
];

const NEGATIVE: &[&str] = &[
    "bad", "terrible", "awful", "horrible", "hate", "sad", "poor", "wrong", "fail", "failure",
    "worst", "ugly", "negative", "problem", "difficult", "hard", "unfortunately", "disappointed",
    "disappointing", "frustrating", "annoying", "angry", "upset", "unhappy",
];

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "been", "be", "have", "has", "had", "do", "does",
    "did", "will", "would", "could", "should", "may", "might", "must", "shall", "can", "need",
    "it", "its", "this", "that", "these", "those", "they", "them", "their", "he", "she", "him",
    "her", "his", "hers", "we", "us", "our", "you", "your", "i", "me", "my", "what", "which",
    "who", "whom", "when", "where", "why", "how", "all", "each", "every", "both", "few", "more",
    "most", "other", "some", "such", "no", "not", "only", "same", "so", "than", "too", "very",
    "just", "also", "now", "here", "there", "then", "once", "if", "because", "while",
    "although", "though", "after", "before", "since", "until", "unless", "about",
];

pub fn default_input() -> Value {
    json!(
        "Weft is a fantastic engine for building durable workflows.\n\
         It provides excellent abstractions that make complex pipelines simple.\n\
         Developers love how easy it is to resume a failed run without repeating work.\n\n\
         However, some advanced features have a learning curve that can be difficult.\n\
         Overall, the engine delivers great value for data-intensive applications."
    )
}

fn text_arg(input: &Value) -> Result<&str> {
    input
        .as_str()
        .ok_or_else(|| WeftError::runtime("expected a text string"))
}

async fn analyze_sentiment(input: Value, _ctx: TaskContext) -> Result<Value> {
    let lowered = text_arg(&input)?.to_lowercase();
    let words = text::words(&lowered);

    let positive: Vec<&str> = words.iter().copied().filter(|w| POSITIVE.contains(w)).collect();
    let negative: Vec<&str> = words.iter().copied().filter(|w| NEGATIVE.contains(w)).collect();
    let total = positive.len() + negative.len();

    let (score, label) = if total == 0 {
        (0.5, "neutral")
    } else {
        let score = positive.len() as f64 / total as f64;
        let label = if score > 0.6 {
            "positive"
        } else if score < 0.4 {
            "negative"
        } else {
            "neutral"
        };
        (score, label)
    };

    let distinct = |found: &[&str]| -> Vec<String> {
        let mut unique: Vec<String> = found
            .iter()
            .map(|w| w.to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        unique.sort();
        unique.truncate(5);
        unique
    };

    Ok(json!({
        "label": label,
        "score": text::round(score, 3),
        "positive_count": positive.len(),
        "negative_count": negative.len(),
        "positive_words_found": distinct(&positive),
        "negative_words_found": distinct(&negative),
    }))
}

async fn compute_statistics(input: Value, _ctx: TaskContext) -> Result<Value> {
    let body = text_arg(&input)?;
    let words = text::words(body);
    let sentences = text::sentences(body);
    let paragraphs = body.split("\n\n").filter(|p| !p.trim().is_empty()).count();
    let unique: HashSet<String> = words.iter().map(|w| w.to_lowercase()).collect();

    let avg_word = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.chars().count()).sum::<usize>() as f64 / words.len() as f64
    };
    let avg_sentence = if sentences.is_empty() {
        0.0
    } else {
        sentences
            .iter()
            .map(|s| s.split_whitespace().count())
            .sum::<usize>() as f64
            / sentences.len() as f64
    };

    Ok(json!({
        "characters": body.chars().count(),
        "characters_no_spaces": body.chars().filter(|c| *c != ' ' && *c != '\n').count(),
        "words": words.len(),
        "unique_words": unique.len(),
        "sentences": sentences.len(),
        "paragraphs": paragraphs,
        "avg_word_length": text::round(avg_word, 2),
        "avg_sentence_length": text::round(avg_sentence, 2),
    }))
}

async fn extract_keywords(input: Value, _ctx: TaskContext) -> Result<Value> {
    let lowered = text_arg(&input)?.to_lowercase();
    let words: Vec<&str> = text::words(&lowered)
        .into_iter()
        .filter(|w| w.len() >= 3 && w.chars().all(|c| c.is_ascii_alphabetic()))
        .collect();
    let total = words.len();

    let mut freq: HashMap<&str, usize> = HashMap::new();
    for word in &words {
        if !STOPWORDS.contains(word) {
            *freq.entry(*word).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(&str, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let keywords: Vec<Value> = ranked
        .into_iter()
        .take(15)
        .map(|(word, count)| {
            let tf = if total == 0 { 0.0 } else { count as f64 / total as f64 };
            json!({"word": word, "count": count, "tf_score": text::round(tf, 5)})
        })
        .collect();
    Ok(Value::Array(keywords))
}

fn interpret(reading_ease: f64) -> &'static str {
    match reading_ease {
        r if r >= 90.0 => "very easy (5th grade)",
        r if r >= 80.0 => "easy (6th grade)",
        r if r >= 70.0 => "fairly easy (7th grade)",
        r if r >= 60.0 => "standard (8th-9th grade)",
        r if r >= 50.0 => "fairly difficult (10th-12th grade)",
        r if r >= 30.0 => "difficult (college)",
        _ => "very difficult (college graduate)",
    }
}

async fn compute_readability(input: Value, _ctx: TaskContext) -> Result<Value> {
    let body = text_arg(&input)?;
    let words = text::words(body);
    let sentences = text::sentences(body);
    if words.is_empty() || sentences.is_empty() {
        return Ok(json!({
            "flesch_reading_ease": null,
            "flesch_kincaid_grade": null,
            "interpretation": "insufficient text",
        }));
    }

    let syllables: usize = words.iter().map(|w| text::syllables(w)).sum();
    let words_per_sentence = words.len() as f64 / sentences.len() as f64;
    let syllables_per_word = syllables as f64 / words.len() as f64;

    let ease = (206.835 - 1.015 * words_per_sentence - 84.6 * syllables_per_word).clamp(0.0, 100.0);
    let grade = (0.39 * words_per_sentence + 11.8 * syllables_per_word - 15.59).max(0.0);

    Ok(json!({
        "flesch_reading_ease": text::round(ease, 1),
        "flesch_kincaid_grade": text::round(grade, 1),
        "interpretation": interpret(ease),
        "total_syllables": syllables,
        "avg_syllables_per_word": text::round(syllables_per_word, 2),
    }))
}

/// Register the analyses and the joining root; returns the root.
pub fn register(engine: &Engine) -> FunctionRef {
    let spec = |name: &str| {
        FunctionSpec::new(format!("analyze.{}", name)).with_resources(ResourceRequest::new(1.0, 1.0))
    };
    let analyses = vec![
        ("sentiment", engine.register(spec("sentiment"), task_fn(analyze_sentiment))),
        ("statistics", engine.register(spec("statistics"), task_fn(compute_statistics))),
        ("keywords", engine.register(spec("keywords"), task_fn(extract_keywords))),
        ("readability", engine.register(spec("readability"), task_fn(compute_readability))),
    ];

    engine.register(
        FunctionSpec::new("analyze.analyze_text").with_resources(ResourceRequest::none()),
        task_fn(move |input: Value, ctx: TaskContext| {
            let analyses = analyses.clone();
            async move {
                text_arg(&input)?;
                let futures: Vec<_> = analyses
                    .iter()
                    .map(|(_, f)| ctx.scope().launch(f, input.clone()))
                    .collect();
                wait(&futures, ReturnWhen::AllCompleted).await;

                let mut results = serde_json::Map::new();
                for ((name, _), future) in analyses.iter().zip(&futures) {
                    let value = future
                        .result()
                        .await
                        .map_err(|f| f.into_error(future.identity().short()))?;
                    results.insert(name.to_string(), value);
                }
                Ok(Value::Object(results))
            }
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_all_analyses_joined() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let result = engine
            .invoke("analyze-test", &root, default_input())
            .await
            .unwrap();

        let output = result.outcome.value().cloned().unwrap();
        assert_eq!(output["sentiment"]["label"], "positive");
        assert_eq!(output["statistics"]["paragraphs"], 2);
        assert!(output["keywords"].as_array().unwrap().len() <= 15);
        assert!(output["readability"]["flesch_reading_ease"].is_number());
    }

    #[tokio::test]
    async fn test_rejects_non_text() {
        let engine = Engine::in_memory();
        let root = register(&engine);
        let result = engine.invoke("analyze-bad", &root, json!(42)).await.unwrap();
        assert!(!result.outcome.is_success());
    }

    #[test]
    fn test_interpret_bands() {
        assert_eq!(interpret(95.0), "very easy (5th grade)");
        assert_eq!(interpret(55.0), "fairly difficult (10th-12th grade)");
        assert_eq!(interpret(0.0), "very difficult (college graduate)");
    }
}

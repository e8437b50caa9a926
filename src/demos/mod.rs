//! Bundled applications for `weft run`.

pub mod analyze;
pub mod fanout;
pub mod pipeline;
pub mod text;
pub mod wordcount;

use clap::ValueEnum;
use serde_json::Value;

use weft_engine::{Engine, FunctionRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum App {
    /// Broadcast an event to four notification channels
    Fanout,
    /// Download, parse, enrich and summarize documents
    Pipeline,
    /// Count words with a map and a streaming reduce
    Wordcount,
    /// Run four text analyses in parallel
    Analyze,
}

impl App {
    pub fn name(&self) -> &'static str {
        match self {
            App::Fanout => "fanout",
            App::Pipeline => "pipeline",
            App::Wordcount => "wordcount",
            App::Analyze => "analyze",
        }
    }

    /// Register the app's functions and return its root.
    pub fn register(&self, engine: &Engine) -> FunctionRef {
        match self {
            App::Fanout => fanout::register(engine),
            App::Pipeline => pipeline::register(engine),
            App::Wordcount => wordcount::register(engine),
            App::Analyze => analyze::register(engine),
        }
    }

    pub fn default_input(&self) -> Value {
        match self {
            App::Fanout => fanout::default_input(),
            App::Pipeline => pipeline::default_input(),
            App::Wordcount => wordcount::default_input(),
            App::Analyze => analyze::default_input(),
        }
    }
}

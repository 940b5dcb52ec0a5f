//! Data kinds and representations of the built-in steps

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use clusterfacts_core::{Data, Kind, RenderError, Representation};

/// One line read from a log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// File the line was read from
    pub file: String,

    /// Line content without its terminator
    pub text: String,
}

/// Lines collected from one log source during one poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    /// Tailed file or directory
    pub source: String,

    pub lines: Vec<LogLine>,
}

impl Data for LogBatch {
    const KIND: Kind = Kind::new("log_batch");

    fn id(&self) -> String {
        self.source.clone()
    }
}

/// A named set of facts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,

    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Data for Document {
    const KIND: Kind = Kind::new("document");

    fn id(&self) -> String {
        self.name.clone()
    }
}

/// Log lines as plain text, one per line
pub struct LogBatchText;

impl Representation for LogBatchText {
    type Data = LogBatch;
    const KIND: Kind = Kind::new("log_batch.text");
    const MIME: &'static str = "text/plain";

    fn render(data: &LogBatch) -> Result<String, RenderError> {
        Ok(data
            .lines
            .iter()
            .map(|line| format!("{}\n", line.text))
            .collect())
    }
}

pub struct LogBatchJson;

impl Representation for LogBatchJson {
    type Data = LogBatch;
    const KIND: Kind = Kind::new("log_batch.json");
    const MIME: &'static str = "application/json";

    fn render(data: &LogBatch) -> Result<String, RenderError> {
        Ok(serde_json::to_string(data)?)
    }
}

pub struct DocumentJson;

impl Representation for DocumentJson {
    type Data = Document;
    const KIND: Kind = Kind::new("document.json");
    const MIME: &'static str = "application/json";

    fn render(data: &Document) -> Result<String, RenderError> {
        Ok(serde_json::to_string_pretty(data)?)
    }
}

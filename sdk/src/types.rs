//! Content-block and capability payload types
//!
//! A step's input is an ordered list of `ContentBlock`s: labeled text
//! fragments, some of which are flagged mandatory (instruction blocks that
//! budget trimming must preserve). Capabilities consume blocks and produce
//! either tool requests or a final `CapabilityOutput`.

use serde::{Deserialize, Serialize};

/// One ordered fragment of a step's input payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    /// Optional section label, rendered as a heading above the text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Block body
    pub text: String,

    /// Mandatory blocks survive budget trimming (truncated only as a last
    /// resort); everything else is droppable under pressure
    #[serde(default)]
    pub mandatory: bool,
}

impl ContentBlock {
    /// Create a plain, droppable block
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            label: None,
            text: text.into(),
            mandatory: false,
        }
    }

    /// Create a labeled, droppable block
    pub fn labeled(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            text: text.into(),
            mandatory: false,
        }
    }

    /// Create a mandatory instruction block
    pub fn mandatory(text: impl Into<String>) -> Self {
        Self {
            label: None,
            text: text.into(),
            mandatory: true,
        }
    }

    /// Mark an existing block as mandatory
    pub fn into_mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// The block as it is presented to a capability: label line (if any)
    /// followed by the body
    pub fn rendered(&self) -> String {
        match &self.label {
            Some(label) => format!("{}\n{}", label, self.text),
            None => self.text.clone(),
        }
    }

    /// Character length of the rendered form
    pub fn rendered_len(&self) -> usize {
        self.label.as_ref().map(|l| l.len() + 1).unwrap_or(0) + self.text.len()
    }
}

/// Tool invocation requested by a capability mid-step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Unique identifier for this invocation
    pub id: String,

    /// Name of the tool to run
    pub name: String,

    /// Arguments to pass to the tool (JSON string)
    pub arguments: String,
}

impl ToolRequest {
    /// Create a new tool request
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// Final output of a capability for one step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityOutput {
    /// Step result text
    pub text: String,

    /// Source URLs backing the result (research capabilities)
    #[serde(default)]
    pub sources: Vec<String>,

    /// Optional structured result (processing capabilities)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<serde_json::Value>,
}

impl CapabilityOutput {
    /// Create a plain text output with no sources
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sources: Vec::new(),
            structured: None,
        }
    }

    /// Attach source URLs
    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }
}

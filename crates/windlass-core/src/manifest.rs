//! Manifest of workflows and steps produced by the build pipeline.
//!
//! Served verbatim at `/.well-known/workflow/v1/manifest.json`. The maps are
//! keyed by module specifier, then by exported function name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::name::{StepName, WorkflowName};

/// Manifest format version this runtime writes.
pub const MANIFEST_VERSION: u32 = 1;

/// Manifest entry for a workflow function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEntry {
    /// Stable workflow id assigned by the build.
    #[serde(rename = "workflowId")]
    pub workflow_id: String,

    /// Optional static call graph captured at build time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<serde_json::Value>,
}

/// Manifest entry for a step function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepEntry {
    /// Stable step id assigned by the build.
    #[serde(rename = "stepId")]
    pub step_id: String,
}

/// Static manifest of everything the deployed bundle exports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: u32,

    /// `moduleSpecifier -> functionName -> entry`.
    pub workflows: BTreeMap<String, BTreeMap<String, WorkflowEntry>>,

    /// `moduleSpecifier -> functionName -> entry`.
    pub steps: BTreeMap<String, BTreeMap<String, StepEntry>>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

impl Manifest {
    /// Creates an empty manifest at the current version.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            workflows: BTreeMap::new(),
            steps: BTreeMap::new(),
        }
    }

    /// Records a workflow under its module specifier and function name.
    pub fn insert_workflow(&mut self, name: &WorkflowName) {
        self.workflows
            .entry(name.module_specifier().to_string())
            .or_default()
            .insert(
                name.item().to_string(),
                WorkflowEntry {
                    workflow_id: name.to_string(),
                    graph: None,
                },
            );
    }

    /// Records a step under its module specifier and function name.
    pub fn insert_step(&mut self, name: &StepName) {
        self.steps
            .entry(name.module_specifier().to_string())
            .or_default()
            .insert(
                name.item().to_string(),
                StepEntry {
                    step_id: name.to_string(),
                },
            );
    }

    /// Looks up a workflow entry.
    #[must_use]
    pub fn workflow(&self, name: &WorkflowName) -> Option<&WorkflowEntry> {
        self.workflows
            .get(name.module_specifier())?
            .get(name.item())
    }

    /// Looks up a step entry.
    #[must_use]
    pub fn step(&self, name: &StepName) -> Option<&StepEntry> {
        self.steps.get(name.module_specifier())?.get(name.item())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut manifest = Manifest::new();
        let wf = WorkflowName::new("./flows.ts", "addTen");
        let step = StepName::new("./math.ts", "add");

        manifest.insert_workflow(&wf);
        manifest.insert_step(&step);

        assert_eq!(
            manifest.workflow(&wf).expect("workflow entry").workflow_id,
            wf.to_string()
        );
        assert_eq!(manifest.step(&step).expect("step entry").step_id, step.to_string());
    }

    #[test]
    fn json_shape() {
        let mut manifest = Manifest::new();
        manifest.insert_workflow(&WorkflowName::new("./flows.ts", "addTen"));

        let json = serde_json::to_value(&manifest).expect("serialize");
        assert_eq!(json["version"], 1);
        assert_eq!(
            json["workflows"]["./flows.ts"]["addTen"]["workflowId"],
            "workflow//./flows.ts//addTen"
        );
        // graph is omitted when absent
        assert!(json["workflows"]["./flows.ts"]["addTen"]
            .get("graph")
            .is_none());
    }

    #[test]
    fn roundtrip() {
        let mut manifest = Manifest::new();
        manifest.insert_workflow(&WorkflowName::new("pkg@1.0.0", "run"));
        manifest.insert_step(&StepName::new("pkg@1.0.0", "fetch"));

        let json = serde_json::to_string(&manifest).expect("serialize");
        let parsed: Manifest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, manifest);
    }
}

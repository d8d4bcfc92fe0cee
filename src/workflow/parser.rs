//! Workflow Source Loader
//!
//! Handles loading workflow definitions from JSON or YAML files, whole
//! folders, or in-memory lists. Every source yields a [`LoadedWorkflow`]
//! carrying the parsed workflow (if any) and its validation errors, so
//! one broken file never hides the others.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::model::Workflow;
use super::validator::validate_workflow;

/// File extensions recognised as workflow definitions.
const WORKFLOW_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

/// Where a batch of workflows comes from.
#[derive(Debug, Clone)]
pub enum WorkflowSource {
    /// Every workflow file directly inside a folder
    Folder(PathBuf),
    /// An explicit list of files
    Files(Vec<PathBuf>),
    /// Workflows already in memory
    Workflows(Vec<Workflow>),
}

/// One workflow as seen by the loader.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    /// File path or in-memory label
    pub source: String,
    /// Parsed workflow, absent when parsing failed
    pub workflow: Option<Workflow>,
    /// Parse and validation errors; empty when the workflow is runnable
    pub errors: Vec<String>,
}

impl LoadedWorkflow {
    fn from_workflow(source: String, workflow: Workflow) -> Self {
        let errors = match validate_workflow(&workflow) {
            Ok(_) => Vec::new(),
            Err(errors) => errors.messages(),
        };
        Self {
            source,
            workflow: Some(workflow),
            errors,
        }
    }

    fn from_error(source: String, error: impl ToString) -> Self {
        Self {
            source,
            workflow: None,
            errors: vec![error.to_string()],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.workflow.is_some() && self.errors.is_empty()
    }
}

/// Parses workflow text; `extension` selects JSON or YAML, anything else
/// tries JSON first.
pub fn parse_workflow(content: &str, extension: Option<&str>) -> Result<Workflow, Box<dyn Error + Send + Sync>> {
    let workflow = match extension {
        Some("json") => serde_json::from_str(content)
            .map_err(|e| format!("Failed to parse workflow JSON: {}", e))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(content)
            .map_err(|e| format!("Failed to parse workflow YAML: {}", e))?,
        _ => match serde_json::from_str(content) {
            Ok(workflow) => workflow,
            Err(_) => serde_yaml::from_str(content)
                .map_err(|e| format!("Failed to parse workflow: {}", e))?,
        },
    };
    Ok(workflow)
}

/// Loads a workflow from a file without validating it.
///
/// The workflow name defaults to the file stem.
///
/// # Example
///
/// ```rust,no_run
/// use flowpilot::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
///     let workflow = load_workflow("login.json")?;
///     println!("Loaded {} nodes", workflow.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, Box<dyn Error + Send + Sync>> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|e| {
        format!(
            "Failed to read workflow file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        )
    })?;

    debug!("Workflow content loaded ({} bytes)", content.len());

    let extension = path.extension().and_then(|e| e.to_str());
    let mut workflow = parse_workflow(&content, extension)?;

    if workflow.name.is_empty() {
        workflow.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("workflow")
            .to_string();
    }

    debug!(
        "Parsed workflow '{}': {} nodes, {} edges",
        workflow.name,
        workflow.nodes.len(),
        workflow.edges.len()
    );

    Ok(workflow)
}

/// Loads and validates one file.
pub fn load_file(path: &Path) -> LoadedWorkflow {
    let source = path.display().to_string();
    match load_workflow(path) {
        Ok(workflow) => LoadedWorkflow::from_workflow(source, workflow),
        Err(e) => {
            warn!("Skipping '{}': {}", source, e);
            LoadedWorkflow::from_error(source, e)
        }
    }
}

/// Lists workflow files directly inside a folder, sorted by name.
pub fn scan_folder(folder: &Path) -> Result<Vec<PathBuf>, Box<dyn Error + Send + Sync>> {
    let entries = fs::read_dir(folder)
        .map_err(|e| format!("Failed to read folder '{}': {}", folder.display(), e))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| WORKFLOW_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();

    files.sort();
    info!("Found {} workflow files in {}", files.len(), folder.display());
    Ok(files)
}

/// Loads every workflow of a source, valid or not.
pub fn load_source(source: &WorkflowSource) -> Result<Vec<LoadedWorkflow>, Box<dyn Error + Send + Sync>> {
    let loaded = match source {
        WorkflowSource::Folder(folder) => scan_folder(folder)?
            .iter()
            .map(|path| load_file(path))
            .collect(),
        WorkflowSource::Files(files) => files.iter().map(|path| load_file(path)).collect(),
        WorkflowSource::Workflows(workflows) => workflows
            .iter()
            .enumerate()
            .map(|(i, workflow)| {
                let label = if workflow.name.is_empty() {
                    format!("workflow-{}", i + 1)
                } else {
                    workflow.name.clone()
                };
                LoadedWorkflow::from_workflow(label, workflow.clone())
            })
            .collect(),
    };
    Ok(loaded)
}

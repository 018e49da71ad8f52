//! Workflow Definition Service — discovery, parsing, validation, and
//! caching of Markdown workflow definitions.
//!
//! A base directory contains one subdirectory per workflow; each
//! workflow directory holds an `index.md` (with the step list) and a
//! `steps/` directory with one file per step. Parsed definitions are
//! cached in memory and invalidated by a content fingerprint over all
//! files in the workflow directory, so live edits take effect without a
//! restart.

pub mod includes;
pub mod parser;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};

use crate::error::DefinitionError;
use includes::resolve_includes;
use parser::{parse_index, parse_step_content, ParsedStep};

/// Delimiter between the index and step sections of the definition blob.
const BLOB_DELIMITER: &str = "\n\n---\n\n";

/// A fully parsed workflow definition, reconstructable from files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Canonical step IDs in index order.
    pub step_list: Vec<String>,
    pub steps: HashMap<String, ParsedStep>,
    /// Deterministic concatenation of the resolved index and step files,
    /// used as LLM prompt context.
    pub full_blob: String,
}

struct CacheSlot {
    fingerprint: String,
    definition: Arc<WorkflowDefinition>,
}

pub struct WorkflowDefinitionService {
    definitions_dir: PathBuf,
    cache: RwLock<HashMap<String, CacheSlot>>,
}

impl WorkflowDefinitionService {
    /// Create the service and eagerly parse every workflow directory.
    /// Invalid workflows are logged and skipped so the service still
    /// comes up with the valid ones.
    pub fn new(definitions_dir: impl Into<PathBuf>) -> Self {
        let service = Self {
            definitions_dir: definitions_dir.into(),
            cache: RwLock::new(HashMap::new()),
        };

        for name in service.list_workflows() {
            if let Err(e) = service.load(&name) {
                tracing::error!("failed to load workflow '{}' during initial scan: {}", name, e);
            }
        }

        service
    }

    /// Names of all workflow subdirectories under the base directory.
    pub fn list_workflows(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.definitions_dir) else {
            tracing::warn!(
                "definitions directory not found: {}",
                self.definitions_dir.display()
            );
            return Vec::new();
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    /// The pre-assembled definition blob for the workflow.
    pub fn full_definition_blob(&self, workflow_name: &str) -> Result<String, DefinitionError> {
        Ok(self.load(workflow_name)?.full_blob.clone())
    }

    /// Verbatim `# Client Instructions` body for the named step.
    pub fn step_client_instructions(
        &self,
        workflow_name: &str,
        step_name: &str,
    ) -> Result<String, DefinitionError> {
        let definition = self.load(workflow_name)?;
        definition
            .steps
            .get(step_name)
            .map(|step| step.client_instructions.clone())
            .ok_or_else(|| {
                DefinitionError::not_found(
                    format!(
                        "step '{}' not found in workflow '{}'",
                        step_name, workflow_name
                    ),
                    None,
                )
            })
    }

    /// Canonical step IDs in index order.
    pub fn step_list(&self, workflow_name: &str) -> Result<Vec<String>, DefinitionError> {
        Ok(self.load(workflow_name)?.step_list.clone())
    }

    /// Load the workflow, reusing the cached parse when the directory
    /// fingerprint is unchanged.
    fn load(&self, workflow_name: &str) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        let fingerprint = self.directory_fingerprint(workflow_name);

        {
            let cache = self.cache.read().expect("definition cache lock");
            if let Some(slot) = cache.get(workflow_name) {
                if slot.fingerprint == fingerprint {
                    return Ok(slot.definition.clone());
                }
            }
        }

        let definition = Arc::new(self.parse_workflow(workflow_name)?);
        tracing::info!(
            "loaded workflow '{}' with steps: {:?}",
            workflow_name,
            definition.step_list
        );

        let mut cache = self.cache.write().expect("definition cache lock");
        cache.insert(
            workflow_name.to_string(),
            CacheSlot {
                fingerprint,
                definition: definition.clone(),
            },
        );
        Ok(definition)
    }

    fn parse_workflow(&self, workflow_name: &str) -> Result<WorkflowDefinition, DefinitionError> {
        let workflow_path = self.definitions_dir.join(workflow_name);
        let index_file = workflow_path.join("index.md");
        let steps_dir = workflow_path.join("steps");

        if !workflow_path.is_dir() {
            return Err(DefinitionError::not_found(
                format!("workflow directory not found: {}", workflow_path.display()),
                Some(workflow_path),
            ));
        }
        if !index_file.is_file() {
            return Err(DefinitionError::not_found(
                format!("workflow index file not found: {}", index_file.display()),
                Some(index_file),
            ));
        }
        if !steps_dir.is_dir() {
            return Err(DefinitionError::not_found(
                format!("workflow steps directory not found: {}", steps_dir.display()),
                Some(steps_dir),
            ));
        }

        let index_raw = read_file(&index_file)?;
        let index_content = resolve_includes(&index_raw, &index_file, &workflow_path)?;
        let step_links = parse_index(&index_content, &index_file)?;

        let mut step_list = Vec::with_capacity(step_links.len());
        let mut steps = HashMap::with_capacity(step_links.len());
        let mut blob_parts = vec![index_content];

        for (step_name, relative_path) in step_links {
            let step_file = workflow_path.join(&relative_path);
            if !step_file.is_file() {
                return Err(DefinitionError::not_found(
                    format!("step file not found: {}", step_file.display()),
                    Some(step_file),
                ));
            }

            let raw = read_file(&step_file)?;
            let base_dir = step_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| workflow_path.clone());
            let resolved = resolve_includes(&raw, &step_file, &base_dir)?;
            let parsed = parse_step_content(&resolved, &step_file)?;

            blob_parts.push(format!("## Step: {}\n\n{}", step_name, parsed.full_content));
            step_list.push(step_name.clone());
            steps.insert(step_name, parsed);
        }

        Ok(WorkflowDefinition {
            name: workflow_name.to_string(),
            step_list,
            steps,
            full_blob: blob_parts.join(BLOB_DELIMITER),
        })
    }

    /// SHA-256 over every file's relative path and bytes, in sorted
    /// order so the result is independent of directory listing order.
    fn directory_fingerprint(&self, workflow_name: &str) -> String {
        let workflow_path = self.definitions_dir.join(workflow_name);
        let mut files = Vec::new();
        collect_files(&workflow_path, &mut files);
        files.sort();

        let mut hasher = Sha256::new();
        for file in files {
            if let Ok(relative) = file.strip_prefix(&workflow_path) {
                hasher.update(relative.to_string_lossy().as_bytes());
            }
            match std::fs::read(&file) {
                Ok(bytes) => hasher.update(&bytes),
                Err(e) => {
                    tracing::warn!(
                        "could not read {} during fingerprint calculation: {}",
                        file.display(),
                        e
                    );
                }
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(path);
        }
    }
}

fn read_file(path: &Path) -> Result<String, DefinitionError> {
    std::fs::read_to_string(path).map_err(|e| {
        DefinitionError::not_found(
            format!("error reading {}: {}", path.display(), e),
            Some(path.to_path_buf()),
        )
    })
}

//! Default system prompt provider
//!
//! Combines a fixed base prompt with operator guidance files (ROOMWRIGHT.md,
//! discovered from the working directory up to the filesystem root) and a
//! live summary of the scene.

use crate::runtime::ContextProvider;
use crate::tools::SceneBackend;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name of the guidance file to look for in each directory
const GUIDANCE_FILE_NAME: &str = "ROOMWRIGHT.md";

/// Base system prompt establishing the assistant's role
const BASE_PROMPT: &str = r"You are a room design assistant. You help the user lay out rooms and the objects in them using the scene tools.

Create a room before adding objects to it. When a request involves several steps, call the tools in the order the steps depend on each other.

Be concise; your replies may be read aloud. After using tools, say briefly what changed.";

/// A discovered guidance file with its path and content
#[derive(Debug, Clone)]
pub struct GuidanceFile {
    pub path: PathBuf,
    pub content: String,
}

/// Discover guidance files from the working directory up to the root.
/// Returns files in order from root to cwd (more specific files last).
pub fn discover_guidance_files(working_dir: &Path) -> Vec<GuidanceFile> {
    let mut files = Vec::new();
    let mut current = Some(working_dir.to_path_buf());

    while let Some(dir) = current {
        let path = dir.join(GUIDANCE_FILE_NAME);
        if path.is_file() {
            match std::fs::read_to_string(&path) {
                Ok(content) => files.push(GuidanceFile { path, content }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable guidance file");
                }
            }
        }
        current = dir.parent().map(Path::to_path_buf);
    }

    files.reverse();
    files
}

/// Context provider used by the binary
pub struct DefaultContextProvider {
    guidance: Vec<GuidanceFile>,
    scene: Option<Arc<SceneBackend>>,
}

impl DefaultContextProvider {
    pub fn new(guidance: Vec<GuidanceFile>, scene: Option<Arc<SceneBackend>>) -> Self {
        Self { guidance, scene }
    }

    /// Load guidance from `working_dir` once; the scene summary is rebuilt
    /// for every request
    pub fn discover(working_dir: &Path, scene: Option<Arc<SceneBackend>>) -> Self {
        let guidance = discover_guidance_files(working_dir);
        if !guidance.is_empty() {
            tracing::info!(files = guidance.len(), "Loaded operator guidance");
        }
        Self::new(guidance, scene)
    }
}

impl ContextProvider for DefaultContextProvider {
    fn system_prompt(&self) -> String {
        let mut prompt = String::from(BASE_PROMPT);

        if !self.guidance.is_empty() {
            prompt.push_str("\n\n<operator_guidance>\n");
            for (i, file) in self.guidance.iter().enumerate() {
                if i > 0 {
                    prompt.push_str("\n---\n\n");
                }
                let display_path = file.path.display();
                let _ = writeln!(prompt, "<!-- From: {display_path} -->");
                prompt.push_str(&file.content);
                if !file.content.ends_with('\n') {
                    prompt.push('\n');
                }
            }
            prompt.push_str("</operator_guidance>");
        }

        if let Some(scene) = &self.scene {
            prompt.push_str("\n\n<current_scene>\n");
            prompt.push_str(&scene.summary());
            if !prompt.ends_with('\n') {
                prompt.push('\n');
            }
            prompt.push_str("</current_scene>");
        }

        prompt
    }
}

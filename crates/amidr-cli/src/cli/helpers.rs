use super::CliError;
use amidr_core::common::config::{AnalysisConfig, load_analysis_config};
use amidr_core::domain::AmidrError;
use amidr_core::modules::serialization::write_text_artifact;
use anyhow::Context;
use globset::{Glob, GlobMatcher};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};

pub(super) fn load_config(path: Option<&Path>) -> Result<AnalysisConfig, CliError> {
    match path {
        Some(path) => load_analysis_config(path).map_err(CliError::Analysis),
        None => Ok(AnalysisConfig::default()),
    }
}

/// Expands every directory input into its files matching `pattern`, sorted by path.
/// File inputs are taken as given.
pub(super) fn collect_inputs(inputs: &[PathBuf], pattern: &str) -> Result<Vec<PathBuf>, CliError> {
    let matcher = compile_pattern(pattern)?;
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut matched = directory_matches(input, &matcher)?;
            if matched.is_empty() {
                tracing::warn!(directory = %input.display(), pattern, "no files matched");
            }
            files.append(&mut matched);
        } else if input.is_file() {
            files.push(input.clone());
        } else {
            return Err(CliError::Analysis(AmidrError::io_system(
                "IO.INPUT_MISSING",
                format!("input '{}' does not exist", input.display()),
            )));
        }
    }
    if files.is_empty() {
        return Err(CliError::Usage(format!(
            "no input files found (pattern '{pattern}')"
        )));
    }
    Ok(files)
}

fn compile_pattern(pattern: &str) -> Result<GlobMatcher, CliError> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|error| CliError::Usage(format!("invalid file pattern '{pattern}': {error}")))
}

fn directory_matches(directory: &Path, matcher: &GlobMatcher) -> Result<Vec<PathBuf>, CliError> {
    let entries = fs::read_dir(directory)
        .with_context(|| format!("failed to list directory '{}'", directory.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in '{}'", directory.display()))?;
        let path = entry.path();
        if path.is_file()
            && path
                .file_name()
                .is_some_and(|name| matcher.is_match(Path::new(name)))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub(super) fn ensure_directory(path: &Path) -> Result<(), CliError> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create output directory '{}'", path.display()))?;
    Ok(())
}

pub(super) fn write_text(path: &Path, content: &str) -> Result<(), CliError> {
    write_text_artifact(path, content)
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    tracing::debug!(path = %path.display(), "wrote text artifact");
    Ok(())
}

pub(super) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CliError> {
    let content = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize '{}'", path.display()))?;
    write_text(path, &content)
}

pub(super) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_str(&source).map_err(|error| {
        CliError::Analysis(AmidrError::configuration(
            "CONFIG.ARTIFACT_PARSE",
            format!("failed to parse '{}': {}", path.display(), error),
        ))
    })
}

pub(super) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record".to_string())
}

//! Definition command handlers
//!
//! `validate` loads a definitions file and prints what it declares; `match`
//! evaluates an event against it without running anything.

use anyhow::{Context, Result};
use colored::*;
use sluice_core::domain::event::TriggerEvent;
use sluice_runner::DefinitionSet;
use sluice_runner::definitions;
use std::path::Path;

use crate::render::print_pipeline_summary;

/// Loads and validates a definitions file
pub fn load(path: &Path) -> Result<DefinitionSet> {
    let project = definitions::load_file(path)
        .with_context(|| format!("Invalid definitions in {}", path.display()))?;
    Ok(DefinitionSet::new(project))
}

pub fn validate(path: &Path) -> Result<()> {
    let set = load(path)?;

    println!(
        "{} {}",
        "✓".green(),
        format!(
            "Project '{}' defines {} pipeline(s):",
            set.project(),
            set.pipelines().len()
        )
        .bold()
    );
    if let Some(root) = set.vcs_root() {
        println!("  VCS root:  {} ({})", root.url, root.default_branch);
    }
    println!();

    for def in set.pipelines() {
        print_pipeline_summary(def);
    }

    Ok(())
}

pub fn show_matches(path: &Path, event: &TriggerEvent) -> Result<()> {
    let set = load(path)?;
    let matching = set.matching(event);

    if matching.is_empty() {
        println!(
            "{}",
            format!("No pipeline is triggered by {}.", event.git_ref).yellow()
        );
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{} pipeline(s) triggered by {}:",
            matching.len(),
            event.git_ref
        )
        .bold()
    );
    for def in matching {
        println!("  {} {}", "▸".cyan(), def.name);
    }

    Ok(())
}

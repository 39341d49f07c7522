//! Terminal rendering for definitions, run events and run summaries

use colored::*;
use sluice_core::domain::event::{RunEvent, RunEventKind};
use sluice_core::domain::log::{LogEntry, LogLevel};
use sluice_core::domain::pipeline::{FilterRule, PipelineDefinition};
use sluice_core::domain::run::{Run, RunState, StepResult};

/// Colorize run state for display
pub fn colorize_state(state: RunState) -> ColoredString {
    let state_str = state.to_string();
    match state {
        RunState::Queued => state_str.yellow(),
        RunState::Running => state_str.cyan(),
        RunState::Succeeded => state_str.green(),
        RunState::Failed => state_str.red(),
        RunState::Cancelled => state_str.dimmed(),
        RunState::TimedOut => state_str.red(),
    }
}

fn rules(rules: &[FilterRule]) -> String {
    if rules.is_empty() {
        return "(any)".to_string();
    }
    rules
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Print a pipeline summary
pub fn print_pipeline_summary(def: &PipelineDefinition) {
    println!("  {} {}", "▸".cyan(), def.name.bold());
    if let Some(description) = &def.description {
        println!("    {}", description.dimmed());
    }
    println!("    Context:   {}", def.status_context);
    println!("    Timeout:   {}m", def.timeout.as_secs() / 60);
    println!("    Branches:  {}", rules(&def.trigger.branch_filter));
    if let Some(paths) = &def.trigger.path_filter {
        println!("    Paths:     {}", rules(paths));
    }
    for step in &def.steps {
        println!(
            "    {}. {} {}",
            step.position + 1,
            step.name,
            format!("({})", step.image).dimmed()
        );
    }
    for rule in &def.artifact_rules {
        println!("    Artifact:  {}", rule.to_string().dimmed());
    }
    println!();
}

/// Print a log entry
pub fn print_log_entry(prefix: &str, log: &LogEntry) {
    let level_str = format!("{:?}", log.level).to_uppercase();
    let level_colored = match log.level {
        LogLevel::Debug => level_str.dimmed(),
        LogLevel::Info => level_str.cyan(),
        LogLevel::Warning => level_str.yellow(),
        LogLevel::Error => level_str.red(),
    };

    println!(
        "{} {} [{}] {}",
        log.timestamp.format("%H:%M:%S").to_string().dimmed(),
        prefix,
        level_colored,
        log.message
    );
}

fn print_step_result(prefix: &str, step: &StepResult) {
    let mark = if step.passed() { "✓".green() } else { "✗".red() };
    let detail = match &step.execution_error {
        Some(error) => error.red().to_string(),
        None => format!("exit {}", step.exit_code),
    };
    println!(
        "{} {} {} ({}, {:.1}s)",
        prefix,
        mark,
        step.name,
        detail,
        step.duration.as_secs_f64()
    );
}

/// Print one run event as it arrives
pub fn print_event(event: &RunEvent) {
    let prefix = format!("[{}]", event.pipeline).cyan().to_string();

    match &event.kind {
        RunEventKind::Queued => println!("{} {}", prefix, "queued".dimmed()),
        RunEventKind::StateChanged(state) => {
            println!("{} {} {}", prefix, "→".dimmed(), colorize_state(*state))
        }
        RunEventKind::StepStarted { index, name } => {
            println!("{} {} step {}: {}", prefix, "▸".cyan(), index + 1, name.bold())
        }
        RunEventKind::StepFinished(step) => print_step_result(&prefix, step),
        RunEventKind::Log(entry) => print_log_entry(&prefix, entry),
        RunEventKind::Superseded { by } => println!(
            "{} {}",
            prefix,
            format!("superseded by run {}", by).dimmed()
        ),
    }
}

/// Print the final state of a run
pub fn print_run_summary(run: &Run) {
    println!(
        "  {} {} {}",
        colorize_state(run.state),
        run.pipeline.bold(),
        run.id.to_string().dimmed()
    );
    println!("    Ref:       {} @ {}", run.git_ref, run.commit_sha);
    if let Some(duration) = run.duration() {
        println!("    Duration:  {}s", duration.num_seconds());
    }
    println!("    Steps:     {}/{}", run.steps.len(), run.total_steps);
    for artifact in &run.artifacts {
        println!(
            "    Artifact:  {} ({} file(s)) {}",
            artifact.archive,
            artifact.files.len(),
            artifact.path.display().to_string().dimmed()
        );
    }
    if let Some(error) = &run.error_message {
        println!("    Error:     {}", error.red());
    }
}

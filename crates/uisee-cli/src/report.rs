//! Terminal output for runs, single commands and history.

use std::{path::Path, process::ExitCode};

use anyhow::{Context as _, Result};
use futures::{StreamExt, future, stream::BoxStream};
use serde_json::Value;
use uisee_core::{
    CommandRecord, Routed, RunEvent, RunState, StepAction, StepStatus, TargetCommand,
    render_value,
};
use uisee_executor::DeviceError;
use uisee_sequencer::{RunReport, StepList};

/// Print run events as they arrive, until the run finishes.
pub async fn print_progress(events: BoxStream<'static, RunEvent>) {
    events
        .take_while(|event| future::ready(!event.is_finished()))
        .for_each(|event| {
            match event {
                RunEvent::RunStarted { steps, repeat, .. } => {
                    println!("Running {steps} step(s) x {repeat}");
                }
                RunEvent::StepStarted {
                    step,
                    repeat,
                    kind,
                    command,
                    ..
                } => println!("[{repeat}:{}] {} {command}", step + 1, kind.as_str()),
                RunEvent::StepFinished { result, .. } => println!(
                    "[{}:{}]   -> {} ({:.2}s) {}",
                    result.repeat,
                    result.step + 1,
                    result.status,
                    result.duration_sec,
                    result.output
                ),
                RunEvent::RunFinished { .. } => {}
            }
            future::ready(())
        })
        .await;
}

pub fn print_summary(report: &RunReport) {
    let log = &report.log;
    let state = match report.state {
        RunState::Completed => "completed",
        RunState::Aborted => "aborted",
        RunState::Running | RunState::Idle => "stopped",
    };
    println!(
        "Run {} {state}: {} result(s), {} success, {} fail, {} timeout, {} invalid, {} error, {} waited",
        report.run_id,
        log.len(),
        log.count(StepStatus::Success),
        log.count(StepStatus::Fail),
        log.count(StepStatus::Timeout),
        log.count(StepStatus::Invalid),
        log.count(StepStatus::Error),
        log.count(StepStatus::Waited),
    );
}

/// A completed run with no failed step.
pub fn succeeded(report: &RunReport) -> bool {
    report.state == RunState::Completed
        && report
            .log
            .results()
            .iter()
            .all(|r| matches!(r.status, StepStatus::Success | StepStatus::Waited))
}

pub fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub fn print_routed(command: &str, routed: &Routed) -> ExitCode {
    let status = StepStatus::from_routed(&routed.result);
    println!("{command} via {}: {status}", routed.via);
    let output = routed.output_text();
    if !output.is_empty() {
        println!("{output}");
    }
    exit_code(routed.is_success())
}

pub fn print_device(action: &str, outcome: &Result<Value, DeviceError>) -> ExitCode {
    match outcome {
        Ok(value) => {
            println!("{action}: ok");
            let text = render_value(value);
            if !text.is_empty() {
                println!("{text}");
            }
        }
        Err(e) => println!("{action}: {e}"),
    }
    exit_code(outcome.is_ok())
}

/// Read a JSON test plan.
pub async fn load_plan(path: &Path) -> Result<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read test plan {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid test plan {}", path.display()))
}

/// List the steps and return how many publish steps will not parse.
pub fn print_validation(list: &StepList) -> usize {
    let mut malformed = 0;
    for (index, step) in list.iter().enumerate() {
        let note = match &step.action {
            StepAction::PublishAndWait { command } => match TargetCommand::parse(command) {
                Ok(_) => String::new(),
                Err(e) => {
                    malformed += 1;
                    format!("  <- {e}")
                }
            },
            _ => String::new(),
        };
        println!(
            "{:>3}. {:<4} {}  (pre {:.1}s, post {:.1}s){note}",
            index + 1,
            step.kind().as_str(),
            step.display_text(),
            step.pre_wait().as_secs_f64(),
            step.post_wait().as_secs_f64(),
        );
    }
    println!("{} step(s)", list.len());
    malformed
}

pub fn print_history(records: &[CommandRecord]) {
    if records.is_empty() {
        println!("No commands recorded");
        return;
    }
    for record in records {
        let mark = if record.success { "ok" } else { "FAILED" };
        println!(
            "{} {:<4} {:<6} {}  {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.via,
            mark,
            record.command,
            record.result
        );
    }
}

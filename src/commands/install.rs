use super::{load_manifest, open_registry};
use colored::Colorize;
use futures::future::join_all;
use kegstand::error::Result;
use kegstand::pipeline::{InstallReport, InstallRequest, Pipeline, PipelineFailure};
use kegstand::resolver::PlanAction;
use kegstand::test_runner::TestResult;
use kegstand::{Config, HttpTransport, KegError};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn install(config: &Config, packages: &[String], head: bool) -> Result<ExitCode> {
    // Every manifest must parse before anything is fetched
    let requests = packages
        .iter()
        .map(|p| load_manifest(config, p).map(|m| InstallRequest::new(m).head(head)))
        .collect::<Result<Vec<_>>>()?;

    println!(
        "Installing {} package{}...",
        requests.len().to_string().bold(),
        if requests.len() == 1 { "" } else { "s" }
    );

    let transport = HttpTransport::new()?;
    let registry = open_registry(config)?;
    let pipeline = Pipeline::new(
        transport,
        registry,
        &config.prefix,
        config.pipeline.clone(),
    );

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling installs");
            on_interrupt.cancel();
        }
    });

    let outcomes = join_all(requests.into_iter().map(|r| pipeline.install(r, &cancel))).await;
    interrupt.abort();

    let mut first_failure: Option<u8> = None;
    let mut installed = 0;
    for outcome in &outcomes {
        match outcome {
            Ok(report) => {
                print_report(report);
                installed += 1;
            }
            Err(failure) => {
                print_failure(failure);
                first_failure.get_or_insert(failure.exit_code());
            }
        }
    }

    if installed > 0 {
        println!(
            "{} Installed {} package{}",
            "✓".green().bold(),
            installed.to_string().bold(),
            if installed == 1 { "" } else { "s" }
        );
    } else {
        println!("No packages were installed");
    }

    Ok(first_failure.map_or(ExitCode::SUCCESS, ExitCode::from))
}

fn print_report(report: &InstallReport) {
    let action = match &report.plan.action {
        PlanAction::Fresh => String::new(),
        PlanAction::Reinstall => " (reinstalled)".to_string(),
        PlanAction::Upgrade { from } => format!(" (upgraded from {})", from),
        PlanAction::Downgrade { from } => format!(" (downgraded from {})", from),
    };
    println!(
        "  {} {} {}{} [{}]",
        "✓".green(),
        report.name.bold().green(),
        report.version.to_string().dimmed(),
        action,
        report.source
    );
    println!(
        "    ├ {} files placed in {:.1}s",
        report.files.len().to_string().dimmed(),
        report.time_ms as f64 / 1000.0
    );
    if !report.plan.to_install_first.is_empty() {
        println!(
            "    ├ {} dependencies not installed: {}",
            "⚠".yellow(),
            report.plan.to_install_first.join(", ").cyan()
        );
    }
    match &report.test {
        TestResult::Pass => println!("    └ {} Test passed", "✓".green()),
        TestResult::Fail { exit_code, output } => {
            println!(
                "    └ {} Test failed with exit code {}",
                "⚠".yellow(),
                exit_code
            );
            print_output(output);
        }
    }
}

fn print_failure(failure: &PipelineFailure) {
    eprintln!(
        "  {} {} failed at {}: {}",
        "✗".red(),
        failure.package.bold(),
        failure.stage,
        failure.error
    );
    if let KegError::TestFailed { output, .. } = &failure.error {
        print_output(output);
    }
}

fn print_output(output: &str) {
    for line in output.lines().take(20) {
        eprintln!("      {}", line.dimmed());
    }
}

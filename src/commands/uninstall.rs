use super::open_registry;
use colored::Colorize;
use kegstand::error::Result;
use kegstand::resolver::ResolutionError;
use kegstand::{Config, HttpTransport, KegError, Pipeline};
use std::process::ExitCode;

pub async fn uninstall(config: &Config, packages: &[String], force: bool) -> Result<ExitCode> {
    println!(
        "Uninstalling {} package{}...",
        packages.len().to_string().bold(),
        if packages.len() == 1 { "" } else { "s" }
    );

    let pipeline = Pipeline::new(
        HttpTransport::new()?,
        open_registry(config)?,
        &config.prefix,
        config.pipeline.clone(),
    );

    let mut first_failure: Option<u8> = None;
    let mut uninstalled = 0;
    for name in packages {
        match pipeline.uninstall(name, force).await {
            Ok(report) => {
                println!(
                    "  {} Uninstalled {} {} ({} files)",
                    "✓".green(),
                    report.name.bold().green(),
                    report.version.to_string().dimmed(),
                    report.removed_files
                );
                uninstalled += 1;
            }
            Err(e) => {
                if let KegError::Resolution(ResolutionError::RequiredBy { required_by, .. }) = &e {
                    println!(
                        "  {} Cannot uninstall {} - required by: {}",
                        "⚠".yellow(),
                        name.bold(),
                        required_by.join(", ").cyan()
                    );
                    println!("    Use {} to force uninstall", "--force".dimmed());
                } else {
                    println!("  {} {}: {}", "✗".red(), name.bold(), e);
                }
                first_failure.get_or_insert(e.exit_code());
            }
        }
    }

    if uninstalled > 0 {
        println!(
            "{} Uninstalled {} package{}",
            "✓".green().bold(),
            uninstalled.to_string().bold(),
            if uninstalled == 1 { "" } else { "s" }
        );
    } else {
        println!("No packages were uninstalled");
    }

    Ok(first_failure.map_or(ExitCode::SUCCESS, ExitCode::from))
}

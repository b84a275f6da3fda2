use super::load_manifest;
use colored::Colorize;
use kegstand::error::Result;
use kegstand::registry::InstalledPackageSet;
use kegstand::Config;

pub async fn info(config: &Config, name_or_path: &str) -> Result<()> {
    let manifest = load_manifest(config, name_or_path)?;
    let installed = InstalledPackageSet::load(&config.registry)?;

    println!(
        "{} {}",
        manifest.name().bold().green(),
        manifest.version().to_string().dimmed()
    );
    if let Some(desc) = manifest.description() {
        println!("{}", desc);
    }
    if let Some(homepage) = manifest.homepage() {
        println!("{}", homepage.cyan());
    }
    println!();

    if let Some(url) = manifest.url() {
        println!("{} {}", "Release:".bold(), url);
    }
    if let Some(head) = manifest.head() {
        println!("{} {}", "Head:".bold(), head);
    }

    let describe = |names: &[String]| -> String {
        names
            .iter()
            .map(|n| {
                if installed.contains(n) {
                    format!("{} {}", n, "✓".green())
                } else {
                    format!("{} {}", n, "✗".red())
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    if !manifest.build_dependencies().is_empty() {
        println!(
            "{} {}",
            "Build dependencies:".bold(),
            describe(manifest.build_dependencies())
        );
    }
    if !manifest.dependencies().is_empty() {
        println!("{} {}", "Dependencies:".bold(), describe(manifest.dependencies()));
    }
    if !manifest.conflicts().is_empty() {
        println!(
            "{} {}",
            "Conflicts with:".bold(),
            manifest.conflicts().join(", ")
        );
    }

    println!("{}", "Installs:".bold());
    for step in manifest.install_steps() {
        println!("  {} -> {}", step.from.display(), step.to.display());
    }
    println!("{} {}", "Test:".bold(), manifest.test_command());
    println!();

    match installed.get(manifest.name()) {
        Some(package) => println!(
            "{} {} ({}, {} files, {})",
            "Installed:".bold(),
            package.version.to_string().green(),
            package.source,
            package.files.len(),
            package.installed_at.format("%Y-%m-%d %H:%M")
        ),
        None => println!("{} {}", "Installed:".bold(), "no".dimmed()),
    }

    Ok(())
}

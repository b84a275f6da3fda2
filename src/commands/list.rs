use colored::Colorize;
use kegstand::error::Result;
use kegstand::registry::InstalledPackageSet;
use kegstand::Config;

pub async fn list(config: &Config, show_versions: bool, json: bool) -> Result<()> {
    let installed = InstalledPackageSet::load(&config.registry)?;

    if json {
        let packages: Vec<_> = installed.iter().collect();
        println!("{}", serde_json::to_string_pretty(&packages)?);
        return Ok(());
    }

    // Piped output is just names, one per line
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    if is_tty {
        if installed.is_empty() {
            println!("No packages installed");
            return Ok(());
        }
        println!("Installed packages:");
    }

    for package in installed.iter() {
        let mut line = if is_tty {
            package.name.bold().to_string()
        } else {
            package.name.clone()
        };
        if show_versions {
            line.push(' ');
            line.push_str(package.version.as_str());
        }
        if is_tty && package.installed_as_dependency {
            line.push_str(&format!(" {}", "(dependency)".dimmed()));
        }
        println!("{}", line);
    }

    Ok(())
}

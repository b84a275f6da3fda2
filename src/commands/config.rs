use colored::Colorize;
use kegstand::error::Result;
use kegstand::Config;

pub fn config(config: &Config) -> Result<()> {
    let options = &config.pipeline;
    let file = match &config.config_file {
        Some(path) => path.display().to_string(),
        None => "(none)".dimmed().to_string(),
    };

    println!("{} {}", "KEG_PREFIX:".bold(), config.prefix.display());
    println!("{} {}", "KEG_REGISTRY:".bold(), config.registry.display());
    println!("{} {}", "KEG_FORMULA_DIR:".bold(), config.formula_dir.display());
    println!("{} {}", "Config file:".bold(), file);
    println!();
    println!("{} {}", "replace:".bold(), options.replace);
    println!("{} {}", "fail_test_is_fatal:".bold(), options.fail_test_is_fatal);
    println!("{} {}", "fetch_retries:".bold(), options.fetch_retries);
    println!("{} {:?}", "retry_backoff:".bold(), options.retry_backoff);
    match options.deadline {
        Some(deadline) => println!("{} {:?}", "timeout:".bold(), deadline),
        None => println!("{} {}", "timeout:".bold(), "none".dimmed()),
    }
    println!("{} {:?}", "dependency_policy:".bold(), options.dependency_policy);
    match &options.staging_dir {
        Some(dir) => println!("{} {}", "staging_dir:".bold(), dir.display()),
        None => println!("{} {}", "staging_dir:".bold(), "system temp".dimmed()),
    }
    println!(
        "{} {} x {:?}",
        "lock_wait:".bold(),
        config.lock_wait_attempts,
        config.lock_wait_interval
    );

    Ok(())
}

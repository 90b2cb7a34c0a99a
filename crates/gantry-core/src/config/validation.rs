//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, PipelineTask};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_globals(config)?;
    for (key, task) in &config.pipeline {
        validate_task(key, task)?;
    }
    validate_cache(config)?;
    debug!("configuration validation passed");
    Ok(())
}

fn validate_globals(config: &Config) -> Result<()> {
    if config.concurrency == 0 {
        return Err(invalid("concurrency", "must be at least 1"));
    }

    validate_env_names("globalEnv", &config.global_env)?;
    if let Some(pass_through) = &config.global_pass_through_env {
        validate_env_names("globalPassThroughEnv", pass_through)?;
    }

    for dep in &config.global_dependencies {
        if dep.trim().is_empty() {
            return Err(invalid("globalDependencies", "entries cannot be empty"));
        }
    }

    Ok(())
}

fn validate_task(key: &str, task: &PipelineTask) -> Result<()> {
    let field = format!("pipeline.{}", key);

    if key.is_empty() {
        return Err(invalid("pipeline", "task names cannot be empty"));
    }
    match key.split_once('#') {
        Some((pkg, name)) if pkg.is_empty() || name.is_empty() || name.contains('#') => {
            return Err(invalid(&field, "must be `task` or `package#task`"));
        }
        _ => {}
    }

    for dep in &task.depends_on {
        let dep_field = format!("{}.dependsOn", field);
        if dep.is_empty() || dep == "^" {
            return Err(invalid(&dep_field, "entries cannot be empty"));
        }
        if dep.starts_with('$') {
            return Err(invalid(
                &dep_field,
                &format!("'{}' looks like an env var; declare it under `env`", dep),
            ));
        }
        if let Some(rest) = dep.strip_prefix('^') {
            if rest.contains('#') {
                return Err(invalid(
                    &dep_field,
                    &format!("'{}' cannot combine `^` with a package name", dep),
                ));
            }
        }
    }

    validate_env_names(&format!("{}.env", field), &task.env)?;
    if let Some(pass_through) = &task.pass_through_env {
        validate_env_names(&format!("{}.passThroughEnv", field), pass_through)?;
    }

    Ok(())
}

fn validate_env_names(field: &str, names: &[String]) -> Result<()> {
    for name in names {
        if name.starts_with('$') {
            return Err(invalid(
                field,
                &format!("'{}' should not start with `$`", name),
            ));
        }
        if name.trim().is_empty() {
            return Err(invalid(field, "entries cannot be empty"));
        }
    }
    Ok(())
}

fn validate_cache(config: &Config) -> Result<()> {
    let remote = &config.cache.remote;
    if remote.enabled && remote.url.as_deref().map_or(true, str::is_empty) {
        return Err(invalid("cache.remote.url", "required when the remote cache is enabled"));
    }
    if remote.timeout_secs == 0 {
        return Err(invalid("cache.remote.timeoutSecs", "must be at least 1"));
    }
    Ok(())
}

fn invalid(field: &str, message: &str) -> crate::error::GantryError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
    .into()
}

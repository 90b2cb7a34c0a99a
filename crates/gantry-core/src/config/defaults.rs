//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "gantry.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "gantry.yaml";

/// Default configuration file name (JSON)
pub const DEFAULT_CONFIG_JSON: &str = "gantry.json";

/// Directory (relative to a package) where task logs are written
pub const TASK_LOG_DIR: &str = ".gantry";

/// Output fingerprints kept between runs, under the root's `TASK_LOG_DIR`
pub const OUTPUT_STATE_FILE: &str = "outputs.json";

/// Get list of config file names to search for, in priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        "gantry.yml",
        DEFAULT_CONFIG_JSON,
    ]
}

/// Environment variables always passed to tasks in strict mode
pub fn default_pass_through_env() -> &'static [&'static str] {
    &[
        "HOME",
        "PATH",
        "SHELL",
        "TERM",
        "TMPDIR",
        "TEMP",
        "TMP",
        "USER",
        "LANG",
        "SYSTEMROOT",
        "COMSPEC",
    ]
}

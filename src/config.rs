// Configuration loading: serde + toml, with `deny_unknown_fields` and an
// untagged enum for ergonomic shell-vs-argv build command syntax.

use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::builder::BuildCommand;

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Raw(Vec<String>),
}

impl From<Command> for BuildCommand {
    fn from(c: Command) -> Self {
        match c {
            Command::Shell(s) => BuildCommand::Shell(s),
            Command::Raw(argv) => BuildCommand::Raw(argv),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct BuildTarget {
    pub name: String,
    pub command: Command,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub repo_owner: String,
    pub repo_name: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,
    pub build: BuildTarget,
    /// Path to a file of newline-delimited SHAs to preload into
    /// SeenCommits at startup -- seeding from a prior run is an external
    /// concern, not something this process persists itself.
    pub seed_file: Option<String>,
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&content).context("parsing config file")
}

pub fn load_seed_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            repo_owner = "rust-lang"
            repo_name = "rust"
            max_concurrent = 4
            poll_interval_secs = 30

            [build]
            name = "ci"
            command = "make test"
        "#;
        let config: Config = toml::from_str(toml).expect("should parse");
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.api_base, "https://api.github.com");
        matches!(config.build.command, Command::Shell(_));
    }

    #[test]
    fn rejects_unknown_fields() {
        let toml = r#"
            repo_owner = "rust-lang"
            repo_name = "rust"
            max_concurrent = 4
            poll_interval_secs = 30
            bogus_field = true

            [build]
            name = "ci"
            command = "make test"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn loads_config_from_an_actual_file() {
        let mut file = NamedTempFile::new().expect("create temp config file");
        write!(
            file,
            r#"
                repo_owner = "rust-lang"
                repo_name = "rust"
                max_concurrent = 4
                poll_interval_secs = 30

                [build]
                name = "ci"
                command = "make test"
            "#
        )
        .unwrap();
        let config = load(file.path()).expect("should load");
        assert_eq!(config.repo_name, "rust");
    }

    #[test]
    fn loads_seed_file_trimming_blank_lines() {
        let mut file = NamedTempFile::new().expect("create temp seed file");
        writeln!(file, "{}\n\n  {}  \n", "a".repeat(40), "b".repeat(40)).unwrap();
        let shas = load_seed_file(file.path()).expect("should load");
        assert_eq!(shas, vec!["a".repeat(40), "b".repeat(40)]);
    }

    #[test]
    fn accepts_raw_argv_command() {
        let toml = r#"
            repo_owner = "rust-lang"
            repo_name = "rust"
            max_concurrent = 4
            poll_interval_secs = 30

            [build]
            name = "ci"
            command = ["make", "test"]
        "#;
        let config: Config = toml::from_str(toml).expect("should parse");
        match config.build.command {
            Command::Raw(argv) => assert_eq!(argv, vec!["make", "test"]),
            _ => panic!("expected Raw command"),
        }
    }
}

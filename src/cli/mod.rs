//! CLI module
//!
//! This module provides the command-line interface of the `relcache` binary:
//! global option parsing here, subcommands in [`commands`].

pub mod commands;

use crate::config::{Profile, ProfilesFile};
use crate::error::{RelcacheError, Result};
use std::path::PathBuf;

// Re-exports
pub use commands::{handle_command, Command, CommandType};

/// Profile used when `--profile` is not given
pub const DEFAULT_PROFILE: &str = "default";

/// Parsed command line
#[derive(Debug, Clone)]
pub struct Args {
    pub profiles_path: Option<PathBuf>,
    pub profile: String,
    pub target: Option<String>,
    pub verbose: bool,
    pub command: Command,
}

impl Args {
    /// Parse arguments, excluding the program name
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut profiles_path = None;
        let mut profile = DEFAULT_PROFILE.to_string();
        let mut target = None;
        let mut verbose = false;
        let mut rest = Vec::new();

        let mut args = args.into_iter().map(Into::into);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--profiles" => profiles_path = Some(PathBuf::from(option_value(&arg, args.next())?)),
                "--profile" => profile = option_value(&arg, args.next())?,
                "--target" => target = Some(option_value(&arg, args.next())?),
                "-v" | "--verbose" => verbose = true,
                _ => {
                    rest.push(arg);
                    rest.extend(args.by_ref());
                }
            }
        }

        Ok(Self {
            profiles_path,
            profile,
            target,
            verbose,
            command: Command::parse(&rest)?,
        })
    }

    /// Load the profiles file and resolve the selected profile and target
    pub fn resolve_profile(&self) -> Result<Profile> {
        let profiles = match &self.profiles_path {
            Some(path) => ProfilesFile::load(path)?,
            None => ProfilesFile::load_default()?,
        };
        profiles.resolve(&self.profile, self.target.as_deref())
    }
}

fn option_value(option: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| RelcacheError::InvalidCommandSyntax {
        command: option.to_string(),
        expected: format!("{} <value>", option),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    #[test]
    fn test_parse_global_options() {
        let args = Args::parse([
            "--profiles",
            "/tmp/profiles.toml",
            "--profile",
            "analytics",
            "--target",
            "prod",
            "-v",
            "relations",
            "staging",
        ])
        .unwrap();
        assert_eq!(args.profiles_path, Some(PathBuf::from("/tmp/profiles.toml")));
        assert_eq!(args.profile, "analytics");
        assert_eq!(args.target.as_deref(), Some("prod"));
        assert!(args.verbose);
        assert_eq!(
            args.command.command_type,
            CommandType::Relations {
                schema: "staging".to_string()
            }
        );
    }

    #[test]
    fn test_parse_defaults() {
        let args = Args::parse(Vec::<String>::new()).unwrap();
        assert_eq!(args.profile, DEFAULT_PROFILE);
        assert_eq!(args.command.command_type, CommandType::Help);
    }

    #[test]
    fn test_missing_option_value() {
        assert!(Args::parse(["--profile"]).is_err());
    }

    #[test]
    fn test_resolve_profile_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.toml");
        let mut profiles = ProfilesFile::new();
        profiles.set_target(DEFAULT_PROFILE, "dev", 3, Credentials::sqlite_memory());
        profiles.save(&path).unwrap();

        let args = Args::parse(["--profiles", path.to_str().unwrap(), "debug"]).unwrap();
        let profile = args.resolve_profile().unwrap();
        assert_eq!(profile.target, "dev");
        assert_eq!(profile.threads, 3);
    }
}

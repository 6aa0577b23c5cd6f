//! Command handlers for CLI
//!
//! This module implements the subcommands of the `relcache` binary.

use crate::config::Profile;
use crate::database::adapter::{RelationAdapter, SqlAdapter};
use crate::database::connection::DatabaseBackend;
use crate::database::driver::ConnectionDriver;
use crate::database::drivers::{PostgresDriver, SqliteDriver};
use crate::database::relation::BaseRelation;
use crate::error::{RelcacheError, Result};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;

/// Command types
#[derive(Debug, Clone, PartialEq)]
pub enum CommandType {
    /// Print connection info and test the connection
    Debug,
    /// List the relations in a schema
    Relations { schema: String },
    /// Print the dependency graph of some schemas as JSON
    Graph { schemas: Vec<String> },
    /// Show help message
    Help,
}

/// Parsed command
#[derive(Debug, Clone)]
pub struct Command {
    /// The type of command
    pub command_type: CommandType,
}

impl Command {
    /// Parse a command from its words, e.g. `["relations", "staging"]`
    pub fn parse(words: &[String]) -> Result<Self> {
        let Some((cmd, rest)) = words.split_first() else {
            return Ok(Command {
                command_type: CommandType::Help,
            });
        };

        match cmd.as_str() {
            "debug" => Ok(Command {
                command_type: CommandType::Debug,
            }),
            "relations" => {
                if rest.len() != 1 {
                    return Err(RelcacheError::InvalidCommandSyntax {
                        command: cmd.to_string(),
                        expected: "relations <schema>".to_string(),
                    });
                }
                Ok(Command {
                    command_type: CommandType::Relations {
                        schema: rest[0].clone(),
                    },
                })
            }
            "graph" => {
                if rest.is_empty() {
                    return Err(RelcacheError::InvalidCommandSyntax {
                        command: cmd.to_string(),
                        expected: "graph <schema>...".to_string(),
                    });
                }
                Ok(Command {
                    command_type: CommandType::Graph {
                        schemas: rest.to_vec(),
                    },
                })
            }
            "help" | "--help" | "-h" => Ok(Command {
                command_type: CommandType::Help,
            }),
            _ => Err(RelcacheError::UnknownCommand(cmd.to_string())),
        }
    }

    /// Whether the command needs a warehouse connection
    pub fn needs_profile(&self) -> bool {
        !matches!(self.command_type, CommandType::Help)
    }
}

pub const HELP: &str = r#"
relcache - warehouse relation cache

Usage:
  relcache [--profiles PATH] [--profile NAME] [--target NAME] [-v] <command>

Commands:
  debug                Show connection info and test the connection
  relations <schema>   Cache a schema and list its relations
  graph <schema>...    Cache schemas and print their dependency graph as JSON
  help                 Show this help message

Profiles are read from <config dir>/relcache/profiles.toml unless --profiles
is given. Variables in a .env file are loaded first, so password_env can
point at them.
"#;

/// Handle a command and return the output to print
pub fn handle_command(command: &Command, profile: Option<&Profile>) -> Result<String> {
    if command.command_type == CommandType::Help {
        return Ok(HELP.to_string());
    }
    let profile = profile.ok_or_else(|| {
        RelcacheError::Config(format!("{:?} needs a profile", command.command_type))
    })?;

    match profile.credentials.backend {
        DatabaseBackend::Postgres => {
            run(&SqlAdapter::new(PostgresDriver::new()?, profile), command, profile)
        }
        DatabaseBackend::Sqlite => {
            run(&SqlAdapter::new(SqliteDriver::new()?, profile), command, profile)
        }
    }
}

fn run<D: ConnectionDriver>(
    adapter: &SqlAdapter<D>,
    command: &Command,
    profile: &Profile,
) -> Result<String> {
    let output = match &command.command_type {
        CommandType::Debug => debug_connection(adapter, profile),
        CommandType::Relations { schema } => {
            adapter.populate_cache([schema], false)?;
            Ok(format_relations(&adapter.list_relations(schema)?))
        }
        CommandType::Graph { schemas } => {
            adapter.populate_cache(schemas, false)?;
            Ok(serde_json::to_string_pretty(&adapter.cache().dump_graph())?)
        }
        CommandType::Help => Ok(HELP.to_string()),
    };
    adapter.cleanup_connections();
    output
}

fn debug_connection<D: ConnectionDriver>(adapter: &SqlAdapter<D>, profile: &Profile) -> Result<String> {
    let mut lines = vec![format!(
        "profile: {} (target: {}, threads: {})",
        profile.name, profile.target, profile.threads
    )];
    for (key, value) in profile.credentials.connection_info() {
        lines.push(format!("  {}: {}", key, value));
    }

    let status = adapter.connection_named("debug", || adapter.execute("select 1", false, true))?;
    lines.push(format!("Connection test: OK ({})", status.status));
    Ok(lines.join("\n"))
}

/// Render relations as a table
pub fn format_relations(relations: &[BaseRelation]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["schema", "identifier", "kind"]);
    for relation in relations {
        table.add_row(vec![
            relation.schema.clone().unwrap_or_default(),
            relation.identifier.clone().unwrap_or_default(),
            relation
                .kind
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::database::relation::RelationKind;

    fn words(input: &str) -> Vec<String> {
        input.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_parse_relations_command() {
        let cmd = Command::parse(&words("relations staging")).unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Relations {
                schema: "staging".to_string()
            }
        );
    }

    #[test]
    fn test_parse_graph_command() {
        let cmd = Command::parse(&words("graph staging marts")).unwrap();
        assert_eq!(
            cmd.command_type,
            CommandType::Graph {
                schemas: vec!["staging".to_string(), "marts".to_string()]
            }
        );
    }

    #[test]
    fn test_parse_help_and_empty() {
        assert_eq!(Command::parse(&[]).unwrap().command_type, CommandType::Help);
        let cmd = Command::parse(&words("help")).unwrap();
        assert!(!cmd.needs_profile());
        assert_eq!(Command::parse(&words("debug")).unwrap().command_type, CommandType::Debug);
    }

    #[test]
    fn test_parse_invalid_command() {
        assert!(matches!(
            Command::parse(&words("index")),
            Err(RelcacheError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_parse_missing_args() {
        assert!(Command::parse(&words("relations")).is_err());
        assert!(Command::parse(&words("relations a b")).is_err());
        assert!(Command::parse(&words("graph")).is_err());
    }

    #[test]
    fn test_format_relations() {
        let relations = vec![
            BaseRelation::create(None, "main", "orders").with_kind(RelationKind::Table),
            BaseRelation::create(None, "main", "orders_v"),
        ];
        let rendered = format_relations(&relations);
        assert!(rendered.contains("orders_v"));
        assert!(rendered.contains("table"));
        assert!(rendered.contains("unknown"));
    }

    #[test]
    fn test_debug_against_sqlite() {
        let profile = Profile::new("local", "dev", 1, Credentials::sqlite_memory());
        let cmd = Command::parse(&words("debug")).unwrap();
        let output = handle_command(&cmd, Some(&profile)).unwrap();
        assert!(output.contains("profile: local"));
        assert!(output.contains("Connection test: OK (SELECT 1)"));
    }

    #[test]
    fn test_help_needs_no_profile() {
        let cmd = Command::parse(&words("help")).unwrap();
        assert!(handle_command(&cmd, None).unwrap().contains("Usage:"));
        let cmd = Command::parse(&words("debug")).unwrap();
        assert!(handle_command(&cmd, None).is_err());
    }
}

//! Command-line surface (§6): subcommands a client process sends over the
//! control socket as `{type, args}` requests.

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "phiocker")]
#[command(about = "phiocker is a minimal Linux container engine.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the control daemon in the foreground.
    Daemon,
    /// Launch a previously created container and attach to its terminal.
    Run(NameArgs),
    /// Attach to an already-running container's terminal.
    Attach(NameArgs),
    /// Stop a running container.
    Stop(NameArgs),
    /// List running containers.
    Ps,
    /// Create a container from a spec file.
    Create(CreateArgs),
    /// Pre-fetch a base image without creating a container.
    Download(NameArgs),
    /// List the built-in image names, optionally filtered by a substring.
    Search(SearchArgs),
    /// Delete a container, an image, or everything of one kind.
    Delete(DeleteArgs),
    /// List containers or images on disk.
    List(ListArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NameArgs {
    /// Name of the container (or image, for `download`).
    #[arg(required = true)]
    pub name: String,
}

#[derive(Args, Debug, Clone)]
pub struct CreateArgs {
    /// Path to the container spec JSON file.
    #[arg(required = true)]
    pub spec: String,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Substring to filter built-in image names by; omit to list all.
    pub query: Option<String>,
    /// Maximum number of results to print.
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// `<name>`, `all`, or `image <name>|all`.
    #[arg(required = true, num_args = 1..)]
    pub target: Vec<String>,
    /// Skip the confirmation prompt for `all` / `image all`.
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    /// Omit to list containers, or pass `images` to list images instead.
    pub target: Option<String>,
}

impl Commands {
    /// The wire `type` string this subcommand maps to.
    pub fn request_type(&self) -> &'static str {
        match self {
            Commands::Daemon => "daemon",
            Commands::Run(_) => "run",
            Commands::Attach(_) => "attach",
            Commands::Stop(_) => "stop",
            Commands::Ps => "ps",
            Commands::Create(_) => "create",
            Commands::Download(_) => "download",
            Commands::Search(_) => "search",
            Commands::Delete(_) => "delete",
            Commands::List(_) => "list",
        }
    }

    /// Flattens this subcommand's arguments into the `args: Vec<String>`
    /// carried by the wire protocol's request envelope.
    pub fn request_args(&self) -> Vec<String> {
        match self {
            Commands::Daemon | Commands::Ps => vec![],
            Commands::Run(a) | Commands::Attach(a) | Commands::Stop(a) | Commands::Download(a) => {
                vec![a.name.clone()]
            }
            Commands::Create(a) => vec![a.spec.clone()],
            Commands::Search(a) => {
                let mut v = Vec::new();
                if let Some(q) = &a.query {
                    v.push(q.clone());
                }
                if let Some(l) = a.limit {
                    v.push(l.to_string());
                }
                v
            }
            Commands::Delete(a) => a.target.clone(),
            Commands::List(a) => a.target.clone().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::parse_from(["phiocker", "run", "web1"]);
        match cli.command {
            Commands::Run(a) => assert_eq!(a.name, "web1"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn delete_collects_remaining_args() {
        let cli = Cli::parse_from(["phiocker", "delete", "image", "all"]);
        assert_eq!(cli.command.request_args(), vec!["image", "all"]);
    }
}

use clap::{parser::ValueSource, ArgMatches, CommandFactory, FromArgMatches, Parser};
use griddle_cluster::Role;
use griddle_http::serve;

/// A griddle search node. Every flag can also be given through the
/// environment; `{data_dir}/node.json`, when present, takes precedence.
#[derive(Parser)]
#[command(name = "griddle", version)]
struct Cli {
    #[arg(long, env = "GRIDDLE_DATA_DIR", default_value = "./data")]
    data_dir: String,
    /// Unique node name (default: hostname)
    #[arg(long, env = "GRIDDLE_NODE_NAME")]
    node_name: Option<String>,
    #[arg(long, env = "GRIDDLE_BIND_ADDR")]
    bind_addr: Option<String>,
    /// Address peers use to reach this node
    #[arg(long, env = "GRIDDLE_ADVERTISE_ADDR")]
    advertise_addr: Option<String>,
    /// Gossip and shard RPC port
    #[arg(long, env = "GRIDDLE_RPC_PORT")]
    rpc_port: Option<u16>,
    /// Public API port
    #[arg(long, env = "GRIDDLE_HTTP_PORT")]
    http_port: Option<u16>,
    /// Comma-separated roles: indexer, searcher
    #[arg(long, env = "GRIDDLE_ROLES", value_delimiter = ',')]
    roles: Vec<Role>,
    /// Comma-separated `host:rpc_port` of nodes to join through
    #[arg(long, env = "GRIDDLE_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,
    /// `file:///path` or `mem://name`
    #[arg(long, env = "GRIDDLE_METASTORE_URI")]
    metastore_uri: Option<String>,
    /// Searchers per shard
    #[arg(long, env = "GRIDDLE_REPLICATION_FACTOR")]
    replication_factor: Option<usize>,
}

impl Cli {
    /// Environment the node config is read from, in `GRIDDLE_*` form.
    fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("GRIDDLE_DATA_DIR", self.data_dir.clone())];
        let optional = [
            ("GRIDDLE_NODE_NAME", self.node_name.clone()),
            ("GRIDDLE_BIND_ADDR", self.bind_addr.clone()),
            ("GRIDDLE_ADVERTISE_ADDR", self.advertise_addr.clone()),
            ("GRIDDLE_RPC_PORT", self.rpc_port.map(|p| p.to_string())),
            ("GRIDDLE_HTTP_PORT", self.http_port.map(|p| p.to_string())),
            ("GRIDDLE_METASTORE_URI", self.metastore_uri.clone()),
            (
                "GRIDDLE_REPLICATION_FACTOR",
                self.replication_factor.map(|rf| rf.to_string()),
            ),
        ];
        vars.extend(optional.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))));
        if !self.roles.is_empty() {
            let roles: Vec<String> = self.roles.iter().map(Role::to_string).collect();
            vars.push(("GRIDDLE_ROLES", roles.join(",")));
        }
        if !self.seeds.is_empty() {
            vars.push(("GRIDDLE_SEEDS", self.seeds.join(",")));
        }
        vars
    }
}

fn validate(cli: &Cli, matches: &ArgMatches) -> Result<(), String> {
    if let (Some(rpc), Some(http)) = (cli.rpc_port, cli.http_port) {
        if rpc == http && rpc != 0 {
            return Err(format!("--rpc-port and --http-port are both {}", rpc));
        }
    }
    if is_set_on_command_line(matches, "replication_factor") && cli.replication_factor == Some(0)
    {
        return Err("--replication-factor must be at least 1".to_string());
    }
    Ok(())
}

fn is_set_on_command_line(matches: &ArgMatches, arg: &str) -> bool {
    matches.value_source(arg) == Some(ValueSource::CommandLine)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Cli::command().get_matches();
    let cli = Cli::from_arg_matches(&matches)?;
    validate(&cli, &matches)
        .map_err(|msg| std::io::Error::new(std::io::ErrorKind::InvalidInput, msg))?;

    for (key, value) in cli.to_env() {
        std::env::set_var(key, value);
    }
    serve().await
}

use std::path::Path;

use pdnstore_rs::config::DEFAULT_BACKEND_ADDR;
use pdnstore_rs::{Backend, InputObservation, RemoteBackend, RemoteOptions, SearchQuery};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    println!(
        r#"pdnstore client

USAGE:
    pdnstore_client [--host <ADDR>] <COMMAND> [OPTIONS]

COMMANDS:
    query    --name <NAME> | --value <VALUE> [--rrtype <T>] [--sensor <S>] [--limit <N>]
    ingest   --name <NAME> --rrtype <T> --value <VALUE> --sensor <S> [--count <N>] [--time <UNIX>]
    backup   --path <PATH>   Checkpoint the backend store into PATH on the backend host
    dump     --path <PATH>   Write every observation as JSON lines to PATH on the backend host

OPTIONS:
        --host <ADDR>   Backend address [default: 127.0.0.1:4242]
    -h, --help          Print help"#
    );
}

fn command() -> Option<String> {
    ["query", "ingest", "backup", "dump"]
        .into_iter()
        .find(|name| has_flag(name))
        .map(str::to_string)
}

fn required(flag: &str) -> anyhow::Result<String> {
    parse_arg(flag).ok_or_else(|| anyhow::anyhow!("missing {flag}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let Some(command) = command() else {
        print_help();
        anyhow::bail!("no command given");
    };
    let host = parse_arg("--host").unwrap_or_else(|| DEFAULT_BACKEND_ADDR.to_string());
    let options = RemoteOptions {
        pool: None,
        ..Default::default()
    };
    let client = RemoteBackend::connect(host, options).await?;

    match command.as_str() {
        "query" => {
            let query = SearchQuery {
                name: parse_arg("--name"),
                value: parse_arg("--value"),
                rrtype: parse_arg("--rrtype"),
                sensor: parse_arg("--sensor"),
                limit: parse_arg("--limit").map(|l| l.parse()).transpose()?.unwrap_or(0),
            };
            for observation in client.search(&query).await? {
                println!("{}", serde_json::to_string(&observation.to_dump_record())?);
            }
        }
        "ingest" => {
            let time: i64 = match parse_arg("--time") {
                Some(raw) => raw.parse()?,
                None => std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)?
                    .as_secs() as i64,
            };
            let count: u32 = parse_arg("--count").map(|c| c.parse()).transpose()?.unwrap_or(1);
            let observation = InputObservation::new(
                required("--name")?,
                required("--rrtype")?,
                parse_arg("--value").unwrap_or_default(),
                required("--sensor")?,
                count,
                time,
                time,
            );
            client.ingest(observation).await?;
        }
        "backup" => client.backup(Path::new(&required("--path")?)).await?,
        "dump" => client.dump(Path::new(&required("--path")?)).await?,
        other => anyhow::bail!("unknown command `{other}`"),
    }

    client.shutdown().await?;
    Ok(())
}

use cellsd::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Sync,
    Logout(String),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync" => mode = CliMode::Sync,
            "--logout" => {
                let Some(account_id) = args.next() else {
                    anyhow::bail!("--logout needs an account id");
                };
                mode = CliMode::Logout(account_id);
            }
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cellsd=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: cellsd [--sync | --logout <account-id>]");
        println!("  --sync                  Run one full offline sync, print the job and exit");
        println!("  --logout <account-id>   Remove stored credentials for the account and exit");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Sync => {
            let job = daemon.sync_once().await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        CliMode::Logout(account_id) => daemon.logout(&account_id).await,
        CliMode::Run | CliMode::Help => daemon.run().await,
    }
}

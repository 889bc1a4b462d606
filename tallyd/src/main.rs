use tallyd::daemon::{DaemonConfig, DaemonRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: tallyd [--once]");
        println!("  --once   Run a single drain pass and exit");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let runtime = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => runtime.drain_once().await,
        CliMode::Run => runtime.run().await,
        CliMode::Help => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cli_mode_defaults_to_run() {
        let mode = parse_cli_mode(vec!["tallyd".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Run);
    }

    #[test]
    fn parse_cli_mode_supports_once() {
        let mode = parse_cli_mode(vec!["tallyd".to_string(), "--once".to_string()]).unwrap();
        assert_eq!(mode, CliMode::Once);
    }

    #[test]
    fn parse_cli_mode_rejects_unknown_flags() {
        assert!(parse_cli_mode(vec!["tallyd".to_string(), "--wat".to_string()]).is_err());
    }
}

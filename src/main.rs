use anyhow::Result;

use blueplane::{cli, config::Config, daemon, doctor, error::PipelineError, hook};

/// Flags that consume the following argument.
const VALUE_FLAGS: &[&str] = &["--data-dir", "--port"];

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help" || a == "-h")
        || args.first().map(|s| s.as_str()) == Some("help")
    {
        cli::print_help();
        return;
    }
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("blueplane {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("blueplane: {e}");
            std::process::exit(2);
        }
    };

    // Flag overrides beat both environment and config file.
    if let Some(dir) = cli::get_flag(&args, "--data-dir") {
        config.data_dir = dir.into();
    }
    if let Some(port) = cli::get_flag(&args, "--port") {
        match port.parse() {
            Ok(port) => config.ingress_port = port,
            Err(_) => {
                eprintln!("blueplane: --port requires a number, got '{port}'");
                std::process::exit(2);
            }
        }
    }

    let command = cli::positionals(&args, VALUE_FLAGS).first().copied();
    let result = match command {
        Some("run") | None => run_daemon(config).await,
        Some("hook") => hook::run(&config).await,
        Some("doctor") => {
            doctor::run(&config).await;
            Ok(())
        }
        Some(other) => {
            eprintln!("blueplane: unknown command '{other}'\n");
            eprintln!("Run 'blueplane help' for usage.");
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("blueplane: {e}");
        std::process::exit(1);
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    daemon::init_tracing(&config)?;
    match daemon::run(config).await {
        Ok(()) => Ok(()),
        Err(e @ PipelineError::Config(_)) => {
            eprintln!("blueplane: {e}");
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

use clap::Parser;

#[derive(Parser)]
#[command(name = "dreamlake", about = "Record ML/robotics experiment artifacts to a local or remote session store")]
struct Cli {
    #[command(subcommand)]
    command: dreamlake_cli::Command,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let mut config = dreamlake_cli::Config::load(dreamlake_cli::Config::default_path()?)?;
    dreamlake_cli::exec(&mut config, cli.command)?;
    config.save()?;
    Ok(())
}

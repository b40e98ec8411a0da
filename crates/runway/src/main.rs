use anyhow::Context;
use clap::Parser;
use runway::{
    Cli, PlatformProcessManagerFactory, ProcessManagerFactory, Supervisor,
    cancel_on_shutdown_signal, init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("runway: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    // Variables that are not valid UTF-8 are not passed on.
    let process_env = std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
    let config = cli.into_config(process_env, &cwd)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        debug!(
            platform = PlatformProcessManagerFactory::platform_name(),
            "Starting supervisor"
        );
        let cancel = CancellationToken::new();
        let force = CancellationToken::new();
        let signals = cancel_on_shutdown_signal(cancel.clone(), force.clone());

        let manager = PlatformProcessManagerFactory::create_process_manager();
        let mut supervisor = Supervisor::new(config, manager).with_force_kill(force.clone());
        let report = supervisor.run(cancel.clone()).await;

        cancel.cancel();
        force.cancel();
        let _ = signals.await;
        Ok::<_, anyhow::Error>(report?.exit_code)
    })
}

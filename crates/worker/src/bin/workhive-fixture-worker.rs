//! Worker process serving the fixture tasks
//!
//! Spawned by a process context, which passes the hub endpoint and the
//! rendezvous key through the environment.

use std::process::ExitCode;

use workhive_config::Config;
use workhive_errors::Result;
use workhive_ipc::remote;
use workhive_worker::{fixtures, Environment, Runner};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "fixture worker failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn run() -> Result<()> {
    let mut config = Config::default();
    config.merge_env()?;

    let channel = remote::connect_from_env(&config.hub).await?;
    let runner = Runner::with_environment(
        fixtures::registry(),
        Environment::new(&config.environment),
    );
    remote::serve(channel, |remote| runner.serve(remote)).await
}

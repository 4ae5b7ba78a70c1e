use anyhow::Context;
use cee_worker::broker::BrokerConsumer;
use cee_worker::config::Config;
use cee_worker::executor::DockerEngine;
use cee_worker::languages::Registry;
use cee_worker::processor::Processor;
use cee_worker::retry::RetryPolicy;
use cee_worker::sandbox::{self, SandboxImage};
use cee_worker::store::RedisStore;
use log::{error, info};

fn main() {
    setup_logs();
    if let Err(err) = run() {
        error!("fatal: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid worker configuration")?;
    let registry = Registry::new(&config.images);

    RetryPolicy::RUNTIME_INIT
        .retry(
            |_| true,
            || {
                if sandbox::docker_running() {
                    Ok(())
                } else {
                    Err(anyhow::anyhow!("the docker daemon is not responding"))
                }
            },
        )
        .context("the container runtime never became reachable")?;

    // A missing image is pulled once; a pull failure is fatal rather than retried.
    for image in registry.images() {
        SandboxImage::ensure(image).with_context(|| format!("image {image} is not usable"))?;
    }

    let store = RedisStore::connect(&config.store).context("cannot reach the submission store")?;
    let engine = DockerEngine::new(&config.work_dir);
    let mut processor = Processor::new(
        engine,
        store,
        registry,
        config.work_dir.clone(),
        config.judge_url.clone(),
    );

    let consumer = BrokerConsumer::connect(&config.broker).context("cannot reach the broker")?;
    consumer.run(&config.queue_name, &mut processor)?;

    info!("consumer stopped, shutting down");
    Ok(())
}

fn setup_logs() {
    let mut env = env_logger::Builder::new();
    env.filter_module("cee_worker", log::LevelFilter::Info);
    if let Ok(content) = std::env::var("RUST_LOG") {
        env.parse_filters(&content);
    }
    env.init();
}

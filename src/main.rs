//! Sortie command-line entry point.
//!
//! Each subcommand runs one service until Ctrl-C:
//! - broker: framed TCP broker server
//! - scheduler: time-based job scheduler
//! - worker: payload and control consumer of one worker
//! - orchestrator: engine consumers for replies and events
//!
//! `execute` runs a single plan to completion and prints its report.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sortie_core::broker::{BrokerHandle, BrokerServer, MemoryBroker, RemoteBroker};
use sortie_core::definition::PlanTemplate;
use sortie_core::engine::Engine;
use sortie_core::orchestrator::Orchestrator;
use sortie_core::rpc::{Outbox, RpcClient};
use sortie_core::scheduler::SchedulerService;
use sortie_core::store::Store;
use sortie_core::worker::Worker;
use sortie_core::Config;

const REPORT_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "sortie", version, about = "Multi-stage scenario orchestrator")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "SORTIE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the message broker
    Broker,
    /// Serve the job scheduler
    Scheduler,
    /// Serve one worker
    Worker,
    /// Serve the orchestrator
    Orchestrator,
    /// Run one plan and print its report
    Execute {
        /// Plan definition (YAML or JSON)
        #[arg(long)]
        plan: PathBuf,
        /// Worker to run the plan on; repeat for several
        #[arg(long = "worker", required = true)]
        workers: Vec<String>,
        /// Run broker, scheduler and workers in this process
        #[arg(long)]
        local: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    sortie_core::observability::init_tracing(&config.observability);

    match cli.command {
        Command::Broker => serve_broker(&config).await?,
        Command::Scheduler => {
            let broker = connect(&config).await?;
            let service = SchedulerService::new(broker.clone(), outbox(&broker, &config), &config.scheduler);
            let cancel = service.cancel_token();
            tokio::spawn(async move {
                shutdown_signal().await;
                cancel.cancel();
            });
            service.run().await?;
        }
        Command::Worker => {
            let broker = connect(&config).await?;
            let worker = Worker::new(broker.clone(), outbox(&broker, &config), config.worker.clone())?;
            let stopper = worker.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                stopper.shutdown().await;
            });
            worker.run().await?;
        }
        Command::Orchestrator => {
            let broker = connect(&config).await?;
            let orchestrator = Orchestrator::new(engine(&broker, &config), broker);
            let cancel = orchestrator.cancel_token();
            tokio::spawn(async move {
                shutdown_signal().await;
                cancel.cancel();
            });
            orchestrator.run().await?;
        }
        Command::Execute { plan, workers, local } => execute(&config, &plan, &workers, local).await?,
    }
    Ok(())
}

async fn serve_broker(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = BrokerServer::new(MemoryBroker::new(), config.broker.clone());
    let listener = server.bind().await?;
    let cancel = server.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });
    server.serve(listener).await?;
    Ok(())
}

async fn execute(
    config: &Config,
    plan: &Path,
    workers: &[String],
    local: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let broker: BrokerHandle = if local {
        Arc::new(MemoryBroker::new())
    } else {
        connect(config).await?
    };

    if local {
        let scheduler = SchedulerService::new(broker.clone(), outbox(&broker, config), &config.scheduler);
        tokio::spawn(async move {
            if let Err(e) = scheduler.run().await {
                tracing::error!(error = %e, "scheduler stopped");
            }
        });
        for name in workers {
            let mut worker_config = config.worker.clone();
            worker_config.name = name.clone();
            let worker = Worker::new(broker.clone(), outbox(&broker, config), worker_config)?;
            worker.start().await?;
        }
    }

    let orchestrator = Orchestrator::new(engine(&broker, config), broker.clone());
    orchestrator.start().await?;
    let engine = orchestrator.engine();

    let template = PlanTemplate::from_file(plan)?;
    let plan = engine.create_plan(&template).await?;
    let mut worker_ids = Vec::new();
    for name in workers {
        worker_ids.push(engine.register_worker(name, "").await?.id);
    }
    let run = engine.create_run(&plan.id, &worker_ids).await?;
    engine.start_run(&run.id).await?;

    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut interrupted = false;
    let report = loop {
        let report = engine.run_report(&run.id).await?;
        if report.is_terminal() {
            break report;
        }
        tokio::select! {
            _ = &mut signal, if !interrupted => {
                interrupted = true;
                tracing::info!(run_id = %run.id, "interrupted, killing run");
                engine.kill_run(&run.id).await?;
            }
            _ = tokio::time::sleep(REPORT_POLL) => {}
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    orchestrator.shutdown();
    Ok(())
}

async fn connect(config: &Config) -> Result<BrokerHandle, Box<dyn std::error::Error>> {
    let broker = RemoteBroker::connect(config.broker.clone()).await?;
    Ok(Arc::new(broker))
}

fn outbox(broker: &BrokerHandle, config: &Config) -> Outbox {
    Outbox::new(broker.clone(), config.broker.reconnect.clone())
}

fn engine(broker: &BrokerHandle, config: &Config) -> Engine {
    let rpc = RpcClient::new(broker.clone(), outbox(broker, config));
    Engine::new(Store::new(), rpc, config.orchestrator.clone())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

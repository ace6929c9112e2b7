//! Controller runner - builds the per-kind controllers and their companions
//!
//! [`build_controllers`] is pure wiring: it creates one [`Controller`] per run
//! kind sharing a single console client and job context, and registers each
//! controller's invalidator under its topic. [`run`] drives everything until
//! shutdown.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use kube::Client;
use runsync_console::{ConsoleClient, RunKind, RunSource};
use runsync_engine::{topic, Controller, PublisherRegistry, Supervised, Supervisor};
use runsync_job::{JobContext, RunReconciler, SecretProvisioner};
use tokio_util::sync::CancellationToken;

use crate::config::Cli;
use crate::events::{self, AppState};

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Everything the operator runs
pub struct Controllers {
    pub controllers: Vec<Arc<Controller<RunReconciler>>>,
    pub registry: Arc<PublisherRegistry>,
    pub supervisor: Arc<Supervisor>,
}

/// Build one controller per run kind over a shared source and job context
pub fn build_controllers(cli: &Cli, source: Arc<dyn RunSource>, ctx: Arc<JobContext>) -> Controllers {
    let registry = Arc::new(PublisherRegistry::new());
    let reconciler = Arc::new(RunReconciler::new(ctx));

    let controllers: Vec<_> = RunKind::ALL
        .into_iter()
        .map(|kind| {
            let controller = Arc::new(Controller::new(
                cli.controller_config(kind),
                source.clone(),
                reconciler.clone(),
            ));
            registry.register(topic(kind), Arc::new(controller.invalidator()));
            controller
        })
        .collect();

    let targets = controllers
        .iter()
        .map(|c| c.clone() as Arc<dyn Supervised>)
        .collect();

    Controllers {
        controllers,
        registry,
        supervisor: Arc::new(Supervisor::new(targets).with_interval(cli.supervisor_interval())),
    }
}

/// Run controllers, supervisor and the event endpoint until ctrl-c
pub async fn run(cli: Cli, client: Client) -> anyhow::Result<()> {
    let (Some(url), Some(token)) = (cli.console_url.clone(), cli.console_token.clone()) else {
        anyhow::bail!("console url and token are required");
    };

    let source: Arc<dyn RunSource> = Arc::new(
        ConsoleClient::new(&url, token.clone())
            .map_err(|e| anyhow::anyhow!("failed to build console client: {}", e))?,
    );
    let ctx = Arc::new(JobContext::new(
        client,
        &cli.namespace,
        SecretProvisioner::new(url.clone(), token),
        cli.images(),
        cli.run_timeout(),
        source.clone(),
    ));
    let built = build_controllers(&cli, source, ctx);
    tracing::info!(
        console = %url,
        namespace = %cli.namespace,
        topics = ?built.registry.topics(),
        "runsync starting"
    );

    let cancel = CancellationToken::new();
    let mut tasks: Vec<BoxedTask> = built
        .controllers
        .iter()
        .map(|c| Box::pin(c.clone().run(cancel.clone())) as BoxedTask)
        .collect();
    tasks.push(Box::pin(built.supervisor.clone().run(cancel.clone())));

    let state = AppState {
        registry: built.registry.clone(),
        supervisor: built.supervisor.clone(),
    };
    let listen = cli.listen;
    let server_cancel = cancel.clone();
    tasks.push(Box::pin(async move {
        if let Err(e) = events::serve(listen, state, server_cancel).await {
            tracing::error!(error = %e, "event endpoint failed");
        }
    }));

    let handles: Vec<_> = tasks.into_iter().map(tokio::spawn).collect();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "task panicked during shutdown");
        }
    }

    tracing::info!("runsync shutting down");
    Ok(())
}

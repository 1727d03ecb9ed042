//! Pipeline host: wires the queue, the measurement source and the broker
//! publisher together and runs them until a shutdown signal arrives.

use crate::broker::loopback::LoopbackBroker;
use crate::broker::mqtt::MqttSession;
use crate::broker::BrokerSession;
use crate::clock::AnchoredClock;
use crate::config::Config;
use crate::publisher::{BrokerPublisher, PublisherError, PublisherSettings, PublisherSummary};
use crate::queue;
use crate::source::{MeasurementSource, SourceSummary};
use crate::stats::{PipelineStats, StatsSnapshot};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

enum Component {
    Source(SourceSummary),
    Publisher(Result<PublisherSummary, PublisherError>),
}

/// Validate `config`, build the broker session and run until Ctrl-C or
/// SIGTERM. `dry_run` swaps the MQTT session for a logging loopback broker.
pub async fn run(config: Config, dry_run: bool) -> Result<()> {
    if dry_run {
        config.validate()?;
    } else {
        config.validate_for_network()?;
    }

    let client_id = config.mqtt.effective_client_id();
    if dry_run {
        info!(client_id = %client_id, "Dry run: publishing to the in-process loopback broker");
        let broker = LoopbackBroker::dry_run();
        run_pipeline(&config, broker.session(client_id), shutdown_signal()).await?;
    } else {
        let session = MqttSession::new(&config.mqtt, client_id)?;
        info!(
            broker = %config.mqtt.broker,
            port = config.mqtt.port,
            topic = %config.mqtt.topic,
            "Telemetry unit started"
        );
        run_pipeline(&config, session, shutdown_signal()).await?;
    }
    Ok(())
}

/// Run the generator and publisher over `session` until `shutdown`
/// resolves, then stop both within `reliability.shutdown_timeout_secs`.
pub async fn run_pipeline<S, F>(config: &Config, session: S, shutdown: F) -> Result<StatsSnapshot>
where
    S: BrokerSession + 'static,
    F: Future<Output = ()>,
{
    let cancel = CancellationToken::new();
    let stats = Arc::new(PipelineStats::new());
    let (writer, reader) = queue::bounded(queue::DEFAULT_CAPACITY);

    let source = MeasurementSource::new(
        Duration::from_secs(config.worker.period_secs),
        Arc::new(AnchoredClock::system()),
        writer,
    )
    .with_stats(Arc::clone(&stats));
    let publisher = BrokerPublisher::new(
        session,
        reader,
        PublisherSettings::from_config(&config.mqtt, &config.reliability),
    )
    .with_stats(Arc::clone(&stats));

    let mut tasks = JoinSet::new();
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { Component::Source(source.run(cancel).await) });
    }
    {
        let cancel = cancel.clone();
        tasks.spawn(async move { Component::Publisher(publisher.run(cancel).await) });
    }

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            () = &mut shutdown => break,
            joined = tasks.join_next() => match joined {
                Some(joined) => report_exit(joined, false),
                None => {
                    (&mut shutdown).await;
                    break;
                }
            },
        }
    }

    info!("Shutdown requested, stopping pipeline");
    cancel.cancel();

    let shutdown_timeout = Duration::from_secs(config.reliability.shutdown_timeout_secs);
    let joined_in_time = tokio::time::timeout(shutdown_timeout, async {
        while let Some(joined) = tasks.join_next().await {
            report_exit(joined, true);
        }
    })
    .await;
    if joined_in_time.is_err() {
        warn!(
            timeout_secs = shutdown_timeout.as_secs(),
            "Pipeline tasks did not stop in time; aborting"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    let snapshot = stats.snapshot();
    info!(
        generated = snapshot.generated,
        accepted = snapshot.accepted,
        dropped = snapshot.dropped,
        published = snapshot.published,
        publish_failures = snapshot.publish_failures,
        connects = snapshot.connects,
        disconnects = snapshot.disconnects,
        in_queue = snapshot.in_queue(),
        "Pipeline stopped"
    );
    Ok(snapshot)
}

fn report_exit(joined: Result<Component, JoinError>, stopping: bool) {
    match joined {
        Ok(Component::Publisher(Err(e))) => {
            error!("Broker publisher failed: {e}");
            if !stopping {
                warn!("Measurements keep being generated but will no longer be published");
            }
        }
        Ok(Component::Publisher(Ok(_))) if !stopping => {
            warn!("Broker publisher exited before shutdown");
        }
        Ok(Component::Source(summary)) => {
            if !stopping {
                warn!("Measurement source exited before shutdown");
            }
            info!(
                ticks = summary.ticks,
                accepted = summary.accepted,
                dropped = summary.dropped,
                "Measurement source stopped"
            );
        }
        Ok(Component::Publisher(Ok(_))) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => error!("Pipeline task panicked: {e}"),
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

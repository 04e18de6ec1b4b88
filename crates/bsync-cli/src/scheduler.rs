//! Background loops: batch flushing, engine health health and a signal
//! listener. All of them stop when the token is cancelled.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::service::{ServiceSignal, SyncService};

#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub sync: Duration,
    pub health: Duration,
}

pub fn spawn(
    service: SyncService,
    intervals: Intervals,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(flush_loop(service.clone(), intervals.sync, cancel.clone())),
        tokio::spawn(health_loop(service.clone(), intervals.health, cancel.clone())),
        tokio::spawn(signal_loop(service, cancel)),
    ]
}

async fn flush_loop(service: SyncService, every: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Err(e) = service.flush(None).await {
                    error!("flush failed: {e}");
                }
            }
        }
    }
    debug!("flush loop stopped");
}

/// The first tick fires at once, so engines are checked at startup.
async fn health_loop(service: SyncService, every: Duration, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let states = service.health_check_all().await;
                debug!("health round: {states:?}");
            }
        }
    }
    debug!("health loop stopped");
}

async fn signal_loop(service: SyncService, cancel: CancellationToken) {
    let mut signals = service.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => {
                match signal {
                    Ok(ServiceSignal::EngineOffline { engine, error }) => {
                        warn!("engine offline: {engine} ({error})");
                    }
                    Ok(ServiceSignal::EngineRecovered { engine }) => {
                        info!("engine recovered: {engine}");
                    }
                    Ok(ServiceSignal::RankingRecalculation { user_id, engine }) => {
                        info!("ranking recalculation for user {user_id} requested by {engine}");
                    }
                    Err(RecvError::Lagged(n)) => warn!("signal listener skipped {n} signals"),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bsync_core::{BehaviorAction, ConnectionState, EngineId, EngineSpec, EventDraft};
    use bsync_store::Store;

    use crate::service::ServiceOptions;
    use crate::testing::MockTransport;

    #[tokio::test]
    async fn test_loops_flush_check_and_stop() {
        let mock = Arc::new(MockTransport::accepting());
        mock.set_healthy(EngineId::Horace, false);
        let service = SyncService::new(
            Store::open_in_memory().unwrap(),
            EngineSpec::defaults(),
            mock.clone(),
            ServiceOptions::default(),
        )
        .unwrap();
        service
            .enqueue(EventDraft {
                action: Some(BehaviorAction::UserActivity),
                user_id: 4,
                target_engines: [EngineId::Archer].into_iter().collect(),
                ..Default::default()
            })
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handles = spawn(
            service.clone(),
            Intervals {
                sync: Duration::from_millis(20),
                health: Duration::from_secs(3600),
            },
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(mock.calls_to(EngineId::Archer), 1);
        let status = service.status().await.unwrap();
        assert_eq!(status.persisted.processed, 1);
        // One health check at startup, then nothing for an hour.
        assert_eq!(status.engines[&EngineId::Horace].state, ConnectionState::Degraded);
        assert_eq!(status.engines[&EngineId::Horace].error_count, 1);
    }
}

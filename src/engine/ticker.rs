use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    events::CoreEvent,
    service::CoreService,
    store::record_log::RecordStore,
    utils::clock::Clock,
};

pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Recomputes the status every second and right after records or settings change. Icon changes
/// are published by the service itself, the ticker only decides when to look.
pub struct StatusTicker<S: RecordStore> {
    service: Arc<CoreService<S>>,
    events: broadcast::Receiver<CoreEvent>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
    interval: Duration,
}

impl<S: RecordStore + Sync> StatusTicker<S> {
    pub fn new(
        service: Arc<CoreService<S>>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let events = service.bus().subscribe();
        Self {
            service,
            events,
            clock,
            shutdown,
            interval: TICK_INTERVAL,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut tick_at = self.clock.instant();
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Status ticker stopped");
                    return Ok(());
                }
                _ = self.clock.sleep_until(tick_at) => {
                    tick_at += self.interval;
                    trace!("Tick");
                    self.service.refresh().await;
                }
                event = self.events.recv() => match event {
                    Ok(CoreEvent::RecordsChanged | CoreEvent::SettingsChanged(_)) => {
                        self.service.refresh().await;
                    }
                    Ok(CoreEvent::IconChanged(_)) => (),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Status ticker missed {skipped} events");
                        self.service.refresh().await;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::{
        self,
        sync::{Mutex, Notify},
        task::JoinHandle,
        time::MissedTickBehavior,
    },
    Orbit, Rocket,
};

use crate::config::Config;
use crate::service::BallotService;

/// A background task that periodically drops stale per-ballot metadata.
/// It can be stopped at any point between sweeps.
pub struct Reaper {
    task_handle: JoinHandle<()>,
    signal: Arc<Notify>,
}

impl Reaper {
    /// Start sweeping every `interval`. The first sweep happens one interval from now.
    pub fn start(service: BallotService, interval: Duration) -> Self {
        let signal = Arc::new(Notify::new());

        let task_signal = signal.clone();
        let task_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_signal.notified() => break,
                    _ = ticker.tick() => {
                        trace!("Sweeping stale ballot metadata");
                        service.cleanup_stale_metadata().await;
                    }
                }
            }
            debug!("Reaper stopped");
        });

        Self {
            task_handle,
            signal,
        }
    }

    /// Stop the reaper, waiting for any sweep in progress to finish.
    pub async fn stop(self) {
        self.signal.notify_one();
        if let Err(e) = self.task_handle.await {
            error!("Reaper task failed: {e}");
        }
    }
}

/// A fairing that starts the reaper once the server is live, and stops it on
/// shutdown. This fairing depends on the `BallotService` and `Config` being
/// in managed state.
#[derive(Default)]
pub struct ReaperFairing {
    reaper: Mutex<Option<Reaper>>,
}

#[rocket::async_trait]
impl Fairing for ReaperFairing {
    fn info(&self) -> Info {
        Info {
            name: "Stale metadata reaper",
            kind: Kind::Liftoff | Kind::Shutdown,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        let (service, config) = match (rocket.state::<BallotService>(), rocket.state::<Config>()) {
            (Some(service), Some(config)) => (service, config),
            _ => {
                error!("Ballot service was not available when starting the reaper");
                return;
            }
        };
        let interval = config.reaper_interval();
        *self.reaper.lock().await = Some(Reaper::start(service.clone(), interval));
        info!("Reaper started, sweeping every {}s", interval.as_secs());
    }

    async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
        if let Some(reaper) = self.reaper.lock().await.take() {
            reaper.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::model::api::{BallotSpec, Vote};

    use super::*;

    #[backend_test(local)]
    async fn reaper_sweeps_until_stopped(service: BallotService) {
        let now = Utc::now();
        let ended = BallotSpec {
            start_time: Some(now - ChronoDuration::hours(2)),
            end_time: Some(now - ChronoDuration::hours(1)),
            ..BallotSpec::yes_no()
        };
        let first = service.create_ballot(ended.clone(), None).await.unwrap();
        let _ = service
            .record_vote(&first.id, Vote::Option(first.options[0].id))
            .await;
        assert_eq!(service.state().tracked_ids(), vec![first.id.clone()]);

        let reaper = Reaper::start(service.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(service.state().tracked_ids().is_empty());
        reaper.stop().await;

        // Nothing is swept once stopped.
        let second = service.create_ballot(ended, None).await.unwrap();
        let _ = service
            .record_vote(&second.id, Vote::Option(second.options[0].id))
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(service.state().tracked_ids(), vec![second.id]);
    }
}

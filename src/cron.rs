use crate::fsm::SessionRegistry;
use actix::prelude::*;
use chrono::Utc;
use log::{debug, info};
use std::time::Duration;

const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Periodic housekeeping: sweeps finished sessions out of the registry once
/// their collection time has passed. Sessions with a collection time of -1
/// (running, pending, or failed) are never touched.
pub struct Cron {
    sessions: SessionRegistry,
}

impl Actor for Cron {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Starting cron process");
        ctx.run_interval(REAP_INTERVAL, |cron: &mut Cron, _ctx| {
            debug!("run collect_garbage");
            let removed = collect_garbage(&cron.sessions, Utc::now().timestamp());
            if removed > 0 {
                debug!("Collected {} finished sessions", removed);
            }
        });
    }

    fn stopping(&mut self, _ctx: &mut Self::Context) -> Running {
        Running::Stop
    }
}

impl Cron {
    pub fn new(sessions: SessionRegistry) -> Self {
        Cron { sessions }
    }
}

/// Removes every session whose collection time is set and already past.
fn collect_garbage(registry: &SessionRegistry, now: i64) -> usize {
    let mut sessions = registry.write();
    let before = sessions.len();
    sessions.retain(|_, session| session.collection_time == -1 || session.collection_time >= now);
    before - sessions.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{new_registry, test_support::dummy_session, Status};

    #[test]
    fn reaps_only_collectable_sessions() {
        let sys = System::new("cron-test");
        let registry = new_registry();
        let now = Utc::now().timestamp();
        {
            let mut sessions = registry.write();
            for (order_id, status, collection_time) in &[
                ("keep-running", Status::AwaitingInput, -1),
                ("keep-failed", Status::TranslationFailed, -1),
                ("keep-fresh", Status::Success, now + 3600),
                ("keep-boundary", Status::Success, now),
                ("reap-stale", Status::Success, now - 10),
            ] {
                let mut session = dummy_session(order_id);
                session.status = *status;
                session.collection_time = *collection_time;
                sessions.insert(s!(*order_id), session);
            }
        }
        let removed = collect_garbage(&registry, now);
        drop(sys);
        assert_eq!(removed, 1);
        let sessions = registry.read();
        assert!(sessions.contains_key("keep-running"));
        assert!(sessions.contains_key("keep-failed"));
        assert!(sessions.contains_key("keep-fresh"));
        assert!(sessions.contains_key("keep-boundary"));
        assert!(!sessions.contains_key("reap-stale"));
    }
}

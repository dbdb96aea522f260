//! Operator console: line commands on stdin.
//!
//! `maintain` stops new sessions and blocks until every live session is
//! terminal; `resume` re-opens the exchange; `consolidate` sweeps dust in
//! the account-model wallet. Anything else is ignored.

use crate::fsm::SessionRegistry;
use crate::wallets::HandlerRef;
use futures::future::Future;
use futures::stream::Stream;
use futures::sync::mpsc;
use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DRAIN_POLL: Duration = Duration::from_secs(30);

pub enum ConsoleCommand {
    Consolidate,
}

/// Runs async operator commands on the arbiter, since the console itself
/// lives on a plain OS thread.
pub fn spawn_command_worker(
    handlers: Arc<HashMap<i64, HandlerRef>>,
) -> mpsc::UnboundedSender<ConsoleCommand> {
    let (tx, rx) = mpsc::unbounded::<ConsoleCommand>();
    actix::spawn(rx.for_each(move |command| match command {
        ConsoleCommand::Consolidate => {
            let sweeps: Vec<_> = handlers
                .values()
                .map(|handler| {
                    handler.consolidate().then(|res| {
                        match res {
                            Ok(()) => (),
                            Err(e) => log_error!("Consolidation failed: {}", e),
                        }
                        Ok::<_, ()>(())
                    })
                })
                .collect();
            futures::future::join_all(sweeps).map(|_| {
                log_activity!("Consolidation pass finished");
            })
        }
    }));
    tx
}

fn all_sessions_terminal(sessions: &SessionRegistry) -> bool {
    // Enumeration takes the write lock; drivers mutate entries concurrently.
    sessions
        .write()
        .values()
        .all(|session| session.status.is_terminal())
}

fn wait_for_all_orders_to_complete(sessions: &SessionRegistry) {
    loop {
        if all_sessions_terminal(sessions) {
            return;
        }
        thread::sleep(DRAIN_POLL);
    }
}

/// Blocks forever reading operator commands; run on a dedicated thread.
pub fn command_loop(
    sessions: SessionRegistry,
    maintenance: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<ConsoleCommand>,
) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => return,
        };
        match line.trim() {
            "maintain" => {
                maintenance.store(true, Ordering::SeqCst);
                wait_for_all_orders_to_complete(&sessions);
                println!("All orders are done you may edit environment");
            }
            "resume" => maintenance.store(false, Ordering::SeqCst),
            "consolidate" => {
                if commands.unbounded_send(ConsoleCommand::Consolidate).is_err() {
                    log_error!("Command worker is gone, cannot consolidate");
                }
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{new_registry, test_support::dummy_session, Status};
    use actix::System;

    #[test]
    fn drain_predicate_requires_all_terminal() {
        let sys = System::new("console-test");
        let registry = new_registry();
        assert!(all_sessions_terminal(&registry));

        let mut active = dummy_session("active");
        active.status = Status::ConfirmingOutput;
        registry.write().insert(s!("active"), active);
        let mut done = dummy_session("done");
        done.status = Status::Success;
        registry.write().insert(s!("done"), done);
        assert!(!all_sessions_terminal(&registry));

        registry
            .write()
            .get_mut("active")
            .map(|session| session.status = Status::TranslationFailed);
        assert!(all_sessions_terminal(&registry));
        drop(sys);
    }
}

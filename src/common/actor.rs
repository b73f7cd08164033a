//
// Copyright 2024 the worldvoice authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A tiny actor runtime: each actor owns its state on a dedicated thread and
//! processes closures sent to it, immediately or after a delay. Periodic
//! work is done by a task that re-sends itself with `send_delayed`.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        atomic::{self, AtomicBool},
        mpsc::{channel, RecvError, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crate::common::Result;
use crate::error::VoiceError;

pub struct Actor<State> {
    name: &'static str,
    sender: Sender<Task<State>>,
    stopper: Stopper,
}

impl<State: 'static> Actor<State> {
    /// Spawns the actor thread and builds the state on it. Blocks until the
    /// state generator has run so construction failures surface to the
    /// caller rather than being lost on a background thread.
    pub fn start(
        name: &'static str,
        stopper: Stopper,
        gen_state: impl FnOnce(Actor<State>) -> Result<State> + Send + 'static,
    ) -> Result<Self> {
        let (sender, receiver) = channel::<Task<State>>();
        let (ready_sender, ready_receiver) = channel::<std::result::Result<(), String>>();

        // One "stopped" flag on the inside of the loop to check if we've
        // been stopped, another on the outside to trigger stopping.
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_to_register = stopped.clone();

        let actor = Self {
            name,
            sender,
            stopper: stopper.clone(),
        };
        let actor_to_register = actor.clone();
        let actor_to_return = actor.clone();
        let join_handle = thread::spawn(move || {
            let mut state = match gen_state(actor) {
                Ok(state) => {
                    let _ = ready_sender.send(Ok(()));
                    state
                }
                Err(err) => {
                    let _ = ready_sender.send(Err(format!("{err}")));
                    return;
                }
            };
            let mut delayed_tasks = BinaryHeap::<Task<State>>::new();
            loop {
                // Manual select between the next delayed deadline and the
                // mailbox.
                let received_task = match delayed_tasks.peek() {
                    None => match receiver.recv() {
                        Ok(received_task) => received_task,
                        Err(RecvError) => break,
                    },
                    Some(delayed_task) => match receiver.recv_timeout(delayed_task.timeout()) {
                        Ok(received_task) => received_task,
                        Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            // It's waited long enough; run it below.
                            match delayed_tasks.pop() {
                                Some(task) => task.as_immediate(),
                                None => continue,
                            }
                        }
                    },
                };
                if stopped.load(atomic::Ordering::Relaxed) {
                    break;
                }
                if received_task.is_delayed() {
                    delayed_tasks.push(received_task);
                } else {
                    (received_task.run)(&mut state);
                }
            }
            trace!("actor {} stopped", name);
        });

        match ready_receiver.recv() {
            Ok(Ok(())) => {
                stopper.register(Box::new(actor_to_register), stopped_to_register, join_handle);
                Ok(actor_to_return)
            }
            Ok(Err(message)) => {
                let _ = join_handle.join();
                Err(VoiceError::StartActor(message).into())
            }
            Err(_) => {
                let _ = join_handle.join();
                Err(VoiceError::StartActor(format!("actor {name} thread died")).into())
            }
        }
    }

    pub fn send(&self, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Task::immediate(Box::new(run)));
    }

    pub fn send_delayed(&self, delay: Duration, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Task::delayed(Box::new(run), delay));
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

// This doesn't #[derive] because State isn't Clone.
impl<State> Clone for Actor<State> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            sender: self.sender.clone(),
            stopper: self.stopper.clone(),
        }
    }
}

impl<State> Stop for Actor<State> {
    fn stop(&self, stopped: &AtomicBool) {
        stopped.store(true, atomic::Ordering::Relaxed);
        // Sending an empty message kicks the message loop if it's stuck
        // waiting on an empty mailbox.
        let _ = self.sender.send(Task::immediate(Box::new(|_state| {})));
    }
}

type BoxedTaskFn<State> = Box<dyn FnOnce(&mut State) + Send>;

struct Task<State> {
    run: BoxedTaskFn<State>,
    deadline: Option<Instant>, // None == immediately
}

impl<State> Task<State> {
    fn immediate(run: BoxedTaskFn<State>) -> Self {
        Self {
            run,
            deadline: None,
        }
    }

    fn delayed(run: BoxedTaskFn<State>, delay: Duration) -> Self {
        Self {
            run,
            deadline: Some(Instant::now() + delay),
        }
    }

    fn as_immediate(self) -> Self {
        Self {
            run: self.run,
            deadline: None,
        }
    }

    fn is_delayed(&self) -> bool {
        self.deadline.is_some()
    }

    fn timeout(&self) -> Duration {
        match self.deadline {
            None => Duration::from_secs(0),
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        }
    }
}

impl<T> Ord for Task<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed because the earliest deadline should come out of the
        // BinaryHeap first.
        self.deadline.cmp(&other.deadline).reverse()
    }
}

impl<T> PartialOrd for Task<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl<T> Eq for Task<T> {}

trait Stop: Send {
    fn stop(&self, stopped: &AtomicBool);
}

/// One Stopper is shared by all the actors of a session; stopping it is the
/// session's cancellation scope. Joining is bounded: a background task stuck
/// in a callback must not hang teardown forever.
#[derive(Clone, Default)]
pub struct Stopper {
    actors: Arc<Mutex<Vec<(Box<dyn Stop>, Arc<AtomicBool>, thread::JoinHandle<()>)>>>,
}

impl Stopper {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        actor: Box<dyn Stop>,
        stopped: Arc<AtomicBool>,
        join_handle: thread::JoinHandle<()>,
    ) {
        if let Ok(mut actors) = self.actors.lock() {
            actors.push((actor, stopped, join_handle));
        } else {
            error!("Stopper lock poisoned; actor will not be registered");
        }
    }

    /// Stop all the actors associated with this Stopper without waiting for
    /// their threads to end.
    pub fn stop_all_without_joining(&self) -> Vec<thread::JoinHandle<()>> {
        let mut actors = match self.actors.lock() {
            Ok(actors) => actors,
            Err(_) => {
                error!("Stopper lock poisoned; can't stop actors");
                return Vec::new();
            }
        };
        actors
            .drain(..)
            .map(|(actor, stopped, join_handle)| {
                actor.stop(&stopped);
                join_handle
            })
            .collect()
    }

    /// Stop all the actors and wait for them to end, but never longer than
    /// `timeout`. Returns false if the deadline passed with threads still
    /// running; they are left to finish detached.
    pub fn stop_all_and_join_with_timeout(&self, timeout: Duration) -> bool {
        let join_handles = self.stop_all_without_joining();
        if join_handles.is_empty() {
            return true;
        }
        let (done_sender, done_receiver) = channel();
        let reaper = thread::spawn(move || {
            for join_handle in join_handles {
                let _ = join_handle.join();
            }
            let _ = done_sender.send(());
        });
        match done_receiver.recv_timeout(timeout) {
            Ok(()) => {
                let _ = reaper.join();
                true
            }
            Err(_) => {
                warn!("timed out joining actor threads after {:?}", timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct Counter {
        count: Arc<AtomicU32>,
    }

    #[test]
    fn runs_sent_tasks_in_order() {
        let count = Arc::new(AtomicU32::new(0));
        let count_in_state = count.clone();
        let actor = Actor::start("test", Stopper::new(), move |_actor| {
            Ok(Counter {
                count: count_in_state,
            })
        })
        .unwrap();

        for _ in 0..10 {
            actor.send(|state: &mut Counter| {
                state.count.fetch_add(1, atomic::Ordering::SeqCst);
            });
        }
        // Stopping drops queued tasks, so wait for the last one to run first.
        let (done_sender, done_receiver) = channel();
        actor.send(move |_state: &mut Counter| {
            let _ = done_sender.send(());
        });
        done_receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("tasks never ran");
        assert_eq!(10, count.load(atomic::Ordering::SeqCst));
        assert!(actor
            .stopper()
            .stop_all_and_join_with_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn start_failure_is_returned_to_the_caller() {
        let result = Actor::<Counter>::start("failing", Stopper::new(), |_actor| {
            Err(VoiceError::StartActor("no state for you".to_string()).into())
        });
        assert!(result.is_err());
    }

    #[test]
    fn delayed_task_runs_after_delay() {
        let count = Arc::new(AtomicU32::new(0));
        let count_in_state = count.clone();
        let actor = Actor::start("delayed", Stopper::new(), move |_actor| {
            Ok(Counter {
                count: count_in_state,
            })
        })
        .unwrap();

        actor.send_delayed(Duration::from_millis(20), |state: &mut Counter| {
            state.count.fetch_add(1, atomic::Ordering::SeqCst);
        });
        assert_eq!(0, count.load(atomic::Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(1, count.load(atomic::Ordering::SeqCst));
        actor
            .stopper()
            .stop_all_and_join_with_timeout(Duration::from_secs(5));
    }
}

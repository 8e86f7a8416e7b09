// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{error, info, span, warn, Level};

use crate::looper::{DurationSource, Looper};

pub mod console;

/// Controller events that trigger behavior in the looper.
#[derive(Debug, PartialEq)]
pub enum Event {
    /// Flips between REC and PLAY. Ignored while the transport runs.
    ToggleMode,

    /// Starts recording or playback when stopped, stops otherwise.
    StartStop,

    /// Selects the previous track when stopped; pauses or resumes playback
    /// when running.
    Left,

    /// Selects the next track when stopped; clears the selected track when
    /// playing.
    Right,

    /// Stops everything and clears all tracks of the current session.
    DeleteAll,

    /// Reports the looper state.
    Status,

    /// Enables or disables super looper mode.
    SuperLooper(bool),

    /// Sets the super looper fixed loop duration.
    FixedDuration(Duration),
}

pub trait Driver: Send + Sync + 'static {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>>;
}

/// Controls a looper.
pub struct Controller {
    handle: JoinHandle<()>,
}

impl Controller {
    /// Creates a new controller with the given driver.
    pub fn new(looper: Looper, driver: Arc<dyn Driver>) -> Result<Controller, Box<dyn Error>> {
        Ok(Controller {
            handle: tokio::spawn(async move { Controller::trigger_events(looper, driver).await }),
        })
    }

    /// Join will block until the controller finishes.
    pub async fn join(&mut self) -> Result<(), JoinError> {
        (&mut self.handle).await
    }

    /// Triggers looper events by watching the driver and getting events from
    /// it.
    async fn trigger_events(looper: Looper, driver: Arc<dyn Driver>) {
        let span = span!(Level::INFO, "controller");
        let _enter = span.enter();

        let (events_tx, mut events_rx) = mpsc::channel(1);
        let join_handle = driver.monitor_events(events_tx);

        info!("Controller started.");

        loop {
            if let Some(event) = events_rx.recv().await {
                info!(event = format!("{:?}", event), "Received event.");

                if let Err(e) = match event {
                    Event::ToggleMode => looper.toggle_mode().map(|_| ()),
                    Event::StartStop => looper.start_stop().map(|_| ()),
                    Event::Left => looper.nav_left().map(|_| ()),
                    Event::Right => looper.nav_right().map(|_| ()),
                    Event::DeleteAll => {
                        looper.delete_all();
                        Ok(())
                    }
                    Event::Status => {
                        println!("{}", looper.status());
                        Ok(())
                    }
                    Event::SuperLooper(enabled) => looper.set_super_looper(enabled, None),
                    Event::FixedDuration(duration) => {
                        // Enabling with a manual duration also covers the
                        // case where super looper isn't on yet.
                        looper.set_super_looper(true, Some(DurationSource::Manual(duration)))
                    }
                } {
                    warn!(err = e.to_string(), "Event not applicable right now.");
                }
            } else {
                info!("Controller closing.");
                looper.shutdown();
                if let Err(e) = join_handle.await {
                    error!("Error waiting for event monitor to stop: {}", e);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        error::Error,
        io,
        sync::{Arc, Barrier, Mutex},
        time::Duration,
    };

    use tokio::{sync::mpsc::Sender, task::JoinHandle};

    use crate::looper::Looper;
    use crate::midi::test::Device as MockDevice;
    use crate::session::{Mode, SystemMode, TransportState};
    use crate::store::Store;
    use crate::testutil::eventually;

    use super::{Driver, Event};

    #[derive(Debug)]
    enum TestEvent {
        Unset,
        Send(Event),
        Close,
    }

    struct TestDriver {
        current_event: Arc<Mutex<TestEvent>>,
        barrier: Arc<Barrier>,
    }

    impl TestDriver {
        /// Creates a new test driver which is explicitly controlled by the
        /// next_event function.
        fn new() -> TestDriver {
            TestDriver {
                current_event: Arc::new(Mutex::new(TestEvent::Unset)),
                barrier: Arc::new(Barrier::new(2)),
            }
        }

        /// Signals the next event to the monitor thread.
        fn next_event(&self, event: TestEvent) {
            {
                let mut current_event = self.current_event.lock().expect("failed to get lock");
                *current_event = event;
            }
            // Wait until the thread goes to receive the event.
            self.barrier.wait();
            // Wait until the thread has locked the mutex.
            self.barrier.wait();
        }
    }

    impl Driver for TestDriver {
        fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>> {
            let barrier = self.barrier.clone();
            let current_event = self.current_event.clone();
            tokio::task::spawn_blocking(move || loop {
                // Wait for next_event to set the current event.
                barrier.wait();
                let mut current_event = current_event.lock().expect("failed to get lock");
                // Let next_event know that we got the event.
                barrier.wait();
                match std::mem::replace(&mut *current_event, TestEvent::Unset) {
                    TestEvent::Unset => panic!("current event should not be unset"),
                    TestEvent::Send(event) => {
                        assert!(events_tx.blocking_send(event).is_ok())
                    }
                    TestEvent::Close => return Ok(()),
                }
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_controller() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = MockDevice::get("mock-controller");
        let looper = Looper::new(
            Arc::new(device.clone()),
            Store::new(dir.path().join("data")),
            dir.path().join("exports"),
            Duration::from_millis(1),
            480,
        )?;

        let driver = Arc::new(TestDriver::new());
        let mut controller = super::Controller::new(looper.clone(), driver.clone())?;

        driver.next_event(TestEvent::Send(Event::Right));
        eventually(
            || looper.status().selected == 2,
            "Selection never moved right",
        );
        driver.next_event(TestEvent::Send(Event::Left));
        eventually(
            || looper.status().selected == 1,
            "Selection never moved back",
        );

        driver.next_event(TestEvent::Send(Event::ToggleMode));
        eventually(
            || looper.status().system_mode == SystemMode::Play,
            "Mode never toggled to PLAY",
        );

        driver.next_event(TestEvent::Send(Event::StartStop));
        eventually(
            || looper.status().transport == TransportState::Playing,
            "Playback never started",
        );
        driver.next_event(TestEvent::Send(Event::StartStop));
        eventually(
            || looper.status().transport == TransportState::Stopped,
            "Playback never stopped",
        );

        driver.next_event(TestEvent::Send(Event::FixedDuration(Duration::from_secs(
            4,
        ))));
        eventually(
            || {
                let status = looper.status();
                status.mode == Mode::SuperLooper
                    && status.fixed_duration == Some(Duration::from_secs(4))
            },
            "Super looper never enabled",
        );
        driver.next_event(TestEvent::Send(Event::SuperLooper(false)));
        eventually(
            || looper.status().mode == Mode::Normal,
            "Super looper never disabled",
        );

        driver.next_event(TestEvent::Send(Event::DeleteAll));
        eventually(
            || looper.status().transport == TransportState::Stopped,
            "Delete all never settled",
        );

        driver.next_event(TestEvent::Close);
        assert!(
            controller.join().await.is_ok(),
            "Error waiting for controller",
        );

        Ok(())
    }
}

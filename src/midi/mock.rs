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
use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::mpsc::Sender;
use tracing::info;

/// A mock device. Records everything sent to it and lets tests inject input
/// messages through the capture channel.
#[derive(Clone)]
pub struct Device {
    name: String,
    sender: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<AtomicUsize>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str) -> Device {
        Device {
            name: name.to_string(),
            sender: Arc::new(Mutex::new(None)),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Injects a raw input message as if the hardware had produced it.
    pub fn mock_event(&self, raw: &[u8]) {
        let sender = self.sender.lock().expect("unable to get sender lock");
        sender
            .as_ref()
            .expect("no capture channel, call watch_events first")
            .try_send(raw.to_vec())
            .expect("error sending mock event");
    }

    /// All messages sent to the output so far, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().expect("unable to get sent lock").clone()
    }

    /// Clears the sent message log.
    pub fn clear_sent(&self) {
        self.sent.lock().expect("unable to get sent lock").clear();
    }

    /// Makes the next n sends fail.
    pub fn fail_next_sends(&self, n: usize) {
        self.fail_sends.store(n, Ordering::Relaxed);
    }
}

impl super::Device for Device {
    fn name(&self) -> String {
        self.name.clone()
    }

    /// Stores the sender so tests can inject events.
    fn watch_events(&self, sender: Sender<Vec<u8>>) -> Result<(), Box<dyn Error>> {
        let mut stored = self.sender.lock().expect("unable to get sender lock");
        if stored.is_some() {
            return Err("Already watching events.".into());
        }

        info!(device = self.name, "Watching MIDI events (mock).");
        *stored = Some(sender);
        Ok(())
    }

    fn stop_watch_events(&self) {
        self.sender
            .lock()
            .expect("unable to get sender lock")
            .take();
    }

    fn send(&self, raw: &[u8]) -> Result<(), Box<dyn Error>> {
        if self
            .fail_sends
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err("mock send failure".into());
        }

        self.sent
            .lock()
            .expect("unable to get sent lock")
            .push(raw.to_vec());
        Ok(())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

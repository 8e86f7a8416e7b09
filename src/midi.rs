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
use std::{error::Error, fmt, sync::Arc};

use tokio::sync::mpsc::Sender;
use tracing::warn;

mod midir;
mod mock;

/// All notes off.
const CC_ALL_NOTES_OFF: u8 = 123;
/// Reset all controllers, which releases sustain among other things.
const CC_RESET_CONTROLLERS: u8 = 121;

/// A MIDI device that can emit raw messages and listen for inputs.
pub trait Device: fmt::Display + Send + Sync {
    /// Returns the name of the device.
    fn name(&self) -> String;

    /// Watches MIDI input for messages and sends their raw bytes to the
    /// given sender.
    fn watch_events(&self, sender: Sender<Vec<u8>>) -> Result<(), Box<dyn Error>>;

    /// Stops watching events.
    fn stop_watch_events(&self);

    /// Sends a raw MIDI message to the output.
    fn send(&self, raw: &[u8]) -> Result<(), Box<dyn Error>>;
}

/// Broadcasts a MIDI panic: all notes off and reset all controllers on every
/// channel. A failed send is retried once before the error is surfaced.
pub fn panic(device: &dyn Device) -> Result<(), Box<dyn Error>> {
    for channel in 0..16u8 {
        for control in [CC_ALL_NOTES_OFF, CC_RESET_CONTROLLERS] {
            let message = [0xB0 | channel, control, 0];
            if let Err(e) = device.send(&message) {
                warn!(
                    err = e.to_string(),
                    channel, "Error sending panic message, retrying."
                );
                device.send(&message)?;
            }
        }
    }
    Ok(())
}

/// Lists devices known to midir.
pub fn list_devices() -> Result<Vec<Box<dyn Device>>, Box<dyn Error>> {
    midir::list()
}

/// Gets a device with the given name.
pub fn get_device(name: &str) -> Result<Arc<dyn Device>, Box<dyn Error>> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(name)));
    };

    Ok(Arc::new(midir::get(name)?))
}

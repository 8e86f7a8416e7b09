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
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use duration_string::DurationString;
use serde::Deserialize;

/// The default emission loop resolution.
const DEFAULT_TICK: Duration = Duration::from_millis(1);
/// The default SMF export resolution in pulses per quarter note.
const DEFAULT_PPQN: u16 = 480;

/// A YAML representation of the looper configuration.
#[derive(Deserialize, Clone)]
pub struct Config {
    /// The MIDI device connected to the instrument.
    midi_device: String,
    /// Where session snapshots are stored.
    data_dir: PathBuf,
    /// Where SMF exports are written. Defaults to the data directory.
    export_dir: Option<PathBuf>,
    /// The emission loop resolution, as a duration string such as "1ms".
    tick: Option<String>,
    /// Pulses per quarter note for SMF export.
    ppqn: Option<u16>,
}

impl Config {
    /// Deserializes the config from the given path.
    pub fn deserialize(path: &Path) -> Result<Config, Box<dyn Error>> {
        Ok(serde_yml::from_str(&fs::read_to_string(path)?)?)
    }

    /// The MIDI device name.
    pub fn midi_device(&self) -> &str {
        &self.midi_device
    }

    /// The snapshot directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The SMF export directory.
    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.clone())
    }

    /// The emission loop resolution.
    pub fn tick(&self) -> Result<Duration, Box<dyn Error>> {
        match &self.tick {
            Some(tick) => Ok(DurationString::from_string(tick.clone())?.into()),
            None => Ok(DEFAULT_TICK),
        }
    }

    /// The SMF export resolution.
    pub fn ppqn(&self) -> u16 {
        self.ppqn.unwrap_or(DEFAULT_PPQN)
    }
}

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
use std::io;

use duration_string::DurationString;
use tokio::{sync::mpsc::Sender, task::JoinHandle};
use tracing::{info, span, warn, Level};

use super::Event;

const MODE: &str = "mode";
const START: &str = "start";
const LEFT: &str = "left";
const RIGHT: &str = "right";
const DELETE: &str = "delete";
const STATUS: &str = "status";
const SUPER: &str = "super";
const DURATION: &str = "duration";

/// A controller that controls the looper from the terminal.
pub struct Driver {}

impl Driver {
    pub fn new() -> Driver {
        Driver {}
    }

    fn monitor_io<R, W>(
        events_tx: &Sender<Event>,
        mut reader: R,
        mut writer: W,
    ) -> Result<(), io::Error>
    where
        R: io::BufRead,
        W: io::Write,
    {
        write!(
            writer,
            "Command ({}, {}, {}, {}, {}, {}, {} on|off, {} <len>): ",
            MODE, START, LEFT, RIGHT, DELETE, STATUS, SUPER, DURATION,
        )?;
        writer.flush()?;
        let mut input: String = String::default();
        reader.read_line(&mut input)?;

        let input = input.trim().to_lowercase();
        let mut words = input.split_whitespace();
        let event = match (words.next(), words.next()) {
            (Some(MODE), None) => Some(Event::ToggleMode),
            (Some(START), None) => Some(Event::StartStop),
            (Some(LEFT), None) => Some(Event::Left),
            (Some(RIGHT), None) => Some(Event::Right),
            (Some(DELETE), None) => Some(Event::DeleteAll),
            (Some(STATUS), None) => Some(Event::Status),
            (Some(SUPER), Some("on")) => Some(Event::SuperLooper(true)),
            (Some(SUPER), Some("off")) => Some(Event::SuperLooper(false)),
            (Some(DURATION), Some(len)) => match DurationString::from_string(len.to_string()) {
                Ok(duration) => Some(Event::FixedDuration(duration.into())),
                Err(e) => {
                    warn!(input = len, err = e.to_string(), "Unrecognized duration");
                    None
                }
            },
            _ => {
                warn!(input = input, "Unrecognized input");
                None
            }
        };

        if let Some(event) = event {
            events_tx
                .blocking_send(event)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        }
        Ok(())
    }
}

impl super::Driver for Driver {
    fn monitor_events(&self, events_tx: Sender<Event>) -> JoinHandle<Result<(), io::Error>> {
        tokio::task::spawn_blocking(move || {
            let span = span!(Level::INFO, "console driver");
            let _enter = span.enter();

            info!("Console driver started.");

            loop {
                Self::monitor_io(&events_tx, io::stdin().lock(), io::stdout())?;
            }
        })
    }
}

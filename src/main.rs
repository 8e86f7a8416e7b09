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
mod config;
mod controller;
mod looper;
mod midi;
mod session;
mod smf;
mod store;
#[cfg(test)]
mod testutil;

use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{crate_version, Parser, Subcommand};

use crate::config::Config;
use crate::controller::Controller;
use crate::looper::Looper;
use crate::session::{Mode, NUM_TRACKS};
use crate::store::Store;

const SYSTEMD_SERVICE: &str = r#"
[Unit]
Description=multitrack MIDI looper

[Service]
Type=simple
Restart=on-failure
EnvironmentFile=-/etc/default/mloop
ExecStart=/usr/local/bin/mloop start "$MLOOP_CONFIG"
ExecReload=/bin/kill -HUP $MAINPID

[Install]
WantedBy=multi-user.target
Alias=mloop.service
"#;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A multitrack MIDI looper."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available MIDI input/output devices.
    MidiDevices {},
    /// Start will start the looper.
    Start {
        /// The path to the looper config.
        config_path: String,
    },
    /// Prints the persisted sessions.
    Status {
        /// The path to the looper config.
        config_path: String,
    },
    /// Exports a persisted session as Standard MIDI Files.
    Export {
        /// The path to the looper config.
        config_path: String,
        /// Merge all tracks into a single file instead of one per track.
        #[arg(short, long)]
        merge: bool,
        /// Export the super looper session instead of the normal one.
        #[arg(short, long)]
        super_looper: bool,
    },
    /// Imports a Standard MIDI File into a track of a persisted session.
    Import {
        /// The path to the looper config.
        config_path: String,
        /// The destination track, 1 through 10.
        track: usize,
        /// The path to the SMF file.
        file: String,
        /// Import into the super looper session instead of the normal one.
        #[arg(short, long)]
        super_looper: bool,
    },
    /// Prints a systemd service definition to stdout.
    Systemd {},
}

fn snapshot_mode(super_looper: bool) -> Mode {
    if super_looper {
        Mode::SuperLooper
    } else {
        Mode::Normal
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::MidiDevices {} => {
            let devices = midi::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Start { config_path } => {
            let config = Config::deserialize(&PathBuf::from(config_path))?;
            let device = midi::get_device(config.midi_device())?;
            let looper = Looper::new(
                device,
                Store::new(config.data_dir()),
                config.export_dir(),
                config.tick()?,
                config.ppqn(),
            )?;

            let driver = Arc::new(controller::console::Driver::new());
            Controller::new(looper, driver)?.join().await?;
        }
        Commands::Status { config_path } => {
            let config = Config::deserialize(&PathBuf::from(config_path))?;
            let store = Store::new(config.data_dir());

            for mode in [Mode::Normal, Mode::SuperLooper] {
                let session = store.load_or_default(mode);
                let status = looper::Status {
                    mode: session.mode(),
                    system_mode: session.system_mode(),
                    transport: session.transport(),
                    selected: session.selected(),
                    fixed_duration: session.fixed_duration(),
                    last_take_truncated: false,
                    tracks: session.summaries(),
                };
                println!("{}", status);
            }
        }
        Commands::Export {
            config_path,
            merge,
            super_looper,
        } => {
            let config = Config::deserialize(&PathBuf::from(config_path))?;
            let store = Store::new(config.data_dir());
            let session = store.load_or_default(snapshot_mode(super_looper));
            let codec = smf::Codec::new(config.ppqn());

            let export_dir = config.export_dir();
            fs::create_dir_all(&export_dir)?;
            let paths = if merge {
                vec![codec.export_merged(&session, &export_dir)?]
            } else {
                codec.export_separate(&session, &export_dir)?
            };

            println!("Exported:");
            for path in paths {
                println!("- {}", path.display());
            }
        }
        Commands::Import {
            config_path,
            track,
            file,
            super_looper,
        } => {
            if !(1..=NUM_TRACKS).contains(&track) {
                return Err(format!("track must be between 1 and {}", NUM_TRACKS).into());
            }

            let config = Config::deserialize(&PathBuf::from(config_path))?;
            let store = Store::new(config.data_dir());
            let mut session = store.load_or_default(snapshot_mode(super_looper));
            let codec = smf::Codec::new(config.ppqn());

            let stream = codec.import(&PathBuf::from(&file), session.track(track).channel())?;
            let events = stream.len();
            session.track_mut(track).record_overwrite(stream);
            store.save(&session)?;

            println!("Imported {} events from {} into track {}.", events, file, track);
        }
        Commands::Systemd {} => {
            println!("{}", SYSTEMD_SERVICE)
        }
    }

    Ok(())
}

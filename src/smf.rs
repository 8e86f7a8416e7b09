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
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use midly::live::LiveEvent;
use midly::num::{u15, u24, u28};
use midly::{Format, Header, MetaMessage, Smf, Timing, TrackEvent, TrackEventKind};
use thiserror::Error;
use tracing::{debug, info};

use crate::session::{EventStream, MidiEvent, Session};

/// Exports use a fixed 120 BPM grid; only deltas matter for a looper.
const MICROS_PER_BEAT: u32 = 500_000;

/// The base name of the merged export file.
pub const MERGED_FILE: &str = "merged_output.mid";

/// Errors from the SMF codec. A failed import or export aborts only that
/// operation and leaves the session untouched.
#[derive(Debug, Error)]
pub enum SmfError {
    #[error("error decoding SMF file {path}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("error encoding SMF data: {0}")]
    Encode(String),
    #[error("error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no recorded tracks to export")]
    NothingToExport,
}

/// Encodes track event streams into Standard MIDI Files and decodes SMF files
/// back into event streams.
pub struct Codec {
    ppqn: u16,
}

impl Codec {
    /// Creates a codec with the given pulses-per-quarter-note resolution.
    pub fn new(ppqn: u16) -> Codec {
        Codec { ppqn }
    }

    /// One encoding time unit. Offsets survive a round trip within this.
    pub fn tick_unit(&self) -> Duration {
        Duration::from_micros(u64::from(MICROS_PER_BEAT) / u64::from(self.ppqn))
    }

    /// Exports all non-empty tracks, globally time-sorted, into a single
    /// format 0 file. Each event keeps its original channel.
    pub fn export_merged(&self, session: &Session, dir: &Path) -> Result<PathBuf, SmfError> {
        let mut events: Vec<&MidiEvent> = session
            .tracks()
            .flat_map(|(_, track)| track.events().iter())
            .collect();
        if events.is_empty() {
            return Err(SmfError::NothingToExport);
        }
        events.sort_by_key(|event| event.offset);

        let path = dir.join(MERGED_FILE);
        self.write_file(&events, &path)?;
        info!(path = %path.display(), events = events.len(), "Exported merged SMF.");
        Ok(path)
    }

    /// Exports each non-empty track into its own format 0 file named
    /// `track_<n>.mid`. Returns the written paths.
    pub fn export_separate(&self, session: &Session, dir: &Path) -> Result<Vec<PathBuf>, SmfError> {
        let mut paths = Vec::new();
        for (index, track) in session.tracks() {
            if track.is_empty() {
                continue;
            }
            let events: Vec<&MidiEvent> = track.events().iter().collect();
            let path = dir.join(format!("track_{}.mid", index));
            self.write_file(&events, &path)?;
            info!(path = %path.display(), track = index, "Exported track SMF.");
            paths.push(path);
        }
        if paths.is_empty() {
            return Err(SmfError::NothingToExport);
        }
        Ok(paths)
    }

    /// Decodes an SMF file into a single event stream, remapping channel
    /// voice messages onto the given destination channel. Parallel track
    /// chunks are merged by absolute time; sequential chunks are appended.
    pub fn import(&self, path: &Path, channel: u8) -> Result<EventStream, SmfError> {
        let buf = fs::read(path).map_err(|source| SmfError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let smf = Smf::parse(&buf).map_err(|e| SmfError::Decode {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let ticks_per_beat = match smf.header.timing {
            Timing::Metrical(ticks) => u32::from(ticks.as_int()),
            Timing::Timecode(_, _) => {
                return Err(SmfError::Decode {
                    path: path.to_path_buf(),
                    reason: "SMPTE timecode timing is not supported".to_string(),
                })
            }
        };

        let sequential = matches!(smf.header.format, Format::Sequential);
        let mut events: Vec<MidiEvent> = Vec::new();
        let mut chunk_base = Duration::ZERO;

        for chunk in &smf.tracks {
            let mut elapsed_ns: u128 = 0;
            // Tempo resets per chunk; a tempo map chunk only affects itself.
            let mut ns_per_tick =
                u128::from(MICROS_PER_BEAT) * 1_000 / u128::from(ticks_per_beat);
            let mut chunk_end = Duration::ZERO;

            for track_event in chunk {
                elapsed_ns += u128::from(track_event.delta.as_int()) * ns_per_tick;
                let offset = chunk_base + Duration::from_nanos(elapsed_ns as u64);
                chunk_end = offset;

                match track_event.kind {
                    TrackEventKind::Midi {
                        channel: source_channel,
                        message,
                    } => {
                        let live = LiveEvent::Midi {
                            channel: source_channel,
                            message,
                        };
                        let mut raw: Vec<u8> = Vec::with_capacity(8);
                        live.write(&mut raw)
                            .map_err(|e| SmfError::Encode(e.to_string()))?;
                        events.push(MidiEvent::from_raw(offset, &raw, channel));
                    }
                    TrackEventKind::Meta(MetaMessage::Tempo(tempo)) => {
                        ns_per_tick =
                            u128::from(tempo.as_int()) * 1_000 / u128::from(ticks_per_beat);
                    }
                    _ => {}
                }
            }

            if sequential {
                chunk_base = chunk_end;
            }
        }

        events.sort_by_key(|event| event.offset);
        debug!(path = %path.display(), events = events.len(), "Decoded SMF.");
        Ok(EventStream::from_events(events))
    }

    /// Writes one track chunk of delta-time + MIDI-message pairs, preceded by
    /// a tempo meta event and followed by end-of-track.
    fn write_file(&self, events: &[&MidiEvent], path: &Path) -> Result<(), SmfError> {
        let timing = u15::try_from(self.ppqn)
            .ok_or_else(|| SmfError::Encode(format!("PPQN {} out of range", self.ppqn)))?;
        let tempo = u24::try_from(MICROS_PER_BEAT)
            .ok_or_else(|| SmfError::Encode("tempo out of range".to_string()))?;

        let mut chunk: Vec<TrackEvent<'_>> = Vec::with_capacity(events.len() + 2);
        chunk.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(tempo)),
        });

        let mut last_ticks: u64 = 0;
        for event in events {
            let (channel, message) = match LiveEvent::parse(&event.data) {
                Ok(LiveEvent::Midi { channel, message }) => (channel, message),
                // The snapshot keeps full raw fidelity; SMF export carries
                // channel voice messages only.
                _ => {
                    debug!(kind = ?event.kind, "Skipping non-channel event in SMF export.");
                    continue;
                }
            };

            let ticks = self.offset_ticks(event.offset);
            let delta = u28::try_from(
                u32::try_from(ticks - last_ticks)
                    .map_err(|_| SmfError::Encode("delta time overflow".to_string()))?,
            )
            .ok_or_else(|| SmfError::Encode("delta time overflow".to_string()))?;
            last_ticks = ticks;

            chunk.push(TrackEvent {
                delta,
                kind: TrackEventKind::Midi { channel, message },
            });
        }

        chunk.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });

        let smf = Smf {
            header: Header {
                format: Format::SingleTrack,
                timing: Timing::Metrical(timing),
            },
            tracks: vec![chunk],
        };
        smf.save(path).map_err(|source| SmfError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Absolute offset in SMF ticks.
    fn offset_ticks(&self, offset: Duration) -> u64 {
        (offset.as_micros() * u128::from(self.ppqn) / u128::from(MICROS_PER_BEAT)) as u64
    }
}

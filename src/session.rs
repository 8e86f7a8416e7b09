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
use std::fmt;
use std::time::Duration;

use midly::live::LiveEvent;
use midly::MidiMessage;
use serde::{Deserialize, Serialize};

/// The number of track slots in a session. Tracks are created empty at
/// session initialization and are never destroyed, only cleared or
/// overwritten.
pub const NUM_TRACKS: usize = 10;

/// The kind of a recorded MIDI message. Messages that aren't channel voice
/// messages we care about individually are kept with full fidelity as Other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NoteOn,
    NoteOff,
    ControlChange,
    ProgramChange,
    Other,
}

/// A single timestamped MIDI message. Immutable once recorded; offsets within
/// a stream are non-decreasing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MidiEvent {
    /// Duration since the start of the track's recording clock.
    pub offset: Duration,
    /// The message kind.
    pub kind: EventKind,
    /// The MIDI channel of the message.
    pub channel: u8,
    /// The raw message bytes, sent verbatim to the output device on playback.
    pub data: Vec<u8>,
}

impl MidiEvent {
    /// Builds an event from raw device bytes, remapping channel voice
    /// messages onto the given channel. The raw bytes are preserved even when
    /// the message can't be parsed.
    pub fn from_raw(offset: Duration, raw: &[u8], channel: u8) -> MidiEvent {
        let mut data = raw.to_vec();
        let mut kind = EventKind::Other;

        // Non-channel messages keep their original bytes and are reported on
        // the track channel for bookkeeping only.
        if let Ok(LiveEvent::Midi { message, .. }) = LiveEvent::parse(raw) {
            // Rewrite the status nibble so the event lands on the track's
            // dedicated channel.
            data[0] = (data[0] & 0xF0) | (channel & 0x0F);
            kind = match message {
                MidiMessage::NoteOn { .. } => EventKind::NoteOn,
                MidiMessage::NoteOff { .. } => EventKind::NoteOff,
                MidiMessage::Controller { .. } => EventKind::ControlChange,
                MidiMessage::ProgramChange { .. } => EventKind::ProgramChange,
                _ => EventKind::Other,
            };
        }

        MidiEvent {
            offset,
            kind,
            channel,
            data,
        }
    }
}

/// An ordered, append-only sequence of timestamped MIDI messages. The atomic
/// unit of recorded data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventStream {
    events: Vec<MidiEvent>,
}

impl EventStream {
    /// Creates an empty stream.
    pub fn new() -> EventStream {
        EventStream::default()
    }

    /// Creates a stream from already-ordered events.
    pub fn from_events(events: Vec<MidiEvent>) -> EventStream {
        EventStream { events }
    }

    /// Appends an event. The caller is responsible for monotonic timestamps;
    /// the scheduler guarantees this by timestamping against a single
    /// recording clock. A regressive offset is clamped rather than reordered.
    pub fn append(&mut self, mut event: MidiEvent) {
        if let Some(last) = self.events.last() {
            if event.offset < last.offset {
                event.offset = last.offset;
            }
        }
        self.events.push(event);
    }

    /// The offset of the final event, or zero for an empty stream.
    pub fn duration(&self) -> Duration {
        self.events.last().map(|e| e.offset).unwrap_or(Duration::ZERO)
    }

    /// A lazy, restartable iteration over the stored events in order. Used
    /// identically by the scheduler and the SMF codec.
    pub fn iter(&self) -> impl Iterator<Item = &MidiEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One of the ten track slots. Holds an event stream and a dedicated MIDI
/// channel; the channel is fixed at session initialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// The fixed MIDI channel for this track (track index - 1).
    channel: u8,
    /// The last seen program change value, if any.
    program: Option<u8>,
    /// The recorded events.
    events: EventStream,
}

impl Track {
    fn new(channel: u8) -> Track {
        Track {
            channel,
            program: None,
            events: EventStream::new(),
        }
    }

    /// Gets the track's fixed MIDI channel.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Gets the last seen program change value.
    pub fn program(&self) -> Option<u8> {
        self.program
    }

    /// Gets the recorded events.
    pub fn events(&self) -> &EventStream {
        &self.events
    }

    /// The offset of the final recorded event, or zero when empty.
    pub fn recorded_duration(&self) -> Duration {
        self.events.duration()
    }

    /// A track is empty iff its event stream is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Replaces the entire event stream and recomputes the derived program.
    /// Recording never appends to existing data; re-recording a track always
    /// discards its previous content.
    pub fn record_overwrite(&mut self, events: EventStream) {
        self.program = events
            .iter()
            .filter(|event| event.kind == EventKind::ProgramChange)
            .filter_map(|event| event.data.get(1).copied())
            .last();
        self.events = events;
    }

    /// Resets the track to the empty state. Idempotent.
    pub fn clear(&mut self) {
        self.events = EventStream::new();
        self.program = None;
    }
}

/// The session mode. Normal and Super Looper sessions are persisted
/// independently and never merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Normal,
    SuperLooper,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Normal => write!(f, "normal"),
            Mode::SuperLooper => write!(f, "super looper"),
        }
    }
}

/// Whether start begins a recording or full playback. The REC/PLAY toggle on
/// the looper's mode button.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    Rec,
    Play,
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SystemMode::Rec => write!(f, "REC"),
            SystemMode::Play => write!(f, "PLAY"),
        }
    }
}

/// The transport state machine. Runtime-only; every process start begins
/// Stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransportState {
    #[default]
    Stopped,
    /// Recording the given track (1-based) with backing playback of the
    /// other non-empty tracks.
    Recording(usize),
    Playing,
    Paused,
}

/// A per-track summary for status reporting.
#[derive(Clone, Debug, PartialEq)]
pub struct TrackSummary {
    pub index: usize,
    pub channel: u8,
    pub event_count: usize,
    pub duration: Duration,
    pub program: Option<u8>,
}

/// The full state of one mode: all tracks, transport selection and mode
/// parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    mode: Mode,
    system_mode: SystemMode,
    /// The shared loop duration in Super Looper mode.
    fixed_duration: Option<Duration>,
    /// The selected track, 1-based. Wraps circularly on navigation.
    selected_track: usize,
    tracks: Vec<Track>,
    #[serde(skip)]
    transport: TransportState,
}

impl Session {
    /// Creates a fresh empty session for the given mode: ten empty tracks,
    /// track 1 selected, stopped.
    pub fn new(mode: Mode) -> Session {
        Session {
            mode,
            system_mode: SystemMode::Rec,
            fixed_duration: None,
            selected_track: 1,
            tracks: (0..NUM_TRACKS).map(|i| Track::new(i as u8)).collect(),
            transport: TransportState::Stopped,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn system_mode(&self) -> SystemMode {
        self.system_mode
    }

    /// Flips between REC and PLAY.
    pub fn toggle_system_mode(&mut self) -> SystemMode {
        self.system_mode = match self.system_mode {
            SystemMode::Rec => SystemMode::Play,
            SystemMode::Play => SystemMode::Rec,
        };
        self.system_mode
    }

    pub fn fixed_duration(&self) -> Option<Duration> {
        self.fixed_duration
    }

    pub fn set_fixed_duration(&mut self, duration: Option<Duration>) {
        self.fixed_duration = duration;
    }

    /// The currently selected track index, 1-based.
    pub fn selected(&self) -> usize {
        self.selected_track
    }

    /// Moves the selection forward, wrapping 10 -> 1.
    pub fn select_next(&mut self) -> usize {
        self.selected_track = self.selected_track % NUM_TRACKS + 1;
        self.selected_track
    }

    /// Moves the selection backward, wrapping 1 -> 10.
    pub fn select_prev(&mut self) -> usize {
        self.selected_track = (self.selected_track + NUM_TRACKS - 2) % NUM_TRACKS + 1;
        self.selected_track
    }

    /// Gets a track by its 1-based index.
    pub fn track(&self, index: usize) -> &Track {
        &self.tracks[index - 1]
    }

    /// Gets a mutable track by its 1-based index.
    pub fn track_mut(&mut self, index: usize) -> &mut Track {
        &mut self.tracks[index - 1]
    }

    /// Iterates tracks with their 1-based indices.
    pub fn tracks(&self) -> impl Iterator<Item = (usize, &Track)> {
        self.tracks.iter().enumerate().map(|(i, t)| (i + 1, t))
    }

    /// The loop length used at playback time for a track: its own recorded
    /// length in Normal mode, or the session's fixed duration in Super Looper
    /// mode. Tracks are stretched or looped to this length at playback time,
    /// never physically resampled.
    pub fn effective_duration(&self, index: usize) -> Duration {
        match (self.mode, self.fixed_duration) {
            (Mode::SuperLooper, Some(fixed)) => fixed,
            _ => self.track(index).recorded_duration(),
        }
    }

    /// Clears all ten tracks.
    pub fn clear_all(&mut self) {
        for track in self.tracks.iter_mut() {
            track.clear();
        }
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    pub fn set_transport(&mut self, transport: TransportState) {
        self.transport = transport;
    }

    /// Per-track summaries for status reporting.
    pub fn summaries(&self) -> Vec<TrackSummary> {
        self.tracks()
            .map(|(index, track)| TrackSummary {
                index,
                channel: track.channel(),
                event_count: track.events().len(),
                duration: track.recorded_duration(),
                program: track.program(),
            })
            .collect()
    }

    /// Validates invariants on a session loaded from disk.
    pub fn validate(&self) -> Result<(), String> {
        if self.tracks.len() != NUM_TRACKS {
            return Err(format!(
                "expected {} tracks, found {}",
                NUM_TRACKS,
                self.tracks.len()
            ));
        }
        if self.selected_track < 1 || self.selected_track > NUM_TRACKS {
            return Err(format!("selected track {} out of range", self.selected_track));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn note_on(offset_ms: u64, key: u8) -> MidiEvent {
        MidiEvent::from_raw(Duration::from_millis(offset_ms), &[0x90, key, 100], 2)
    }

    #[test]
    fn test_event_stream_duration() {
        let mut stream = EventStream::new();
        assert_eq!(stream.duration(), Duration::ZERO);

        stream.append(note_on(0, 60));
        stream.append(note_on(1500, 64));
        assert_eq!(stream.duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_event_stream_clamps_regressive_offsets() {
        let mut stream = EventStream::new();
        stream.append(note_on(1000, 60));
        stream.append(note_on(500, 64));
        assert_eq!(stream.duration(), Duration::from_millis(1000));
    }

    #[test]
    fn test_channel_remap_and_kind() {
        let event = MidiEvent::from_raw(Duration::ZERO, &[0x93, 60, 100], 7);
        assert_eq!(event.kind, EventKind::NoteOn);
        assert_eq!(event.channel, 7);
        assert_eq!(event.data, vec![0x97, 60, 100]);

        let event = MidiEvent::from_raw(Duration::ZERO, &[0xB0, 64, 127], 0);
        assert_eq!(event.kind, EventKind::ControlChange);

        let event = MidiEvent::from_raw(Duration::ZERO, &[0xC0, 12], 4);
        assert_eq!(event.kind, EventKind::ProgramChange);
        assert_eq!(event.data, vec![0xC4, 12]);
    }

    #[test]
    fn test_record_overwrite_derives_duration_and_program() {
        let mut session = Session::new(Mode::Normal);
        let mut stream = EventStream::new();
        stream.append(note_on(0, 60));
        stream.append(MidiEvent::from_raw(
            Duration::from_millis(200),
            &[0xC0, 42],
            0,
        ));
        stream.append(note_on(900, 62));

        let track = session.track_mut(1);
        track.record_overwrite(stream);
        assert_eq!(track.recorded_duration(), Duration::from_millis(900));
        assert_eq!(track.program(), Some(42));
        assert_eq!(track.events().len(), 3);

        // Overwriting discards previous content entirely.
        let mut replacement = EventStream::new();
        replacement.append(note_on(100, 70));
        track.record_overwrite(replacement);
        assert_eq!(track.events().len(), 1);
        assert_eq!(track.program(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let mut session = Session::new(Mode::Normal);
        let mut stream = EventStream::new();
        stream.append(note_on(0, 60));
        session.track_mut(3).record_overwrite(stream);

        session.track_mut(3).clear();
        let once = session.track(3).clone();
        session.track_mut(3).clear();
        assert_eq!(&once, session.track(3));
        assert!(session.track(3).is_empty());
        assert_eq!(session.track(3).recorded_duration(), Duration::ZERO);
    }

    #[test]
    fn test_navigation_wraps() {
        let mut session = Session::new(Mode::Normal);
        assert_eq!(session.selected(), 1);
        assert_eq!(session.select_prev(), 10);
        assert_eq!(session.select_next(), 1);

        for _ in 0..9 {
            session.select_next();
        }
        assert_eq!(session.selected(), 10);
        assert_eq!(session.select_next(), 1);
    }

    #[test]
    fn test_effective_duration() {
        let mut session = Session::new(Mode::SuperLooper);
        session.set_fixed_duration(Some(Duration::from_secs(8)));

        let mut stream = EventStream::new();
        stream.append(note_on(5500, 60));
        session.track_mut(2).record_overwrite(stream);

        // A short take still reports the shared loop length.
        assert_eq!(session.effective_duration(2), Duration::from_secs(8));
        assert_eq!(
            session.track(2).recorded_duration(),
            Duration::from_millis(5500)
        );

        let mut normal = Session::new(Mode::Normal);
        let mut stream = EventStream::new();
        stream.append(note_on(4000, 60));
        normal.track_mut(2).record_overwrite(stream);
        assert_eq!(normal.effective_duration(2), Duration::from_secs(4));
    }

    #[test]
    fn test_track_channels_are_fixed() {
        let session = Session::new(Mode::Normal);
        for (index, track) in session.tracks() {
            assert_eq!(usize::from(track.channel()) + 1, index);
        }
    }
}

// MIDI controller: Standard MIDI File <-> note table.
//
// `extract` flattens an SMF into a list of timed notes (seconds, not ticks),
// which is the representation the feature engineering in roll.rs works from.
// `save` goes the other way for composed output: one track per program, SMF
// Format 1, fixed tempo.
//
// Uses the `midly` crate for parsing and writing.

use crate::error::{ComposerError, Result};
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use tracing::{debug, warn};

/// Ticks per quarter note in MIDI output.
const TICKS_PER_QUARTER: u16 = 480;

/// Tempo used for output and assumed for input until the first tempo event.
const DEFAULT_TEMPO_US: u32 = 500_000;

/// MIDI channel reserved for percussion (channel 10, zero-based 9).
const DRUM_CHANNEL: u8 = 9;

/// One sounding note.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    /// General MIDI program (0-127).
    pub program: u8,
    /// Onset in seconds.
    pub start: f64,
    /// Release in seconds.
    pub end: f64,
    pub pitch: u8,
    pub velocity: u8,
    /// True for notes on the percussion channel.
    pub is_drum: bool,
}

/// All notes of one MIDI file (or of one composition).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteTable {
    pub notes: Vec<NoteEvent>,
}

impl NoteTable {
    pub fn new(notes: Vec<NoteEvent>) -> Self {
        NoteTable { notes }
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Distinct non-drum programs, ascending.
    pub fn programs(&self) -> BTreeSet<u8> {
        self.notes
            .iter()
            .filter(|n| !n.is_drum)
            .map(|n| n.program)
            .collect()
    }

    /// End time of the last note, in seconds.
    pub fn duration(&self) -> f64 {
        self.notes.iter().map(|n| n.end).fold(0.0, f64::max)
    }

    /// Mean velocity, or `None` for an empty table.
    pub fn velocity_mean(&self) -> Option<f64> {
        if self.notes.is_empty() {
            return None;
        }
        let sum: f64 = self.notes.iter().map(|n| n.velocity as f64).sum();
        Some(sum / self.notes.len() as f64)
    }

    /// Sample standard deviation of velocity (n - 1 denominator).
    /// Zero when there are fewer than two notes.
    pub fn velocity_std(&self) -> f64 {
        let Some(mean) = self.velocity_mean() else {
            return 0.0;
        };
        if self.notes.len() < 2 {
            return 0.0;
        }
        let ss: f64 = self
            .notes
            .iter()
            .map(|n| (n.velocity as f64 - mean).powi(2))
            .sum();
        (ss / (self.notes.len() - 1) as f64).sqrt()
    }

    /// Sort notes by (start, end, pitch).
    pub fn sort(&mut self) {
        self.notes.sort_by(|a, b| {
            a.start
                .total_cmp(&b.start)
                .then(a.end.total_cmp(&b.end))
                .then(a.pitch.cmp(&b.pitch))
        });
    }
}

/// Read a MIDI file into a note table.
pub fn extract(path: &Path) -> Result<NoteTable> {
    let bytes = std::fs::read(path).map_err(|e| ComposerError::io(path, e))?;
    let smf = Smf::parse(&bytes).map_err(|source| ComposerError::Midi {
        path: path.to_path_buf(),
        source,
    })?;
    let table = smf_to_notes(&smf);
    if table.is_empty() {
        warn!(path = %path.display(), "MIDI file contains no notes");
    } else {
        debug!(
            path = %path.display(),
            notes = table.len(),
            duration = table.duration(),
            "extracted MIDI file"
        );
    }
    Ok(table)
}

/// Write a note table to a MIDI file.
pub fn save(path: &Path, table: &NoteTable) -> Result<()> {
    let smf = notes_to_smf(table);
    let mut buf = Vec::new();
    smf.write_std(&mut buf).map_err(|e| ComposerError::io(path, e))?;
    std::fs::write(path, &buf).map_err(|e| ComposerError::io(path, e))?;
    Ok(())
}

/// Tick-to-seconds conversion for one file.
enum Clock {
    /// Sorted tempo segments: (start tick, seconds at that tick, µs per quarter).
    Metrical {
        ticks_per_quarter: f64,
        segments: Vec<(u64, f64, u32)>,
    },
    Timecode {
        ticks_per_second: f64,
    },
}

impl Clock {
    fn new(smf: &Smf) -> Self {
        match smf.header.timing {
            Timing::Metrical(tpq) => {
                let ticks_per_quarter = tpq.as_int().max(1) as f64;
                let mut changes: Vec<(u64, u32)> = Vec::new();
                for track in &smf.tracks {
                    let mut tick = 0u64;
                    for event in track {
                        tick += event.delta.as_int() as u64;
                        if let TrackEventKind::Meta(MetaMessage::Tempo(t)) = event.kind {
                            changes.push((tick, t.as_int()));
                        }
                    }
                }
                changes.sort_by_key(|&(tick, _)| tick);

                let mut segments = vec![(0u64, 0.0f64, DEFAULT_TEMPO_US)];
                for (tick, tempo) in changes {
                    let &(last_tick, last_secs, last_tempo) =
                        segments.last().unwrap_or(&(0, 0.0, DEFAULT_TEMPO_US));
                    let secs = last_secs
                        + (tick - last_tick) as f64 * last_tempo as f64
                            / 1_000_000.0
                            / ticks_per_quarter;
                    if tick == last_tick {
                        segments.pop();
                    }
                    segments.push((tick, secs, tempo));
                }
                Clock::Metrical {
                    ticks_per_quarter,
                    segments,
                }
            }
            Timing::Timecode(fps, subframes) => Clock::Timecode {
                ticks_per_second: (fps.as_f32() as f64 * subframes.max(1) as f64).max(1.0),
            },
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        match self {
            Clock::Metrical {
                ticks_per_quarter,
                segments,
            } => {
                let idx = segments.partition_point(|&(t, _, _)| t <= tick);
                let (seg_tick, seg_secs, tempo) = segments[idx.saturating_sub(1)];
                seg_secs
                    + (tick - seg_tick) as f64 * tempo as f64 / 1_000_000.0 / ticks_per_quarter
            }
            Clock::Timecode { ticks_per_second } => tick as f64 / ticks_per_second,
        }
    }
}

fn smf_to_notes(smf: &Smf) -> NoteTable {
    let clock = Clock::new(smf);
    let mut notes = Vec::new();

    for track in &smf.tracks {
        let mut tick = 0u64;
        let mut programs = [0u8; 16];
        // (channel, key) -> queue of (onset tick, velocity, program); FIFO so
        // overlapping re-strikes release in onset order.
        let mut open: HashMap<(u8, u8), VecDeque<(u64, u8, u8)>> = HashMap::new();

        for event in track {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = event.kind else {
                continue;
            };
            let channel = channel.as_int();
            match message {
                MidiMessage::ProgramChange { program } => {
                    programs[channel as usize] = program.as_int();
                }
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    open.entry((channel, key.as_int()))
                        .or_default()
                        .push_back((tick, vel.as_int(), programs[channel as usize]));
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    let key = key.as_int();
                    if let Some((onset, velocity, program)) =
                        open.get_mut(&(channel, key)).and_then(|q| q.pop_front())
                    {
                        notes.push(NoteEvent {
                            program,
                            start: clock.seconds(onset),
                            end: clock.seconds(tick),
                            pitch: key,
                            velocity,
                            is_drum: channel == DRUM_CHANNEL,
                        });
                    }
                }
                _ => {}
            }
        }

        // Close anything still sounding at the end of the track.
        for ((channel, key), queue) in open {
            for (onset, velocity, program) in queue {
                if tick > onset {
                    notes.push(NoteEvent {
                        program,
                        start: clock.seconds(onset),
                        end: clock.seconds(tick),
                        pitch: key,
                        velocity,
                        is_drum: channel == DRUM_CHANNEL,
                    });
                }
            }
        }
    }

    let mut table = NoteTable::new(notes);
    table.sort();
    table
}

fn seconds_to_ticks(seconds: f64) -> u64 {
    let ticks_per_second = TICKS_PER_QUARTER as f64 * 1_000_000.0 / DEFAULT_TEMPO_US as f64;
    (seconds.max(0.0) * ticks_per_second).round() as u64
}

/// Melodic channels in allocation order, skipping percussion.
fn melodic_channel(index: usize) -> u8 {
    const CHANNELS: [u8; 15] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13, 14, 15];
    CHANNELS[index % CHANNELS.len()]
}

fn notes_to_smf(table: &NoteTable) -> Smf<'static> {
    let mut smf = Smf::new(Header::new(
        Format::Parallel,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));

    let mut tempo_track: Track<'static> = Vec::new();
    tempo_track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(DEFAULT_TEMPO_US))),
    });
    tempo_track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(tempo_track);

    let drum_notes = table.notes.iter().any(|n| n.is_drum);
    let mut groups: Vec<(Option<u8>, u8)> = table
        .programs()
        .into_iter()
        .enumerate()
        .map(|(i, program)| (Some(program), melodic_channel(i)))
        .collect();
    if drum_notes {
        groups.push((None, DRUM_CHANNEL));
    }

    for (program, channel) in groups {
        let ch = u4::new(channel);
        // (absolute tick, is_note_on, key, velocity)
        let mut events: Vec<(u64, bool, u8, u8)> = Vec::new();
        for note in &table.notes {
            let matches = match program {
                Some(p) => !note.is_drum && note.program == p,
                None => note.is_drum,
            };
            if !matches {
                continue;
            }
            let key = note.pitch.min(127);
            let vel = note.velocity.clamp(1, 127);
            let on = seconds_to_ticks(note.start);
            let off = seconds_to_ticks(note.end).max(on + 1);
            events.push((on, true, key, vel));
            events.push((off, false, key, 0));
        }
        // Releases sort before onsets on the same tick so re-struck keys sound.
        events.sort_by_key(|&(tick, is_on, key, _)| (tick, is_on, key));

        let mut track: Track<'static> = Vec::new();
        if let Some(p) = program {
            track.push(TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: ch,
                    message: MidiMessage::ProgramChange {
                        program: u7::new(p.min(127)),
                    },
                },
            });
        }
        let mut last_tick = 0u64;
        for (tick, is_on, key, vel) in events {
            let delta = (tick - last_tick) as u32;
            let message = if is_on {
                MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(vel),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::new(key),
                    vel: u7::new(0),
                }
            };
            track.push(TrackEvent {
                delta: u28::new(delta),
                kind: TrackEventKind::Midi {
                    channel: ch,
                    message,
                },
            });
            last_tick = tick;
        }
        track.push(TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        smf.tracks.push(track);
    }

    smf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(program: u8, start: f64, end: f64, pitch: u8, velocity: u8) -> NoteEvent {
        NoteEvent {
            program,
            start,
            end,
            pitch,
            velocity,
            is_drum: false,
        }
    }

    #[test]
    fn test_notes_to_smf_track_layout() {
        let table = NoteTable::new(vec![
            note(0, 0.0, 1.0, 60, 80),
            note(40, 0.5, 1.5, 67, 90),
            note(0, 1.0, 2.0, 64, 70),
        ]);
        let smf = notes_to_smf(&table);
        // Tempo track + one track per program.
        assert_eq!(smf.tracks.len(), 3);
    }

    #[test]
    fn test_smf_round_trip_preserves_timing() {
        let table = NoteTable::new(vec![
            note(0, 0.0, 0.5, 60, 80),
            note(0, 0.5, 1.0, 62, 81),
            note(33, 1.0, 3.0, 40, 100),
        ]);
        let smf = notes_to_smf(&table);
        let back = smf_to_notes(&smf);
        assert_eq!(back.len(), 3);
        let bass = back.notes.iter().find(|n| n.program == 33).unwrap();
        assert_eq!(bass.pitch, 40);
        assert!((bass.start - 1.0).abs() < 1e-9);
        assert!((bass.end - 3.0).abs() < 1e-9);
        assert_eq!(bass.velocity, 100);
    }

    #[test]
    fn test_tempo_change_affects_seconds() {
        // 480 tpq; tempo doubles speed (250000 µs/q) at tick 960.
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
        ));
        let ch = u4::new(0);
        let on = |delta: u32, key: u8| TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: ch,
                message: MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(64),
                },
            },
        };
        let off = |delta: u32, key: u8| TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: ch,
                message: MidiMessage::NoteOn {
                    key: u7::new(key),
                    vel: u7::new(0),
                },
            },
        };
        smf.tracks.push(vec![
            on(0, 60),
            off(960, 60),
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(250_000))),
            },
            on(0, 62),
            off(960, 62),
        ]);
        let table = smf_to_notes(&smf);
        assert_eq!(table.len(), 2);
        // 960 ticks at 120 BPM = 1s; 960 ticks at 240 BPM = 0.5s.
        assert!((table.notes[0].end - 1.0).abs() < 1e-9);
        assert!((table.notes[1].start - 1.0).abs() < 1e-9);
        assert!((table.notes[1].end - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_program_change_and_drums() {
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
        ));
        let midi = |delta: u32, channel: u8, message: MidiMessage| TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(channel),
                message,
            },
        };
        smf.tracks.push(vec![
            midi(0, 2, MidiMessage::ProgramChange { program: u7::new(24) }),
            midi(0, 2, MidiMessage::NoteOn { key: u7::new(52), vel: u7::new(90) }),
            midi(0, 9, MidiMessage::NoteOn { key: u7::new(36), vel: u7::new(100) }),
            midi(480, 2, MidiMessage::NoteOff { key: u7::new(52), vel: u7::new(0) }),
            midi(0, 9, MidiMessage::NoteOff { key: u7::new(36), vel: u7::new(0) }),
        ]);
        let table = smf_to_notes(&smf);
        assert_eq!(table.len(), 2);
        let guitar = table.notes.iter().find(|n| n.pitch == 52).unwrap();
        assert_eq!(guitar.program, 24);
        assert!(!guitar.is_drum);
        assert!(table.notes.iter().any(|n| n.pitch == 36 && n.is_drum));
        assert_eq!(table.programs().into_iter().collect::<Vec<_>>(), vec![24]);
    }

    #[test]
    fn test_unterminated_note_closes_at_track_end() {
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Metrical(u15::new(480)),
        ));
        smf.tracks.push(vec![
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Midi {
                    channel: u4::new(0),
                    message: MidiMessage::NoteOn { key: u7::new(60), vel: u7::new(64) },
                },
            },
            TrackEvent {
                delta: u28::new(480),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ]);
        let table = smf_to_notes(&smf);
        assert_eq!(table.len(), 1);
        assert!((table.notes[0].end - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_velocity_statistics() {
        let table = NoteTable::new(vec![
            note(0, 0.0, 1.0, 60, 60),
            note(0, 1.0, 2.0, 62, 80),
            note(0, 2.0, 3.0, 64, 100),
        ]);
        assert_eq!(table.velocity_mean(), Some(80.0));
        assert!((table.velocity_std() - 20.0).abs() < 1e-9);
        assert_eq!(NoteTable::default().velocity_mean(), None);
        assert_eq!(NoteTable::default().velocity_std(), 0.0);
    }

    #[test]
    fn test_timecode_timing_counts_subframes() {
        // 25 fps * 40 subframes = 1000 ticks per second.
        let mut smf = Smf::new(Header::new(
            Format::SingleTrack,
            Timing::Timecode(midly::Fps::Fps25, 40),
        ));
        let midi = |delta: u32, message: MidiMessage| TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(0),
                message,
            },
        };
        smf.tracks.push(vec![
            midi(250, MidiMessage::NoteOn { key: u7::new(60), vel: u7::new(70) }),
            midi(1500, MidiMessage::NoteOff { key: u7::new(60), vel: u7::new(0) }),
        ]);
        let mut buf = Vec::new();
        smf.write_std(&mut buf).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timecode.mid");
        std::fs::write(&path, &buf).unwrap();

        let table = extract(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert!((table.notes[0].start - 0.25).abs() < 1e-9);
        assert!((table.notes[0].end - 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_save_clamps_velocity_into_midi_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clamped.mid");
        save(
            &path,
            &NoteTable::new(vec![
                note(0, 0.0, 0.5, 60, 0),
                note(0, 0.5, 1.0, 62, 200),
            ]),
        )
        .unwrap();

        let back = extract(&path).unwrap();
        let velocities: Vec<u8> = back.notes.iter().map(|n| n.velocity).collect();
        // A zero-velocity onset would read back as a release.
        assert_eq!(velocities, vec![1, 127]);
    }

    #[test]
    fn test_more_programs_than_channels_wrap() {
        let notes: Vec<NoteEvent> = (0..20).map(|p| note(p, 0.0, 1.0, 60, 80)).collect();
        let smf = notes_to_smf(&NoteTable::new(notes));
        assert_eq!(smf.tracks.len(), 21);
        assert_eq!(melodic_channel(9), 10);
        assert_eq!(melodic_channel(15), 0);
    }
}

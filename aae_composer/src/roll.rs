// Piano-roll feature engineering.
//
// Bars are the compositional unit: harmonic changes tend to fall on bar
// boundaries, so the samplers cut rolls into windows of `seq_len` steps and
// the generator learns whole bars at a time. The layout follows the
// multi-track piano-roll idea: one binary plane per instrument program, time
// steps down the rows, pitches across the columns.
//
// A roll is derived from a NoteTable once at sampler construction; composed
// output goes back to notes in composer.rs.

use crate::midi::NoteTable;

/// Quantisation of note tables into piano-roll steps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollLayout {
    pub time_fraction: f64,
    pub min_pitch: u8,
    pub max_pitch: u8,
    pub seq_len: usize,
}

impl RollLayout {
    pub fn dim(&self) -> usize {
        (self.max_pitch - self.min_pitch) as usize
    }

    /// Steps covered by a note: `first..=last`.
    pub fn step_span(&self, start: f64, end: f64) -> (usize, usize) {
        let first = (start / self.time_fraction).floor().max(0.0) as usize;
        let last_exclusive = (end / self.time_fraction).ceil().max(0.0) as usize;
        (first, last_exclusive.saturating_sub(1).max(first))
    }

    pub fn pitch_index(&self, pitch: u8) -> Option<usize> {
        (self.min_pitch..self.max_pitch)
            .contains(&pitch)
            .then(|| (pitch - self.min_pitch) as usize)
    }
}

/// Binary roll of one MIDI file, laid out as `[channel][step][pitch]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PianoRoll {
    channels: usize,
    steps: usize,
    dim: usize,
    data: Vec<f32>,
    /// Notes that landed inside the pitch range.
    note_count: usize,
}

impl PianoRoll {
    /// Build the roll of `table`. Channel `i` holds notes whose program is
    /// `program_list[i]`; drum notes and notes outside the pitch range are
    /// dropped.
    pub fn from_notes(table: &NoteTable, program_list: &[u8], layout: &RollLayout) -> Self {
        let dim = layout.dim();
        let channels = program_list.len();
        let mut spans = Vec::with_capacity(table.len());
        let mut steps = layout.seq_len;
        for note in &table.notes {
            if note.is_drum {
                continue;
            }
            let Some(channel) = program_list.iter().position(|&p| p == note.program) else {
                continue;
            };
            let Some(pitch) = layout.pitch_index(note.pitch) else {
                continue;
            };
            let (first, last) = layout.step_span(note.start, note.end);
            steps = steps.max(last + 1);
            spans.push((channel, first, last, pitch));
        }

        let mut roll = PianoRoll {
            channels,
            steps,
            dim,
            data: vec![0.0; channels * steps * dim],
            note_count: spans.len(),
        };
        for (channel, first, last, pitch) in spans {
            for step in first..=last {
                let i = roll.index(channel, step, pitch);
                roll.data[i] = 1.0;
            }
        }
        roll
    }

    #[inline]
    fn index(&self, channel: usize, step: usize, pitch: usize) -> usize {
        (channel * self.steps + step) * self.dim + pitch
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn note_count(&self) -> usize {
        self.note_count
    }

    pub fn get(&self, channel: usize, step: usize, pitch: usize) -> f32 {
        self.data[self.index(channel, step, pitch)]
    }

    /// Number of window offsets a bar of `seq_len` steps can start at.
    pub fn window_count(&self, seq_len: usize) -> usize {
        self.steps + 1 - seq_len.min(self.steps)
    }

    /// Copy the window `offset..offset + seq_len` into one sample buffer
    /// laid out as `[channel][seq_len][dim]`. Steps past the end of the roll
    /// stay silent.
    pub fn write_window(&self, offset: usize, seq_len: usize, out: &mut [f32]) {
        for (channel, plane) in out
            .chunks_exact_mut(seq_len * self.dim)
            .take(self.channels)
            .enumerate()
        {
            for (s, dst) in plane.chunks_exact_mut(self.dim).enumerate() {
                let step = offset + s;
                if step >= self.steps {
                    break;
                }
                let row = self.index(channel, step, 0);
                dst.copy_from_slice(&self.data[row..row + self.dim]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::NoteEvent;

    fn layout() -> RollLayout {
        RollLayout {
            time_fraction: 0.5,
            min_pitch: 60,
            max_pitch: 72,
            seq_len: 4,
        }
    }

    fn note(program: u8, start: f64, end: f64, pitch: u8) -> NoteEvent {
        NoteEvent {
            program,
            start,
            end,
            pitch,
            velocity: 64,
            is_drum: false,
        }
    }

    #[test]
    fn test_step_span_rounds_outward() {
        let s = layout();
        assert_eq!(s.step_span(0.0, 1.0), (0, 1));
        assert_eq!(s.step_span(0.25, 0.75), (0, 1));
        // Zero-length notes still occupy their onset step.
        assert_eq!(s.step_span(1.0, 1.0), (2, 2));
    }

    #[test]
    fn test_roll_channels_follow_program_list() {
        let table = NoteTable::new(vec![
            note(0, 0.0, 1.0, 60),
            note(40, 1.0, 1.5, 71),
            note(40, 0.0, 0.5, 72), // out of range
            note(99, 0.0, 0.5, 64), // program not listed
        ]);
        let roll = PianoRoll::from_notes(&table, &[0, 40], &layout());
        assert_eq!(roll.channels(), 2);
        assert_eq!(roll.note_count(), 2);
        assert_eq!(roll.get(0, 0, 0), 1.0);
        assert_eq!(roll.get(0, 1, 0), 1.0);
        assert_eq!(roll.get(0, 2, 0), 0.0);
        assert_eq!(roll.get(1, 2, 11), 1.0);
    }

    #[test]
    fn test_short_roll_is_padded_to_one_window() {
        let table = NoteTable::new(vec![note(0, 0.0, 0.5, 65)]);
        let roll = PianoRoll::from_notes(&table, &[0], &layout());
        assert_eq!(roll.steps(), 4);
        assert_eq!(roll.window_count(4), 1);
    }

    #[test]
    fn test_write_window() {
        let table = NoteTable::new(vec![note(0, 1.0, 1.5, 62), note(0, 3.0, 3.5, 63)]);
        let roll = PianoRoll::from_notes(&table, &[0], &layout());
        assert_eq!(roll.steps(), 7);
        assert_eq!(roll.window_count(4), 4);

        let mut out = vec![0.0f32; 4 * 12];
        roll.write_window(2, 4, &mut out);
        assert_eq!(out[2], 1.0);
        assert_eq!(out[3], 0.0);
        assert_eq!(out.iter().sum::<f32>(), 1.0);

        // The tail window runs past the roll's last step.
        out.fill(0.0);
        roll.write_window(5, 4, &mut out);
        assert_eq!(out[12 + 3], 1.0);
        assert_eq!(out.iter().sum::<f32>(), 1.0);
    }
}

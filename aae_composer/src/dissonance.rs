// Harmonic scoring of note tables.
//
// A composition is sliced at the midpoint of every time step; every pair of
// simultaneously sounding pitches is classified by interval class. The
// dissonance ratio is the share of pairs that are seconds, sevenths or
// tritones. Drums have no pitch in this sense and are ignored.

use crate::midi::NoteTable;

/// Pitch-class distances heard as consonant: unison, thirds, fourth, fifth,
/// sixths. The fourth counts because the pairs are not ranked by voice.
const CONSONANT_DISTANCES: [u8; 7] = [0, 3, 4, 5, 7, 8, 9];

/// Whether two pitches, in either order, form a second, a seventh or a tritone.
fn clashes(a: u8, b: u8) -> bool {
    let distance = a.abs_diff(b) % 12;
    !CONSONANT_DISTANCES.contains(&distance)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DissonanceReport {
    /// Steps with at least two sounding pitches.
    pub harmonic_steps: usize,
    pub pairs: usize,
    pub dissonant_pairs: usize,
}

impl DissonanceReport {
    /// Share of dissonant pairs; zero when nothing sounds together.
    pub fn ratio(&self) -> f64 {
        if self.pairs == 0 {
            0.0
        } else {
            self.dissonant_pairs as f64 / self.pairs as f64
        }
    }
}

/// Count simultaneous pitch pairs at the midpoint of each `time_fraction` step.
pub fn analyze(table: &NoteTable, time_fraction: f64) -> DissonanceReport {
    let mut report = DissonanceReport::default();
    if !(time_fraction > 0.0) {
        return report;
    }
    let steps = (table.duration() / time_fraction).ceil() as usize;
    let mut sounding = Vec::new();
    for step in 0..steps {
        let t = (step as f64 + 0.5) * time_fraction;
        sounding.clear();
        sounding.extend(
            table
                .notes
                .iter()
                .filter(|n| !n.is_drum && n.start <= t && t < n.end)
                .map(|n| n.pitch),
        );
        if sounding.len() < 2 {
            continue;
        }
        report.harmonic_steps += 1;
        for (i, &a) in sounding.iter().enumerate() {
            for &b in &sounding[i + 1..] {
                report.pairs += 1;
                if clashes(a, b) {
                    report.dissonant_pairs += 1;
                }
            }
        }
    }
    report
}

pub fn dissonance_ratio(table: &NoteTable, time_fraction: f64) -> f64 {
    analyze(table, time_fraction).ratio()
}

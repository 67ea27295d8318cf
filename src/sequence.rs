use crate::diagnostics::Diagnostics;
use crate::format::Format;
use crate::source::ByteSource;
use crate::track::{Track, TrackError, TrackOutcome};

/// Default resolution when a format does not state one.
pub const DEFAULT_PPQN: u16 = 48;

/// A playable sequence: PPQN plus the tracks its decoder walks.
#[derive(Debug, Clone)]
pub struct SequenceFile {
    pub ppqn:    u16,
    pub tracks:  Vec<Track>,
    interpreted: bool,
}

impl SequenceFile {
    pub fn new(ppqn: u16) -> Self {
        Self { ppqn, tracks: Vec::new(), interpreted: false }
    }

    pub fn with_track(mut self, track: Track) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn is_interpreted(&self) -> bool { self.interpreted }

    /// Discard every timeline so the next [`interpret`](Self::interpret) re-runs.
    pub fn invalidate(&mut self) {
        for track in &mut self.tracks {
            track.reset();
        }
        self.interpreted = false;
    }

    /// One past the furthest byte any track decoded.
    pub fn extent(&self) -> usize {
        self.tracks.iter().map(Track::furthest).max().unwrap_or(0)
    }

    /// Interpret every track with `format`'s decoder.
    ///
    /// A failing track is logged and left with whatever it produced before
    /// the failure; it never stops its siblings.  Safe to call again: each
    /// track resets before its pass.
    pub fn interpret(
        &mut self,
        format:    &dyn Format,
        source:    &ByteSource,
        max_steps: usize,
        log:       &mut Diagnostics,
    ) {
        #[cfg(feature = "parallel")]
        let outcomes: Vec<TrackOutcome> = {
            use rayon::prelude::*;
            self.tracks
                .par_iter_mut()
                .map(|t| t.interpret(max_steps, |t| format.read_event(source, t)))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<TrackOutcome> = self
            .tracks
            .iter_mut()
            .map(|t| t.interpret(max_steps, |t| format.read_event(source, t)))
            .collect();

        let component = format!("format/{}", format.name());
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                TrackOutcome::Completed | TrackOutcome::LoopedForever { .. } => {}
                TrackOutcome::Exhausted { steps } => log.error(&component, format!(
                    "{}: track {i} cut off after {steps} steps", source.name(),
                )),
                TrackOutcome::Failed(e @ TrackError::UnknownOpcode { .. }) => log.warn(&component, format!(
                    "{}: track {i} stopped: {e}", source.name(),
                )),
                TrackOutcome::Failed(e) => log.error(&component, format!(
                    "{}: track {i} aborted: {e}", source.name(),
                )),
            }
        }
        self.interpreted = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Severity;
    use crate::format::ScanContext;
    use crate::track::Step;

    /// `00` ends a track, `FF` is no opcode, any other byte is a note.
    struct Notes;

    impl Format for Notes {
        fn name(&self) -> &'static str { "notes" }

        fn scan(&self, _: &mut ScanContext<'_>) {}

        fn read_event(&self, source: &ByteSource, track: &mut Track) -> Result<Step, TrackError> {
            match track.read_u8(source)? {
                0x00 => Ok(Step::End),
                0xFF => Err(track.unknown_opcode(0xFF)),
                key => {
                    track.emit_note_with_duration(0, key, 100, 6);
                    track.advance_time(6);
                    Ok(Step::Continue)
                }
            }
        }
    }

    fn three_tracks() -> (ByteSource, SequenceFile) {
        let src = ByteSource::from_bytes("three", vec![0x3C, 0x00, 0x40, 0xFF, 0x41, 0x43, 0x45, 0x00]);
        let seq = SequenceFile::new(DEFAULT_PPQN)
            .with_track(Track::new(0))
            .with_track(Track::new(2))
            .with_track(Track::new(5));
        (src, seq)
    }

    #[test]
    fn failing_track_leaves_siblings_running() {
        let (src, mut seq) = three_tracks();
        let mut log = Diagnostics::new();
        seq.interpret(&Notes, &src, 100, &mut log);

        assert!(seq.is_interpreted());
        assert_eq!(seq.tracks[0].outcome(), Some(&TrackOutcome::Completed));
        assert_eq!(
            seq.tracks[1].outcome(),
            Some(&TrackOutcome::Failed(TrackError::UnknownOpcode { offset: 3, opcode: 0xFF })),
        );
        assert_eq!(seq.tracks[2].outcome(), Some(&TrackOutcome::Completed));

        // The failed track keeps what it decoded before the bad byte.
        assert_eq!(seq.tracks[1].timeline().len(), 2);
        assert_eq!(seq.tracks[2].timeline().len(), 4);
        assert_eq!(seq.extent(), 8);

        let problems: Vec<_> = log.at_least(Severity::Warning).collect();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].component, "format/notes");
        assert!(problems[0].message.starts_with("three: track 1 stopped"));
    }

    #[test]
    fn invalidate_discards_timelines() {
        let (src, mut seq) = three_tracks();
        let mut log = Diagnostics::new();
        seq.interpret(&Notes, &src, 100, &mut log);
        seq.invalidate();
        assert!(!seq.is_interpreted());
        assert!(seq.tracks.iter().all(|t| t.timeline().is_empty()));

        seq.interpret(&Notes, &src, 100, &mut log);
        assert_eq!(seq.tracks[2].timeline().len(), 4);
    }
}

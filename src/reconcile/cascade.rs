use serde::Serialize;

use crate::audio::{frames_to_ms, ms_to_frames};
use crate::snapshot::Stage;
use crate::utterance::{FlagEntry, UtteranceFlag, UtteranceId};

/// A reconciled clip waiting for placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CascadeInput {
    pub utterance_id: UtteranceId,
    pub start_ms: u64,
    pub frames: u64,
}

/// Final placement of one clip on the master track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub utterance_id: UtteranceId,
    pub offset_ms: u64,
    pub offset_frames: u64,
    pub frames: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<UtteranceFlag>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    pub entries: Vec<TimelineEntry>,
    /// Clips that would start at or beyond the end of the media
    pub dropped: Vec<FlagEntry>,
}

impl Timeline {
    /// All timeline flags keyed by utterance id
    pub fn flags(&self) -> impl Iterator<Item = (UtteranceId, &UtteranceFlag)> {
        self.entries
            .iter()
            .flat_map(|e| e.flags.iter().map(move |f| (e.utterance_id, f)))
            .chain(
                self.dropped
                    .iter()
                    .flat_map(|d| d.flags.iter().map(move |f| (d.utterance_id, f))),
            )
    }
}

/// Place clips in start order in a single pass.
///
/// A clip is placed at its source start unless that overlaps the previous
/// placed clip, in which case it is shifted to the previous clip's end and
/// both clips are flagged. Shifts carry forward through the rest of the
/// timeline. Clips running past `media_frames` are truncated; clips that
/// would start at or after it are dropped.
pub fn cascade(inputs: &[CascadeInput], sample_rate: u32, media_frames: u64) -> Timeline {
    let mut ordered = inputs.to_vec();
    ordered.sort_by_key(|c| (c.start_ms, c.utterance_id));

    let mut timeline = Timeline::default();
    let mut previous_end = 0u64;

    for clip in ordered {
        let start = ms_to_frames(clip.start_ms, sample_rate);
        let offset = start.max(previous_end);

        // dropped clips are never placed and raise no collision
        if offset >= media_frames {
            timeline.dropped.push(FlagEntry {
                utterance_id: clip.utterance_id,
                stage: Stage::Timeline,
                flags: vec![UtteranceFlag::Truncated {
                    ms: frames_to_ms(clip.frames, sample_rate),
                }],
            });
            continue;
        }

        let mut flags = Vec::new();
        if offset > start {
            if let Some(previous) = timeline.entries.last_mut() {
                previous.flags.push(UtteranceFlag::Collision {
                    with: clip.utterance_id,
                });
                flags.push(UtteranceFlag::Collision {
                    with: previous.utterance_id,
                });
            }
            flags.push(UtteranceFlag::Shifted {
                ms: frames_to_ms(offset - start, sample_rate),
            });
        }

        let mut frames = clip.frames;
        if offset + frames > media_frames {
            let cut = offset + frames - media_frames;
            frames -= cut;
            flags.push(UtteranceFlag::Truncated {
                ms: frames_to_ms(cut, sample_rate),
            });
        }

        previous_end = offset + frames;
        timeline.entries.push(TimelineEntry {
            utterance_id: clip.utterance_id,
            offset_ms: frames_to_ms(offset, sample_rate),
            offset_frames: offset,
            frames,
            duration_ms: frames_to_ms(frames, sample_rate),
            flags,
        });
    }

    timeline
}

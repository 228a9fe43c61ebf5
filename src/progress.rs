//! Decoder for the progress stream git emits on stderr
//!
//! Git reports transfer progress as single lines terminated by `\r` (in-place
//! updates) or `\n`, e.g. `Compressing objects:  50% (1/2)`. Lines relayed
//! from the server side carry a `remote: ` prefix. The decoder buffers raw
//! bytes, splits complete lines, classifies them by phase and stage, and
//! forwards decoded updates to a caller-supplied [`Progress`] implementation.
//! Everything that is not a progress line is kept for the caller: error lines
//! for diagnostics, all other lines for the per-ref summary parsers.

use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;
use regex::Regex;

bitflags! {
    /// Operation code passed to progress callbacks.
    ///
    /// The two low bits are stage markers, the remaining bits identify the
    /// phase. A callback receives `phase | stage` per line; stages of one
    /// phase accumulate via bitwise OR in the decoder so callers can check
    /// that a phase ran to completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ProgressOp: u32 {
        const BEGIN = 1 << 0;
        const END = 1 << 1;

        const COUNTING = 1 << 2;
        const COMPRESSING = 1 << 3;
        const WRITING = 1 << 4;
        const RECEIVING = 1 << 5;
        const RESOLVING = 1 << 6;
        const FINDING_SOURCES = 1 << 7;
        const CHECKING_OUT = 1 << 8;
        /// Catch-all for phases outside the known vocabulary. Still delivered
        /// to the callback, but never validated for stage completeness.
        const UNKNOWN = 1 << 9;

        const STAGE_MASK = Self::BEGIN.bits() | Self::END.bits();
        const OP_MASK = Self::COUNTING.bits()
            | Self::COMPRESSING.bits()
            | Self::WRITING.bits()
            | Self::RECEIVING.bits()
            | Self::RESOLVING.bits()
            | Self::FINDING_SOURCES.bits()
            | Self::CHECKING_OUT.bits()
            | Self::UNKNOWN.bits();
    }
}

impl ProgressOp {
    /// The phase bits of this op code.
    pub fn phase(self) -> ProgressOp {
        self & ProgressOp::OP_MASK
    }

    /// The stage bits of this op code.
    pub fn stage(self) -> ProgressOp {
        self & ProgressOp::STAGE_MASK
    }
}

/// Callback interface for decoded progress updates.
///
/// Callbacks are invoked synchronously from the stream-draining task and
/// must not block for long, or the subprocess stalls on a full pipe.
pub trait Progress {
    /// One decoded progress line. `max` is absent on absolute-count lines.
    fn update(&mut self, op: ProgressOp, cur: Option<u64>, max: Option<u64>, message: &str) {
        let _ = (op, cur, max, message);
    }

    /// A line that did not match the progress grammar. Not an error.
    fn line_dropped(&mut self, line: &str) {
        let _ = line;
    }
}

/// No-op progress sink.
pub struct NoProgress;

impl Progress for NoProgress {}

static RE_RELATIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(remote: )?([\w ]+):\s+(\d+)% \((\d+)/(\d+)\)(.*)$").unwrap());
static RE_ABSOLUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(remote: )?([\w ]+):\s+(\d+)(.*)$").unwrap());

const DONE_TOKEN: &str = "done.";

fn phase_for(name: &str) -> ProgressOp {
    match name {
        "Counting objects" => ProgressOp::COUNTING,
        "Compressing objects" => ProgressOp::COMPRESSING,
        "Writing objects" => ProgressOp::WRITING,
        "Receiving objects" => ProgressOp::RECEIVING,
        "Resolving deltas" => ProgressOp::RESOLVING,
        "Finding sources" => ProgressOp::FINDING_SOURCES,
        "Checking out files" => ProgressOp::CHECKING_OUT,
        _ => ProgressOp::UNKNOWN,
    }
}

/// Stateful line decoder for one fetch/push/pull call.
///
/// Owns the partial-line byte buffer and the per-phase stage bookkeeping.
/// Discarded when the call completes.
pub struct ProgressDecoder<'a> {
    progress: Option<&'a mut dyn Progress>,
    pending: Vec<u8>,
    seen_phases: ProgressOp,
    stages_seen: HashMap<u32, ProgressOp>,
    error_lines: Vec<String>,
    other_lines: Vec<String>,
}

impl<'a> ProgressDecoder<'a> {
    pub fn new(progress: Option<&'a mut dyn Progress>) -> Self {
        Self {
            progress,
            pending: Vec::new(),
            seen_phases: ProgressOp::empty(),
            stages_seen: HashMap::new(),
            error_lines: Vec::new(),
            other_lines: Vec::new(),
        }
    }

    /// Feed a chunk of raw bytes. Lines may be split or merged across
    /// chunks; only complete `\r`/`\n`-terminated lines are decoded.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\r' || b == b'\n') {
            let rest = self.pending.split_off(pos + 1);
            let raw = std::mem::replace(&mut self.pending, rest);
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            self.handle_line(&line);
        }
    }

    /// Flush a trailing unterminated line, if any.
    pub fn finish(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).into_owned();
        self.handle_line(&line);
    }

    /// Stage bits observed so far for the given phase.
    pub fn stages_seen(&self, phase: ProgressOp) -> ProgressOp {
        self.stages_seen
            .get(&phase.phase().bits())
            .copied()
            .map(ProgressOp::stage)
            .unwrap_or_else(ProgressOp::empty)
    }

    /// Phases that produced at least one update.
    pub fn seen_phases(&self) -> ProgressOp {
        self.seen_phases
    }

    /// Lines starting with `error:` or `fatal:`.
    pub fn error_lines(&self) -> &[String] {
        &self.error_lines
    }

    /// Non-progress, non-error lines, in arrival order. The fetch summary
    /// lines end up here.
    pub fn other_lines(&self) -> &[String] {
        &self.other_lines
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return;
        }
        if line.starts_with("error:") || line.starts_with("fatal:") {
            self.error_lines.push(line.to_string());
            return;
        }

        let (name, percent, cur, max, rest) = if let Some(c) = RE_RELATIVE.captures(line) {
            let percent: u64 = c[3].parse().unwrap_or(0);
            let cur: u64 = c[4].parse().unwrap_or(0);
            let max: u64 = c[5].parse().unwrap_or(0);
            (
                c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                Some(percent),
                Some(cur),
                Some(max),
                c.get(6).map(|m| m.as_str().to_string()).unwrap_or_default(),
            )
        } else if let Some(c) = RE_ABSOLUTE.captures(line) {
            let cur: u64 = c[3].parse().unwrap_or(0);
            (
                c.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
                None,
                Some(cur),
                None,
                c.get(4).map(|m| m.as_str().to_string()).unwrap_or_default(),
            )
        } else {
            self.other_lines.push(line.to_string());
            if let Some(progress) = self.progress.as_deref_mut() {
                progress.line_dropped(line);
            }
            return;
        };

        let phase = phase_for(&name);
        let mut op = phase;
        if !self.seen_phases.contains(phase) {
            self.seen_phases |= phase;
            op |= ProgressOp::BEGIN;
        }

        let mut message = rest.trim();
        if let Some(stripped) = message.strip_suffix(DONE_TOKEN) {
            op |= ProgressOp::END;
            message = stripped;
        }
        if percent == Some(100) {
            op |= ProgressOp::END;
        }
        let message = message
            .trim()
            .trim_matches(|c| c == ',' || c == ' ')
            .to_string();

        *self
            .stages_seen
            .entry(phase.bits())
            .or_insert_with(ProgressOp::empty) |= op;

        if let Some(progress) = self.progress.as_deref_mut() {
            progress.update(op, cur, max, &message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        updates: Vec<(ProgressOp, Option<u64>, Option<u64>, String)>,
        dropped: Vec<String>,
    }

    impl Progress for Recorder {
        fn update(&mut self, op: ProgressOp, cur: Option<u64>, max: Option<u64>, message: &str) {
            self.updates.push((op, cur, max, message.to_string()));
        }

        fn line_dropped(&mut self, line: &str) {
            self.dropped.push(line.to_string());
        }
    }

    fn decode(input: &[u8]) -> (Recorder, Vec<String>, Vec<String>) {
        let mut recorder = Recorder::default();
        let mut decoder = ProgressDecoder::new(Some(&mut recorder));
        decoder.feed(input);
        decoder.finish();
        let errors = decoder.error_lines().to_vec();
        let others = decoder.other_lines().to_vec();
        (recorder, errors, others)
    }

    #[test]
    fn test_all_phases_reach_begin_and_end() {
        let input = b"Counting objects:  50% (1/2)\r\
Counting objects: 100% (2/2), done.\n\
Compressing objects:  50% (1/2)\r\
Compressing objects: 100% (2/2), done.\n\
Writing objects:  50% (1/2)\r\
Writing objects: 100% (2/2), 215 bytes | 215.00 KiB/s, done.\n";

        let mut recorder = Recorder::default();
        let mut decoder = ProgressDecoder::new(Some(&mut recorder));
        decoder.feed(input);
        decoder.finish();

        for phase in [
            ProgressOp::COUNTING,
            ProgressOp::COMPRESSING,
            ProgressOp::WRITING,
        ] {
            assert_eq!(decoder.stages_seen(phase), ProgressOp::STAGE_MASK);
        }
        assert_eq!(recorder.updates.len(), 6);

        let (first_op, ..) = recorder.updates[0];
        assert!(first_op.contains(ProgressOp::COUNTING | ProgressOp::BEGIN));
        let (last_op, _, _, ref message) = recorder.updates[5];
        assert!(last_op.contains(ProgressOp::WRITING | ProgressOp::END));
        assert_eq!(message, "215 bytes | 215.00 KiB/s");
    }

    #[test]
    fn test_unknown_phase_still_delivered() {
        let (recorder, _, _) = decode(b"Enumerating objects: 5, done.\n");
        assert_eq!(recorder.updates.len(), 1);
        let (op, cur, max, _) = recorder.updates[0].clone();
        assert_eq!(op.phase(), ProgressOp::UNKNOWN);
        assert_eq!(cur, Some(5));
        assert_eq!(max, None);
    }

    #[test]
    fn test_remote_prefix_stripped() {
        let (recorder, _, _) = decode(b"remote: Compressing objects:  25% (1/4)\n");
        assert_eq!(recorder.updates.len(), 1);
        let (op, cur, max, _) = recorder.updates[0].clone();
        assert_eq!(op.phase(), ProgressOp::COMPRESSING);
        assert_eq!((cur, max), (Some(1), Some(4)));
    }

    #[test]
    fn test_unparseable_line_dropped_not_fatal() {
        let (recorder, _, others) = decode(b"From /tmp/some/repo\n * branch master -> FETCH_HEAD\n");
        assert!(recorder.updates.is_empty());
        assert_eq!(recorder.dropped.len(), 2);
        assert_eq!(others.len(), 2);
    }

    #[test]
    fn test_error_lines_collected() {
        let (recorder, errors, others) = decode(b"fatal: couldn't find remote ref nope\n");
        assert!(recorder.updates.is_empty());
        assert_eq!(errors.len(), 1);
        assert!(others.is_empty());
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut recorder = Recorder::default();
        let mut decoder = ProgressDecoder::new(Some(&mut recorder));
        decoder.feed(b"Counting obj");
        decoder.feed(b"ects:  50% (1/2)\rCounting objects: 100% (2/2), done.");
        decoder.finish();

        assert_eq!(decoder.stages_seen(ProgressOp::COUNTING), ProgressOp::STAGE_MASK);
        assert_eq!(recorder.updates.len(), 2);
    }

    #[test]
    fn test_begin_only_on_first_sighting() {
        let (recorder, _, _) = decode(
            b"Receiving objects:  10% (1/10)\rReceiving objects:  20% (2/10)\r",
        );
        assert_eq!(recorder.updates.len(), 2);
        assert!(recorder.updates[0].0.contains(ProgressOp::BEGIN));
        assert!(!recorder.updates[1].0.contains(ProgressOp::BEGIN));
    }
}

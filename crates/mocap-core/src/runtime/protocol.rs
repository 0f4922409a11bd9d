//! Standard-output progress protocol spoken by the external tools.
//!
//! Lines are turned into [`ToolEvent`]s as soon as they are read; nothing
//! past the supervisor sees raw text.

use std::path::PathBuf;

use crate::pipeline::ProgressFormat;

/// One parsed line of tool output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEvent {
    /// `TOTAL:<n>`
    Total(u64),
    /// `PROGRESS:<cur>/<total>`
    Progress { current: u64, total: u64 },
    /// `DONE:<path>`
    Done(PathBuf),
    /// `STOPPED:<path>`
    Stopped(PathBuf),
    /// Anything else, kept only for diagnostics.
    Other(String),
}

impl ToolEvent {
    pub fn parse(line: &str, format: ProgressFormat) -> Self {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("TOTAL:") {
            if let Ok(n) = rest.trim().parse() {
                return ToolEvent::Total(n);
            }
        } else if let Some(rest) = trimmed.strip_prefix("PROGRESS:") {
            if let Some((current, total)) = parse_fraction(rest) {
                return ToolEvent::Progress { current, total };
            }
        } else if let Some(rest) = trimmed.strip_prefix("DONE:") {
            let path = rest.trim();
            if !path.is_empty() {
                return ToolEvent::Done(PathBuf::from(path));
            }
        } else if let Some(rest) = trimmed.strip_prefix("STOPPED:") {
            let path = rest.trim();
            if !path.is_empty() {
                return ToolEvent::Stopped(PathBuf::from(path));
            }
        } else if format == ProgressFormat::FrameCounter {
            if let Some((current, total)) = parse_frame_counter(trimmed) {
                return ToolEvent::Progress { current, total };
            }
        }

        ToolEvent::Other(trimmed.to_owned())
    }
}

/// `"<cur>/<total>"`, tolerating surrounding whitespace and a trailing colon.
fn parse_fraction(s: &str) -> Option<(u64, u64)> {
    let (cur, total) = s.trim().trim_end_matches(':').split_once('/')?;
    Some((cur.trim().parse().ok()?, total.trim().parse().ok()?))
}

/// `... Frame 50/125 ...` as printed by the MocapNET lifter.
fn parse_frame_counter(line: &str) -> Option<(u64, u64)> {
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word.to_ascii_lowercase().starts_with("frame") {
            return words.next().and_then(parse_fraction);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> ToolEvent {
        ToolEvent::parse(line, ProgressFormat::Protocol)
    }

    #[test]
    fn parses_protocol_lines() {
        assert_eq!(parse("TOTAL:100"), ToolEvent::Total(100));
        assert_eq!(
            parse("PROGRESS:50/100\n"),
            ToolEvent::Progress { current: 50, total: 100 }
        );
        assert_eq!(parse("DONE:/tmp/x.out"), ToolEvent::Done("/tmp/x.out".into()));
        assert_eq!(
            parse("STOPPED: /tmp/partial.bvh "),
            ToolEvent::Stopped("/tmp/partial.bvh".into())
        );
    }

    #[test]
    fn malformed_lines_are_diagnostics() {
        assert!(matches!(parse("TOTAL:many"), ToolEvent::Other(_)));
        assert!(matches!(parse("PROGRESS:50"), ToolEvent::Other(_)));
        assert!(matches!(parse("DONE:"), ToolEvent::Other(_)));
        assert_eq!(parse("loading model"), ToolEvent::Other("loading model".into()));
    }

    #[test]
    fn frame_counter_only_in_that_format() {
        let line = "Processing Frame 50/125 (hands)";
        assert!(matches!(parse(line), ToolEvent::Other(_)));
        assert_eq!(
            ToolEvent::parse(line, ProgressFormat::FrameCounter),
            ToolEvent::Progress { current: 50, total: 125 }
        );
        assert_eq!(
            ToolEvent::parse("frame 7/9:", ProgressFormat::FrameCounter),
            ToolEvent::Progress { current: 7, total: 9 }
        );
        assert!(matches!(
            ToolEvent::parse("Frames written", ProgressFormat::FrameCounter),
            ToolEvent::Other(_)
        ));
    }
}

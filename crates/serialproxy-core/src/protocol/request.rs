//! Requests and replies
//!
//! A [`Request`] is one command line plus the [`Terminator`] that marks the
//! last line of its reply. Executing it yields a [`Response`].

use regex::{Captures, Regex};
use std::fmt;
use std::time::Duration;

use super::ProtocolError;

/// Capture groups of a pattern match; index 0 is the whole match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchGroups(Vec<Option<String>>);

impl MatchGroups {
    pub(crate) fn from_captures(captures: &Captures<'_>) -> Self {
        Self(
            captures
                .iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        )
    }

    /// Text of group `index`, if it participated in the match
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(|group| group.as_deref())
    }

    /// Number of groups including the whole match
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no group was captured
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Marks the end of a reply
#[derive(Clone)]
pub enum Terminator {
    /// A line equal to this string
    Exact(String),
    /// A line matched by this expression
    Pattern(Regex),
}

impl Terminator {
    /// Compile a regular expression terminator
    pub fn pattern(pattern: &str) -> Result<Self, ProtocolError> {
        Ok(Terminator::Pattern(Regex::new(pattern)?))
    }

    /// Test a received line.
    ///
    /// Returns `None` when the line does not end the reply, otherwise the
    /// captured groups (always `None` inside for an exact terminator).
    pub fn check(&self, line: &str) -> Option<Option<MatchGroups>> {
        match self {
            Terminator::Exact(expected) => (line == expected).then_some(None),
            Terminator::Pattern(regex) => regex
                .captures(line)
                .map(|captures| Some(MatchGroups::from_captures(&captures))),
        }
    }
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Exact(s) => f.debug_tuple("Exact").field(s).finish(),
            Terminator::Pattern(r) => f.debug_tuple("Pattern").field(&r.as_str()).finish(),
        }
    }
}

impl From<&str> for Terminator {
    fn from(s: &str) -> Self {
        Terminator::Exact(s.to_string())
    }
}

impl From<String> for Terminator {
    fn from(s: String) -> Self {
        Terminator::Exact(s)
    }
}

impl From<Regex> for Terminator {
    fn from(regex: Regex) -> Self {
        Terminator::Pattern(regex)
    }
}

/// One command and the end-of-reply marker
#[derive(Debug, Clone)]
pub struct Request {
    /// Command line sent to the device (without newline)
    pub command: String,
    /// End-of-reply marker
    pub terminator: Terminator,
    /// Overrides the connection's read timeout
    pub timeout: Option<Duration>,
}

impl Request {
    /// Request ended by any terminator
    pub fn new(command: impl Into<String>, terminator: impl Into<Terminator>) -> Self {
        Self {
            command: command.into(),
            terminator: terminator.into(),
            timeout: None,
        }
    }

    /// Reply ends with a line equal to `terminator`
    pub fn exact(command: impl Into<String>, terminator: impl Into<String>) -> Self {
        Self::new(command, Terminator::Exact(terminator.into()))
    }

    /// Reply ends with a line matching the regular expression `pattern`
    pub fn pattern(command: impl Into<String>, pattern: &str) -> Result<Self, ProtocolError> {
        Ok(Self::new(command, Terminator::pattern(pattern)?))
    }

    /// Override the connection's read timeout for this request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Reply to a completed [`Request`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// All lines received after the command was sent, terminator included
    pub lines: Vec<String>,
    /// Groups captured by a pattern terminator
    pub end_match: Option<MatchGroups>,
}

impl Response {
    /// The line that satisfied the terminator
    pub fn last_line(&self) -> Option<&str> {
        self.lines.last().map(String::as_str)
    }

    /// Lines before the terminator
    pub fn body(&self) -> &[String] {
        match self.lines.split_last() {
            Some((_, body)) => body,
            None => &[],
        }
    }
}

/// Collects lines for the request currently on the wire
#[derive(Debug)]
pub(crate) struct PendingReply {
    terminator: Terminator,
    lines: Vec<String>,
}

impl PendingReply {
    pub(crate) fn new(terminator: Terminator) -> Self {
        Self {
            terminator,
            lines: Vec::new(),
        }
    }

    /// Append a line; returns the finished reply when it was the terminator
    pub(crate) fn push(&mut self, line: String) -> Option<Response> {
        let end = self.terminator.check(&line);
        self.lines.push(line);
        end.map(|end_match| Response {
            lines: std::mem::take(&mut self.lines),
            end_match,
        })
    }

    pub(crate) fn received(&self) -> usize {
        self.lines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exact_terminator() {
        let t = Terminator::from("AOK");
        assert_eq!(t.check("AOK"), Some(None));
        assert_eq!(t.check("AOK "), None);
        assert_eq!(t.check("A"), None);
    }

    #[test]
    fn test_pattern_terminator_captures() {
        let t = Terminator::pattern(r"^ERR(\d+)(x)?$").expect("valid regex");
        let groups = t.check("ERR42").expect("match").expect("groups");
        assert_eq!(groups.get(0), Some("ERR42"));
        assert_eq!(groups.get(1), Some("42"));
        assert_eq!(groups.get(2), None);
        assert_eq!(groups.len(), 3);
        assert!(t.check("OK").is_none());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Request::pattern("AV", "(").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPattern(_)));
    }

    #[test]
    fn test_pending_reply_collects_until_terminator() {
        let mut pending = PendingReply::new(Terminator::pattern(r"^SOK(\d)$").expect("regex"));
        assert!(pending.push("12.5".to_string()).is_none());
        assert!(pending.push("13.0".to_string()).is_none());
        assert_eq!(pending.received(), 2);

        let response = pending.push("SOK1".to_string()).expect("complete");
        assert_eq!(response.lines, vec!["12.5", "13.0", "SOK1"]);
        assert_eq!(response.last_line(), Some("SOK1"));
        assert_eq!(response.body(), &["12.5".to_string(), "13.0".to_string()]);
        assert_eq!(response.end_match.expect("groups").get(1), Some("1"));
    }

    #[test]
    fn test_request_builders() {
        let r = Request::exact("SIR", "SIROK").with_timeout(Duration::from_millis(10));
        assert_eq!(r.command, "SIR");
        assert_eq!(r.timeout, Some(Duration::from_millis(10)));
        assert!(matches!(r.terminator, Terminator::Exact(ref s) if s == "SIROK"));
    }
}

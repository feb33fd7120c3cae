//! Incremental classifier for ping process output.

use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use super::MeasurementEvent;

/// Upper bound on remembered sequence numbers between resets.
const MAX_TRACKED_SEQUENCES: usize = 1024;

fn latency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time[=<]\s*(?P<val>[0-9.]+)\s*ms").unwrap())
}

fn sequence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"icmp_seq=(?P<seq>\d+)").unwrap())
}

fn banner_ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((?P<ip>[^)\s]+)\)").unwrap())
}

fn reply_ip_re() -> &'static Regex {
    // "from 8.8.8.8: ...", "from dns.google (8.8.8.8): ...", "from 2001:db8::1: ..."
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"from\s+(?:[^\s(]+\s+\()?(?P<ip>[0-9A-Fa-f.:]+?)\)?:\s").unwrap()
    })
}

fn from_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"from\s+(?P<ip>\S+)").unwrap())
}

/// Classifies ping output lines into measurement events.
///
/// The target IP is learned once and kept for the lifetime of the parser.
/// Sequence numbers are deduplicated within a burst.
///
/// iputils reports `no answer yet` for a request whose reply is merely
/// slower than the send spacing, so those sequences are held as pending and
/// only reported lost by [`end_burst`](Self::end_burst) if no reply follows.
#[derive(Debug, Default)]
pub struct StreamParser {
    target_ip: Option<String>,
    seen: HashSet<u32>,
    pending: BTreeSet<u32>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target_ip(&self) -> Option<&str> {
        self.target_ip.as_deref()
    }

    /// Forget reported sequence numbers; they restart with every burst.
    pub fn begin_burst(&mut self) {
        self.seen.clear();
        self.pending.clear();
    }

    /// Report every sequence still waiting for a reply as lost.
    pub fn end_burst(&mut self) -> Vec<MeasurementEvent> {
        let unanswered = std::mem::take(&mut self.pending);
        unanswered
            .into_iter()
            .filter(|seq| !self.seen.contains(seq))
            .map(|_| MeasurementEvent::lost(self.target_ip.clone()))
            .collect()
    }

    /// Classify one output line. Lines that carry no measurement yield `None`.
    pub fn parse_line(&mut self, line: &str) -> Option<MeasurementEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if line.starts_with("PING") {
            if self.target_ip.is_none() {
                self.target_ip = banner_ip(line);
            }
            return None;
        }

        let latency = latency_re().captures(line);
        let sequence = sequence_re().captures(line);
        if let (Some(latency), Some(sequence)) = (latency, sequence) {
            if self.target_ip.is_none() {
                self.target_ip = reply_ip_re()
                    .captures(line)
                    .map(|caps| caps["ip"].to_string());
            }

            let seq: u32 = sequence["seq"].parse().ok()?;
            self.pending.remove(&seq);
            if self.seen.contains(&seq) {
                return None;
            }
            let ms: f64 = latency["val"].parse().ok()?;

            if self.seen.len() >= MAX_TRACKED_SEQUENCES {
                self.seen.clear();
            }
            self.seen.insert(seq);

            return Some(MeasurementEvent::success(ms, self.target_ip.clone()));
        }

        if line.contains("no answer yet") {
            if let Some(seq) = sequence_re()
                .captures(line)
                .and_then(|caps| caps["seq"].parse::<u32>().ok())
            {
                if !self.seen.contains(&seq) && self.pending.len() < MAX_TRACKED_SEQUENCES {
                    self.pending.insert(seq);
                }
                return None;
            }
        }

        if line.contains("Request timeout") || line.contains("no answer") {
            return Some(MeasurementEvent::lost(self.target_ip.clone()));
        }

        None
    }
}

fn banner_ip(line: &str) -> Option<String> {
    if let Some(caps) = banner_ip_re().captures(line) {
        return Some(caps["ip"].to_string());
    }
    from_token_re()
        .captures(line)
        .map(|caps| caps["ip"].trim_end_matches(':').to_string())
        .filter(|ip| !ip.is_empty())
}

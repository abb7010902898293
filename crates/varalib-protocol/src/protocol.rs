//! Control-channel line parsing and outgoing commands.
//!
//! Every inbound line is split on whitespace into a keyword (compared
//! case-insensitively, stored lowercased) and its arguments. [`Notice`]
//! gives the keywords the session reacts to a typed shape; anything else is
//! [`Notice::Other`] and only matters to the command queue as a possible
//! reply keyword.

use varalib_core::error::{Error, Result};

/// Number of bytes shown by [`summarize`] before truncating.
pub const SUMMARY_LEN: usize = 32;

/// One inbound control line, split into keyword and arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolLine {
    /// The line as received, without the CR.
    pub raw: String,
    /// First token, lowercased. Empty for a blank line.
    pub keyword: String,
    /// Remaining whitespace-separated tokens, case preserved.
    pub args: Vec<String>,
}

/// The typed meaning of an inbound control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// `BUSY`: channel activity report.
    Busy,
    /// `IAMALIVE`: modem keepalive.
    IAmAlive,
    /// `PTT`: transmitter keying report.
    Ptt,
    /// `PENDING`: an inbound link is being negotiated.
    Pending,
    /// `CANCELPENDING`: the pending link was abandoned.
    CancelPending,
    /// `CONNECTED <remote> <local>`: link established.
    Connected {
        remote: Option<String>,
        local: Option<String>,
    },
    /// `DISCONNECTED [reason]`: link ended.
    Disconnected { reason: Option<String> },
    /// `BUFFER <n>`: bytes still queued for transmission in the modem.
    Buffer(u64),
    /// `MISSING`: the modem lost track of the session.
    Missing,
    /// `WRONG`: the last command was rejected.
    Wrong,
    /// `OK`: generic success.
    Ok,
    /// `VERSION [v]`: reply to a version request.
    Version(Option<String>),
    /// A blank line.
    Empty,
    /// Any other keyword.
    Other,
}

impl Notice {
    /// Informational lines that never affect state and log at trace level.
    pub fn is_chatter(&self) -> bool {
        matches!(self, Notice::Busy | Notice::IAmAlive | Notice::Ptt)
    }
}

impl ProtocolLine {
    /// Split a decoded line into keyword and arguments.
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next().map(str::to_ascii_lowercase).unwrap_or_default();
        ProtocolLine {
            raw: line.to_string(),
            keyword,
            args: tokens.map(str::to_string).collect(),
        }
    }

    fn arg(&self, index: usize) -> Option<String> {
        self.args.get(index).cloned()
    }

    /// Everything after the keyword, with the original spacing collapsed.
    fn rest(&self) -> Option<String> {
        if self.args.is_empty() {
            None
        } else {
            Some(self.args.join(" "))
        }
    }

    /// Interpret the keyword.
    ///
    /// Fails only for a `BUFFER` line whose count is missing or not a
    /// non-negative integer.
    pub fn notice(&self) -> Result<Notice> {
        let notice = match self.keyword.as_str() {
            "" => Notice::Empty,
            "busy" => Notice::Busy,
            "iamalive" => Notice::IAmAlive,
            "ptt" => Notice::Ptt,
            "pending" => Notice::Pending,
            "cancelpending" => Notice::CancelPending,
            "connected" => Notice::Connected {
                remote: self.arg(0),
                local: self.arg(1),
            },
            "disconnected" => Notice::Disconnected {
                reason: self.rest(),
            },
            "buffer" => {
                let count = self
                    .args
                    .first()
                    .and_then(|n| n.parse::<u64>().ok())
                    .ok_or_else(|| Error::Protocol(format!("malformed BUFFER line: {:?}", self.raw)))?;
                Notice::Buffer(count)
            }
            "missing" => Notice::Missing,
            "wrong" => Notice::Wrong,
            "ok" => Notice::Ok,
            "version" => Notice::Version(self.rest()),
            _ => Notice::Other,
        };
        Ok(notice)
    }
}

/// An outgoing control command and the reply keyword it waits for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    expect: Option<String>,
}

impl Command {
    /// A command awaiting `expect` (matched case-insensitively), or no
    /// reply at all when `expect` is `None`.
    pub fn new(text: impl Into<String>, expect: Option<&str>) -> Self {
        Command {
            text: text.into(),
            expect: expect.map(str::to_ascii_lowercase),
        }
    }

    /// `VERSION`, answered by `VERSION <v>`.
    pub fn version() -> Self {
        Command::new("VERSION", Some("version"))
    }

    /// `MYCALL <call1> <call2> ...`, answered by `OK`.
    pub fn my_call(call_signs: &[String]) -> Self {
        let mut text = String::from("MYCALL");
        for call in call_signs {
            text.push(' ');
            text.push_str(call);
        }
        Command::new(text, Some("ok"))
    }

    /// `LISTEN ON` or `LISTEN OFF`, answered by `OK`.
    pub fn listen(on: bool) -> Self {
        Command::new(if on { "LISTEN ON" } else { "LISTEN OFF" }, Some("ok"))
    }

    /// `DISCONNECT`. The modem answers with a status line, not a reply.
    pub fn disconnect() -> Self {
        Command::new("DISCONNECT", None)
    }

    /// The line written to the modem, without the CR.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The lowercased reply keyword, if any.
    pub fn expected_reply(&self) -> Option<&str> {
        self.expect.as_deref()
    }

    /// Whether `keyword` completes this command.
    pub fn is_answered_by(&self, keyword: &str) -> bool {
        self.expect
            .as_deref()
            .is_some_and(|expect| expect.eq_ignore_ascii_case(keyword))
    }
}

/// Short printable preview of a data chunk for log records.
///
/// Shows at most the first 32 bytes as Latin-1 text with `\r` escaped, and
/// appends `...` when the chunk was longer.
pub fn summarize(data: &[u8]) -> String {
    let shown = &data[..data.len().min(SUMMARY_LEN)];
    let mut out = String::with_capacity(shown.len() + 3);
    for &b in shown {
        if b == b'\r' {
            out.push_str("\\r");
        } else {
            out.push(char::from(b));
        }
    }
    if data.len() > SUMMARY_LEN {
        out.push_str("...");
    }
    out
}

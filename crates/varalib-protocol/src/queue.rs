//! Request/reply sequencing for control commands.
//!
//! The modem answers commands in order but without correlation ids, so at
//! most one command may be awaiting its reply at a time. [`CommandQueue`]
//! holds the rest until that reply (or `WRONG`) arrives. It performs no
//! I/O: each method returns the command the caller must now write.
//!
//! A command with no expected reply (`DISCONNECT`) still occupies the
//! in-flight slot once written, but does not block: the next `enqueue`
//! supersedes it and is written immediately.

use std::collections::VecDeque;

use crate::protocol::Command;

/// Result of a reply completing the in-flight command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advance {
    /// The command that was answered.
    pub completed: Command,
    /// The next command to write, if one was queued.
    pub next: Option<Command>,
}

/// Result of a `WRONG` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Text of the command the rejection answers: the in-flight command,
    /// or failing that the last command written.
    pub request: Option<String>,
    /// The next command to write, if one was queued.
    pub next: Option<Command>,
}

/// FIFO of control commands with a single in-flight slot.
#[derive(Debug, Default)]
pub struct CommandQueue {
    pending: VecDeque<Command>,
    in_flight: Option<Command>,
    last_request: Option<String>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command. Returns it (or an earlier queued command) when it
    /// should be written right away because nothing is awaiting a reply.
    pub fn enqueue(&mut self, cmd: Command) -> Option<Command> {
        self.pending.push_back(cmd);
        if self.awaiting_reply() {
            None
        } else {
            self.advance()
        }
    }

    /// Offer an inbound keyword as a reply.
    ///
    /// Returns `None` without touching the queue unless the keyword matches
    /// the in-flight command's expected reply. Unsolicited status lines
    /// therefore never advance the queue.
    pub fn on_reply(&mut self, keyword: &str) -> Option<Advance> {
        if !self
            .in_flight
            .as_ref()
            .is_some_and(|cmd| cmd.is_answered_by(keyword))
        {
            return None;
        }
        let completed = self.in_flight.take()?;
        let next = self.advance();
        Some(Advance { completed, next })
    }

    /// The modem rejected the in-flight command. Clears it and releases the
    /// next one regardless of what it was waiting for.
    pub fn on_wrong(&mut self) -> Rejection {
        let request = self
            .in_flight
            .take()
            .map(|cmd| cmd.text().to_string())
            .or_else(|| self.last_request.clone());
        let next = self.advance();
        Rejection { request, next }
    }

    /// Whether the in-flight command is still waiting for its reply.
    pub fn awaiting_reply(&self) -> bool {
        self.in_flight
            .as_ref()
            .is_some_and(|cmd| cmd.expected_reply().is_some())
    }

    /// The command currently in flight, if any.
    pub fn in_flight(&self) -> Option<&Command> {
        self.in_flight.as_ref()
    }

    /// Text of the last command released for writing.
    pub fn last_request(&self) -> Option<&str> {
        self.last_request.as_deref()
    }

    /// Number of commands waiting behind the in-flight one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn advance(&mut self) -> Option<Command> {
        let cmd = self.pending.pop_front();
        if let Some(cmd) = &cmd {
            self.last_request = Some(cmd.text().to_string());
        }
        self.in_flight = cmd.clone();
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(cmds: &[Option<Command>]) -> Vec<Option<&str>> {
        cmds.iter().map(|c| c.as_ref().map(Command::text)).collect()
    }

    #[test]
    fn first_command_is_written_immediately() {
        let mut q = CommandQueue::new();
        let out = q.enqueue(Command::version());
        assert_eq!(out.as_ref().map(Command::text), Some("VERSION"));
        assert!(q.awaiting_reply());
        assert_eq!(q.last_request(), Some("VERSION"));
    }

    #[test]
    fn commands_wait_for_the_expected_reply() {
        let mut q = CommandQueue::new();
        let calls = vec!["N0CALL".to_string()];
        let written = [
            q.enqueue(Command::version()),
            q.enqueue(Command::my_call(&calls)),
            q.enqueue(Command::listen(true)),
        ];
        assert_eq!(texts(&written), vec![Some("VERSION"), None, None]);
        assert_eq!(q.len(), 2);

        let adv = q.on_reply("version").unwrap();
        assert_eq!(adv.completed.text(), "VERSION");
        assert_eq!(adv.next.as_ref().map(Command::text), Some("MYCALL N0CALL"));

        let adv = q.on_reply("OK").unwrap();
        assert_eq!(adv.next.as_ref().map(Command::text), Some("LISTEN ON"));

        let adv = q.on_reply("ok").unwrap();
        assert_eq!(adv.completed.text(), "LISTEN ON");
        assert_eq!(adv.next, None);
        assert!(!q.awaiting_reply());
    }

    #[test]
    fn ordering_holds_for_many_commands() {
        let mut q = CommandQueue::new();
        let mut written = Vec::new();
        for i in 0..10 {
            if let Some(cmd) = q.enqueue(Command::new(format!("CMD{i}"), Some("ok"))) {
                written.push(cmd.text().to_string());
            }
        }
        assert_eq!(written, vec!["CMD0"]);

        while let Some(adv) = q.on_reply("ok") {
            if let Some(next) = adv.next {
                written.push(next.text().to_string());
            }
        }
        let expected: Vec<String> = (0..10).map(|i| format!("CMD{i}")).collect();
        assert_eq!(written, expected);
    }

    #[test]
    fn unsolicited_lines_do_not_advance() {
        let mut q = CommandQueue::new();
        q.enqueue(Command::listen(true));
        q.enqueue(Command::version());

        assert!(q.on_reply("busy").is_none());
        assert!(q.on_reply("iamalive").is_none());
        assert!(q.on_reply("ptt").is_none());
        assert!(q.on_reply("version").is_none());
        assert_eq!(q.in_flight().map(Command::text), Some("LISTEN ON"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn wrong_releases_the_next_command() {
        let mut q = CommandQueue::new();
        q.enqueue(Command::listen(true));
        q.enqueue(Command::version());

        let rejection = q.on_wrong();
        assert_eq!(rejection.request.as_deref(), Some("LISTEN ON"));
        assert_eq!(rejection.next.as_ref().map(Command::text), Some("VERSION"));
        assert_eq!(q.in_flight().map(Command::text), Some("VERSION"));
    }

    #[test]
    fn wrong_with_nothing_in_flight_names_last_request() {
        let mut q = CommandQueue::new();
        q.enqueue(Command::listen(true));
        q.on_reply("ok");

        let rejection = q.on_wrong();
        assert_eq!(rejection.request.as_deref(), Some("LISTEN ON"));
        assert_eq!(rejection.next, None);
    }

    #[test]
    fn wrong_on_empty_queue() {
        let mut q = CommandQueue::new();
        let rejection = q.on_wrong();
        assert_eq!(rejection.request, None);
        assert_eq!(rejection.next, None);
    }

    #[test]
    fn fire_and_forget_is_superseded_by_next_enqueue() {
        let mut q = CommandQueue::new();
        let out = q.enqueue(Command::disconnect());
        assert_eq!(out.as_ref().map(Command::text), Some("DISCONNECT"));
        assert!(!q.awaiting_reply());
        assert_eq!(q.in_flight().map(Command::text), Some("DISCONNECT"));

        // Nothing answers DISCONNECT; an OK for someone else is ignored.
        assert!(q.on_reply("ok").is_none());

        let out = q.enqueue(Command::listen(true));
        assert_eq!(out.as_ref().map(Command::text), Some("LISTEN ON"));
        assert!(q.awaiting_reply());
    }

    #[test]
    fn fire_and_forget_behind_a_pending_command() {
        let mut q = CommandQueue::new();
        q.enqueue(Command::listen(true));
        assert!(q.enqueue(Command::disconnect()).is_none());
        assert!(q.enqueue(Command::version()).is_none());

        let adv = q.on_reply("ok").unwrap();
        assert_eq!(adv.next.as_ref().map(Command::text), Some("DISCONNECT"));
        // VERSION stays queued until the next enqueue supersedes DISCONNECT.
        assert_eq!(q.len(), 1);

        let out = q.enqueue(Command::listen(false));
        assert_eq!(out.as_ref().map(Command::text), Some("VERSION"));
        assert_eq!(q.len(), 1);
    }
}

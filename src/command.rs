//! The command aggregate.
//!
//! A [`Command`] is a stateful request made of one or more CAN messages.
//! It is created READY, queued with the network dispatcher, transitioned
//! to RUNNING when its messages hit the wire, and reaches exactly one
//! terminal state: DONE when every expected reply arrived accepted,
//! FAILED on any non-accepted response code, TIMEDOUT when the reply
//! timer expires, or CANCELLED. Awaiters resolve on the first terminal
//! state; a broadcast that can only end by timing out still counts as
//! having succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, warn};

use canopus_proto::{
    data, descriptor, CommandDescriptor, CommandId, CommandStatus, ResponseCode,
};

use crate::can::message::{Message, Reply};
use crate::error::CommandError;

static NEXT_COMMAND_UID: AtomicU64 = AtomicU64::new(1);

/// Reply timeout policy for one command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timeout {
    /// Use the descriptor's default.
    Default,
    /// Wait for replies indefinitely.
    Never,
    /// Expire after the given duration. Zero means fire-and-forget: the
    /// command is marked DONE right after it is sent.
    After(Duration),
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Default
    }
}

impl Timeout {
    fn resolve(self, descriptor: &CommandDescriptor) -> Option<Duration> {
        match self {
            Timeout::Default => descriptor.timeout,
            Timeout::Never => None,
            Timeout::After(duration) => Some(duration),
        }
    }
}

/// Payload layout for the messages of one command.
#[derive(Debug, Clone, Default)]
pub enum CommandData {
    /// A single message with no payload per positioner.
    #[default]
    Empty,
    /// The same single payload to every addressed positioner.
    Single(Vec<u8>),
    /// The same message sequence to every addressed positioner.
    PerMessage(Vec<Vec<u8>>),
    /// A message sequence per positioner (trajectory streaming).
    PerPositioner(HashMap<u16, Vec<Vec<u8>>>),
}

impl CommandData {
    fn chunks_for(&self, positioner_id: u16) -> Option<Vec<Vec<u8>>> {
        match self {
            CommandData::Empty => Some(vec![Vec::new()]),
            CommandData::Single(blob) => Some(vec![blob.clone()]),
            CommandData::PerMessage(blobs) => {
                if blobs.is_empty() {
                    Some(vec![Vec::new()])
                } else {
                    Some(blobs.clone())
                }
            }
            CommandData::PerPositioner(map) => map.get(&positioner_id).cloned(),
        }
    }
}

struct CommandState {
    status: CommandStatus,
    data: CommandData,
    replies: Vec<Reply>,
    /// (positioner_id, uid) pairs already matched to accepted replies.
    matched: HashSet<(u16, u8)>,
    n_messages: usize,
    message_uids: Vec<u8>,
    /// Messages each broadcast listener is expected to answer.
    messages_per_positioner: usize,
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

struct CommandInner {
    descriptor: &'static CommandDescriptor,
    command_uid: u64,
    positioner_ids: Vec<u16>,
    timeout: Option<Duration>,
    n_positioners: Option<usize>,
    uid_bits: u32,
    state: Mutex<CommandState>,
    status_tx: watch::Sender<CommandStatus>,
}

/// Handle to a command. Clones share state; awaiting any of them
/// resolves when the command reaches a terminal status.
#[derive(Clone)]
pub struct Command {
    inner: Arc<CommandInner>,
}

impl Command {
    pub fn new(
        command_id: CommandId,
        positioner_ids: Vec<u16>,
        data: CommandData,
        timeout: Timeout,
        n_positioners: Option<usize>,
        uid_bits: u32,
    ) -> Result<Command, CommandError> {
        let descriptor = descriptor(command_id);
        let command_uid = NEXT_COMMAND_UID.fetch_add(1, Ordering::Relaxed);

        if positioner_ids.is_empty() {
            return Err(CommandError::Invalid {
                command: command_id,
                reason: "no positioners addressed".to_string(),
            });
        }

        let is_broadcast = positioner_ids.contains(&0);
        if is_broadcast {
            if !descriptor.broadcastable {
                return Err(CommandError::NotBroadcastable(command_id));
            }
            if positioner_ids.len() > 1 {
                return Err(CommandError::Invalid {
                    command: command_id,
                    reason: "a broadcast cannot name other positioners".to_string(),
                });
            }
            if matches!(data, CommandData::PerPositioner(_)) {
                return Err(CommandError::Invalid {
                    command: command_id,
                    reason: "per-positioner data cannot be broadcast".to_string(),
                });
            }
        } else if n_positioners.is_some() {
            return Err(CommandError::Invalid {
                command: command_id,
                reason: "n_positioners only applies to broadcasts".to_string(),
            });
        }

        let (status_tx, _) = watch::channel(CommandStatus::READY);

        Ok(Command {
            inner: Arc::new(CommandInner {
                descriptor,
                command_uid,
                positioner_ids,
                timeout: timeout.resolve(descriptor),
                n_positioners,
                uid_bits,
                state: Mutex::new(CommandState {
                    status: CommandStatus::READY,
                    data,
                    replies: Vec::new(),
                    matched: HashSet::new(),
                    n_messages: 0,
                    message_uids: Vec::new(),
                    messages_per_positioner: 0,
                    timeout_task: None,
                }),
                status_tx,
            }),
        })
    }

    pub fn command_id(&self) -> CommandId {
        self.inner.descriptor.id
    }

    pub fn name(&self) -> &'static str {
        self.inner.descriptor.name
    }

    pub fn command_uid(&self) -> u64 {
        self.inner.command_uid
    }

    pub fn descriptor(&self) -> &'static CommandDescriptor {
        self.inner.descriptor
    }

    pub fn positioner_ids(&self) -> &[u16] {
        &self.inner.positioner_ids
    }

    pub fn is_broadcast(&self) -> bool {
        self.inner.positioner_ids.contains(&0)
    }

    pub fn status(&self) -> CommandStatus {
        self.inner.state.lock().expect("command state lock").status
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.inner
            .state
            .lock()
            .expect("command state lock")
            .replies
            .clone()
    }

    pub fn replies_for(&self, positioner_id: u16) -> Vec<Reply> {
        self.replies()
            .into_iter()
            .filter(|reply| reply.positioner_id == positioner_id)
            .collect()
    }

    /// UIDs assigned to the outgoing messages by `get_messages`.
    pub fn message_uids(&self) -> Vec<u8> {
        self.inner
            .state
            .lock()
            .expect("command state lock")
            .message_uids
            .clone()
    }

    /// Produces the outgoing messages, assigning each positioner's
    /// messages UIDs `0..n-1`. Fails when a positioner needs more
    /// messages than the UID space holds, or has no data.
    pub fn get_messages(&self) -> Result<Vec<Message>, CommandError> {
        let mut state = self.inner.state.lock().expect("command state lock");

        let max_uids = 1usize << self.inner.uid_bits;
        let mut messages = Vec::new();
        let mut message_uids = Vec::new();
        let mut per_positioner = 0usize;

        for &positioner_id in &self.inner.positioner_ids {
            let chunks = state.data.chunks_for(positioner_id).ok_or_else(|| {
                CommandError::MissingData {
                    command: self.command_id(),
                    command_uid: self.command_uid(),
                    positioner_id,
                }
            })?;

            if chunks.len() > max_uids {
                return Err(CommandError::UidPoolExhausted {
                    command: self.command_id(),
                    command_uid: self.command_uid(),
                    n_messages: chunks.len(),
                    max_uids,
                });
            }

            per_positioner = per_positioner.max(chunks.len());

            for (uid, chunk) in chunks.into_iter().enumerate() {
                let message = Message::new(
                    self.command_id(),
                    positioner_id,
                    uid as u8,
                    chunk,
                    self.inner.uid_bits,
                )?;
                message_uids.push(uid as u8);
                messages.push(message);
            }
        }

        state.n_messages = messages.len();
        state.message_uids = message_uids;
        state.messages_per_positioner = per_positioner;

        Ok(messages)
    }

    /// Marks the command RUNNING and arms its reply timer. Returns
    /// `false` when the command is already terminal.
    pub fn mark_running(&self) -> bool {
        {
            let mut state = self.inner.state.lock().expect("command state lock");
            if state.status.is_done() {
                return false;
            }
            state.status = CommandStatus::RUNNING;

            match self.inner.timeout {
                Some(timeout) if timeout.is_zero() => {
                    // Fire-and-forget: nobody is expected to reply in time.
                    drop(state);
                    CommandInner::finish(&self.inner, CommandStatus::DONE);
                    return true;
                }
                Some(timeout) => {
                    let weak = Arc::downgrade(&self.inner);
                    state.timeout_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(inner) = weak.upgrade() {
                            CommandInner::finish(&inner, CommandStatus::TIMEDOUT);
                        }
                    }));
                }
                None => {}
            }
        }

        self.inner.status_tx.send_replace(CommandStatus::RUNNING);
        true
    }

    /// Handles one reply from the network. Invalid or duplicate replies
    /// are logged and dropped.
    pub fn process_reply(&self, message: &Message) {
        let reply = match Reply::from_message(message) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(
                    command = %self.name(),
                    command_uid = self.command_uid(),
                    %err,
                    "cannot decode reply"
                );
                return;
            }
        };

        let mut state = self.inner.state.lock().expect("command state lock");

        if state.status.is_done() {
            debug!(
                command = %self.name(),
                command_uid = self.command_uid(),
                positioner_id = reply.positioner_id,
                "reply for a finished command; ignoring"
            );
            return;
        }

        // A reply implies the messages were sent even if the dispatcher
        // has not marked the transition yet.
        if state.status == CommandStatus::READY {
            state.status = CommandStatus::RUNNING;
            self.inner.status_tx.send_replace(CommandStatus::RUNNING);
        }

        let is_broadcast = self.is_broadcast();

        if !is_broadcast && !self.inner.positioner_ids.contains(&reply.positioner_id) {
            error!(
                command = %self.name(),
                command_uid = self.command_uid(),
                positioner_id = reply.positioner_id,
                "received a reply from a positioner this command never addressed"
            );
            return;
        }

        let key = (reply.positioner_id, reply.uid);
        if state.matched.contains(&key) {
            debug!(
                command = %self.name(),
                command_uid = self.command_uid(),
                positioner_id = reply.positioner_id,
                uid = reply.uid,
                "duplicate reply; ignoring"
            );
            return;
        }

        let accepted = reply.response_code.accepted();
        debug!(
            command = %self.name(),
            command_uid = self.command_uid(),
            positioner_id = reply.positioner_id,
            uid = reply.uid,
            response_code = %reply.response_code,
            data = %hex::encode(&reply.data),
            "reply received"
        );

        state.replies.push(reply);

        if !accepted {
            drop(state);
            CommandInner::finish(&self.inner, CommandStatus::FAILED);
            return;
        }

        state.matched.insert(key);

        let complete = if is_broadcast {
            match self.inner.n_positioners {
                Some(n) => state.matched.len() >= n * state.messages_per_positioner.max(1),
                // Without an expected count a broadcast only ends by
                // timing out.
                None => false,
            }
        } else {
            state.n_messages > 0 && state.matched.len() >= state.n_messages
        };

        if complete {
            drop(state);
            CommandInner::finish(&self.inner, CommandStatus::DONE);
        }
    }

    /// Cancels the command. Safe to call at any time; a no-op once the
    /// command is terminal.
    pub fn cancel(&self, silent: bool) {
        {
            let state = self.inner.state.lock().expect("command state lock");
            if state.status.is_done() {
                return;
            }
        }

        if !silent {
            warn!(
                command = %self.name(),
                command_uid = self.command_uid(),
                "command cancelled"
            );
        }

        CommandInner::finish(&self.inner, CommandStatus::CANCELLED);
    }

    /// Resolves when the command reaches a terminal status.
    pub async fn wait(&self) -> CommandStatus {
        let mut rx = self.inner.status_tx.subscribe();

        loop {
            let status = *rx.borrow_and_update();
            if status.is_done() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Awaits completion and folds the outcome into a result.
    pub async fn result(&self) -> Result<(), CommandError> {
        self.wait().await;
        match self.error() {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// DONE, or a broadcast whose only terminal path was its timeout.
    pub fn succeeded(&self) -> bool {
        let status = self.status();
        status == CommandStatus::DONE
            || (self.is_broadcast()
                && self.inner.n_positioners.is_none()
                && status == CommandStatus::TIMEDOUT)
    }

    /// Builds the error this command terminated with, if it did not
    /// succeed.
    pub fn error(&self) -> Option<CommandError> {
        let status = self.status();

        if self.succeeded() {
            return None;
        }

        if status == CommandStatus::TIMEDOUT {
            return Some(CommandError::TimedOut {
                command: self.command_id(),
                command_uid: self.command_uid(),
            });
        }

        if status.contains(CommandStatus::CANCELLED) {
            return Some(CommandError::Cancelled {
                command: self.command_id(),
                command_uid: self.command_uid(),
            });
        }

        if status.failed() {
            let outcomes = self
                .replies()
                .into_iter()
                .filter(|reply| !reply.response_code.accepted())
                .map(|reply| (reply.positioner_id, reply.response_code))
                .collect();
            return Some(CommandError::Failed {
                command: self.command_id(),
                command_uid: self.command_uid(),
                outcomes,
            });
        }

        None
    }

    /// Parses GET_FIRMWARE_VERSION replies.
    pub fn firmware_versions(&self) -> HashMap<u16, String> {
        self.replies()
            .iter()
            .filter_map(|reply| {
                data::firmware_from_reply(&reply.data)
                    .ok()
                    .map(|fw| (reply.positioner_id, fw))
            })
            .collect()
    }

    /// Parses GET_STATUS replies into raw status registers.
    pub fn positioner_status(&self) -> HashMap<u16, u64> {
        self.replies()
            .iter()
            .filter_map(|reply| {
                data::status_from_reply(&reply.data)
                    .ok()
                    .map(|raw| (reply.positioner_id, raw))
            })
            .collect()
    }

    /// Parses GET_ACTUAL_POSITION replies into `(alpha, beta)` degrees.
    pub fn positions(&self, motor_steps: u32) -> HashMap<u16, (f64, f64)> {
        self.replies()
            .iter()
            .filter_map(|reply| {
                data::position_from_reply(&reply.data, motor_steps)
                    .ok()
                    .map(|pos| (reply.positioner_id, pos))
            })
            .collect()
    }

    /// Parses goto replies into `(alpha, beta)` move times, seconds.
    pub fn move_times(&self, time_step: f64) -> HashMap<u16, (f64, f64)> {
        self.replies()
            .iter()
            .filter_map(|reply| {
                data::move_time_from_reply(&reply.data, time_step)
                    .ok()
                    .map(|times| (reply.positioner_id, times))
            })
            .collect()
    }

    /// Non-accepted response codes by positioner.
    pub fn failed_outcomes(&self) -> HashMap<u16, ResponseCode> {
        self.replies()
            .into_iter()
            .filter(|reply| !reply.response_code.accepted())
            .map(|reply| (reply.positioner_id, reply.response_code))
            .collect()
    }
}

impl CommandInner {
    /// Moves the command to a terminal status exactly once.
    fn finish(inner: &Arc<CommandInner>, status: CommandStatus) {
        let mut state = inner.state.lock().expect("command state lock");

        if state.status.is_done() {
            return;
        }

        state.status = status;
        if let Some(task) = state.timeout_task.take() {
            task.abort();
        }
        drop(state);

        inner.status_tx.send_replace(status);
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("command", &self.name())
            .field("command_uid", &self.command_uid())
            .field("positioner_ids", &self.inner.positioner_ids)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopus_proto::encode_identifier;
    use canopus_proto::ident::DEFAULT_UID_BITS;

    fn reply_message(command_id: CommandId, pid: u16, uid: u8, code: u8) -> Message {
        let aid =
            encode_identifier(pid, command_id.as_u16(), uid, code, DEFAULT_UID_BITS).unwrap();
        Message::from_frame(aid, vec![], DEFAULT_UID_BITS, Some(0), None).unwrap()
    }

    fn unicast(command_id: CommandId, pids: Vec<u16>) -> Command {
        Command::new(
            command_id,
            pids,
            CommandData::Empty,
            Timeout::Default,
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn unicast_completes_on_accepted_replies() {
        let cmd = unicast(CommandId::GetStatus, vec![4, 5]);
        let messages = cmd.get_messages().unwrap();
        assert_eq!(messages.len(), 2);
        assert!(cmd.mark_running());

        cmd.process_reply(&reply_message(CommandId::GetStatus, 4, 0, 0));
        assert_eq!(cmd.status(), CommandStatus::RUNNING);

        cmd.process_reply(&reply_message(CommandId::GetStatus, 5, 0, 0));
        assert_eq!(cmd.wait().await, CommandStatus::DONE);
        assert!(cmd.succeeded());
        assert!(cmd.error().is_none());
    }

    #[tokio::test]
    async fn non_accepted_reply_fails_immediately() {
        let cmd = unicast(CommandId::GoToAbsolutePosition, vec![4]);
        cmd.get_messages().unwrap();
        cmd.mark_running();

        cmd.process_reply(&reply_message(CommandId::GoToAbsolutePosition, 4, 0, 3));

        assert_eq!(cmd.wait().await, CommandStatus::FAILED);
        match cmd.error() {
            Some(CommandError::Failed { outcomes, .. }) => {
                assert_eq!(outcomes[&4], ResponseCode::AlreadyInMotion);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_from_strangers_are_dropped() {
        let cmd = unicast(CommandId::GetStatus, vec![4]);
        cmd.get_messages().unwrap();
        cmd.mark_running();

        cmd.process_reply(&reply_message(CommandId::GetStatus, 9, 0, 0));
        assert_eq!(cmd.status(), CommandStatus::RUNNING);
        assert!(cmd.replies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_without_count_succeeds_by_timeout() {
        let cmd = Command::new(
            CommandId::GetFirmwareVersion,
            vec![0],
            CommandData::Empty,
            Timeout::After(Duration::from_secs(1)),
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap();
        cmd.get_messages().unwrap();
        cmd.mark_running();

        cmd.process_reply(&reply_message(CommandId::GetFirmwareVersion, 1, 0, 0));
        cmd.process_reply(&reply_message(CommandId::GetFirmwareVersion, 2, 0, 0));

        assert_eq!(cmd.wait().await, CommandStatus::TIMEDOUT);
        assert!(cmd.succeeded());
        assert_eq!(cmd.replies().len(), 2);
    }

    #[tokio::test]
    async fn broadcast_with_count_completes_early() {
        let cmd = Command::new(
            CommandId::GetStatus,
            vec![0],
            CommandData::Empty,
            Timeout::Default,
            Some(2),
            DEFAULT_UID_BITS,
        )
        .unwrap();
        cmd.get_messages().unwrap();
        cmd.mark_running();

        cmd.process_reply(&reply_message(CommandId::GetStatus, 1, 0, 0));
        cmd.process_reply(&reply_message(CommandId::GetStatus, 2, 0, 0));

        assert_eq!(cmd.wait().await, CommandStatus::DONE);
    }

    #[tokio::test(start_paused = true)]
    async fn unicast_times_out_without_replies() {
        let cmd = Command::new(
            CommandId::GetStatus,
            vec![4],
            CommandData::Empty,
            Timeout::After(Duration::from_secs(2)),
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap();
        cmd.get_messages().unwrap();
        cmd.mark_running();

        assert_eq!(cmd.wait().await, CommandStatus::TIMEDOUT);
        assert!(!cmd.succeeded());
        assert!(matches!(cmd.error(), Some(CommandError::TimedOut { .. })));
    }

    #[tokio::test]
    async fn zero_timeout_is_fire_and_forget() {
        let cmd = Command::new(
            CommandId::StopTrajectory,
            vec![0],
            CommandData::Empty,
            Timeout::After(Duration::ZERO),
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap();
        cmd.get_messages().unwrap();
        cmd.mark_running();

        assert_eq!(cmd.status(), CommandStatus::DONE);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal_once() {
        let cmd = unicast(CommandId::GetStatus, vec![4]);
        cmd.cancel(true);
        assert_eq!(cmd.status(), CommandStatus::CANCELLED);

        cmd.cancel(true);
        assert_eq!(cmd.status(), CommandStatus::CANCELLED);

        // A terminal command ignores late replies and transitions.
        cmd.process_reply(&reply_message(CommandId::GetStatus, 4, 0, 0));
        assert_eq!(cmd.status(), CommandStatus::CANCELLED);
        assert!(!cmd.mark_running());
    }

    #[test]
    fn broadcast_requires_capability() {
        let err = Command::new(
            CommandId::GoToAbsolutePosition,
            vec![0],
            CommandData::Empty,
            Timeout::Default,
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::NotBroadcastable(_)));
    }

    #[test]
    fn uid_pool_is_bounded() {
        let points: Vec<Vec<u8>> = (0..100).map(|_| vec![0u8; 8]).collect();
        let cmd = Command::new(
            CommandId::SendTrajectoryData,
            vec![4],
            CommandData::PerMessage(points),
            Timeout::Default,
            None,
            4,
        )
        .unwrap();

        let err = cmd.get_messages().unwrap_err();
        assert!(matches!(err, CommandError::UidPoolExhausted { .. }));
    }

    #[test]
    fn per_positioner_data_assigns_uids_per_target() {
        let mut map = HashMap::new();
        map.insert(4u16, vec![vec![1u8; 8], vec![2u8; 8]]);
        map.insert(5u16, vec![vec![3u8; 8]]);

        let cmd = Command::new(
            CommandId::SendTrajectoryData,
            vec![4, 5],
            CommandData::PerPositioner(map),
            Timeout::Default,
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap();

        let messages = cmd.get_messages().unwrap();
        assert_eq!(messages.len(), 3);

        let uids_4: Vec<u8> = messages
            .iter()
            .filter(|m| m.positioner_id == 4)
            .map(|m| m.uid)
            .collect();
        assert_eq!(uids_4, vec![0, 1]);
    }

    #[test]
    fn missing_per_positioner_data_is_an_error() {
        let cmd = Command::new(
            CommandId::SendTrajectoryData,
            vec![4, 5],
            CommandData::PerPositioner(HashMap::new()),
            Timeout::Default,
            None,
            DEFAULT_UID_BITS,
        )
        .unwrap();

        assert!(matches!(
            cmd.get_messages(),
            Err(CommandError::MissingData { .. })
        ));
    }
}

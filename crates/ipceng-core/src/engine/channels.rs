//! Channel management and messaging.
//!
//! A channel to peer `P` from engine `E` is the queue `/E2P.mq` (which `E`
//! writes) plus the queue `/P2E.mq` (which `E` reads). Whichever engine adds
//! its side first creates both queues; the other opens the existing ones.

use super::records::{ChannelRecord, DirectionalQueue};
use super::{ChannelInfo, Engine};
use crate::config::{ChannelOptions, QueueConfig};
use crate::error::{IpcError, Operation, Result};
use crate::naming;
use crate::platform::{IpcBackend, QueueDirection};
use crate::unwind::Unwind;
use serde::{Deserialize, Serialize};
use std::io;
use tracing::{debug, warn};

/// A message taken off an inbound queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Exactly the bytes the sender enqueued.
    pub payload: Vec<u8>,
    pub priority: u32,
}

impl Message {
    /// The payload up to the first NUL, as text.
    ///
    /// Peers sending C strings include the terminator in the payload.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end])
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl<B: IpcBackend> Engine<B> {
    /// Add a channel to `peer` and open both of its queues.
    ///
    /// Queues that don't exist yet are created with the requested geometry
    /// after it has been checked against the host ceilings. If the inbound
    /// queue can't be opened, the outbound queue is closed and unlinked and
    /// no channel is recorded.
    pub fn add_channel(&mut self, peer: &str, options: &ChannelOptions) -> Result<()> {
        let result = self.try_add_channel(peer, options);
        self.record(Operation::ChannelAdd, result)
    }

    /// Add a channel with default geometry and timeouts.
    pub fn add_channel_simple(&mut self, peer: &str) -> Result<()> {
        self.add_channel(peer, &ChannelOptions::default())
    }

    /// Close the channel to `peer`, unlink both queues and forget it.
    ///
    /// Deleting an unknown channel succeeds.
    pub fn delete_channel(&mut self, peer: &str) -> Result<()> {
        let result = self.try_delete_channel(peer);
        self.record(Operation::ChannelDelete, result)
    }

    /// Delete every channel. Keeps going past failures and reports the first.
    pub fn delete_all_channels(&mut self) -> Result<()> {
        let peers: Vec<String> = self.channels.keys().map(String::from).collect();
        let mut first_error = None;
        for peer in peers {
            if let Err(err) = self.try_delete_channel(&peer) {
                first_error.get_or_insert(err);
            }
        }
        self.record(Operation::ChannelDelete, first_error.map_or(Ok(()), Err))
    }

    /// Reopen a closed channel. Already open queues are left alone.
    pub fn open_channel(&mut self, peer: &str) -> Result<()> {
        let result = self.try_open_channel(peer);
        self.record(Operation::ChannelOpen, result)
    }

    /// Release both queue descriptors of a channel, keeping the record and
    /// the queues themselves.
    ///
    /// Closing an unknown or already closed channel succeeds.
    pub fn close_channel(&mut self, peer: &str) -> Result<()> {
        let backend = &self.backend;
        let result = match self.channels.get_mut(peer) {
            Some(record) => record.close(backend),
            None => Ok(()),
        };
        if result.is_ok() && self.logging {
            debug!("Engine {}: closed channel {}", self.name, peer);
        }
        self.record(Operation::ChannelClose, result)
    }

    /// Close every channel. Keeps going past failures and reports the first.
    pub fn close_all_channels(&mut self) -> Result<()> {
        let result = self.close_every_channel();
        self.record(Operation::ChannelClose, result)
    }

    /// Enqueue `payload` for `peer` at `priority` (0..=31).
    ///
    /// Blocks for at most the channel's send timeout when the queue is full.
    /// An OS failure is recorded with its error number as the code.
    pub fn send(&mut self, peer: &str, payload: &[u8], priority: i32) -> Result<()> {
        let result = self.try_send(peer, payload, priority);
        self.record(Operation::ChannelSend, result)
    }

    /// Send at the default priority.
    pub fn send_simple(&mut self, peer: &str, payload: &[u8]) -> Result<()> {
        let result = self.try_send_at(peer, payload, QueueConfig::DEFAULT_PRIORITY);
        self.record(Operation::ChannelSend, result)
    }

    /// Send `text` followed by a NUL terminator.
    pub fn send_text(&mut self, peer: &str, text: &str, priority: i32) -> Result<()> {
        let mut payload = Vec::with_capacity(text.len() + 1);
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        self.send(peer, &payload, priority)
    }

    /// Take the oldest highest-priority message sent by `peer`.
    ///
    /// Blocks for at most the channel's receive timeout when the queue is
    /// empty. A zero-length message is a success.
    pub fn receive(&mut self, peer: &str) -> Result<Message> {
        let result = self.try_receive(peer);
        self.record(Operation::ChannelReceive, result)
    }

    /// Receive and return only the payload.
    pub fn receive_simple(&mut self, peer: &str) -> Result<Vec<u8>> {
        self.receive(peer).map(|message| message.payload)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn has_channel(&self, peer: &str) -> bool {
        self.channels.contains(peer)
    }

    /// Peers in the order their channels were added.
    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().map(String::from).collect()
    }

    pub fn channel_info(&self, peer: &str) -> Option<ChannelInfo> {
        self.channels.get(peer).map(|record| record.info(peer))
    }

    /// Snapshot of every channel, in insertion order.
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.channels
            .iter()
            .map(|(peer, record)| record.info(peer))
            .collect()
    }

    pub(crate) fn close_every_channel(&mut self) -> Result<()> {
        let backend = &self.backend;
        let mut first_error = None;
        for record in self.channels.values_mut() {
            if let Err(err) = record.close(backend) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn try_add_channel(&mut self, peer: &str, options: &ChannelOptions) -> Result<()> {
        naming::validate_logical_name(peer)?;
        if self.channels.contains(peer) {
            return Err(IpcError::DuplicateChannel {
                peer: peer.to_string(),
            });
        }

        let max_messages = options.effective_max_messages();
        let max_message_size = options.effective_max_message_size();
        self.limits.check(max_messages, max_message_size)?;

        let mut outbound = DirectionalQueue::new(
            naming::outbound_queue_name(&self.name, peer)?,
            QueueDirection::Outbound,
            options.send_timeout(),
            max_messages,
            max_message_size,
        );
        let mut inbound = DirectionalQueue::new(
            naming::inbound_queue_name(&self.name, peer)?,
            QueueDirection::Inbound,
            options.recv_timeout(),
            max_messages,
            max_message_size,
        );

        let backend = &self.backend;
        let logging = self.logging;
        let mut unwind = Unwind::new(logging);

        outbound.open(backend)?;
        let created = outbound.name.clone();
        unwind.defer("unlink outbound queue", move || {
            if let Err(err) = backend.unlink_queue(&created) {
                if logging {
                    warn!("Failed to unlink {} during rollback: {}", created, err);
                }
            }
        });

        inbound.open(backend)?;
        unwind.commit();

        if logging {
            debug!(
                "Engine {}: added channel {} ({} -> {})",
                self.name, peer, outbound.name, inbound.name
            );
        }
        self.channels
            .insert(peer.to_string(), ChannelRecord { outbound, inbound });
        Ok(())
    }

    fn try_delete_channel(&mut self, peer: &str) -> Result<()> {
        let Some(mut record) = self.channels.remove(peer) else {
            return Ok(());
        };

        let closed = record.close(&self.backend);
        let outbound = unlink_queue(&self.backend, &record.outbound.name);
        let inbound = unlink_queue(&self.backend, &record.inbound.name);

        if self.logging {
            debug!("Engine {}: deleted channel {}", self.name, peer);
        }
        closed.and(outbound).and(inbound)
    }

    fn try_open_channel(&mut self, peer: &str) -> Result<()> {
        let backend = &self.backend;
        let record = self
            .channels
            .get_mut(peer)
            .ok_or_else(|| IpcError::ChannelNotFound {
                peer: peer.to_string(),
            })?;

        record.outbound.open(backend)?;
        if let Err(err) = record.inbound.open(backend) {
            if let Err(close_err) = record.outbound.close(backend) {
                if self.logging {
                    warn!("Failed to close {} after open failure: {}", record.outbound.name, close_err);
                }
            }
            return Err(err);
        }

        if self.logging {
            debug!("Engine {}: opened channel {}", self.name, peer);
        }
        Ok(())
    }

    fn channel(&self, peer: &str) -> Result<&ChannelRecord<B::Queue>> {
        self.channels
            .get(peer)
            .ok_or_else(|| IpcError::ChannelNotFound {
                peer: peer.to_string(),
            })
    }

    fn try_send(&self, peer: &str, payload: &[u8], priority: i32) -> Result<()> {
        let priority = check_priority(priority)?;
        self.try_send_at(peer, payload, priority)
    }

    fn try_send_at(&self, peer: &str, payload: &[u8], priority: u32) -> Result<()> {
        let record = self.channel(peer)?;
        let queue = record
            .outbound
            .handle()
            .ok_or_else(|| IpcError::ChannelClosed {
                peer: peer.to_string(),
            })?;

        self.backend
            .send(queue, payload, priority, record.outbound.timeout.as_duration())
            .map_err(|source| IpcError::Send {
                peer: peer.to_string(),
                source,
            })
    }

    fn try_receive(&self, peer: &str) -> Result<Message> {
        let record = self.channel(peer)?;
        let queue = record
            .inbound
            .handle()
            .ok_or_else(|| IpcError::ChannelClosed {
                peer: peer.to_string(),
            })?;

        let mut buf = vec![0u8; record.inbound.spec.max_message_size];
        let (len, priority) = self
            .backend
            .receive(queue, &mut buf, record.inbound.timeout.as_duration())
            .map_err(|source| IpcError::Receive {
                peer: peer.to_string(),
                source,
            })?;
        buf.truncate(len);

        Ok(Message {
            payload: buf,
            priority,
        })
    }
}

fn check_priority(priority: i32) -> Result<u32> {
    u32::try_from(priority)
        .ok()
        .filter(|p| (QueueConfig::PRIORITY_MIN..=QueueConfig::PRIORITY_MAX).contains(p))
        .ok_or(IpcError::PriorityOutOfRange {
            priority,
            min: QueueConfig::PRIORITY_MIN,
            max: QueueConfig::PRIORITY_MAX,
        })
}

/// Unlink a queue, treating an already missing queue as done.
fn unlink_queue<B: IpcBackend>(backend: &B, name: &str) -> Result<()> {
    match backend.unlink_queue(name) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(IpcError::QueueUnlink {
            name: name.to_string(),
            source,
        }),
    }
}

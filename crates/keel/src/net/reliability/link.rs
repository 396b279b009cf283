use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::{Bytes, BytesMut};

use super::cipher::DatagramCipher;
use super::frame::{
    AckInfo, DATAGRAM_HEADER_MAX, Datagram, FRAME_HEADER_MAX, LinkError, MessageFrame, PLAIN_TAG,
    SEALED_TAG, SplitHeader,
};
use super::ordering::{InboundChannels, OutboundChannels};
use super::tracking::{AckTracker, ReceiveTracker, ReceivedWindow};
use super::{DatagramSink, ORDERING_CHANNELS, Priority, Reliability, ReliabilityLayer};
use crate::net::address::PeerAddress;
use crate::net::clock::TimeMs;
use crate::net::protocol::{MAXIMUM_MTU, MINIMUM_MTU};
use crate::net::security::SessionKey;
use crate::net::stats::LinkStatistics;

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const UDP_HEADER_LEN: usize = 28;
/// Counter, authentication tag and worst-case block padding.
const SEAL_OVERHEAD: usize = 8 + 16 + 16;
const MAX_TRACKED_DATAGRAMS: usize = 512;
const MAX_SPLIT_PARTS: u32 = 8_192;
const MAX_SPLITS_IN_FLIGHT: usize = 64;
/// Upper bound on what unfinished splits may claim, counting each part at full MTU.
const MAX_SPLIT_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug)]
struct ResendEntry {
    frame: MessageFrame,
    first_sent_at: TimeMs,
    next_resend_at: TimeMs,
}

#[derive(Debug)]
struct SplitAssembly {
    parts: Vec<Option<Bytes>>,
    received: u32,
    reliability: Reliability,
    ordering: Option<(u8, u32)>,
    started_at: TimeMs,
}

impl SplitAssembly {
    fn claimed(&self) -> usize {
        claimed_bytes(self.parts.len() as u32)
    }
}

fn claimed_bytes(count: u32) -> usize {
    count as usize * MAXIMUM_MTU
}

/// Datagram-sequenced reliable transport for one remote peer.
///
/// Reliable frames keep their message number across resends; each datagram
/// gets a fresh sequence number so acks always refer to a single transmission.
#[derive(Debug)]
pub struct ReliableLink {
    mtu: usize,
    timeout_ms: u64,
    outgoing: [VecDeque<MessageFrame>; Priority::COUNT],
    resend: BTreeMap<u32, ResendEntry>,
    ack_tracker: AckTracker,
    receive_tracker: ReceiveTracker,
    received_messages: ReceivedWindow,
    acks_owed: bool,
    next_sequence: u32,
    next_message_number: u32,
    next_split_id: u16,
    outbound_channels: OutboundChannels,
    inbound_channels: InboundChannels,
    splits: HashMap<u16, SplitAssembly>,
    split_bytes: usize,
    delivered: VecDeque<Bytes>,
    cipher: Option<DatagramCipher>,
    /// Set once a sealed datagram opens; plaintext is refused from then on.
    inbound_sealed: bool,
    dead: bool,
    stats: LinkStatistics,
}

impl Default for ReliableLink {
    fn default() -> Self {
        Self::new(crate::net::protocol::DEFAULT_MTU, DEFAULT_TIMEOUT_MS)
    }
}

impl ReliableLink {
    pub fn new(mtu: usize, timeout_ms: u64) -> Self {
        Self {
            mtu: mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU),
            timeout_ms,
            outgoing: Default::default(),
            resend: BTreeMap::new(),
            ack_tracker: AckTracker::new(MAX_TRACKED_DATAGRAMS),
            receive_tracker: ReceiveTracker::new(),
            received_messages: ReceivedWindow::new(),
            acks_owed: false,
            next_sequence: 0,
            next_message_number: 0,
            next_split_id: 0,
            outbound_channels: OutboundChannels::default(),
            inbound_channels: InboundChannels::new(),
            splits: HashMap::new(),
            split_bytes: 0,
            delivered: VecDeque::new(),
            cipher: None,
            inbound_sealed: false,
            dead: false,
            stats: LinkStatistics::default(),
        }
    }

    /// Bytes of frames that fit one datagram at the current MTU.
    fn datagram_budget(&self) -> usize {
        self.mtu - UDP_HEADER_LEN - DATAGRAM_HEADER_MAX - SEAL_OVERHEAD - 1
    }

    fn split_part_size(&self) -> usize {
        self.datagram_budget() - FRAME_HEADER_MAX
    }

    fn next_message_number(&mut self, reliability: Reliability) -> Option<u32> {
        reliability.is_reliable().then(|| {
            let number = self.next_message_number;
            self.next_message_number = self.next_message_number.wrapping_add(1);
            number
        })
    }

    fn push_frame(
        &mut self,
        frame: MessageFrame,
        batch: &mut Vec<MessageFrame>,
        batch_len: &mut usize,
        sink: &mut dyn DatagramSink,
        peer: PeerAddress,
        now: TimeMs,
    ) {
        let len = frame.encoded_len();
        if !batch.is_empty() && *batch_len + len > self.datagram_budget() {
            self.flush(std::mem::take(batch), sink, peer, now);
            *batch_len = 0;
        }
        *batch_len += len;
        batch.push(frame);
    }

    fn flush(
        &mut self,
        frames: Vec<MessageFrame>,
        sink: &mut dyn DatagramSink,
        peer: PeerAddress,
        now: TimeMs,
    ) {
        let acks = (self.acks_owed && self.receive_tracker.has_received()).then(|| {
            let (ack, bitfield) = self.receive_tracker.ack_data();
            AckInfo { ack, bitfield }
        });
        self.acks_owed = false;

        let sequence = (!frames.is_empty()).then(|| {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            sequence
        });
        if acks.is_none() && sequence.is_none() {
            return;
        }

        if let Some(sequence) = sequence {
            let numbers = frames.iter().filter_map(|f| f.message_number).collect();
            self.ack_tracker.track_datagram(sequence, numbers, now);
        }

        let datagram = Datagram {
            acks,
            sequence,
            frames,
        };
        let bytes = match self.cipher.as_mut() {
            Some(cipher) => match cipher.seal(&datagram.encode_body()) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("failed to seal datagram for {}: {}", peer, e);
                    return;
                }
            },
            None => datagram.encode_plain(),
        };

        self.stats.datagrams_sent += 1;
        self.stats.bytes_sent += bytes.len() as u64;
        if acks.is_some() {
            self.stats.acks_sent += 1;
        }
        sink.send_datagram(&bytes, peer);
    }

    fn open(&mut self, datagram: &[u8]) -> Result<Datagram, LinkError> {
        match datagram.first() {
            Some(&SEALED_TAG) => {
                let cipher = self.cipher.as_ref().ok_or(LinkError::NoKey)?;
                let body = cipher.open(datagram)?;
                let decoded = Datagram::decode_body(&body)?;
                self.inbound_sealed = true;
                Ok(decoded)
            }
            Some(&PLAIN_TAG) if self.inbound_sealed => Err(LinkError::Downgrade),
            _ => Datagram::decode_plain(datagram),
        }
    }

    /// Refuses a datagram whose frames would grow inbound state past its limits.
    ///
    /// A refused datagram is not acked, so a well-behaved sender resends it.
    fn admit(&self, frames: &[MessageFrame]) -> Result<(), LinkError> {
        let mut fresh = HashSet::new();
        let mut claimed = 0;

        for frame in frames {
            if let Some(number) = frame.message_number {
                if self.received_messages.contains(number) {
                    continue;
                }
                if !self.received_messages.admits(number) {
                    return Err(LinkError::OutOfWindow);
                }
            }
            if let Some((channel, index)) = frame.ordering {
                if frame.reliability.is_ordered()
                    && !self.inbound_channels.admits_ordered(channel, index)
                {
                    return Err(LinkError::OutOfWindow);
                }
            }
            let Some(split) = frame.split else {
                continue;
            };
            if split.count == 0 || split.count > MAX_SPLIT_PARTS || split.index >= split.count {
                return Err(LinkError::BadSplit);
            }
            match self.splits.get(&split.id) {
                Some(assembly) if assembly.parts.len() != split.count as usize => {
                    return Err(LinkError::BadSplit);
                }
                Some(_) => {}
                None => {
                    if fresh.insert(split.id) {
                        claimed += claimed_bytes(split.count);
                    }
                }
            }
        }

        if self.splits.len() + fresh.len() > MAX_SPLITS_IN_FLIGHT
            || self.split_bytes + claimed > MAX_SPLIT_BYTES
        {
            return Err(LinkError::SplitLimit);
        }
        Ok(())
    }

    fn expire_splits(&mut self, now: TimeMs) {
        let timeout = self.timeout_ms;
        let before = self.splits.len();
        self.splits
            .retain(|_, assembly| now.saturating_sub(assembly.started_at) < timeout);
        if self.splits.len() != before {
            log::trace!("expired {} unfinished splits", before - self.splits.len());
            self.split_bytes = self.splits.values().map(SplitAssembly::claimed).sum();
        }
    }

    fn receive_frame(&mut self, frame: MessageFrame, now: TimeMs) {
        if let Some(number) = frame.message_number {
            if !self.received_messages.insert(number) {
                self.stats.duplicate_messages_received += 1;
                return;
            }
        }

        let (payload, reliability, ordering) = match frame.split {
            Some(split) => match self.reassemble(split, frame, now) {
                Some(whole) => whole,
                None => return,
            },
            None => (frame.payload, frame.reliability, frame.ordering),
        };

        match ordering {
            Some((channel, index)) if reliability.is_ordered() => {
                let mut released = Vec::new();
                self.inbound_channels
                    .accept_ordered(channel, index, payload, &mut released);
                self.delivered.extend(released);
            }
            Some((channel, index)) if reliability.is_sequenced() => {
                if self.inbound_channels.accept_sequenced(channel, index) {
                    self.delivered.push_back(payload);
                }
            }
            _ => self.delivered.push_back(payload),
        }
    }

    fn reassemble(
        &mut self,
        split: SplitHeader,
        frame: MessageFrame,
        now: TimeMs,
    ) -> Option<(Bytes, Reliability, Option<(u8, u32)>)> {
        if !self.splits.contains_key(&split.id) {
            self.split_bytes += claimed_bytes(split.count);
        }
        let assembly = self.splits.entry(split.id).or_insert_with(|| SplitAssembly {
            parts: vec![None; split.count as usize],
            received: 0,
            reliability: frame.reliability,
            ordering: frame.ordering,
            started_at: now,
        });
        if assembly.parts.len() != split.count as usize {
            return None;
        }

        let slot = assembly.parts.get_mut(split.index as usize)?;
        if slot.is_none() {
            *slot = Some(frame.payload);
            assembly.received += 1;
        }
        if assembly.received < split.count {
            return None;
        }

        let assembly = self.splits.remove(&split.id)?;
        self.split_bytes = self.split_bytes.saturating_sub(assembly.claimed());
        let total = assembly.parts.iter().flatten().map(Bytes::len).sum();
        let mut whole = BytesMut::with_capacity(total);
        for part in assembly.parts.into_iter().flatten() {
            whole.extend_from_slice(&part);
        }
        Some((whole.freeze(), assembly.reliability, assembly.ordering))
    }
}

impl ReliabilityLayer for ReliableLink {
    fn send(
        &mut self,
        data: Vec<u8>,
        priority: Priority,
        reliability: Reliability,
        channel: u8,
        _now: TimeMs,
    ) -> bool {
        if data.is_empty() || channel >= ORDERING_CHANNELS {
            return false;
        }

        let part_size = self.split_part_size();
        let data = Bytes::from(data);
        let is_split = data.len() > part_size;
        let count = data.len().div_ceil(part_size);
        if count > MAX_SPLIT_PARTS as usize {
            log::warn!("message of {} bytes exceeds the split limit", data.len());
            return false;
        }

        let reliability = if is_split {
            reliability.upgraded_for_split()
        } else {
            reliability
        };
        let ordering = if reliability.is_ordered() {
            Some((channel, self.outbound_channels.next_ordered(channel)))
        } else if reliability.is_sequenced() {
            Some((channel, self.outbound_channels.next_sequenced(channel)))
        } else {
            None
        };

        let queue = priority.index();
        if is_split {
            let id = self.next_split_id;
            self.next_split_id = self.next_split_id.wrapping_add(1);
            for index in 0..count {
                let start = index * part_size;
                let end = (start + part_size).min(data.len());
                let frame = MessageFrame {
                    reliability,
                    message_number: self.next_message_number(reliability),
                    ordering,
                    split: Some(SplitHeader {
                        id,
                        index: index as u32,
                        count: count as u32,
                    }),
                    payload: data.slice(start..end),
                };
                self.outgoing[queue].push_back(frame);
            }
        } else {
            let frame = MessageFrame {
                reliability,
                message_number: self.next_message_number(reliability),
                ordering,
                split: None,
                payload: data,
            };
            self.outgoing[queue].push_back(frame);
        }

        self.stats.messages_sent += 1;
        true
    }

    fn update(&mut self, sink: &mut dyn DatagramSink, peer: PeerAddress, mtu: usize, now: TimeMs) {
        self.mtu = mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);

        if !self.dead
            && self
                .resend
                .values()
                .any(|e| now.saturating_sub(e.first_sent_at) >= self.timeout_ms)
        {
            log::debug!("link to {} dead: reliable data unacked for {}ms", peer, self.timeout_ms);
            self.dead = true;
        }
        self.expire_splits(now);

        let rto = self.ack_tracker.rto_ms();
        let mut batch = Vec::new();
        let mut batch_len = 0;

        let due: Vec<u32> = self
            .resend
            .iter()
            .filter(|(_, e)| e.next_resend_at <= now)
            .map(|(&number, _)| number)
            .collect();
        for number in due {
            let Some(entry) = self.resend.get_mut(&number) else {
                continue;
            };
            entry.next_resend_at = now + rto;
            let frame = entry.frame.clone();
            self.stats.messages_resent += 1;
            self.push_frame(frame, &mut batch, &mut batch_len, sink, peer, now);
        }

        for queue in 0..Priority::COUNT {
            while let Some(frame) = self.outgoing[queue].pop_front() {
                if let Some(number) = frame.message_number {
                    self.resend.insert(
                        number,
                        ResendEntry {
                            frame: frame.clone(),
                            first_sent_at: now,
                            next_resend_at: now + rto,
                        },
                    );
                }
                self.push_frame(frame, &mut batch, &mut batch_len, sink, peer, now);
            }
        }

        if !batch.is_empty() || self.acks_owed {
            self.flush(batch, sink, peer, now);
        }
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        let payload = self.delivered.pop_front()?;
        self.stats.messages_received += 1;
        Some(payload.to_vec())
    }

    fn handle_incoming_datagram(&mut self, datagram: &[u8], now: TimeMs) -> bool {
        let decoded = match self.open(datagram) {
            Ok(decoded) => decoded,
            Err(e) => {
                log::trace!("rejected datagram of {} bytes: {}", datagram.len(), e);
                return false;
            }
        };

        self.stats.datagrams_received += 1;
        self.stats.bytes_received += datagram.len() as u64;

        if let Some(acks) = decoded.acks {
            for number in self.ack_tracker.process_ack(acks.ack, acks.bitfield, now) {
                self.resend.remove(&number);
            }
        }

        if let Some(sequence) = decoded.sequence {
            if let Err(e) = self.admit(&decoded.frames) {
                log::debug!("refused datagram {}: {}", sequence, e);
                // authenticated traffic is throttled, not reported as tampering
                return datagram.first() == Some(&SEALED_TAG);
            }
            self.acks_owed = true;
            if !self.receive_tracker.record_received(sequence) {
                return true;
            }
            for frame in decoded.frames {
                self.receive_frame(frame, now);
            }
        }
        true
    }

    fn is_dead_connection(&self) -> bool {
        self.dead
    }

    fn is_data_waiting(&self) -> bool {
        self.outgoing.iter().any(|q| !q.is_empty())
    }

    fn are_acks_waiting(&self) -> bool {
        !self.resend.is_empty()
    }

    fn set_encryption_key(&mut self, key: Option<SessionKey>) {
        self.cipher = key.as_ref().map(DatagramCipher::new);
        if self.cipher.is_none() {
            self.inbound_sealed = false;
        }
    }

    fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    fn set_timeout_time(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    fn statistics(&self) -> LinkStatistics {
        let mut stats = self.stats.clone();
        stats.messages_waiting = self.outgoing.iter().map(VecDeque::len).sum();
        stats.messages_unacked = self.resend.len();
        stats.rtt_ms = self.ack_tracker.srtt();
        stats.rtt_variance = self.ack_tracker.rtt_var();
        if stats.messages_sent > 0 {
            stats.packet_loss_percent =
                stats.messages_resent as f32 / stats.messages_sent.max(1) as f32 * 100.0;
        }
        stats
    }
}

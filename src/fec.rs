//! Forward error correction over shard groups.
//!
//! Outbound packets become *data shards*; every `data_shards` of them the encoder
//! emits `parity_shards` *parity shards*, so a receiver can reconstruct any
//! `data_shards` out of the `data_shards + parity_shards` group. Each shard carries a
//! 6-byte header at the FEC offset:
//!
//! ```ascii
//! 0: shard sequence id (u32 LE, monotonic per session)
//! 4: shard type (u16 LE): 0x00F1 data, 0x00F2 parity
//! ```
//!
//! The type tags are chosen so they can never collide with the 16-bit word formed by
//! an ARQ command byte (0x51..0x54) and fragment count at the same offset - that word
//! is how the receive path tells FEC-framed packets from bare ARQ frames.
//!
//! The erasure code runs over the region *after* the header, which starts with a
//! 2-byte little-endian length prefix covering the prefix itself plus the ARQ frame.
//! Shards of one group are zero-padded to the group's largest shard before coding, so
//! a reconstructed shard always starts with a valid length prefix - zero for padding
//! shards, which the input path discards.
//!
//! A group that does not fill up within [`MAX_ENCODE_LATENCY`] is sealed early: the
//! missing data slots are treated as zero shards and their sequence ids are skipped,
//! keeping parity ids aligned to the group grid.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, trace};

use crate::buffers::{pool, PacketBuf};

/// size of the shard header
pub const FEC_HEADER_SIZE: usize = 6;

/// shard header plus the length prefix of the coded region
pub const FEC_HEADER_SIZE_PLUS_2: usize = FEC_HEADER_SIZE + 2;

/// shard type tag for data shards
pub const TYPE_DATA: u16 = 0x00F1;

/// shard type tag for parity shards
pub const TYPE_PARITY: u16 = 0x00F2;

/// how long an unfilled shard group may wait before it is sealed with zero padding
pub const MAX_ENCODE_LATENCY: Duration = Duration::from_millis(500);

/// shard groups the decoder keeps around before evicting the oldest
const GROUP_WINDOW: usize = 4;

fn write_header(packet: &mut [u8], seq: u32, flag: u16) {
    packet[..4].copy_from_slice(&seq.to_le_bytes());
    packet[4..6].copy_from_slice(&flag.to_le_bytes());
}

/// Shard-group parity producer for the outbound pipeline.
pub struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    codec: ReedSolomon,

    /// bytes reserved in front of the shard header (the crypt header, when sealing is on)
    header_offset: usize,
    /// offset of the coded region (header offset + shard header)
    payload_offset: usize,

    next_seq: u32,
    /// coded regions of the current group's data shards
    cache: Vec<Vec<u8>>,
    max_size: usize,
    group_opened: Option<Instant>,
}

impl FecEncoder {
    pub fn new(data_shards: usize, parity_shards: usize, header_offset: usize) -> FecEncoder {
        FecEncoder {
            data_shards,
            parity_shards,
            codec: ReedSolomon::new(data_shards, parity_shards)
                .expect("shard counts are validated at configuration time"),
            header_offset,
            payload_offset: header_offset + FEC_HEADER_SIZE,
            next_seq: 0,
            cache: Vec::with_capacity(data_shards),
            max_size: 0,
            group_opened: None,
        }
    }

    /// Frame `packet` as a data shard in place and return any parity packets that
    ///  became due. `packet` must hold the ARQ frame at `header_offset + 8` with the
    ///  shard header and length prefix space reserved in front.
    pub fn encode(&mut self, packet: &mut PacketBuf) -> Vec<PacketBuf> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let buf = packet.as_mut();
        write_header(&mut buf[self.header_offset..], seq, TYPE_DATA);
        let region_len = buf.len() - self.payload_offset;
        buf[self.payload_offset..self.payload_offset + 2]
            .copy_from_slice(&(region_len as u16).to_le_bytes());

        self.cache.push(buf[self.payload_offset..].to_vec());
        self.max_size = self.max_size.max(region_len);
        if self.group_opened.is_none() {
            self.group_opened = Some(Instant::now());
        }

        let group_full = self.cache.len() == self.data_shards;
        let overdue = self
            .group_opened
            .map(|t| t.elapsed() > MAX_ENCODE_LATENCY)
            .unwrap_or(false);

        if group_full || overdue {
            self.seal_group(group_full)
        } else {
            Vec::new()
        }
    }

    fn seal_group(&mut self, group_full: bool) -> Vec<PacketBuf> {
        if !group_full {
            trace!(
                "sealing shard group early with {} of {} data shards",
                self.cache.len(),
                self.data_shards
            );
            // skip the sequence ids of the unused data slots so parity ids stay
            //  aligned to the group grid
            let skipped = (self.data_shards - self.cache.len()) as u32;
            self.next_seq = self.next_seq.wrapping_add(skipped);
            self.cache.resize(self.data_shards, Vec::new());
        }

        let max_size = self.max_size;
        for shard in &mut self.cache {
            shard.resize(max_size, 0);
        }

        let mut parity_packets = Vec::with_capacity(self.parity_shards);
        for _ in 0..self.parity_shards {
            let seq = self.next_seq;
            self.next_seq = self.next_seq.wrapping_add(1);

            let mut packet = pool().get();
            packet.set_len(self.payload_offset + max_size);
            let buf = packet.as_mut();
            write_header(&mut buf[self.header_offset..], seq, TYPE_PARITY);
            buf[self.payload_offset..].fill(0);
            parity_packets.push(packet);
        }

        {
            let data_refs: Vec<&[u8]> = self.cache.iter().map(|s| s.as_slice()).collect();
            let mut parity_refs: Vec<&mut [u8]> = parity_packets
                .iter_mut()
                .map(|p| {
                    let off = self.payload_offset;
                    &mut p.as_mut()[off..]
                })
                .collect();
            self.codec
                .encode_sep(&data_refs, &mut parity_refs)
                .expect("shards of one group are padded to equal size");
        }

        self.cache.clear();
        self.max_size = 0;
        self.group_opened = None;
        parity_packets
    }
}

struct FecGroup {
    base: u32,
    /// coded regions, indexed by position in the group
    shards: Vec<Option<Vec<u8>>>,
    max_size: usize,
    /// the group has either delivered its reconstruction or needs none
    settled: bool,
}

/// Parity-assisted recovery for the inbound pipeline.
pub struct FecDecoder {
    data_shards: usize,
    shard_size: usize,
    codec: ReedSolomon,
    groups: VecDeque<FecGroup>,
}

impl FecDecoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> FecDecoder {
        FecDecoder {
            data_shards,
            shard_size: data_shards + parity_shards,
            codec: ReedSolomon::new(data_shards, parity_shards)
                .expect("shard counts are validated at configuration time"),
            groups: VecDeque::new(),
        }
    }

    /// Feed one FEC-framed packet (starting at its shard header). Returns any data
    ///  shard regions the group can now reconstruct, each beginning with its 2-byte
    ///  length prefix.
    pub fn decode(&mut self, packet: &[u8]) -> Vec<PacketBuf> {
        if packet.len() < FEC_HEADER_SIZE {
            return Vec::new();
        }
        let seq = u32::from_le_bytes(packet[..4].try_into().expect("seq field is 4 bytes"));
        let region = &packet[FEC_HEADER_SIZE..];

        let base = seq - seq % self.shard_size as u32;
        let idx = (seq - base) as usize;

        let pos = match self.groups.iter().position(|g| g.base == base) {
            Some(pos) => pos,
            None => {
                if self.groups.len() >= GROUP_WINDOW {
                    if let Some(g) = self.groups.pop_front() {
                        if !g.settled {
                            debug!("evicting unsettled shard group at base {}", g.base);
                        }
                    }
                }
                self.groups.push_back(FecGroup {
                    base,
                    shards: (0..self.shard_size).map(|_| None).collect(),
                    max_size: 0,
                    settled: false,
                });
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[pos];

        if group.settled || group.shards[idx].is_some() {
            return Vec::new();
        }
        group.shards[idx] = Some(region.to_vec());
        group.max_size = group.max_size.max(region.len());

        let present = group.shards.iter().filter(|s| s.is_some()).count();
        let data_present = group.shards[..self.data_shards]
            .iter()
            .filter(|s| s.is_some())
            .count();

        if data_present == self.data_shards {
            group.settled = true;
            return Vec::new();
        }
        if present < self.data_shards {
            return Vec::new();
        }

        // enough shards for reconstruction; equalize sizes first
        let max_size = group.max_size;
        let missing_data: Vec<usize> = (0..self.data_shards)
            .filter(|&i| group.shards[i].is_none())
            .collect();
        for shard in group.shards.iter_mut().flatten() {
            shard.resize(max_size, 0);
        }

        let recovers = match self.codec.reconstruct(&mut group.shards) {
            Ok(()) => missing_data
                .into_iter()
                .map(|i| {
                    let shard = group.shards[i].as_ref().expect("shard was reconstructed");
                    let mut packet = pool().get();
                    packet.put_slice(shard);
                    packet
                })
                .collect(),
            Err(e) => {
                debug!("shard group reconstruction failed: {}", e);
                Vec::new()
            }
        };
        group.settled = true;
        recovers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet(encoder: &mut FecEncoder, frame: &[u8]) -> PacketBuf {
        let mut packet = pool().get();
        packet.set_len(encoder.header_offset + FEC_HEADER_SIZE_PLUS_2);
        packet.put_slice(frame);
        packet
    }

    fn feed(decoder: &mut FecDecoder, packet: &PacketBuf) -> Vec<PacketBuf> {
        decoder.decode(packet.as_ref())
    }

    #[test]
    fn test_header_roundtrip() {
        let mut buf = [0u8; FEC_HEADER_SIZE];
        write_header(&mut buf, 0x01020304, TYPE_PARITY);
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()), 0x01020304);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), TYPE_PARITY);
    }

    #[test]
    fn test_parity_emitted_when_group_fills() {
        let mut encoder = FecEncoder::new(3, 2, 0);

        let mut p0 = data_packet(&mut encoder, b"alpha");
        let mut p1 = data_packet(&mut encoder, b"bravo-longer");
        let mut p2 = data_packet(&mut encoder, b"charlie");

        assert!(encoder.encode(&mut p0).is_empty());
        assert!(encoder.encode(&mut p1).is_empty());
        let parity = encoder.encode(&mut p2);
        assert_eq!(parity.len(), 2);

        // parity shards span the group's largest coded region
        let expected_len = FEC_HEADER_SIZE + 2 + b"bravo-longer".len();
        assert!(parity.iter().all(|p| p.len() == expected_len));

        // sequence ids form one contiguous group
        for (i, p) in [&p0, &p1, &p2].into_iter().enumerate() {
            assert_eq!(u32::from_le_bytes(p.as_ref()[..4].try_into().unwrap()), i as u32);
        }
        assert_eq!(u32::from_le_bytes(parity[0].as_ref()[..4].try_into().unwrap()), 3);
        assert_eq!(u32::from_le_bytes(parity[1].as_ref()[..4].try_into().unwrap()), 4);
    }

    #[test]
    fn test_decoder_reconstructs_lost_shard() {
        let mut encoder = FecEncoder::new(3, 2, 0);
        let mut decoder = FecDecoder::new(3, 2);

        let mut p0 = data_packet(&mut encoder, b"first frame");
        let mut p1 = data_packet(&mut encoder, b"second");
        let mut p2 = data_packet(&mut encoder, b"third frame here");

        encoder.encode(&mut p0);
        encoder.encode(&mut p1);
        let parity = encoder.encode(&mut p2);

        // p1 is lost in transit
        assert!(feed(&mut decoder, &p0).is_empty());
        assert!(feed(&mut decoder, &p2).is_empty());
        let recovered = feed(&mut decoder, &parity[0]);

        assert_eq!(recovered.len(), 1);
        let shard = recovered[0].as_ref();
        let sz = u16::from_le_bytes(shard[..2].try_into().unwrap()) as usize;
        assert_eq!(&shard[2..sz], b"second");
    }

    #[test]
    fn test_decoder_recovers_two_of_two_lost() {
        let mut encoder = FecEncoder::new(3, 2, 0);
        let mut decoder = FecDecoder::new(3, 2);

        let mut packets: Vec<PacketBuf> = [b"aa".as_slice(), b"bbbb", b"cccccc"]
            .iter()
            .map(|frame| data_packet(&mut encoder, frame))
            .collect();

        let mut parity = Vec::new();
        for p in &mut packets {
            parity = encoder.encode(p);
        }

        // only one data shard and both parity shards arrive
        assert!(feed(&mut decoder, &packets[1]).is_empty());
        assert!(feed(&mut decoder, &parity[0]).is_empty());
        let recovered = feed(&mut decoder, &parity[1]);

        let mut frames: Vec<Vec<u8>> = recovered
            .iter()
            .map(|r| {
                let shard = r.as_ref();
                let sz = u16::from_le_bytes(shard[..2].try_into().unwrap()) as usize;
                shard[2..sz].to_vec()
            })
            .collect();
        frames.sort();
        assert_eq!(frames, vec![b"aa".to_vec(), b"cccccc".to_vec()]);
    }

    #[test]
    fn test_no_reconstruction_without_enough_shards() {
        let mut encoder = FecEncoder::new(3, 1, 0);
        let mut decoder = FecDecoder::new(3, 1);

        let mut packets: Vec<PacketBuf> = [b"one".as_slice(), b"two", b"three"]
            .iter()
            .map(|frame| data_packet(&mut encoder, frame))
            .collect();
        let mut parity = Vec::new();
        for p in &mut packets {
            parity = encoder.encode(p);
        }

        // two data shards lost, one parity cannot bridge the gap
        assert!(feed(&mut decoder, &packets[0]).is_empty());
        assert!(feed(&mut decoder, &parity[0]).is_empty());
    }

    #[test]
    fn test_duplicate_shards_ignored() {
        let mut encoder = FecEncoder::new(2, 1, 0);
        let mut decoder = FecDecoder::new(2, 1);

        let mut p0 = data_packet(&mut encoder, b"dup");
        let mut p1 = data_packet(&mut encoder, b"dup2");
        encoder.encode(&mut p0);
        let parity = encoder.encode(&mut p1);

        assert!(feed(&mut decoder, &p0).is_empty());
        assert!(feed(&mut decoder, &p0).is_empty());
        // p1 lost; parity recovers exactly once
        let recovered = feed(&mut decoder, &parity[0]);
        assert_eq!(recovered.len(), 1);
        assert!(feed(&mut decoder, &parity[0]).is_empty());
    }

    #[test]
    fn test_early_seal_skips_sequence_ids() {
        let mut encoder = FecEncoder::new(5, 1, 0);

        let mut p0 = data_packet(&mut encoder, b"lonely");
        assert!(encoder.encode(&mut p0).is_empty());

        encoder.group_opened = Some(Instant::now() - MAX_ENCODE_LATENCY * 2);
        let mut p1 = data_packet(&mut encoder, b"straggler");
        let parity = encoder.encode(&mut p1);

        assert_eq!(parity.len(), 1);
        // parity lands on the group-grid slot even though three data slots went unused
        assert_eq!(u32::from_le_bytes(parity[0].as_ref()[..4].try_into().unwrap()), 5);
        // and the next data shard opens the following group
        let mut p2 = data_packet(&mut encoder, b"next group");
        encoder.encode(&mut p2);
        assert_eq!(u32::from_le_bytes(p2.as_ref()[..4].try_into().unwrap()), 6);
    }

    #[test]
    fn test_recovered_zero_padding_has_zero_prefix() {
        let mut encoder = FecEncoder::new(3, 2, 0);
        let mut decoder = FecDecoder::new(3, 2);

        let mut p0 = data_packet(&mut encoder, b"real data");
        assert!(encoder.encode(&mut p0).is_empty());

        encoder.group_opened = Some(Instant::now() - MAX_ENCODE_LATENCY * 2);
        let mut p1 = data_packet(&mut encoder, b"second real");
        let parity = encoder.encode(&mut p1);
        assert_eq!(parity.len(), 2);

        // p1 lost; the virtual zero shard is also "lost" (it was never sent)
        assert!(feed(&mut decoder, &p0).is_empty());
        assert!(feed(&mut decoder, &parity[0]).is_empty());
        let recovered = feed(&mut decoder, &parity[1]);

        // both the lost shard and the padding shard come back; padding carries a
        //  zero length prefix, which the input path discards
        let mut real = 0;
        let mut padding = 0;
        for r in &recovered {
            let shard = r.as_ref();
            let sz = u16::from_le_bytes(shard[..2].try_into().unwrap()) as usize;
            if sz >= 2 {
                assert_eq!(&shard[2..sz], b"second real");
                real += 1;
            } else {
                padding += 1;
            }
        }
        assert_eq!((real, padding), (1, 1));
    }
}

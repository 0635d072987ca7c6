use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use bytes_varint::{VarIntSupport, VarIntSupportMut};

bitflags! {
    /// Presence byte at the start of every serialized packet.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct PacketFlags: u8 {
        const HANDSHAKE  = 1;
        const CLOSE      = 1 << 1;
        const DATA       = 1 << 2;
        const ACKS       = 1 << 3;
        const ACK_COUNTS = 1 << 4;
        const BYTES_READ = 1 << 5;
    }
}

/// One wire packet. Exactly one of {handshake, close, data/ack/bytes-read} is meaningful per
///  instance.
///
/// Wire layout (all integers varint encoded):
/// ```ascii
/// 0: flags (u8) - field presence, see PacketFlags
/// *: sequence id (u32) - always present, 0 for packets without sequenced payload
/// *: [DATA]       payload length + payload bytes
/// *: [ACKS]       run count n, n * run start; iff ACK_COUNTS also n * run length.
///                 The count list is omitted on the wire iff every run has length 1.
/// *: [BYTES_READ] cumulative bytes the sender has read (u64)
/// *: [HANDSHAKE]  advertised window size (u32), mtu (u32),
///                 client id count + (length + utf8 bytes) per id
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// 0 = control packet without sequenced payload
    pub sequence_id: u32,
    pub data: Vec<u8>,
    pub ack_start_seqs: Vec<u32>,
    /// empty iff every ack run has length 1
    pub ack_seq_counts: Vec<u32>,
    pub bytes_read: u64,
    /// handshake only
    pub client_ids: Vec<String>,
    /// handshake only: advertised receive window in bytes
    pub window_size: u32,
    /// handshake only
    pub mtu: u32,
    pub is_close: bool,
    pub is_handshake: bool,
}

impl Packet {
    fn flags(&self) -> PacketFlags {
        let mut flags = PacketFlags::empty();
        if self.is_handshake {
            flags |= PacketFlags::HANDSHAKE;
        }
        if self.is_close {
            flags |= PacketFlags::CLOSE;
        }
        if !self.data.is_empty() {
            flags |= PacketFlags::DATA;
        }
        if !self.ack_start_seqs.is_empty() {
            flags |= PacketFlags::ACKS;
        }
        if !self.ack_seq_counts.is_empty() {
            flags |= PacketFlags::ACK_COUNTS;
        }
        if self.bytes_read > 0 {
            flags |= PacketFlags::BYTES_READ;
        }
        flags
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let flags = self.flags();
        buf.put_u8(flags.bits());
        buf.put_u32_varint(self.sequence_id);

        if flags.contains(PacketFlags::DATA) {
            buf.put_usize_varint(self.data.len());
            buf.put_slice(&self.data);
        }
        if flags.contains(PacketFlags::ACKS) {
            buf.put_usize_varint(self.ack_start_seqs.len());
            for &start in &self.ack_start_seqs {
                buf.put_u32_varint(start);
            }
            for &count in &self.ack_seq_counts {
                buf.put_u32_varint(count);
            }
        }
        if flags.contains(PacketFlags::BYTES_READ) {
            buf.put_u64_varint(self.bytes_read);
        }
        if flags.contains(PacketFlags::HANDSHAKE) {
            buf.put_u32_varint(self.window_size);
            buf.put_u32_varint(self.mtu);
            buf.put_usize_varint(self.client_ids.len());
            for id in &self.client_ids {
                buf.put_usize_varint(id.len());
                buf.put_slice(id.as_bytes());
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let flags = match PacketFlags::from_bits(buf.try_get_u8()?) {
            Some(flags) => flags,
            None => bail!("unknown flag bits"),
        };
        if flags.contains(PacketFlags::ACK_COUNTS) && !flags.contains(PacketFlags::ACKS) {
            bail!("ack counts without ack starts");
        }

        let mut packet = Packet {
            sequence_id: buf.try_get_u32_varint()?,
            is_close: flags.contains(PacketFlags::CLOSE),
            is_handshake: flags.contains(PacketFlags::HANDSHAKE),
            ..Packet::default()
        };

        if flags.contains(PacketFlags::DATA) {
            let len = buf.try_get_usize_varint()?;
            if buf.remaining() < len {
                bail!("payload length exceeds packet");
            }
            let mut data = vec![0u8; len];
            buf.copy_to_slice(&mut data);
            packet.data = data;
        }
        if flags.contains(PacketFlags::ACKS) {
            let num_runs = buf.try_get_usize_varint()?;
            packet.ack_start_seqs = Vec::with_capacity(num_runs);
            for _ in 0..num_runs {
                packet.ack_start_seqs.push(buf.try_get_u32_varint()?);
            }
            if flags.contains(PacketFlags::ACK_COUNTS) {
                packet.ack_seq_counts = Vec::with_capacity(num_runs);
                for _ in 0..num_runs {
                    packet.ack_seq_counts.push(buf.try_get_u32_varint()?);
                }
            }
        }
        if flags.contains(PacketFlags::BYTES_READ) {
            packet.bytes_read = buf.try_get_u64_varint()?;
        }
        if flags.contains(PacketFlags::HANDSHAKE) {
            packet.window_size = buf.try_get_u32_varint()?;
            packet.mtu = buf.try_get_u32_varint()?;
            let num_ids = buf.try_get_usize_varint()?;
            packet.client_ids = Vec::with_capacity(num_ids);
            for _ in 0..num_ids {
                let len = buf.try_get_usize_varint()?;
                if buf.remaining() < len {
                    bail!("client id length exceeds packet");
                }
                let mut raw = vec![0u8; len];
                buf.copy_to_slice(&mut raw);
                match String::from_utf8(raw) {
                    Ok(id) => packet.client_ids.push(id),
                    Err(_) => bail!("client id is not valid utf8"),
                }
            }
        }

        Ok(packet)
    }
}

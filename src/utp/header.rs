use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

use super::MAX_UNACKED_INBOUND;

pub const HEADER_SIZE: usize = 20;
const VERSION: u8 = 1;
const EXTENSION_SELECTIVE_ACK: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data,
    Fin,
    State,
    Reset,
    Syn,
}

impl PacketType {
    fn to_nibble(self) -> u8 {
        match self {
            PacketType::Data => 0,
            PacketType::Fin => 1,
            PacketType::State => 2,
            PacketType::Reset => 3,
            PacketType::Syn => 4,
        }
    }

    fn from_nibble(value: u8) -> anyhow::Result<PacketType> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            _ => bail!("invalid packet type {}", value),
        }
    }
}

/// The selective-ACK extension payload: bit `n` acknowledges sequence number
///  `ack_nr + 2 + n`. The mask grows in 4-byte steps, bounded by the receive window.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectiveAck {
    bytes: Vec<u8>,
}

impl SelectiveAck {
    pub fn new() -> SelectiveAck {
        SelectiveAck::default()
    }

    fn from_bytes(bytes: Vec<u8>) -> SelectiveAck {
        SelectiveAck { bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn set_bit(&mut self, index: usize) {
        debug_assert!(index < MAX_UNACKED_INBOUND);
        let needed = (index / 8 + 1 + 3) / 4 * 4;
        if self.bytes.len() < needed {
            self.bytes.resize(needed, 0);
        }
        self.bytes[index / 8] |= 1 << (index % 8);
    }

    pub fn bit_set(&self, index: usize) -> bool {
        match self.bytes.get(index / 8) {
            Some(byte) => byte & (1 << (index % 8)) != 0,
            None => false,
        }
    }

    /// Iterates the acknowledged bit indexes in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bytes.len() * 8).filter(move |i| self.bit_set(*i))
    }
}

/// A uTP packet header plus its extension chain. `ser`/`deser` cover exactly the
///  header; the packet payload is whatever follows in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub packet_type: PacketType,
    pub conn_id: u16,
    pub timestamp_us: u32,
    pub timestamp_diff_us: u32,
    pub wnd_size: u32,
    pub seq_nr: u16,
    pub ack_nr: u16,
    pub selective_ack: Option<SelectiveAck>,
}

impl Header {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8((self.packet_type.to_nibble() << 4) | VERSION);
        match &self.selective_ack {
            Some(_) => buf.put_u8(EXTENSION_SELECTIVE_ACK),
            None => buf.put_u8(0),
        }
        buf.put_u16(self.conn_id);
        buf.put_u32(self.timestamp_us);
        buf.put_u32(self.timestamp_diff_us);
        buf.put_u32(self.wnd_size);
        buf.put_u16(self.seq_nr);
        buf.put_u16(self.ack_nr);

        if let Some(sack) = &self.selective_ack {
            debug_assert!(sack.len_bytes() % 4 == 0 && !sack.bytes.is_empty());
            buf.put_u8(0); // no further extension
            buf.put_u8(sack.len_bytes() as u8);
            buf.put_slice(&sack.bytes);
        }
    }

    /// Parses the header and extension chain from the front of `buf`, leaving the
    ///  payload behind.
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Header> {
        let type_ver = buf.try_get_u8()?;
        if type_ver & 0x0f != VERSION {
            bail!("unsupported version {}", type_ver & 0x0f);
        }
        let packet_type = PacketType::from_nibble(type_ver >> 4)?;

        let mut extension = buf.try_get_u8()?;
        let conn_id = buf.try_get_u16()?;
        let timestamp_us = buf.try_get_u32()?;
        let timestamp_diff_us = buf.try_get_u32()?;
        let wnd_size = buf.try_get_u32()?;
        let seq_nr = buf.try_get_u16()?;
        let ack_nr = buf.try_get_u16()?;

        let mut selective_ack = None;
        while extension != 0 {
            let next = buf.try_get_u8()?;
            let len = buf.try_get_u8()? as usize;
            if buf.remaining() < len {
                bail!("truncated extension");
            }
            let mut data = vec![0u8; len];
            buf.copy_to_slice(&mut data);

            if extension == EXTENSION_SELECTIVE_ACK {
                if len == 0 || len % 4 != 0 {
                    bail!("invalid selective ack length {}", len);
                }
                selective_ack = Some(SelectiveAck::from_bytes(data));
            }
            // unknown extensions are skipped

            extension = next;
        }

        Ok(Header {
            packet_type,
            conn_id,
            timestamp_us,
            timestamp_diff_us,
            wnd_size,
            seq_nr,
            ack_nr,
            selective_ack,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 4)]
    #[case(31, 4)]
    #[case(32, 8)]
    #[case(255, 32)]
    fn test_selective_ack_bitmask_len(#[case] bit_index: usize, #[case] expected_len: usize) {
        let mut sack = SelectiveAck::new();
        sack.set_bit(bit_index);
        assert_eq!(sack.len_bytes(), expected_len);
        assert!(sack.bit_set(bit_index));
        assert_eq!(sack.iter_set().collect::<Vec<_>>(), vec![bit_index]);
    }

    #[test]
    fn test_decode_reference_packet() {
        // a state packet captured off the wire
        let raw: Vec<u8> = vec![
            0x21, 0x00, 0x00, 0x00, 0x00, 0x23, 0xa2, 0x24, 0x00, 0x00, 0x04, 0x1f, 0x00, 0x10,
            0x00, 0x00, 0xf1, 0xfc, 0x00, 0x01,
        ];
        let mut buf: &[u8] = &raw;
        let hdr = Header::deser(&mut buf).unwrap();

        assert_eq!(hdr.packet_type, PacketType::State);
        assert_eq!(hdr.conn_id, 0);
        assert_eq!(hdr.timestamp_us, 0x0023a224);
        assert_eq!(hdr.timestamp_diff_us, 0x041f);
        assert_eq!(hdr.wnd_size, 0x0010_0000);
        assert_eq!(hdr.seq_nr, 0xf1fc);
        assert_eq!(hdr.ack_nr, 0x0001);
        assert!(hdr.selective_ack.is_none());
        assert!(buf.is_empty());
    }

    #[rstest]
    #[case::data_no_ext(PacketType::Data, None)]
    #[case::syn(PacketType::Syn, None)]
    #[case::state_with_sack(PacketType::State, Some(vec![0, 2, 37]))]
    fn test_roundtrip(#[case] packet_type: PacketType, #[case] sack_bits: Option<Vec<usize>>) {
        let selective_ack = sack_bits.map(|bits| {
            let mut sack = SelectiveAck::new();
            for bit in bits {
                sack.set_bit(bit);
            }
            sack
        });
        let original = Header {
            packet_type,
            conn_id: 0x1234,
            timestamp_us: 77,
            timestamp_diff_us: 3,
            wnd_size: 0x10_0000,
            seq_nr: 0x8001,
            ack_nr: 0x7fff,
            selective_ack,
        };

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        buf.put_slice(b"payload");

        let mut read: &[u8] = &buf;
        let decoded = Header::deser(&mut read).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(read, b"payload");
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::truncated_header(vec![0x21, 0x00, 0x00])]
    #[case::bad_version(vec![0x22; 20])]
    #[case::bad_type(vec![0x51; 20])]
    fn test_deser_rejects(#[case] raw: Vec<u8>) {
        let mut buf: &[u8] = &raw;
        assert!(Header::deser(&mut buf).is_err());
    }

    #[test]
    fn test_deser_rejects_truncated_extension() {
        let mut buf = BytesMut::new();
        let mut sack = SelectiveAck::new();
        sack.set_bit(1);
        Header {
            packet_type: PacketType::State,
            conn_id: 1,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr: 0,
            ack_nr: 0,
            selective_ack: Some(sack),
        }
        .ser(&mut buf);

        let truncated = &buf[..buf.len() - 2];
        let mut read: &[u8] = truncated;
        assert!(Header::deser(&mut read).is_err());
    }
}

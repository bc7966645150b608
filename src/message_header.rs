use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// The length prefix of a framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_len: u32,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u32>();

    pub fn for_message(message: &[u8], max_message_size: u32) -> anyhow::Result<MessageHeader> {
        match u32::try_from(message.len()) {
            Ok(message_len) if message_len <= max_message_size => Ok(MessageHeader { message_len }),
            _ => bail!("message size {} bytes exceeds limit of {}", message.len(), max_message_size),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.message_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete message header: {} bytes", buf.remaining());
        }
        Ok(MessageHeader {
            message_len: buf.get_u32(),
        })
    }

    /// NB: The length is announced by the peer, so it must be checked before it is used to size
    ///      receive buffers
    pub fn validate(&self, max_message_size: u32) -> anyhow::Result<()> {
        if self.message_len > max_message_size {
            bail!("peer announced a message of {} bytes, limit is {}", self.message_len, max_message_size);
        }
        Ok(())
    }

    pub fn payload_len(&self) -> usize {
        self.message_len as usize
    }
}

/// Serializes a message with its length prefix into a fresh buffer, failing if the message exceeds
///  the size limit.
pub fn frame_message(message: &[u8], max_message_size: u32) -> anyhow::Result<BytesMut> {
    let header = MessageHeader::for_message(message, max_message_size)?;

    let mut buf = BytesMut::with_capacity(MessageHeader::SERIALIZED_LEN + message.len());
    header.ser(&mut buf);
    buf.put_slice(message);
    Ok(buf)
}

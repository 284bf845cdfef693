use super::{LCodec, Limits, RCodec, RpcCodec, WCodec};
use crate::{
    buffers::{
        reader::{HasReader, Reader},
        writer::{DidntWrite, HasWriter, Writer},
    },
    error::ProtocolError,
    protocol::{HEADER_SIZE, Header, LEN_SIZE, Message, NFDS_SIZE},
};

/// Everything following the length word of a frame. Descriptors travel out
/// of band and are collected separately.
#[derive(Debug)]
pub(crate) struct FrameBody {
    pub(crate) header: Header,
    pub(crate) nfds: usize,
    pub(crate) payload: Vec<u8>,
}

impl LCodec<&Message> for RpcCodec {
    fn w_len(self, x: &Message) -> usize {
        let nfds = if x.header.kind.carries_fds() || !x.fds.is_empty() {
            NFDS_SIZE
        } else {
            0
        };
        LEN_SIZE + HEADER_SIZE + nfds + x.payload.len()
    }
}

impl<W> WCodec<&Message, &mut W> for RpcCodec
where
    W: Writer,
{
    type Output = Result<(), ProtocolError>;

    fn write(self, writer: &mut W, x: &Message) -> Self::Output {
        let kind = x.header.kind.with_fds(x.fds.len())?;
        let len = self.w_len(x);
        let len32 = u32::try_from(len).map_err(|_| ProtocolError::TooLarge(len))?;
        let overflow = |_: DidntWrite| ProtocolError::TooLarge(len);

        self.write(&mut *writer, len32).map_err(overflow)?;
        self.write(&mut *writer, x.header.with_kind(kind)).map_err(overflow)?;
        if kind.carries_fds() {
            self.write(&mut *writer, x.fds.len() as u32).map_err(overflow)?;
        }
        self.write(&mut *writer, x.payload.as_slice()).map_err(overflow)?;

        Ok(())
    }
}

impl<R> RCodec<FrameBody, &mut R> for RpcCodec
where
    R: Reader,
{
    type Error = ProtocolError;

    fn read(self, reader: &mut R) -> Result<FrameBody, Self::Error> {
        let header: Header = self.read(&mut *reader)?;
        let nfds = if header.kind.carries_fds() {
            let n: u32 = self.read(&mut *reader).map_err(|_| ProtocolError::Truncated)?;
            n as usize
        } else {
            0
        };
        let payload = reader.read_to_vec();

        Ok(FrameBody { header, nfds, payload })
    }
}

/// Validates the length word of an incoming frame and returns the number of
/// bytes still to read for its body.
pub(crate) fn body_len(prefix: [u8; LEN_SIZE], limits: &Limits) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix);
    let total = len as usize;
    if total < LEN_SIZE + HEADER_SIZE || total > limits.max_frame {
        return Err(ProtocolError::BadLength(len));
    }
    Ok(total - LEN_SIZE)
}

impl Message {
    /// Encodes the message into a complete frame, length word included.
    ///
    /// Attached descriptors are only counted: they must be passed over the
    /// transport once the bytes are out.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let codec = RpcCodec::new();
        let mut buffer = Vec::with_capacity(codec.w_len(self));
        codec.write(&mut (&mut buffer).writer(), self)?;
        Ok(buffer)
    }

    /// Decodes a complete frame, length word included.
    ///
    /// Returns the message along with the number of descriptors announced by
    /// the frame, which the caller is expected to receive out of band.
    pub fn decode(frame: &[u8]) -> Result<(Message, usize), ProtocolError> {
        let mut reader = frame.reader();
        let mut prefix = [0u8; LEN_SIZE];
        reader.read_exact(&mut prefix).map_err(|_| ProtocolError::Truncated)?;
        let len = u32::from_be_bytes(prefix);
        if len as usize != frame.len() || frame.len() < LEN_SIZE + HEADER_SIZE {
            return Err(ProtocolError::BadLength(len));
        }

        let body: FrameBody = RpcCodec::new().read(&mut reader)?;
        let message = Message::new(body.header, body.payload);
        Ok((message, body.nfds))
    }
}

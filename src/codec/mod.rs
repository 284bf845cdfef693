use crate::protocol::{MAX_FDS, MAX_FRAME};

pub(crate) mod core;
pub(crate) mod frame;
pub(crate) mod header;

pub(crate) trait WCodec<Message, Buffer> {
    type Output;
    fn write(self, buffer: Buffer, message: Message) -> Self::Output;
}

pub(crate) trait RCodec<Message, Buffer> {
    type Error;
    fn read(self, buffer: Buffer) -> Result<Message, Self::Error>;
}

// Calculate the length of the value once serialized
pub(crate) trait LCodec<Message> {
    fn w_len(self, message: Message) -> usize;
}

#[derive(Clone, Copy, Default)]
pub(crate) struct RpcCodec;

impl RpcCodec {
    pub(crate) const fn new() -> Self {
        Self
    }
}

/// Bounds enforced on incoming and outgoing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    /// Largest frame, length word included.
    pub(crate) max_frame: usize,
    /// Largest number of descriptors per frame.
    pub(crate) max_fds: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame: MAX_FRAME,
            max_fds: MAX_FDS,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::{
        buffers::{
            reader::{HasReader, Reader},
            writer::HasWriter,
        },
        protocol::{Header, Message},
    };

    const NUM_ITER: usize = 100;

    macro_rules! run {
        ($type:ty, $rand:expr) => {
            let codec = RpcCodec::new();
            let mut buffer = vec![];
            for _ in 0..NUM_ITER {
                let x: $type = $rand;

                buffer.clear();
                {
                    let mut writer = (&mut buffer).writer();
                    codec.write(&mut writer, x).unwrap();
                }
                assert_eq!(codec.w_len(x), buffer.len());
                {
                    let mut reader = buffer.reader();
                    let y: $type = codec.read(&mut reader).unwrap();
                    assert_eq!(x, y);
                    assert!(reader.read_to_vec().is_empty());
                }
            }
        };
    }

    #[test]
    fn codec_u32() {
        let mut rng = rand::rng();

        run!(u32, { u32::MIN });
        run!(u32, { u32::MAX });
        run!(u32, { rng.random::<u32>() });
    }

    #[test]
    fn codec_header() {
        run!(Header, { Header::rand() });
    }

    #[test]
    fn codec_message() {
        for _ in 0..NUM_ITER {
            let msg = Message::rand();
            let frame = msg.encode().unwrap();
            assert_eq!(frame.len(), RpcCodec::new().w_len(&msg));

            let (decoded, nfds) = Message::decode(&frame).unwrap();
            assert_eq!(nfds, 0);
            assert_eq!(decoded.header, msg.header);
            assert_eq!(decoded.payload, msg.payload);
        }
    }
}

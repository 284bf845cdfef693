use super::{LCodec, RCodec, RpcCodec, WCodec};
use crate::buffers::{
    reader::{DidntRead, Reader},
    writer::{DidntWrite, Writer},
};

// u32, always big-endian on the wire
impl<W> WCodec<u32, &mut W> for RpcCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: u32) -> Self::Output {
        writer.write_exact(&x.to_be_bytes())
    }
}

impl<R> RCodec<u32, &mut R> for RpcCodec
where
    R: Reader,
{
    type Error = DidntRead;

    fn read(self, reader: &mut R) -> Result<u32, Self::Error> {
        let mut x = [0u8; 4];
        reader.read_exact(&mut x)?;
        Ok(u32::from_be_bytes(x))
    }
}

impl LCodec<u32> for RpcCodec {
    fn w_len(self, _: u32) -> usize {
        4
    }
}

// Opaque payload, copied verbatim
impl<W> WCodec<&[u8], &mut W> for RpcCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, x: &[u8]) -> Self::Output {
        writer.write_exact(x)
    }
}

impl LCodec<&[u8]> for RpcCodec {
    fn w_len(self, x: &[u8]) -> usize {
        x.len()
    }
}

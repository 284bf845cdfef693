use super::{
    reader::HasReader,
    writer::{DidntWrite, HasWriter, Writer},
};

impl HasWriter for &mut Vec<u8> {
    type Writer = Self;

    fn writer(self) -> Self::Writer {
        self
    }
}

impl Writer for &mut Vec<u8> {
    fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl<'a> HasReader for &'a Vec<u8> {
    type Reader = &'a [u8];

    fn reader(self) -> Self::Reader {
        self
    }
}

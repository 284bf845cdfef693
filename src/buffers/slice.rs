use core::mem;

use super::reader::{DidntRead, HasReader, Reader};

impl HasReader for &[u8] {
    type Reader = Self;

    fn reader(self) -> Self::Reader {
        self
    }
}

impl Reader for &[u8] {
    fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead> {
        let Some((head, tail)) = self.split_at_checked(into.len()) else {
            return Err(DidntRead);
        };
        into.copy_from_slice(head);
        *self = tail;
        Ok(())
    }

    fn read_to_vec(&mut self) -> Vec<u8> {
        mem::take(self).to_vec()
    }
}

//! Byte sinks and sources the wire codec is written against.
//!
//! Outgoing frames are encoded in one go into a `Vec<u8>` sized up front,
//! incoming frame bodies are decoded from the slice the input buffer was
//! filled into. Neither side ever sees a partial frame.
mod slice;
mod vec;

pub(crate) mod writer {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DidntWrite;

    pub(crate) trait Writer {
        /// Appends all of `bytes`, or nothing.
        fn write_exact(&mut self, bytes: &[u8]) -> Result<(), DidntWrite>;
    }

    pub(crate) trait HasWriter {
        type Writer: Writer;

        fn writer(self) -> Self::Writer;
    }
}

pub(crate) mod reader {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DidntRead;

    pub(crate) trait Reader {
        /// Fills `into` completely, or consumes nothing.
        fn read_exact(&mut self, into: &mut [u8]) -> Result<(), DidntRead>;

        /// Consumes whatever is left.
        fn read_to_vec(&mut self) -> Vec<u8>;
    }

    pub(crate) trait HasReader {
        type Reader: Reader;

        fn reader(self) -> Self::Reader;
    }
}

#[cfg(test)]
mod tests {
    use super::{
        reader::{DidntRead, HasReader, Reader},
        writer::{HasWriter, Writer},
    };

    #[test]
    fn buffer_words() {
        // 1. Length word, two header words, a payload
        let mut buffer = vec![];
        {
            let mut writer = (&mut buffer).writer();
            writer.write_exact(&14u32.to_be_bytes()).unwrap();
            writer.write_exact(&[0, 0, 0, 1]).unwrap();
            writer.write_exact(&[0xff; 4]).unwrap();
            writer.write_exact(&[]).unwrap();
            writer.write_exact(b"hi").unwrap();
        }
        assert_eq!(buffer.len(), 14);

        // 2. Read back word by word
        let mut reader = buffer.reader();
        let mut word = [0u8; 4];
        reader.read_exact(&mut word).unwrap();
        assert_eq!(u32::from_be_bytes(word), 14);
        reader.read_exact(&mut word).unwrap();
        reader.read_exact(&mut word).unwrap();
        assert_eq!(word, [0xff; 4]);
        assert_eq!(reader.len(), 2);

        // 3. A short read consumes nothing
        assert_eq!(reader.read_exact(&mut word), Err(DidntRead));
        assert_eq!(reader.read_to_vec(), b"hi");
        assert!(reader.read_to_vec().is_empty());
    }
}

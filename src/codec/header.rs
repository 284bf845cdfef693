use super::{LCodec, RCodec, RpcCodec, WCodec};
use crate::{
    buffers::{
        reader::Reader,
        writer::{DidntWrite, Writer},
    },
    error::ProtocolError,
    protocol::{HEADER_SIZE, Header, MessageType, Status},
};

impl LCodec<Header> for RpcCodec {
    fn w_len(self, _: Header) -> usize {
        HEADER_SIZE
    }
}

impl<W> WCodec<Header, &mut W> for RpcCodec
where
    W: Writer,
{
    type Output = Result<(), DidntWrite>;

    fn write(self, writer: &mut W, header: Header) -> Self::Output {
        let Header {
            program,
            version,
            procedure,
            serial,
            kind,
            status,
        } = header;

        self.write(&mut *writer, program)?;
        self.write(&mut *writer, version)?;
        self.write(&mut *writer, procedure)?;
        self.write(&mut *writer, serial)?;
        self.write(&mut *writer, kind as u32)?;
        self.write(&mut *writer, status as u32)?;

        Ok(())
    }
}

impl<R> RCodec<Header, &mut R> for RpcCodec
where
    R: Reader,
{
    type Error = ProtocolError;

    fn read(self, reader: &mut R) -> Result<Header, Self::Error> {
        let mut word = || -> Result<u32, ProtocolError> {
            let w: u32 = self.read(&mut *reader).map_err(|_| ProtocolError::Truncated)?;
            Ok(w)
        };

        let program = word()?;
        let version = word()?;
        let procedure = word()?;
        let serial = word()?;
        let kind = MessageType::try_from(word()?)?;
        let status = Status::try_from(word()?)?;

        Ok(Header {
            program,
            version,
            procedure,
            serial,
            kind,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{reader::HasReader, writer::HasWriter};

    #[test]
    fn header_layout() {
        let header = Header::call(0x2000_8086, 1, 66, 7);

        let mut buffer = vec![];
        RpcCodec::new().write(&mut (&mut buffer).writer(), header).unwrap();

        #[rustfmt::skip]
        let expected = [
            0x20, 0x00, 0x80, 0x86, // program
            0x00, 0x00, 0x00, 0x01, // version
            0x00, 0x00, 0x00, 0x42, // procedure
            0x00, 0x00, 0x00, 0x07, // serial
            0x00, 0x00, 0x00, 0x00, // type
            0x00, 0x00, 0x00, 0x00, // status
        ];
        assert_eq!(buffer, expected);
    }

    #[test]
    fn header_invalid() {
        let codec = RpcCodec::new();

        // 1. Truncated
        let buffer = [0u8; HEADER_SIZE - 1];
        let mut reader = buffer.as_slice().reader();
        let res: Result<Header, _> = codec.read(&mut reader);
        assert_eq!(res, Err(ProtocolError::Truncated));

        // 2. Unknown type
        let mut buffer = vec![];
        codec.write(&mut (&mut buffer).writer(), Header::call(1, 1, 1, 1)).unwrap();
        buffer[19] = 9;
        let res: Result<Header, _> = codec.read(&mut buffer.reader());
        assert_eq!(res, Err(ProtocolError::UnknownType(9)));

        // 3. Unknown status
        buffer[19] = 0;
        buffer[23] = 3;
        let res: Result<Header, _> = codec.read(&mut buffer.reader());
        assert_eq!(res, Err(ProtocolError::UnknownStatus(3)));
    }
}

use std::io::{ErrorKind, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};

use crate::Error;

/// "mdat"
const MDAT: u32 = 0x6D64_6174;

/// Walks the top-level atoms of an MP4 file until the reader is positioned
/// at the first byte of the `mdat` payload.
///
/// Each atom is a big-endian 32-bit size followed by a 32-bit type; anything
/// that is not `mdat` is skipped wholesale. Everything else in the container
/// (track tables, the codec configuration) belongs to the caller that
/// produced the `StreamInfo`.
pub fn seek_mdat<R: Read + Seek>(reader: &mut R) -> Result<(), Error> {
    loop {
        let atom_size = match reader.read_u32::<BigEndian>() {
            Ok(size) => size,
            Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::Container("no mdat atom in stream"));
            }
            Err(err) => return Err(Error::Io(err)),
        };
        let atom_type = reader.read_u32::<BigEndian>().map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                Error::Container("no mdat atom in stream")
            } else {
                Error::Io(err)
            }
        })?;

        if atom_type == MDAT {
            return Ok(());
        }
        if atom_size < 8 {
            // 64-bit and to-end-of-file atom sizes never precede mdat in the
            // files this decoder accepts.
            return Err(Error::Container("unsupported atom size"));
        }
        reader.seek(SeekFrom::Current(i64::from(atom_size) - 8))?;
    }
}

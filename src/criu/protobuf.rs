use std::io::{self, ErrorKind, Read, Write};

use prost::Message;

/// Write a message preceded by its u32 length.
pub fn pb_write_one<W: Write, M: Message>(img: &mut W, obj: &M) -> io::Result<()> {
    let size = obj.encoded_len();

    let mut buf = Vec::with_capacity(4 + size);
    buf.extend_from_slice(&(size as u32).to_ne_bytes());
    obj.encode(&mut buf).map_err(|e| {
        io::Error::new(ErrorKind::Other, format!("Failed packing PB object: {}", e))
    })?;

    img.write_all(&buf)
}

/// Read one length-prefixed message, `None` on a clean end of image.
pub fn pb_read_one_eof<R: Read, M: Message + Default>(img: &mut R) -> io::Result<Option<M>> {
    let mut size_buf = [0u8; 4];
    let mut got = 0usize;

    while got < size_buf.len() {
        match img.read(&mut size_buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    if got == 0 {
        return Ok(None);
    }
    if got < size_buf.len() {
        return Err(io::Error::new(
            ErrorKind::UnexpectedEof,
            format!("Read {} bytes while {} expected", got, size_buf.len()),
        ));
    }

    let size = u32::from_ne_bytes(size_buf) as usize;
    let mut buf = vec![0u8; size];
    img.read_exact(&mut buf)?;

    let msg = M::decode(&buf[..]).map_err(|e| {
        io::Error::new(ErrorKind::InvalidData, format!("Failed unpacking PB object: {}", e))
    })?;

    Ok(Some(msg))
}

pub fn pb_read_one<R: Read, M: Message + Default>(img: &mut R) -> io::Result<M> {
    pb_read_one_eof(img)?
        .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "Unexpected EOF"))
}

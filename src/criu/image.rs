use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

pub mod magic {
    pub const IMG_COMMON_MAGIC: u32 = 0x54564319;
    pub const PAGEMAP_MAGIC: u32 = 0x56084025;
}

pub const CR_FD_PERM: u32 = 0o600;

pub fn pagemap_image_name(pid: libc::pid_t) -> String {
    format!("pagemap-{}.img", pid)
}

pub fn pages_image_name(pages_id: u32) -> String {
    format!("pages-{}.img", pages_id)
}

pub fn write_img_u32<W: Write>(img: &mut W, val: u32) -> io::Result<()> {
    img.write_all(&val.to_ne_bytes())
}

pub fn read_img_u32<R: Read>(img: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    img.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

pub fn img_write_magic<W: Write>(img: &mut W, type_magic: u32) -> io::Result<()> {
    write_img_u32(img, magic::IMG_COMMON_MAGIC)?;
    write_img_u32(img, type_magic)
}

pub fn img_check_magic<R: Read>(img: &mut R, expected_magic: u32, path: &str) -> io::Result<()> {
    if read_img_u32(img)? != magic::IMG_COMMON_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Head magic doesn't match for {}", path),
        ));
    }

    if read_img_u32(img)? != expected_magic {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Magic doesn't match for {}", path),
        ));
    }

    Ok(())
}

fn create_image_file(dir: &Path, name: &str) -> io::Result<File> {
    let path = dir.join(name);
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(CR_FD_PERM)
        .open(&path)
        .map_err(|e| io::Error::new(e.kind(), format!("Unable to open {}: {}", path.display(), e)))
}

/// Create a buffered image and stamp it with its magic.
pub fn open_image_w(dir: &Path, name: &str, type_magic: u32) -> io::Result<BufWriter<File>> {
    let mut img = BufWriter::new(create_image_file(dir, name)?);
    img_write_magic(&mut img, type_magic)?;
    Ok(img)
}

/// Create a headerless image written straight through its descriptor.
pub fn open_raw_image_w(dir: &Path, name: &str) -> io::Result<File> {
    create_image_file(dir, name)
}

pub fn open_image_r(dir: &Path, name: &str, type_magic: u32) -> io::Result<BufReader<File>> {
    let path = dir.join(name);
    let file = File::open(&path).map_err(|e| {
        io::Error::new(e.kind(), format!("Unable to open {}: {}", path.display(), e))
    })?;

    let mut img = BufReader::new(file);
    img_check_magic(&mut img, type_magic, &path.display().to_string())?;
    Ok(img)
}

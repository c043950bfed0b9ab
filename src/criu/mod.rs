pub mod image;
pub mod mem;
pub mod options;
pub mod page_pipe;
pub mod page_xfer;
pub mod proc_parse;
pub mod protobuf;
pub mod stats;
pub mod util;
pub mod vma;

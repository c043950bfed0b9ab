// Core modules
pub mod compel;
pub mod criu;
pub mod error;
pub mod proto;

pub use criu::mem::{dump, parasite_dump_pages_seized};
pub use criu::options::DumpOpts;
pub use criu::page_xfer::{Destination, ImageDir, PageServer, PageXfer};
pub use error::{DumpError, DumpStage, MemError, Result};

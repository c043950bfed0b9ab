//! Image messages written by the page dump.
//!
//! Field numbers follow images/pagemap.proto so the result is readable by
//! criu's own tools.

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PagemapHead {
    #[prost(uint32, tag = "1")]
    pub pages_id: u32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct PagemapEntry {
    #[prost(uint64, tag = "1")]
    pub vaddr: u64,
    #[prost(uint32, tag = "2")]
    pub nr_pages: u32,
    #[prost(bool, optional, tag = "3")]
    pub in_parent: ::core::option::Option<bool>,
    #[prost(uint32, optional, tag = "4")]
    pub flags: ::core::option::Option<u32>,
}

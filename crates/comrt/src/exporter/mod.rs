//! Export side: stub manager tables

mod stub_manager;

pub(crate) use stub_manager::ExportTable;

pub mod fetcher;
pub mod patch;
pub mod readers;

pub use fetcher::AssetFetcher;
pub use readers::{
  AssetReader, FlowReader, LoadedAsset, Playbook, PlaybookReader, SchemaReader,
};

pub mod bill_batch;
pub mod catalog_indexer;
pub mod header_locator;
pub mod item_parser;
pub mod output_composer;
pub mod reconciler;

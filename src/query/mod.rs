// Module for query classification and table extraction
pub mod query_type;
pub mod table_extractor;

pub use query_type::QueryType;
pub use table_extractor::{TableExtractor, TempTableChange};

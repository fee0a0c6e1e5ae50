pub mod sanitize;
pub mod text_search;

pub use sanitize::{sanitize_query, sanitize_refinement};
pub use text_search::TextSearch;

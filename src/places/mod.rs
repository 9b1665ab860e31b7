pub mod client;
pub mod normalize;

pub use client::{HttpPageFetcher, PaginatedSearch, SearchClient};
pub use normalize::{normalize, PlaceRecord, RawPlace};

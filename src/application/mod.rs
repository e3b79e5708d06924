pub mod error;
pub mod feeds;
pub mod posts;
pub mod repos;
pub mod tweets;

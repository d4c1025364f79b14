//! Car Scout: demand-driven crawling of used-car marketplaces.
//!
//! Searches register demand through [`queue::SearchQueueRegistry`], the
//! [`scheduler::Scheduler`] crawls due tasks region by region, and listings
//! land in SQLite with prices normalized by [`currency::CurrencyNormalizer`].

pub mod config;
pub mod currency;
pub mod error;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod scrapers;
pub mod storage;

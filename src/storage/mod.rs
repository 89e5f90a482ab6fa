//! Backend adapters behind the capability traits in [`traits`].
//!
//! | Trait | Production | In-memory |
//! |---|---|---|
//! | `CacheStore` | [`redis::RedisCache`] | [`memory::InMemoryCache`] |
//! | `RelationalChangeSource`, `UserRepository` | [`sql::PgStore`] | [`memory::InMemoryUserStore`] |
//! | `SearchIndexSink` | [`meilisearch::MeiliIndex`] | [`memory::InMemoryIndex`] |
//! | `MessageBroker` | [`amqp::AmqpBroker`] | [`memory::InMemoryBroker`] |

pub mod amqp;
pub mod meilisearch;
pub mod memory;
pub mod redis;
pub mod sql;
pub mod traits;
